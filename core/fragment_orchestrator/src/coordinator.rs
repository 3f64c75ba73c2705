use crate::aggregator;
use crate::detection::DetectionEngine;
use crate::errors::PipelineError;
use crate::planner;
use crate::progress::{ProgressBus, RequestEmitter};
use crate::providers::ProviderClient;
use crate::router::{self, ProviderRegistry};
use crate::scheduler::{self, DispatchContext};
use crate::state_service::{self, StateStore};
use dashmap::DashMap;
use platform::{record_counter, record_histogram};
use serde_json::json;
use shared_types::{
    AppConfig, EventStatus, FragmentKind, FragmentSpec, FragmentationPlan, FragmentationStrategy,
    PipelineConfig, ProviderId, QueryPolicy, RequestId, RequestRecord, Stage, TerminalState,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress percentage reported when a stage completes.
fn stage_pct(stage: Stage) -> u8 {
    match stage {
        Stage::Received => 5,
        Stage::Detection => 20,
        Stage::Planning => 35,
        Stage::Anonymization => 45,
        Stage::Dispatch => 75,
        Stage::Aggregation => 90,
        Stage::Complete | Stage::Failed => 100,
    }
}

/// Process-wide wiring shared by every request coordinator.
pub struct CoordinatorContext {
    pub config: Arc<AppConfig>,
    pub detection: Arc<DetectionEngine>,
    pub registry: Arc<ProviderRegistry>,
    pub clients: Arc<HashMap<ProviderId, Arc<dyn ProviderClient>>>,
    pub bus: Arc<ProgressBus>,
    pub store: Arc<dyn StateStore>,
    pub records: DashMap<RequestId, RequestRecord>,
    pub cancellations: DashMap<RequestId, CancellationToken>,
    /// Response caching is only worthwhile with a cross-process store.
    pub cache_enabled: bool,
}

impl CoordinatorContext {
    /// Accept a query, register its record and progress channel, and spawn
    /// its coordinator task. Returns immediately.
    pub fn submit(self: &Arc<Self>, query: String, policy: QueryPolicy) -> RequestId {
        let request_id = Uuid::new_v4();
        let record = RequestRecord::new(request_id, query, chrono::Utc::now().to_rfc3339());
        self.records.insert(request_id, record);
        self.bus.ensure_channel(request_id);

        let cancel = CancellationToken::new();
        self.cancellations.insert(request_id, cancel.clone());

        record_counter("orchestrator_requests_total", 1);
        let ctx = self.clone();
        tokio::spawn(async move {
            run_request(ctx, request_id, policy, cancel).await;
        });
        request_id
    }

    /// External abort: propagates to the scheduler and every in-flight
    /// provider call. A no-op for sealed or unknown requests.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.cancellations.get(&request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn record(&self, request_id: RequestId) -> Option<RequestRecord> {
        if let Some(record) = self.records.get(&request_id) {
            return Some(record.clone());
        }
        // Fall back to the state store for records persisted by an earlier
        // process lifetime.
        state_service::load_record(self.store.as_ref(), request_id).unwrap_or_else(|e| {
            warn!(%request_id, error = %e, "state store lookup failed");
            None
        })
    }
}

struct RequestRun {
    ctx: Arc<CoordinatorContext>,
    request_id: RequestId,
    cfg: PipelineConfig,
    emitter: RequestEmitter,
    cancel: CancellationToken,
    diagnostics: Vec<String>,
}

async fn run_request(
    ctx: Arc<CoordinatorContext>,
    request_id: RequestId,
    policy: QueryPolicy,
    cancel: CancellationToken,
) {
    let submitted_at = Instant::now();
    let emitter = RequestEmitter::new(ctx.bus.clone(), request_id, submitted_at);
    let cfg = ctx.config.pipeline.with_policy(&policy);

    let run = RequestRun {
        ctx,
        request_id,
        cfg,
        emitter,
        cancel,
        diagnostics: Vec::new(),
    };
    run.drive().await;
}

impl RequestRun {
    async fn drive(mut self) {
        let Some(query) = self
            .ctx
            .records
            .get(&self.request_id)
            .map(|r| r.query.clone())
        else {
            warn!(request_id = %self.request_id, "record vanished before start");
            return;
        };

        info!(request_id = %self.request_id, len = query.len(), "request received");
        self.stage_started(Stage::Received, "query received");
        self.stage_completed(Stage::Received, "query accepted", None);

        // DETECTION: failure is soft; an empty report disables fragmentation.
        self.stage_started(Stage::Detection, "running recognizers");
        if self.check_canceled().await {
            return;
        }
        let report = match self.ctx.detection.analyze(&query) {
            Ok(report) => report,
            Err(e) => {
                warn!(request_id = %self.request_id, error = %e, "detection degraded");
                self.diagnostics
                    .push(format!("detection degraded to empty report: {e}"));
                shared_types::DetectionReport::empty()
            }
        };
        self.stage_completed(
            Stage::Detection,
            "detection finished",
            Some(json!({
                "entities": report.entities.len(),
                "has_code": report.has_code,
                "sensitivity_score": report.sensitivity_score,
            })),
        );

        // PLANNING: failure is terminal.
        self.stage_started(Stage::Planning, "selecting strategy");
        if self.check_canceled().await {
            return;
        }
        let snapshot = self.ctx.registry.snapshot();
        let mut plan = match planner::plan(&query, &report, &self.cfg, &snapshot) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        self.update_record(|record| record.plan = Some(plan.clone()));
        self.stage_completed(
            Stage::Planning,
            "plan ready",
            Some(json!({
                "strategy": plan.strategy,
                "fragments": plan.fragments.len(),
            })),
        );

        // ANONYMIZATION is folded into planning; the stage reports the
        // entity-map outcome for subscribers.
        self.stage_started(Stage::Anonymization, "applying entity map");
        let anonymization_message = if plan.entity_map.is_empty() {
            "no entities to anonymize"
        } else {
            "entities replaced with placeholders"
        };
        self.stage_completed(
            Stage::Anonymization,
            anonymization_message,
            Some(json!({ "mapped_entities": plan.entity_map.len() })),
        );

        // DISPATCH.
        self.stage_started(Stage::Dispatch, "routing fragments");
        if self.check_canceled().await {
            return;
        }

        let min_distinct = if report.sensitivity_score >= 0.5
            && plan.strategy != FragmentationStrategy::PassThrough
        {
            self.cfg.min_providers_for_sensitive
        } else {
            1
        };

        let mut degraded_routing = false;
        let assignments = match router::assign(&snapshot, &plan.fragments, min_distinct) {
            Ok(assignments) => assignments,
            Err(e @ PipelineError::NoProviderAvailable(_)) => {
                // Degrade to a single pass-through attempt against the
                // least-unhealthy provider before giving up.
                match router::least_unhealthy(&snapshot) {
                    Some(provider_id) => {
                        warn!(
                            request_id = %self.request_id,
                            provider = %provider_id,
                            "no healthy provider; degrading to pass-through"
                        );
                        degraded_routing = true;
                        self.diagnostics.push(format!(
                            "routing degraded to pass-through on {provider_id}"
                        ));
                        plan = pass_through_plan(&query);
                        self.update_record(|record| record.plan = Some(plan.clone()));
                        vec![("f1".to_string(), provider_id)]
                    }
                    None => {
                        self.fail(e).await;
                        return;
                    }
                }
            }
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };

        let assigned: Vec<(FragmentSpec, ProviderId)> = assignments
            .into_iter()
            .filter_map(|(fragment_id, provider_id)| {
                plan.fragments
                    .iter()
                    .find(|f| f.id == fragment_id)
                    .map(|f| (f.clone(), provider_id))
            })
            .collect();

        let dispatch_ctx = DispatchContext {
            clients: self.ctx.clients.clone(),
            registry: self.ctx.registry.clone(),
            emitter: self.emitter.clone(),
            cache: if self.ctx.cache_enabled {
                Some(self.ctx.store.clone())
            } else {
                None
            },
            config: self.cfg.clone(),
        };
        let results = scheduler::dispatch(&dispatch_ctx, assigned, &self.cancel).await;
        self.update_record(|record| record.results = Some(results.clone()));

        if self.check_canceled().await {
            return;
        }

        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        self.stage_completed(
            Stage::Dispatch,
            "dispatch finished",
            Some(json!({ "ok": ok_count, "failed": results.len() - ok_count })),
        );

        if ok_count == 0 {
            let error = if degraded_routing {
                PipelineError::NoProviderAvailable(
                    "pass-through fallback attempt failed".to_string(),
                )
            } else {
                PipelineError::AggregationEmpty
            };
            self.fail(error).await;
            return;
        }

        // AGGREGATION.
        self.stage_started(Stage::Aggregation, "merging fragment responses");
        let aggregated = match aggregator::aggregate(
            &plan,
            results,
            &self.ctx.config.providers,
            self.cfg.fragment_timeout_ms,
        ) {
            Ok(mut aggregated) => {
                aggregated.diagnostics.extend(self.diagnostics.drain(..));
                aggregated
            }
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        self.stage_completed(
            Stage::Aggregation,
            "responses merged",
            Some(json!({
                "privacy_score": aggregated.privacy_score,
                "quality_score": aggregated.quality_score,
            })),
        );

        let summary = json!({
            "privacy_score": aggregated.privacy_score,
            "quality_score": aggregated.quality_score,
            "total_cost": aggregated.total_cost,
            "total_latency_ms": aggregated.total_latency_ms,
        });
        self.update_record(|record| {
            record.aggregated = Some(aggregated.clone());
            record.terminal = Some(TerminalState::Complete);
        });
        self.seal();
        record_counter("orchestrator_requests_completed_total", 1);
        record_histogram(
            "orchestrator_request_duration_seconds",
            self.emitter.elapsed_ms() as f64 / 1000.0,
        );
        self.emitter.emit(
            Stage::Complete,
            EventStatus::Completed,
            100,
            "request complete",
            Some(summary),
        );
    }

    /// Cancellation check at a stage boundary; seals the request as
    /// FAILED(CANCELED) when the external token has fired.
    async fn check_canceled(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.fail(PipelineError::Canceled).await;
            return true;
        }
        false
    }

    async fn fail(&mut self, error: PipelineError) {
        let failure = error.to_failure();
        warn!(
            request_id = %self.request_id,
            kind = %failure.kind,
            message = %failure.message,
            "request failed"
        );

        self.update_record(|record| {
            record.terminal = Some(TerminalState::Failed {
                kind: failure.kind,
                message: failure.message.clone(),
            });
        });
        self.seal();
        record_counter("orchestrator_requests_failed_total", 1);
        self.emitter.emit(
            Stage::Failed,
            EventStatus::Failed,
            100,
            &failure.message,
            Some(json!({ "error_kind": failure.kind, "message": failure.message })),
        );
    }

    fn stage_started(&self, stage: Stage, message: &str) {
        self.emitter
            .emit(stage, EventStatus::Started, stage_pct(stage).saturating_sub(5), message, None);
    }

    fn stage_completed(&self, stage: Stage, message: &str, payload: Option<serde_json::Value>) {
        self.emitter
            .emit(stage, EventStatus::Completed, stage_pct(stage), message, payload);
    }

    fn update_record<F: FnOnce(&mut RequestRecord)>(&self, f: F) {
        if let Some(mut record) = self.ctx.records.get_mut(&self.request_id) {
            if record.is_sealed() {
                return;
            }
            f(&mut record);
            let snapshot = record.clone();
            drop(record);
            self.persist(&snapshot);
        }
    }

    /// Persist the record; state-store unavailability is soft.
    fn persist(&self, record: &RequestRecord) {
        if let Err(e) =
            state_service::save_record(self.ctx.store.as_ref(), record, self.cfg.state_ttl_seconds)
        {
            warn!(request_id = %self.request_id, error = %e, "state store write failed");
        }
    }

    /// Further input for a sealed request is a no-op; its cancellation
    /// token is retired here.
    fn seal(&self) {
        self.ctx.cancellations.remove(&self.request_id);
    }
}

fn pass_through_plan(query: &str) -> FragmentationPlan {
    FragmentationPlan {
        strategy: FragmentationStrategy::PassThrough,
        fragments: vec![FragmentSpec {
            id: "f1".to_string(),
            anonymized_text: query.to_string(),
            kind: FragmentKind::General,
            recommended_providers: Vec::new(),
        }],
        entity_map: shared_types::EntityMap::default(),
    }
}
