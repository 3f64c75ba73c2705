use crate::progress::RequestEmitter;
use crate::providers::{ProviderCallError, ProviderClient};
use crate::router::{self, ProviderRegistry};
use crate::state_service::{self, CachedProviderResponse, StateStore};
use platform::{record_counter, record_histogram};
use rand::Rng;
use serde_json::json;
use shared_types::{
    EventStatus, FragmentResult, FragmentSpec, FragmentStatus, PipelineConfig, ProviderId, Stage,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_FACTOR: u64 = 2;
const BACKOFF_JITTER: f64 = 0.2;

/// Everything one dispatch run needs. The scheduler never chains one
/// fragment's call after another's; tasks only share the in-flight
/// semaphore and the result channel.
pub struct DispatchContext {
    pub clients: Arc<HashMap<ProviderId, Arc<dyn ProviderClient>>>,
    pub registry: Arc<ProviderRegistry>,
    pub emitter: RequestEmitter,
    pub cache: Option<Arc<dyn StateStore>>,
    pub config: PipelineConfig,
}

/// Execute all assigned fragment calls concurrently, bounded by
/// `max_in_flight`, enforcing the per-fragment timeout and the overall
/// deadline. Returns once every fragment has a terminal status; fragments
/// overtaken by the deadline or an external cancellation come back
/// CANCELED.
pub async fn dispatch(
    ctx: &DispatchContext,
    assignments: Vec<(FragmentSpec, ProviderId)>,
    cancel: &CancellationToken,
) -> Vec<FragmentResult> {
    let total = assignments.len();
    if total == 0 {
        return Vec::new();
    }

    // The effective token fires on external cancellation or when the
    // overall deadline is reached, whichever comes first.
    let effective = cancel.child_token();
    let deadline_guard = effective.clone();
    let total_deadline = Duration::from_millis(ctx.config.total_deadline_ms);
    let watchdog = tokio::spawn(async move {
        tokio::select! {
            _ = deadline_guard.cancelled() => {}
            _ = tokio::time::sleep(total_deadline) => deadline_guard.cancel(),
        }
    });

    let semaphore = Arc::new(Semaphore::new(ctx.config.max_in_flight.max(1)));
    let (tx, mut rx) = mpsc::channel::<FragmentResult>(total);

    for (fragment, provider_id) in assignments {
        let task = FragmentTask {
            fragment,
            provider_id,
            clients: ctx.clients.clone(),
            registry: ctx.registry.clone(),
            emitter: ctx.emitter.clone(),
            cache: ctx.cache.clone(),
            config: ctx.config.clone(),
            semaphore: semaphore.clone(),
            cancel: effective.clone(),
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = task.run().await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(total);
    while let Some(result) = rx.recv().await {
        results.push(result);
        let pct = (results.len() * 100 / total) as u8;
        ctx.emitter.emit(
            Stage::Dispatch,
            EventStatus::Progress,
            pct,
            "fragment reached terminal state",
            Some(json!({ "completed": results.len(), "total": total })),
        );
        if results.len() == total {
            break;
        }
    }

    watchdog.abort();
    results
}

struct FragmentTask {
    fragment: FragmentSpec,
    provider_id: ProviderId,
    clients: Arc<HashMap<ProviderId, Arc<dyn ProviderClient>>>,
    registry: Arc<ProviderRegistry>,
    emitter: RequestEmitter,
    cache: Option<Arc<dyn StateStore>>,
    config: PipelineConfig,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

enum CallOutcome {
    Ok(crate::providers::GenerateOutput),
    TimedOut,
    Remote(String),
    Canceled,
}

impl FragmentTask {
    async fn run(self) -> FragmentResult {
        let started = Instant::now();
        let mut provider_id = self.provider_id.clone();
        let mut tried: HashSet<ProviderId> = HashSet::from([provider_id.clone()]);
        let mut attempt: u32 = 0;

        self.emit_phase("STARTED", &provider_id, None);

        loop {
            if self.cancel.is_cancelled() {
                return self.terminal(provider_id, FragmentStatus::Canceled, started);
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.terminal(provider_id, FragmentStatus::Canceled, started);
                }
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.expect("dispatch semaphore closed")
                }
            };

            if let Some(result) = self.cached_result(&provider_id, started) {
                drop(permit);
                record_counter("provider_cache_hits_total", 1);
                self.emit_phase("COMPLETED", &provider_id, Some("cache hit"));
                return result;
            }

            let Some(client) = self.clients.get(&provider_id).cloned() else {
                warn!(provider = %provider_id, "no client for assigned provider");
                return self.terminal(provider_id, FragmentStatus::ProviderError, started);
            };

            let call_started = Instant::now();
            let fragment_timeout = Duration::from_millis(self.config.fragment_timeout_ms);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => CallOutcome::Canceled,
                called = timeout(
                    fragment_timeout,
                    client.generate(&self.fragment.anonymized_text, &self.cancel),
                ) => match called {
                    Ok(Ok(output)) => CallOutcome::Ok(output),
                    Ok(Err(ProviderCallError::Canceled)) => CallOutcome::Canceled,
                    Ok(Err(ProviderCallError::Remote(message))) => CallOutcome::Remote(message),
                    Err(_) => CallOutcome::TimedOut,
                },
            };
            drop(permit);
            let latency_ms = call_started.elapsed().as_millis() as u64;
            record_histogram(
                "provider_call_duration_seconds",
                call_started.elapsed().as_secs_f64(),
            );
            if !matches!(outcome, CallOutcome::Ok(_)) {
                record_counter("provider_call_failures_total", 1);
            }

            match outcome {
                CallOutcome::Ok(output) => {
                    self.registry.record_success(&provider_id, latency_ms);
                    self.cache_output(&provider_id, &output);
                    self.emit_phase("COMPLETED", &provider_id, None);
                    return FragmentResult {
                        fragment_id: self.fragment.id.clone(),
                        provider_id,
                        status: FragmentStatus::Ok,
                        response_text: output.text,
                        tokens_in: output.tokens_in,
                        tokens_out: output.tokens_out,
                        latency_ms,
                        cost: output.cost,
                        confidence: 0.0,
                    };
                }
                CallOutcome::TimedOut => {
                    // Per-fragment timeouts are terminal; only provider
                    // errors are retried.
                    self.registry.record_failure(&provider_id);
                    self.emit_phase("FAILED", &provider_id, Some("fragment timeout"));
                    return self.terminal(provider_id, FragmentStatus::Timeout, started);
                }
                CallOutcome::Canceled => {
                    return self.terminal(provider_id, FragmentStatus::Canceled, started);
                }
                CallOutcome::Remote(message) => {
                    self.registry.record_failure(&provider_id);
                    debug!(
                        fragment = %self.fragment.id,
                        provider = %provider_id,
                        attempt,
                        error = %message,
                        "provider call failed"
                    );

                    if attempt >= self.config.retries {
                        self.emit_phase("FAILED", &provider_id, Some(&message));
                        return self.terminal(provider_id, FragmentStatus::ProviderError, started);
                    }

                    attempt += 1;
                    self.emit_phase("RETRYING", &provider_id, Some(&message));

                    let delay = backoff_delay(attempt);
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return self.terminal(provider_id, FragmentStatus::Canceled, started);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    if self.config.retry_alternate_provider {
                        let snapshot = self.registry.snapshot();
                        if let Some(alternate) =
                            router::next_best_excluding(&snapshot, self.fragment.kind, &tried)
                        {
                            provider_id = alternate;
                            tried.insert(provider_id.clone());
                        }
                    }
                }
            }
        }
    }

    fn cached_result(&self, provider_id: &str, started: Instant) -> Option<FragmentResult> {
        let cache = self.cache.as_ref()?;
        let snapshot = self.registry.snapshot();
        let model = snapshot.get(provider_id)?.config.model_name.clone();
        let cached = state_service::get_cached_response(
            cache.as_ref(),
            provider_id,
            &model,
            &self.fragment.anonymized_text,
        )?;
        Some(FragmentResult {
            fragment_id: self.fragment.id.clone(),
            provider_id: provider_id.to_string(),
            status: FragmentStatus::Ok,
            response_text: cached.text,
            tokens_in: cached.tokens_in,
            tokens_out: cached.tokens_out,
            latency_ms: started.elapsed().as_millis() as u64,
            cost: 0.0,
            confidence: 0.0,
        })
    }

    fn cache_output(&self, provider_id: &str, output: &crate::providers::GenerateOutput) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let snapshot = self.registry.snapshot();
        let Some(state) = snapshot.get(provider_id) else {
            return;
        };
        let cached = CachedProviderResponse {
            text: output.text.clone(),
            provider: provider_id.to_string(),
            model: state.config.model_name.clone(),
            tokens_in: output.tokens_in,
            tokens_out: output.tokens_out,
            cost: output.cost,
            cached_at: chrono::Utc::now().to_rfc3339(),
        };
        state_service::put_cached_response(
            cache.as_ref(),
            &self.fragment.anonymized_text,
            &cached,
            self.config.state_ttl_seconds,
        );
    }

    fn emit_phase(&self, phase: &str, provider_id: &str, detail: Option<&str>) {
        let mut payload = json!({
            "fragment_id": self.fragment.id,
            "provider_id": provider_id,
            "phase": phase,
        });
        if let Some(detail) = detail {
            payload["detail"] = json!(detail);
        }
        self.emitter.emit(
            Stage::Dispatch,
            EventStatus::Progress,
            0,
            "fragment transition",
            Some(payload),
        );
    }

    fn terminal(
        &self,
        provider_id: ProviderId,
        status: FragmentStatus,
        started: Instant,
    ) -> FragmentResult {
        let latency_ms = match status {
            FragmentStatus::Timeout => self.config.fragment_timeout_ms,
            _ => started.elapsed().as_millis() as u64,
        };
        FragmentResult {
            fragment_id: self.fragment.id.clone(),
            provider_id,
            status,
            response_text: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            latency_ms,
            cost: 0.0,
            confidence: 0.0,
        }
    }
}

/// Exponential backoff, base 200 ms, factor 2, jitter ±20%.
fn backoff_delay(retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(16);
    let base = BACKOFF_BASE_MS.saturating_mul(BACKOFF_FACTOR.saturating_pow(exp));
    let jitter = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    Duration::from_millis((base as f64 * jitter) as u64)
}
