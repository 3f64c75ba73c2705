use crate::errors::{PipelineError, PipelineResult};
use chrono::{DateTime, Duration, Utc};
use shared_types::{
    FragmentKind, FragmentSpec, ProviderCircuitBreakerConfig, ProviderConfig,
    ProviderHealthSummaryV1, ProviderId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

const W_PRIORITY: f64 = 0.5;
const W_COST: f64 = 0.3;
const W_LATENCY: f64 = 0.2;

/// Priority when a provider lacks the capability a fragment kind asks for
/// but is still routable (capability filter relaxed because nobody matched).
const OFF_CAPABILITY_PRIORITY: f64 = 0.4;

/// Mutable per-provider runtime state layered over the static config.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub config: ProviderConfig,
    pub healthy: bool,
    pub rolling_latency_ms: f64,
    pub rolling_cost: f64,
    pub consecutive_failures: u32,
    pub circuit_open_until: Option<DateTime<Utc>>,
}

impl ProviderState {
    fn new(config: ProviderConfig) -> Self {
        let rolling_cost = config.cost_per_1k_tokens;
        ProviderState {
            config,
            healthy: true,
            rolling_latency_ms: 0.0,
            rolling_cost,
            consecutive_failures: 0,
            circuit_open_until: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.config.capabilities.iter().any(|c| c == capability)
    }
}

/// Immutable view of all providers, ordered by id for deterministic
/// iteration. Readers hold an `Arc` snapshot; updates swap a new one in.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub providers: Vec<ProviderState>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&ProviderState> {
        self.providers.iter().find(|p| p.id() == id)
    }

    pub fn healthy(&self) -> impl Iterator<Item = &ProviderState> {
        self.providers.iter().filter(|p| p.healthy)
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy().count()
    }
}

/// Process-wide provider registry. Request-time readers see a consistent
/// copy-on-write snapshot; only the health probe and the scheduler's
/// success/failure reporting mutate it.
pub struct ProviderRegistry {
    inner: RwLock<Arc<RegistrySnapshot>>,
    breaker: ProviderCircuitBreakerConfig,
}

impl ProviderRegistry {
    pub fn new(configs: Vec<ProviderConfig>, breaker: ProviderCircuitBreakerConfig) -> Self {
        let mut providers: Vec<ProviderState> =
            configs.into_iter().map(ProviderState::new).collect();
        providers.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        ProviderRegistry {
            inner: RwLock::new(Arc::new(RegistrySnapshot { providers })),
            breaker,
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    fn update<F: FnOnce(&mut RegistrySnapshot)>(&self, f: F) {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Record a successful call: closes the circuit and folds the observed
    /// latency into the rolling average.
    pub fn record_success(&self, id: &str, latency_ms: u64) {
        self.update(|snap| {
            if let Some(p) = snap.providers.iter_mut().find(|p| p.config.id == id) {
                p.healthy = true;
                p.consecutive_failures = 0;
                p.circuit_open_until = None;
                p.rolling_latency_ms = if p.rolling_latency_ms == 0.0 {
                    latency_ms as f64
                } else {
                    0.8 * p.rolling_latency_ms + 0.2 * latency_ms as f64
                };
            }
        });
    }

    /// Record a failed call; opens the circuit once the failure threshold
    /// is crossed.
    pub fn record_failure(&self, id: &str) {
        let breaker = self.breaker.clone();
        self.update(|snap| {
            if let Some(p) = snap.providers.iter_mut().find(|p| p.config.id == id) {
                p.consecutive_failures += 1;
                if p.consecutive_failures >= breaker.failure_threshold {
                    p.healthy = false;
                    p.circuit_open_until =
                        Some(Utc::now() + Duration::milliseconds(breaker.cooldown_ms as i64));
                }
            }
        });
    }

    /// Fold probe results in. A provider whose circuit is still open stays
    /// unhealthy regardless of the probe outcome.
    pub fn apply_probe(&self, results: &HashMap<ProviderId, bool>) {
        let now = Utc::now();
        self.update(|snap| {
            for p in snap.providers.iter_mut() {
                let circuit_open = p.circuit_open_until.map(|t| t > now).unwrap_or(false);
                if circuit_open {
                    p.healthy = false;
                    continue;
                }
                p.circuit_open_until = None;
                if let Some(ok) = results.get(p.id()) {
                    p.healthy = *ok;
                    if *ok {
                        p.consecutive_failures = 0;
                    }
                }
            }
        });
    }

    /// Force a provider's health flag; used by operators and tests.
    pub fn set_healthy(&self, id: &str, healthy: bool) {
        self.update(|snap| {
            if let Some(p) = snap.providers.iter_mut().find(|p| p.config.id == id) {
                p.healthy = healthy;
                if healthy {
                    p.consecutive_failures = 0;
                    p.circuit_open_until = None;
                }
            }
        });
    }

    pub fn summaries(&self) -> Vec<ProviderHealthSummaryV1> {
        self.snapshot()
            .providers
            .iter()
            .map(|p| ProviderHealthSummaryV1 {
                provider_id: p.config.id.clone(),
                healthy: p.healthy,
                consecutive_failures: p.consecutive_failures,
                rolling_latency_ms: p.rolling_latency_ms,
                circuit_open_until: p.circuit_open_until.map(|t| t.to_rfc3339()),
            })
            .collect()
    }
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max > min {
        (value - min) / (max - min)
    } else {
        0.0
    }
}

/// Rank providers for one fragment kind: capability filter, health filter,
/// weighted score, stable id tie-break. When no healthy provider carries
/// the capability the filter is relaxed to all healthy providers and the
/// capability mismatch is reflected in the priority term.
pub fn rank_for_kind(snapshot: &RegistrySnapshot, kind: FragmentKind) -> Vec<(ProviderId, f64)> {
    let capability = kind.required_capability();

    let mut candidates: Vec<&ProviderState> = snapshot
        .healthy()
        .filter(|p| p.has_capability(capability))
        .collect();
    if candidates.is_empty() {
        candidates = snapshot.healthy().collect();
    }
    if candidates.is_empty() {
        return Vec::new();
    }

    let min_cost = candidates
        .iter()
        .map(|p| p.rolling_cost)
        .fold(f64::INFINITY, f64::min);
    let max_cost = candidates
        .iter()
        .map(|p| p.rolling_cost)
        .fold(f64::NEG_INFINITY, f64::max);
    let min_latency = candidates
        .iter()
        .map(|p| p.rolling_latency_ms)
        .fold(f64::INFINITY, f64::min);
    let max_latency = candidates
        .iter()
        .map(|p| p.rolling_latency_ms)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut ranked: Vec<(ProviderId, f64)> = candidates
        .iter()
        .map(|p| {
            let priority = if p.has_capability(capability) {
                1.0
            } else {
                OFF_CAPABILITY_PRIORITY
            };
            let norm_cost = normalize(p.rolling_cost, min_cost, max_cost);
            let norm_latency = normalize(p.rolling_latency_ms, min_latency, max_latency);
            let score =
                W_PRIORITY * priority + W_COST * (1.0 - norm_cost) + W_LATENCY * (1.0 - norm_latency);
            (p.config.id.clone(), score)
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
}

/// Top-ranked provider ids for a kind, used for plan recommendations.
pub fn recommend_for_kind(snapshot: &RegistrySnapshot, kind: FragmentKind, top: usize) -> Vec<ProviderId> {
    rank_for_kind(snapshot, kind)
        .into_iter()
        .take(top)
        .map(|(id, _)| id)
        .collect()
}

/// Best healthy provider for `kind` that is not in `exclude`; used for
/// alternate-provider retries.
pub fn next_best_excluding(
    snapshot: &RegistrySnapshot,
    kind: FragmentKind,
    exclude: &HashSet<ProviderId>,
) -> Option<ProviderId> {
    rank_for_kind(snapshot, kind)
        .into_iter()
        .map(|(id, _)| id)
        .find(|id| !exclude.contains(id))
}

/// Assign one provider per fragment. `min_distinct` is the number of
/// distinct providers the plan requires (1 unless the query is sensitive);
/// when collisions keep the count below it, the lowest-ranked colliding
/// fragment is moved to the next-best distinct healthy provider.
pub fn assign(
    snapshot: &RegistrySnapshot,
    fragments: &[FragmentSpec],
    min_distinct: usize,
) -> PipelineResult<Vec<(String, ProviderId)>> {
    if snapshot.healthy_count() == 0 {
        return Err(PipelineError::NoProviderAvailable(
            "every provider is unhealthy".to_string(),
        ));
    }

    let mut assignments: Vec<(String, ProviderId, f64)> = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let ranked = rank_for_kind(snapshot, fragment.kind);
        let (provider_id, score) = ranked
            .first()
            .cloned()
            .ok_or_else(|| {
                PipelineError::NoProviderAvailable("every provider is unhealthy".to_string())
            })?;
        assignments.push((fragment.id.clone(), provider_id, score));
    }

    let target = min_distinct
        .min(snapshot.healthy_count())
        .min(fragments.len())
        .max(1);

    loop {
        let distinct: HashSet<&ProviderId> = assignments.iter().map(|(_, p, _)| p).collect();
        if distinct.len() >= target {
            break;
        }

        // Lowest-ranked fragment among those sharing a provider with
        // another fragment.
        let mut collision_idx: Option<usize> = None;
        for (i, (_, provider, score)) in assignments.iter().enumerate() {
            let shared = assignments
                .iter()
                .enumerate()
                .any(|(j, (_, p, _))| j != i && p == provider);
            if !shared {
                continue;
            }
            match collision_idx {
                None => collision_idx = Some(i),
                Some(best) => {
                    if *score < assignments[best].2 {
                        collision_idx = Some(i);
                    }
                }
            }
        }

        let Some(idx) = collision_idx else { break };
        let used: HashSet<ProviderId> = assignments.iter().map(|(_, p, _)| p.clone()).collect();
        let kind = fragments
            .iter()
            .find(|f| f.id == assignments[idx].0)
            .map(|f| f.kind)
            .unwrap_or(FragmentKind::General);

        match next_best_excluding(snapshot, kind, &used) {
            Some(alternate) => {
                let score = rank_for_kind(snapshot, kind)
                    .into_iter()
                    .find(|(id, _)| *id == alternate)
                    .map(|(_, s)| s)
                    .unwrap_or(0.0);
                assignments[idx].1 = alternate;
                assignments[idx].2 = score;
            }
            None => break,
        }
    }

    Ok(assignments
        .into_iter()
        .map(|(fragment_id, provider_id, _)| (fragment_id, provider_id))
        .collect())
}

/// Background task refreshing provider health every probe interval.
/// Readers keep seeing consistent snapshots while it runs.
pub async fn run_health_probe(
    registry: Arc<ProviderRegistry>,
    clients: Arc<HashMap<ProviderId, Arc<dyn crate::providers::ProviderClient>>>,
    interval: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut results = HashMap::new();
        for (id, client) in clients.iter() {
            results.insert(id.clone(), client.probe().await);
        }
        registry.apply_probe(&results);
        tracing::debug!(
            healthy = registry.snapshot().healthy_count(),
            probed = results.len(),
            "provider health probe finished"
        );
    }
}

/// Provider to try when everything is unhealthy and the coordinator
/// degrades to a single pass-through attempt: fewest consecutive failures,
/// stable by id.
pub fn least_unhealthy(snapshot: &RegistrySnapshot) -> Option<ProviderId> {
    snapshot
        .providers
        .iter()
        .min_by(|a, b| {
            a.consecutive_failures
                .cmp(&b.consecutive_failures)
                .then_with(|| a.config.id.cmp(&b.config.id))
        })
        .map(|p| p.config.id.clone())
}
