#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use fragment_orchestrator::coordinator::CoordinatorContext;
use fragment_orchestrator::detection::DetectionEngine;
use fragment_orchestrator::progress::{ProgressBus, ProgressSubscription};
use fragment_orchestrator::providers::{GenerateOutput, ProviderCallError, ProviderClient};
use fragment_orchestrator::router::ProviderRegistry;
use fragment_orchestrator::state_service::MemoryStateStore;
use shared_types::{
    AppConfig, PipelineConfig, ProgressEvent, ProviderCircuitBreakerConfig, ProviderConfig,
    RequestId, RequestRecord,
};

pub fn provider(id: &str, capabilities: &[&str], cost: f64) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        base_url: format!("http://{id}.test.local"),
        api_key: None,
        model_name: format!("{id}-model"),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        weight: 0.9,
        cost_per_1k_tokens: cost,
    }
}

/// Scripted provider behaviors for deterministic pipeline tests.
pub enum Behavior {
    /// Answer `"{prefix}{prompt}"` after a fixed latency.
    Echo { prefix: &'static str, latency_ms: u64 },
    /// Never answer; only cancellation ends the call.
    Hang,
    /// Always fail with a remote error.
    Fail { message: &'static str },
    /// Fail the first `failures` calls, then echo.
    FailThenEcho { failures: usize },
    /// Block until the gate receives a permit, then echo.
    Gated { gate: Arc<Semaphore> },
    /// Echo after `latency_ms` while tracking peak concurrency.
    Tracked {
        latency_ms: u64,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    },
}

pub struct ScriptedClient {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(ScriptedClient {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn echo(prefix: &str, prompt: &str) -> GenerateOutput {
        GenerateOutput {
            text: format!("{prefix}{prompt}"),
            tokens_in: (prompt.len() / 4) as u64,
            tokens_out: 50,
            cost: 0.01,
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerateOutput, ProviderCallError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Echo { prefix, latency_ms } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderCallError::Canceled),
                    _ = tokio::time::sleep(Duration::from_millis(*latency_ms)) => {
                        Ok(Self::echo(prefix, prompt))
                    }
                }
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(ProviderCallError::Canceled)
            }
            Behavior::Fail { message } => Err(ProviderCallError::Remote(message.to_string())),
            Behavior::FailThenEcho { failures } => {
                if call < *failures {
                    Err(ProviderCallError::Remote("transient upstream error".to_string()))
                } else {
                    Ok(Self::echo("", prompt))
                }
            }
            Behavior::Gated { gate } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderCallError::Canceled),
                    permit = gate.acquire() => {
                        permit.expect("gate closed").forget();
                        Ok(Self::echo("", prompt))
                    }
                }
            }
            Behavior::Tracked {
                latency_ms,
                active,
                peak,
            } => {
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_active, Ordering::SeqCst);
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderCallError::Canceled),
                    _ = tokio::time::sleep(Duration::from_millis(*latency_ms)) => {
                        Ok(Self::echo("", prompt))
                    }
                };
                active.fetch_sub(1, Ordering::SeqCst);
                result
            }
        }
    }
}

/// Wire a coordinator context from scripted providers and a pipeline config.
pub fn build_context(
    providers: Vec<(ProviderConfig, Arc<dyn ProviderClient>)>,
    pipeline: PipelineConfig,
) -> Arc<CoordinatorContext> {
    let configs: Vec<ProviderConfig> = providers.iter().map(|(c, _)| c.clone()).collect();
    let clients: Arc<HashMap<String, Arc<dyn ProviderClient>>> = Arc::new(
        providers
            .into_iter()
            .map(|(c, client)| (c.id, client))
            .collect(),
    );

    let registry = Arc::new(ProviderRegistry::new(
        configs.clone(),
        ProviderCircuitBreakerConfig::default(),
    ));
    let bus = Arc::new(ProgressBus::new(pipeline.max_replay));
    let config = AppConfig {
        pipeline,
        providers: configs,
        circuit_breaker: ProviderCircuitBreakerConfig::default(),
        redis: None,
    };

    Arc::new(CoordinatorContext {
        config: Arc::new(config),
        detection: Arc::new(DetectionEngine::with_defaults()),
        registry,
        clients,
        bus,
        store: Arc::new(MemoryStateStore::new()),
        records: DashMap::new(),
        cancellations: DashMap::new(),
        cache_enabled: false,
    })
}

/// Drain a subscription until its terminal event, guarded against hangs.
pub async fn collect_until_terminal(mut sub: ProgressSubscription) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(300), async {
        while let Some(event) = sub.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
    })
    .await
    .expect("stream did not reach a terminal event");
    events
}

/// Poll the record table until the coordinator seals the request.
pub async fn wait_for_terminal_record(
    ctx: &Arc<CoordinatorContext>,
    request_id: RequestId,
) -> RequestRecord {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            if let Some(record) = ctx.records.get(&request_id) {
                if record.is_sealed() {
                    return record.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request never reached a terminal state")
}
