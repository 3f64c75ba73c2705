use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Pipeline data model: detection, plans, fragments, results, progress.
pub mod pipeline;
pub use pipeline::*;

/// Identifier for one submitted query; unique within a process lifetime.
pub type RequestId = Uuid;

/// Opaque identifier for a configured LLM provider (e.g. "openrouter-a").
pub type ProviderId = String;

/// Correlation identifier used to join logs/traces across the orchestrator
/// and the HTTP surface.
pub type CorrelationId = Uuid;

/// API version for all external contracts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiVersion {
    V1,
}

/// Convenience constant for the current stable version.
pub const API_VERSION_CURRENT: ApiVersion = ApiVersion::V1;

/// Wire-level error kind published in FAILED progress events and the Fetch
/// endpoint. Mirrors the pipeline error taxonomy without internal detail.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DetectionUnavailable,
    PlanUnfeasible,
    NoProviderAvailable,
    ProviderError,
    Timeout,
    Canceled,
    AggregationEmpty,
    StateStoreUnavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DetectionUnavailable => "detection_unavailable",
            ErrorKind::PlanUnfeasible => "plan_unfeasible",
            ErrorKind::NoProviderAvailable => "no_provider_available",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Canceled => "canceled",
            ErrorKind::AggregationEmpty => "aggregation_empty",
            ErrorKind::StateStoreUnavailable => "state_store_unavailable",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Structured failure surfaced to external consumers. Carries no stack or
/// provider internals.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Privacy posture requested for a query; shifts strategy thresholds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Per-request overrides accepted on submission. Absent fields fall back to
/// the process-wide pipeline configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct QueryPolicy {
    #[serde(default)]
    pub privacy_level: Option<PrivacyLevel>,
    #[serde(default)]
    pub max_fragments: Option<usize>,
    #[serde(default)]
    pub min_providers_for_sensitive: Option<usize>,
}

fn default_max_fragments() -> usize {
    5
}
fn default_max_in_flight() -> usize {
    8
}
fn default_fragment_timeout_ms() -> u64 {
    8_000
}
fn default_total_deadline_ms() -> u64 {
    30_000
}
fn default_retries() -> u32 {
    2
}
fn default_retry_alternate_provider() -> bool {
    true
}
fn default_chunk_size_cap() -> usize {
    400
}
fn default_min_providers_for_sensitive() -> usize {
    2
}
fn default_health_probe_interval_ms() -> u64 {
    30_000
}
fn default_max_replay() -> usize {
    64
}
fn default_state_ttl_seconds() -> u64 {
    3_600
}

/// Process-wide pipeline tuning. Field defaults match the documented
/// configuration table so a minimal TOML file is valid.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_fragment_timeout_ms")]
    pub fragment_timeout_ms: u64,
    #[serde(default = "default_total_deadline_ms")]
    pub total_deadline_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_alternate_provider")]
    pub retry_alternate_provider: bool,
    #[serde(default = "default_chunk_size_cap")]
    pub chunk_size_cap: usize,
    #[serde(default = "default_min_providers_for_sensitive")]
    pub min_providers_for_sensitive: usize,
    #[serde(default = "default_health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,
    #[serde(default = "default_max_replay")]
    pub max_replay: usize,
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: u64,
    #[serde(default)]
    pub privacy_level: PrivacyLevel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_fragments: default_max_fragments(),
            max_in_flight: default_max_in_flight(),
            fragment_timeout_ms: default_fragment_timeout_ms(),
            total_deadline_ms: default_total_deadline_ms(),
            retries: default_retries(),
            retry_alternate_provider: default_retry_alternate_provider(),
            chunk_size_cap: default_chunk_size_cap(),
            min_providers_for_sensitive: default_min_providers_for_sensitive(),
            health_probe_interval_ms: default_health_probe_interval_ms(),
            max_replay: default_max_replay(),
            state_ttl_seconds: default_state_ttl_seconds(),
            privacy_level: PrivacyLevel::default(),
        }
    }
}

impl PipelineConfig {
    /// Apply per-request policy overrides on top of the process defaults.
    pub fn with_policy(&self, policy: &QueryPolicy) -> PipelineConfig {
        let mut effective = self.clone();
        if let Some(level) = policy.privacy_level {
            effective.privacy_level = level;
        }
        if let Some(max) = policy.max_fragments {
            effective.max_fragments = max.max(1);
        }
        if let Some(min) = policy.min_providers_for_sensitive {
            effective.min_providers_for_sensitive = min.max(1);
        }
        effective
    }
}

fn default_provider_weight() -> f64 {
    0.8
}

/// Static configuration for one upstream LLM provider.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_name: String,
    /// Opaque capability tags ("general", "code", "sensitive", "cheap", ...).
    /// Membership is deployment-defined; the router matches them nominally.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Static ensemble weight in [0, 1] used by the aggregator.
    #[serde(default = "default_provider_weight")]
    pub weight: f64,
    /// Nominal cost per 1K tokens, used for routing score normalization.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

/// Redis-backed state store configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,
    /// Redis connection pool size
    pub pool_size: u32,
    /// Connection timeout in milliseconds
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,
}

/// Circuit breaker thresholds applied to provider health tracking.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderCircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for ProviderCircuitBreakerConfig {
    fn default() -> Self {
        ProviderCircuitBreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 60_000,
        }
    }
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub circuit_breaker: ProviderCircuitBreakerConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Point-in-time provider health exposed by the providers endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderHealthSummaryV1 {
    pub provider_id: ProviderId,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub rolling_latency_ms: f64,
    pub circuit_open_until: Option<String>,
}

fn default_api_version() -> ApiVersion {
    API_VERSION_CURRENT
}

/// Body of `POST /api/v1/queries`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitRequestV1 {
    #[serde(default = "default_api_version")]
    pub api_version: ApiVersion,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub query: String,
    #[serde(default)]
    pub policy: Option<QueryPolicy>,
}

/// Response of `POST /api/v1/queries`; the coordinator runs asynchronously.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitResponseV1 {
    pub api_version: ApiVersion,
    pub request_id: RequestId,
    pub correlation_id: CorrelationId,
}

/// Processing status reported by the Fetch endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Processing,
    Complete,
    Failed,
}

/// Response of `GET /api/v1/queries/{id}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FetchResponseV1 {
    pub api_version: ApiVersion,
    pub request_id: RequestId,
    pub status: FetchStatus,
    #[serde(default)]
    pub aggregated: Option<AggregatedResponse>,
    #[serde(default)]
    pub error: Option<PipelineFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_request_v1_defaults_api_version_and_policy() {
        let value = json!({
            "query": "What is the capital of France?"
        });

        let req: SubmitRequestV1 =
            serde_json::from_value(value).expect("deserialization should succeed");
        assert_eq!(req.api_version, API_VERSION_CURRENT);
        assert!(req.policy.is_none());
        assert!(req.correlation_id.is_none());
    }

    #[test]
    fn pipeline_config_defaults_match_documented_table() {
        let cfg: PipelineConfig = serde_json::from_value(json!({})).expect("empty config is valid");
        assert_eq!(cfg.max_fragments, 5);
        assert_eq!(cfg.max_in_flight, 8);
        assert_eq!(cfg.fragment_timeout_ms, 8_000);
        assert_eq!(cfg.total_deadline_ms, 30_000);
        assert_eq!(cfg.retries, 2);
        assert!(cfg.retry_alternate_provider);
        assert_eq!(cfg.chunk_size_cap, 400);
        assert_eq!(cfg.min_providers_for_sensitive, 2);
        assert_eq!(cfg.max_replay, 64);
        assert_eq!(cfg.state_ttl_seconds, 3_600);
        assert_eq!(cfg.privacy_level, PrivacyLevel::Medium);
    }

    #[test]
    fn policy_overrides_apply_and_clamp_to_one() {
        let base = PipelineConfig::default();
        let policy = QueryPolicy {
            privacy_level: Some(PrivacyLevel::High),
            max_fragments: Some(0),
            min_providers_for_sensitive: Some(3),
        };

        let effective = base.with_policy(&policy);
        assert_eq!(effective.privacy_level, PrivacyLevel::High);
        assert_eq!(effective.max_fragments, 1);
        assert_eq!(effective.min_providers_for_sensitive, 3);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let kind = ErrorKind::NoProviderAvailable;
        let json = serde_json::to_string(&kind).expect("serialization should succeed");
        assert_eq!(json, "\"no_provider_available\"");
    }
}
