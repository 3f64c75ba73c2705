use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{ErrorKind, ProviderId, RequestId};

/// Categories the detection engine can assign to a text span.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Person,
    Email,
    Phone,
    Ssn,
    CreditCard,
    Address,
    ApiKey,
    MedicalId,
    Location,
    Organization,
    CodeBlock,
    Other,
}

impl EntityKind {
    /// Kinds that immediately push a query into the high-risk band.
    pub fn is_high_risk(self) -> bool {
        matches!(
            self,
            EntityKind::Ssn | EntityKind::CreditCard | EntityKind::ApiKey | EntityKind::MedicalId
        )
    }

    /// Label used in placeholders, e.g. "PERSON" in "PERSON_1".
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Person => "PERSON",
            EntityKind::Email => "EMAIL",
            EntityKind::Phone => "PHONE",
            EntityKind::Ssn => "SSN",
            EntityKind::CreditCard => "CREDIT_CARD",
            EntityKind::Address => "ADDRESS",
            EntityKind::ApiKey => "API_KEY",
            EntityKind::MedicalId => "MEDICAL_ID",
            EntityKind::Location => "LOCATION",
            EntityKind::Organization => "ORGANIZATION",
            EntityKind::CodeBlock => "CODE_BLOCK",
            EntityKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One detected span. Offsets are byte offsets into the original query and
/// satisfy `0 <= start < end <= query.len()`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub confidence: f64,
}

/// Output of the detection engine. Spans are ordered by start offset and
/// non-overlapping after dedup. Immutable once produced.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DetectionReport {
    pub entities: Vec<Entity>,
    pub has_code: bool,
    pub code_language: Option<String>,
    pub sensitivity_score: f64,
}

impl DetectionReport {
    /// Report used when detection degrades to a soft failure.
    pub fn empty() -> Self {
        DetectionReport::default()
    }

    pub fn has_pii(&self) -> bool {
        self.entities
            .iter()
            .any(|e| e.kind != EntityKind::CodeBlock)
    }
}

/// One original-span-to-placeholder substitution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub original: String,
    pub placeholder: String,
    pub kind: EntityKind,
}

/// Bijection between original span text and placeholders ("PERSON_1"),
/// ordered by span position. Carries enough to invert during aggregation.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EntityMap {
    pub entries: Vec<EntityMapping>,
}

impl EntityMap {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn placeholder_for(&self, original: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|m| m.original == original)
            .map(|m| m.placeholder.as_str())
    }

    pub fn original_for(&self, placeholder: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|m| m.placeholder == placeholder)
            .map(|m| m.original.as_str())
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|m| m.placeholder.as_str())
    }

    pub fn originals(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|m| m.original.as_str())
    }
}

/// Fragmentation policy chosen for one query.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FragmentationStrategy {
    PassThrough,
    SemanticSplit,
    PiiIsolate,
    CodeIsolate,
    Hybrid,
}

/// Role a fragment plays in the plan; drives capability-based routing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FragmentKind {
    General,
    PiiBearing,
    Code,
    Context,
}

impl FragmentKind {
    /// Capability tag a provider must carry to receive this fragment kind.
    pub fn required_capability(self) -> &'static str {
        match self {
            FragmentKind::Code => "code",
            FragmentKind::PiiBearing => "sensitive",
            FragmentKind::General | FragmentKind::Context => "general",
        }
    }
}

/// One bounded piece of the anonymized query, submitted to one provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FragmentSpec {
    pub id: String,
    pub anonymized_text: String,
    pub kind: FragmentKind,
    pub recommended_providers: Vec<ProviderId>,
}

/// Strategy plus fragment specs plus the entity map that anonymized them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FragmentationPlan {
    pub strategy: FragmentationStrategy,
    pub fragments: Vec<FragmentSpec>,
    pub entity_map: EntityMap,
}

/// Terminal status of one fragment's dispatch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FragmentStatus {
    Ok,
    Timeout,
    ProviderError,
    Canceled,
}

/// Per-fragment outcome produced by the dispatch scheduler.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FragmentResult {
    pub fragment_id: String,
    pub provider_id: ProviderId,
    pub status: FragmentStatus,
    pub response_text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    pub cost: f64,
    pub confidence: f64,
}

impl FragmentResult {
    pub fn is_ok(&self) -> bool {
        self.status == FragmentStatus::Ok
    }
}

/// How many fragments each provider ended up handling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProviderUsage {
    pub provider_id: ProviderId,
    pub fragments_handled: usize,
}

/// Final recombined answer plus quality and privacy accounting.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AggregatedResponse {
    pub final_text: String,
    pub privacy_score: f64,
    pub quality_score: f64,
    pub total_cost: f64,
    pub total_latency_ms: u64,
    pub per_fragment: Vec<FragmentResult>,
    pub per_provider: Vec<ProviderUsage>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

/// Coordinator stage carried on every progress event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    Detection,
    Planning,
    Anonymization,
    Dispatch,
    Aggregation,
    Complete,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }
}

/// Status of the stage named by the event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Started,
    Progress,
    Completed,
    Failed,
}

/// One record on the per-request progress stream. `timestamp_ms` is
/// monotonic milliseconds since the request was submitted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressEvent {
    pub request_id: RequestId,
    pub stage: Stage,
    pub status: EventStatus,
    pub progress_pct: u8,
    pub message: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub timestamp_ms: u64,
}

impl ProgressEvent {
    /// Marker inserted into a subscriber's stream when it fell behind and
    /// events were dropped.
    pub fn lagged(request_id: RequestId, skipped: u64, timestamp_ms: u64) -> Self {
        ProgressEvent {
            request_id,
            stage: Stage::Dispatch,
            status: EventStatus::Progress,
            progress_pct: 0,
            message: "lagged".to_string(),
            payload: Some(serde_json::json!({ "lagged": true, "skipped": skipped })),
            timestamp_ms,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_lagged_marker(&self) -> bool {
        self.payload
            .as_ref()
            .and_then(|p| p.get("lagged"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Terminal disposition of a request record.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalState {
    Complete,
    Failed { kind: ErrorKind, message: String },
}

/// Process-wide state for one request, owned exclusively by its coordinator
/// and persisted under `req:<RequestId>` between stage transitions.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub query: String,
    pub created_at: String,
    #[serde(default)]
    pub plan: Option<FragmentationPlan>,
    #[serde(default)]
    pub results: Option<Vec<FragmentResult>>,
    #[serde(default)]
    pub aggregated: Option<AggregatedResponse>,
    #[serde(default)]
    pub terminal: Option<TerminalState>,
}

impl RequestRecord {
    pub fn new(request_id: RequestId, query: String, created_at: String) -> Self {
        RequestRecord {
            request_id,
            query,
            created_at,
            plan: None,
            results: None,
            aggregated: None,
            terminal: None,
        }
    }

    /// A sealed record ignores further input.
    pub fn is_sealed(&self) -> bool {
        self.terminal.is_some()
    }
}
