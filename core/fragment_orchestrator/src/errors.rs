use shared_types::{ErrorKind, PipelineFailure, ProviderId};
use thiserror::Error;

/// Failures the pipeline can produce. Severity and recovery are decided by
/// the coordinator: detection and state-store failures are soft, planning
/// and routing failures are terminal, provider failures stay per-fragment.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    #[error("detection unavailable: {0}")]
    DetectionUnavailable(String),

    #[error("plan unfeasible: {0}")]
    PlanUnfeasible(String),

    #[error("no provider available: {0}")]
    NoProviderAvailable(String),

    #[error("provider {provider_id} failed: {message}")]
    Provider {
        provider_id: ProviderId,
        message: String,
    },

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,

    #[error("no fragment produced a usable result")]
    AggregationEmpty,

    #[error("state store unavailable: {0}")]
    StateStore(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::DetectionUnavailable(_) => ErrorKind::DetectionUnavailable,
            PipelineError::PlanUnfeasible(_) => ErrorKind::PlanUnfeasible,
            PipelineError::NoProviderAvailable(_) => ErrorKind::NoProviderAvailable,
            PipelineError::Provider { .. } => ErrorKind::ProviderError,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Canceled => ErrorKind::Canceled,
            PipelineError::AggregationEmpty => ErrorKind::AggregationEmpty,
            PipelineError::StateStore(_) => ErrorKind::StateStoreUnavailable,
        }
    }

    /// Wire-safe form for FAILED events and the Fetch endpoint.
    pub fn to_failure(&self) -> PipelineFailure {
        PipelineFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_one_to_one() {
        assert_eq!(
            PipelineError::PlanUnfeasible("empty".into()).kind(),
            ErrorKind::PlanUnfeasible
        );
        assert_eq!(PipelineError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(
            PipelineError::Provider {
                provider_id: "p1".into(),
                message: "502".into()
            }
            .kind(),
            ErrorKind::ProviderError
        );
    }

    #[test]
    fn failure_carries_message_without_internals() {
        let failure = PipelineError::NoProviderAvailable("all unhealthy".into()).to_failure();
        assert_eq!(failure.kind, ErrorKind::NoProviderAvailable);
        assert!(failure.message.contains("all unhealthy"));
    }
}
