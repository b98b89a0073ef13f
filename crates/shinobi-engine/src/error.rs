use std::time::Duration;

use shinobi_core::errors::GatewayError;
use shinobi_core::usage::Usage;

use crate::workflow::ErrorPolicy;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("specialist '{specialist}' failed: {reason}")]
    SpecialistFailed { specialist: String, reason: String },

    /// A pause, not a fault. Surfaced as an error only where the caller
    /// cannot resume (inside an orchestrator or workflow step).
    #[error("specialist '{specialist}' needs human input: {question}")]
    HumanInputRequired { specialist: String, question: String },

    #[error(transparent)]
    GraphValidation(#[from] GraphValidationError),

    #[error("module '{module}' failed: {reason}")]
    ModuleFailed { module: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    WorkflowStep(Box<WorkflowStepError>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate capability: {0}")]
    DuplicateCapability(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),

    /// A failure raised after model calls were already made. `usage` is
    /// what those calls cost; display and classification are the source's.
    #[error("{source}")]
    Billed { usage: Usage, source: Box<EngineError> },
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Attach usage spent before this failure. Zero usage leaves the error
    /// unchanged; repeated calls accumulate.
    #[must_use]
    pub fn with_usage(self, usage: Usage) -> Self {
        if usage.is_zero() && !usage.approximate {
            return self;
        }
        match self {
            Self::Billed { usage: prior, source } => Self::Billed {
                usage: prior + usage,
                source,
            },
            other => Self::Billed {
                usage,
                source: Box::new(other),
            },
        }
    }

    /// Usage spent before the failure, zero if none was recorded.
    pub fn usage(&self) -> Usage {
        match self {
            Self::Billed { usage, .. } => *usage,
            _ => Usage::default(),
        }
    }

    /// The failure itself, without any attached usage.
    pub fn root(&self) -> &EngineError {
        match self {
            Self::Billed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Split into attached usage and the bare failure.
    pub fn take_usage(self) -> (Usage, EngineError) {
        match self {
            Self::Billed { usage, source } => {
                let (inner, root) = source.take_usage();
                (usage + inner, root)
            }
            other => (Usage::default(), other),
        }
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Billed { source, .. } => source.kind(),
            Self::Gateway(_) => "gateway",
            Self::SpecialistFailed { .. } => "specialist_failed",
            Self::HumanInputRequired { .. } => "human_input_required",
            Self::GraphValidation(_) => "graph_validation",
            Self::ModuleFailed { .. } => "module_failed",
            Self::Timeout(_) => "timeout",
            Self::WorkflowStep(_) => "workflow_step",
            Self::InvalidConfig(_) => "invalid_config",
            Self::DuplicateCapability(_) => "duplicate_capability",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled | Self::Gateway(GatewayError::Cancelled))
    }

    /// A gateway failure that repeating the same request cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Self::Gateway(e) if e.is_fatal())
    }
}

impl From<WorkflowStepError> for EngineError {
    fn from(err: WorkflowStepError) -> Self {
        Self::WorkflowStep(Box::new(err))
    }
}

/// Rejected before any module runs.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphValidationError {
    #[error("graph has no modules")]
    Empty,
    #[error("duplicate module id: {0}")]
    DuplicateModule(String),
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    MissingDependency { module: String, dependency: String },
    #[error("dependency cycle among modules: {}", modules.join(", "))]
    Cycle { modules: Vec<String> },
}

/// A workflow step failure with the policy that was applied to it.
#[derive(Debug, thiserror::Error)]
#[error("step '{step_id}' (#{step_index}) failed after {attempts} attempt(s) under {policy:?} policy: {source}")]
pub struct WorkflowStepError {
    pub step_id: String,
    pub step_index: usize,
    pub policy: ErrorPolicy,
    pub attempts: u32,
    pub source: EngineError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_modules() {
        let err = GraphValidationError::Cycle {
            modules: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle among modules: a, b");
    }

    #[test]
    fn step_error_wraps_source() {
        let err: EngineError = WorkflowStepError {
            step_id: "draft".into(),
            step_index: 1,
            policy: ErrorPolicy::Halt,
            attempts: 1,
            source: EngineError::Cancelled,
        }
        .into();
        assert_eq!(err.kind(), "workflow_step");
        assert!(err.to_string().contains("step 'draft' (#1)"));
        assert!(std::error::Error::source(&err).is_some());
    }

    fn spent(tokens: u64) -> Usage {
        Usage {
            total_tokens: tokens,
            model_calls: 1,
            ..Usage::default()
        }
    }

    #[test]
    fn usage_attaches_and_accumulates() {
        let err = EngineError::Gateway(GatewayError::ProviderOverloaded)
            .with_usage(spent(10))
            .with_usage(spent(5));
        assert_eq!(err.usage().total_tokens, 15);
        assert_eq!(err.usage().model_calls, 2);
        assert_eq!(err.kind(), "gateway");
        assert_eq!(err.to_string(), "gateway error: provider overloaded");
        assert!(matches!(err.root(), EngineError::Gateway(GatewayError::ProviderOverloaded)));

        let (usage, root) = err.take_usage();
        assert_eq!(usage.total_tokens, 15);
        assert!(matches!(root, EngineError::Gateway(_)));
    }

    #[test]
    fn zero_usage_leaves_error_bare() {
        let err = EngineError::Cancelled.with_usage(Usage::default());
        assert!(matches!(err, EngineError::Cancelled));
        let unknown = Usage {
            approximate: true,
            ..Usage::default()
        };
        assert!(EngineError::Cancelled.with_usage(unknown).usage().approximate);
    }

    #[test]
    fn classification_sees_through_usage() {
        let err = EngineError::Cancelled.with_usage(spent(1));
        assert!(err.is_cancelled());
        let fatal = EngineError::Gateway(GatewayError::AuthenticationFailed("k".into())).with_usage(spent(1));
        assert!(fatal.is_fatal());
        assert!(!EngineError::Gateway(GatewayError::ProviderOverloaded).is_fatal());
    }

    #[test]
    fn cancellation_is_recognised_through_gateway() {
        assert!(EngineError::Gateway(GatewayError::Cancelled).is_cancelled());
        assert!(!EngineError::Timeout(Duration::from_secs(1)).is_cancelled());
    }
}
