use thiserror::Error;

use crate::schedules::model::TaskState;

/// Errors surfaced by the scheduling core.
///
/// Contention (another worker already applied a conditional update) is not an
/// error: those paths return `Ok(false)` / `Ok(None)`.
#[derive(Debug, Error)]
pub enum SchedError {
    /// A cron expression could not be parsed.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },

    /// A poll loop was configured with no wait times.
    #[error("poll wait-time sequence must not be empty")]
    EmptyWaitTimes,

    /// A strategy name has no registration.
    #[error("unknown {kind} strategy `{name}`")]
    UnknownStrategy { kind: &'static str, name: String },

    /// A stored schedule definition does not decode for its strategy.
    #[error("invalid schedule definition for `{strategy}`: {reason}")]
    InvalidScheduleDefinition { strategy: String, reason: String },

    /// The requested task state change is not in the transition table.
    #[error("illegal task transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    /// A lease length outside `1..=time::MAX_OFFSET_SECONDS`.
    #[error("invalid lease duration: {seconds}s")]
    InvalidLeaseDuration { seconds: i64 },

    #[error("schedule not found: {id}")]
    ScheduleNotFound { id: String },

    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Datastore failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Job-execution backend failure.
    #[error("execution backend error: {0}")]
    Execution(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedError {
    pub fn invalid_cron(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_definition(strategy: &str, reason: impl Into<String>) -> Self {
        Self::InvalidScheduleDefinition {
            strategy: strategy.to_string(),
            reason: reason.into(),
        }
    }

    /// Configuration errors are non-retryable and fail at construction time.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidCron { .. }
                | Self::EmptyWaitTimes
                | Self::UnknownStrategy { .. }
                | Self::InvalidScheduleDefinition { .. }
                | Self::IllegalTransition { .. }
                | Self::InvalidLeaseDuration { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
