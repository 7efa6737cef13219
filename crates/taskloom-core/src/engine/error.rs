//! Engine-wide error taxonomy.

use taskloom_types::error::{ActivityErrorKind, OffloadError, RepositoryError};
use taskloom_types::task::{Cursor, UnknownStepKind};

use super::activity::ActivityError;
use super::expression::ExpressionError;

/// Errors surfaced by task execution.
///
/// Structural errors (`InvalidCursor`, `UnknownStepKind`, `NoMatchingBranch`,
/// `InvalidParallelism`, `InvalidTask`) mean the task definition is malformed.
/// Every fatal error propagates through the continuation chain to the root
/// execution, which records a terminal `error` transition.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid cursor {cursor}: {reason}")]
    InvalidCursor { cursor: Cursor, reason: String },

    #[error(transparent)]
    UnknownStepKind(#[from] UnknownStepKind),

    #[error("no matching branch for switch at {0}")]
    NoMatchingBranch(Cursor),

    #[error("invalid parallelism {requested}: effective value {effective} must be greater than 1")]
    InvalidParallelism { requested: i64, effective: i64 },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("activity '{activity}' failed: {source}")]
    ActivityFailure {
        activity: String,
        #[source]
        source: ActivityError,
    },

    #[error("Error in batch {batch}: {source}")]
    BatchFailure {
        batch: usize,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("step {cursor} failed: {message}")]
    StepFailed { cursor: Cursor, message: String },

    #[error("timed out waiting for input at {0}")]
    InputTimeout(Cursor),

    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Offload(#[from] OffloadError),

    #[error("failed to record transition: {0}")]
    Transition(#[from] RepositoryError),

    #[error("no next step after {0}")]
    NoNextStep(Cursor),

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl ExecutionError {
    /// Convert a surfaced activity error, keeping expression failures and
    /// cancellations in their own variants.
    pub fn from_activity(activity: impl Into<String>, error: ActivityError) -> Self {
        match error {
            ActivityError::Expression(e) => ExecutionError::Expression(e),
            other if other.kind() == ActivityErrorKind::Cancelled => ExecutionError::Cancelled,
            other => ExecutionError::ActivityFailure {
                activity: activity.into(),
                source: other,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}
