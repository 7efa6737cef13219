//! Execution and transition repository trait definition.

use serde_json::Value;
use uuid::Uuid;

use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{ExecutionRecord, ExecutionStatus, TransitionRecord};

use super::SortOrder;

/// Storage for execution rows and their append-only transition log.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Persist a new execution. Returns `Conflict` if the id already exists.
    fn create_execution(
        &self,
        execution: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// Set the status (and, when given, the output or error) of an execution.
    /// Returns `NotFound` for an unknown id.
    fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Append a transition and move the execution to the status it implies.
    fn append_transition(
        &self,
        transition: &TransitionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Transitions of an execution ordered by creation time.
    fn list_transitions(
        &self,
        execution_id: &Uuid,
        order: SortOrder,
    ) -> impl std::future::Future<Output = Result<Vec<TransitionRecord>, RepositoryError>> + Send;

    fn latest_transition(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TransitionRecord>, RepositoryError>> + Send;
}
