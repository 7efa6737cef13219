//! In-memory `ExecutionRepository`.
//!
//! Useful for tests and for embedding the engine without a database.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use taskloom_core::repository::SortOrder;
use taskloom_core::repository::execution::ExecutionRepository;
use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{ExecutionRecord, ExecutionStatus, TransitionRecord};

#[derive(Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<Uuid, ExecutionRecord>,
    transitions: DashMap<Uuid, Vec<TransitionRecord>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(format!(
                "execution '{}' already exists",
                execution.id
            )));
        }
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut execution = self.executions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        execution.status = status;
        if let Some(output) = output {
            execution.output = Some(output.clone());
        }
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn append_transition(&self, transition: &TransitionRecord) -> Result<(), RepositoryError> {
        {
            let mut execution = self
                .executions
                .get_mut(&transition.execution_id)
                .ok_or(RepositoryError::NotFound)?;
            execution.status = transition.transition_type.execution_status();
            execution.updated_at = Utc::now();
        }
        self.transitions
            .entry(transition.execution_id)
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn list_transitions(
        &self,
        execution_id: &Uuid,
        order: SortOrder,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let mut transitions = self
            .transitions
            .get(execution_id)
            .map(|t| t.value().clone())
            .unwrap_or_default();
        if order == SortOrder::Desc {
            transitions.reverse();
        }
        Ok(transitions)
    }

    async fn latest_transition(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<TransitionRecord>, RepositoryError> {
        Ok(self
            .transitions
            .get(execution_id)
            .and_then(|t| t.value().last().cloned()))
    }
}
