//! Execution submission and control.
//!
//! Creates execution records, runs root executions through an
//! `ExecutionLauncher` and records their terminal state. Cancellation and
//! external input are forwarded to the launcher.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use taskloom_types::execution::{ExecutionRecord, ExecutionStatus, TransitionRecord};
use taskloom_types::task::{Cursor, ExecutionInput, MAIN_WORKFLOW, TaskDefinition};

use crate::engine::error::ExecutionError;
use crate::engine::runtime::{ExecutionArgs, ExecutionLauncher};
use crate::repository::SortOrder;
use crate::repository::execution::ExecutionRepository;

/// Request to run a task once.
#[derive(Debug, Clone)]
pub struct SubmitExecution {
    pub task: TaskDefinition,
    pub agent_id: Uuid,
    pub user_id: Option<Uuid>,
    pub arguments: Value,
}

pub struct ExecutionService<R: ExecutionRepository, L: ExecutionLauncher> {
    repository: Arc<R>,
    launcher: L,
}

impl<R: ExecutionRepository, L: ExecutionLauncher> ExecutionService<R, L> {
    pub fn new(repository: Arc<R>, launcher: L) -> Self {
        Self {
            repository,
            launcher,
        }
    }

    /// Validate the task and persist a `queued` execution.
    ///
    /// Rejects tasks without a `main` workflow or with two workflows of the
    /// same name.
    pub async fn create_execution(
        &self,
        request: SubmitExecution,
    ) -> Result<ExecutionInput, ExecutionError> {
        let SubmitExecution {
            task,
            agent_id,
            user_id,
            arguments,
        } = request;

        if task.workflow(MAIN_WORKFLOW).is_none() {
            return Err(ExecutionError::InvalidTask(format!(
                "task '{}' has no '{MAIN_WORKFLOW}' workflow",
                task.name
            )));
        }
        if let Some(name) = task.duplicate_workflow_name() {
            return Err(ExecutionError::InvalidTask(format!(
                "task '{}' defines workflow '{name}' more than once",
                task.name
            )));
        }

        let now = Utc::now();
        let record = ExecutionRecord {
            id: Uuid::now_v7(),
            task_id: task.id,
            agent_id,
            user_id,
            status: ExecutionStatus::Queued,
            input: arguments.clone(),
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.repository.create_execution(&record).await?;

        tracing::info!(
            execution_id = %record.id,
            task = %task.name,
            "execution created"
        );

        Ok(ExecutionInput {
            task,
            execution_id: record.id,
            agent_id,
            user_id,
            arguments,
        })
    }

    /// Run a created execution from `main` step 0 to its terminal state.
    pub async fn run(&self, input: ExecutionInput) -> Result<Value, ExecutionError> {
        let execution_id = input.execution_id;
        self.repository
            .update_execution_status(&execution_id, ExecutionStatus::Running, None, None)
            .await?;

        let args = ExecutionArgs::new(input, Cursor::start(MAIN_WORKFLOW), None);
        let result = self.launcher.launch(args).await;

        match &result {
            Ok(output) => {
                tracing::info!(execution_id = %execution_id, "execution succeeded");
                self.repository
                    .update_execution_status(
                        &execution_id,
                        ExecutionStatus::Succeeded,
                        Some(output),
                        None,
                    )
                    .await?;
            }
            Err(err) => {
                let status = if err.is_cancelled() {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                tracing::error!(
                    execution_id = %execution_id,
                    status = ?status,
                    error = %err,
                    "execution did not succeed"
                );
                let message = err.to_string();
                self.repository
                    .update_execution_status(&execution_id, status, None, Some(&message))
                    .await?;
            }
        }

        result
    }

    /// Create and run in one call.
    pub async fn submit(&self, request: SubmitExecution) -> Result<Value, ExecutionError> {
        let input = self.create_execution(request).await?;
        self.run(input).await
    }

    /// Cancel a running execution and all of its sub-executions.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        tracing::info!(execution_id = %execution_id, "cancelling execution");
        self.launcher.cancel(execution_id)
    }

    /// Deliver input to a suspended step; the oldest pending wait receives
    /// it when no signal name is given.
    pub fn provide_input(&self, execution_id: Uuid, signal: Option<&str>, value: Value) -> bool {
        self.launcher.send_input(execution_id, signal, value)
    }

    pub fn pending_inputs(&self, execution_id: Uuid) -> Vec<String> {
        self.launcher.pending_inputs(execution_id)
    }

    pub async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<ExecutionRecord>, ExecutionError> {
        Ok(self.repository.get_execution(execution_id).await?)
    }

    pub async fn transitions(
        &self,
        execution_id: &Uuid,
        order: SortOrder,
    ) -> Result<Vec<TransitionRecord>, ExecutionError> {
        Ok(self.repository.list_transitions(execution_id, order).await?)
    }
}
