//! Per-step execution context.
//!
//! A `StepContext` is built fresh for every dispatched step: the resolved
//! cursor and step, the immutable execution input, the plain (resolved)
//! values of all previous inputs, and the carried user state. It holds no
//! live handles, so it can be cloned into activities and sub-executions.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use taskloom_types::execution::UserState;
use taskloom_types::task::{Cursor, ExecutionInput, ToolDef, WorkflowStep};

use super::error::ExecutionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub execution_input: ExecutionInput,
    pub cursor: Cursor,
    pub current_step: WorkflowStep,
    /// Previous inputs in order; the first is the submitted arguments.
    pub inputs: Vec<Value>,
    pub user_state: UserState,
}

impl StepContext {
    /// Resolve `cursor` against the task and build the context.
    ///
    /// Fails with `InvalidCursor` when the workflow is unknown or the step
    /// index is out of range.
    pub fn new(
        execution_input: ExecutionInput,
        cursor: Cursor,
        inputs: Vec<Value>,
        user_state: UserState,
    ) -> Result<Self, ExecutionError> {
        let workflow = execution_input
            .task
            .workflow(&cursor.workflow)
            .ok_or_else(|| ExecutionError::InvalidCursor {
                cursor: cursor.clone(),
                reason: format!("unknown workflow '{}'", cursor.workflow),
            })?;

        let current_step = workflow
            .steps
            .get(cursor.step)
            .cloned()
            .ok_or_else(|| ExecutionError::InvalidCursor {
                cursor: cursor.clone(),
                reason: format!(
                    "step index out of range (workflow has {} steps)",
                    workflow.steps.len()
                ),
            })?;

        Ok(Self {
            execution_input,
            cursor,
            current_step,
            inputs,
            user_state,
        })
    }

    /// Output of the previous step (or the submitted arguments).
    pub fn current_input(&self) -> Value {
        self.inputs.last().cloned().unwrap_or(Value::Null)
    }

    pub fn is_first_step(&self) -> bool {
        self.cursor.step == 0
    }

    pub fn is_main(&self) -> bool {
        self.cursor.is_main()
    }

    /// Whether no step follows this one in its workflow.
    pub fn is_last_step(&self) -> bool {
        self.execution_input
            .task
            .workflow(&self.cursor.workflow)
            .is_none_or(|w| self.cursor.step + 1 >= w.steps.len())
    }

    pub fn tools(&self) -> &[ToolDef] {
        &self.execution_input.task.tools
    }

    /// Names visible to expressions and templates.
    ///
    /// - `_`: current input
    /// - `inputs`: every previous input, oldest first
    /// - `outputs`: previous step outputs (inputs without the arguments)
    /// - `state`: carried user state
    /// - `task`, `execution`: identifiers of this run
    pub fn bindings(&self) -> Value {
        json!({
            "_": self.current_input(),
            "inputs": self.inputs,
            "outputs": self.inputs.iter().skip(1).collect::<Vec<_>>(),
            "state": self.user_state.to_value(),
            "task": {
                "id": self.execution_input.task.id,
                "name": self.execution_input.task.name,
            },
            "execution": {
                "id": self.execution_input.execution_id,
                "agent_id": self.execution_input.agent_id,
                "user_id": self.execution_input.user_id,
                "arguments": self.execution_input.arguments,
            },
        })
    }

    /// Signal name a wait at this position listens on.
    pub fn input_signal_name(&self) -> String {
        format!("{}:{}", self.execution_input.execution_id, self.cursor.scope_name())
    }
}
