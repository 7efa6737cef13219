//! Execution-time records: step outcomes, user state, transitions, and the
//! execution row itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::Cursor;

// ---------------------------------------------------------------------------
// Step outcome
// ---------------------------------------------------------------------------

/// Result of executing a single step: either an output or an error message.
///
/// Serialized externally tagged, so exactly one of `output` / `error` appears:
/// `{"output": ...}` or `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Output(Value),
    Error(String),
}

impl StepOutcome {
    pub fn output(&self) -> Option<&Value> {
        match self {
            StepOutcome::Output(v) => Some(v),
            StepOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StepOutcome::Output(_) => None,
            StepOutcome::Error(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            StepOutcome::Output(v) => Ok(v),
            StepOutcome::Error(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// User state
// ---------------------------------------------------------------------------

/// Key/value map carried across continuations (written by `set_value`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserState(BTreeMap<String, Value>);

impl UserState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Build from a JSON object; non-object values yield an empty state.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            _ => Self::default(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// New state with `overlay`'s keys taking precedence. Neither input changes.
    pub fn merged(&self, overlay: &UserState) -> UserState {
        let mut merged = self.0.clone();
        merged.extend(overlay.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        UserState(merged)
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Kind of a recorded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// First step of the main workflow.
    Init,
    /// First step of a sub-workflow (branch or map item).
    InitBranch,
    Step,
    Wait,
    Resume,
    Finish,
    FinishBranch,
    Error,
    Cancelled,
}

impl TransitionType {
    /// Execution status implied by having just recorded this transition.
    pub fn execution_status(&self) -> ExecutionStatus {
        match self {
            TransitionType::Init => ExecutionStatus::Starting,
            TransitionType::InitBranch
            | TransitionType::Step
            | TransitionType::Resume
            | TransitionType::FinishBranch => ExecutionStatus::Running,
            TransitionType::Wait => ExecutionStatus::AwaitingInput,
            TransitionType::Finish => ExecutionStatus::Succeeded,
            TransitionType::Error => ExecutionStatus::Failed,
            TransitionType::Cancelled => ExecutionStatus::Cancelled,
        }
    }

    /// Whether the run loop stops after recording this transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransitionType::Finish
                | TransitionType::FinishBranch
                | TransitionType::Error
                | TransitionType::Cancelled
        )
    }
}

/// One row of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// UUIDv7 transition ID.
    pub id: Uuid,
    pub execution_id: Uuid,
    #[serde(rename = "type")]
    pub transition_type: TransitionType,
    /// Step the transition was recorded at.
    pub current: Cursor,
    /// Step that runs next, when the execution continues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Cursor>,
    /// Step output (possibly a `RemoteRef` marker).
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Starting,
    Running,
    AwaitingInput,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// A single run of a task. Used for query results and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub status: ExecutionStatus,
    /// Arguments the execution was submitted with.
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
