//! Task definition types: the step tree an execution walks.
//!
//! A `TaskDefinition` is a set of named `Workflow`s, each an ordered list of
//! `WorkflowStep`s. A `Cursor` addresses one step inside that tree. An
//! `ExecutionInput` is the immutable snapshot of a task definition plus the
//! identifiers of a single run; branching constructs derive new inputs from it
//! instead of mutating it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Name of the entry workflow every task run starts in.
pub const MAIN_WORKFLOW: &str = "main";

/// Conventional catch-all condition for `switch` cases.
pub const CATCH_ALL_CASE: &str = "_";

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Position of execution inside a task's step tree.
///
/// Immutable once produced: advancing creates a new cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Name of the workflow the step belongs to.
    pub workflow: String,
    /// Zero-based index into the workflow's step list.
    pub step: usize,
}

impl Cursor {
    pub fn new(workflow: impl Into<String>, step: usize) -> Self {
        Self {
            workflow: workflow.into(),
            step,
        }
    }

    /// Cursor pointing at the first step of `workflow`.
    pub fn start(workflow: impl Into<String>) -> Self {
        Self::new(workflow, 0)
    }

    /// Cursor for the following step in the same workflow.
    pub fn next(&self) -> Self {
        Self::new(self.workflow.clone(), self.step + 1)
    }

    /// Whether this cursor is inside the task's entry workflow.
    pub fn is_main(&self) -> bool {
        self.workflow == MAIN_WORKFLOW
    }

    /// Deterministic scope prefix used to name sub-executions spawned from
    /// this position, e.g. `` `main`[2] ``.
    pub fn scope_name(&self) -> String {
        format!("`{}`[{}]", self.workflow, self.step)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.workflow, self.step)
    }
}

// ---------------------------------------------------------------------------
// Step kinds
// ---------------------------------------------------------------------------

/// The kind tag of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Switch,
    IfElse,
    Foreach,
    MapReduce,
    ToolCall,
    Prompt,
    SetValue,
    GetValue,
    Log,
    Return,
    Yield,
    Evaluate,
    WaitForInput,
    Sleep,
    Error,
}

impl StepKind {
    pub const ALL: [StepKind; 15] = [
        StepKind::Switch,
        StepKind::IfElse,
        StepKind::Foreach,
        StepKind::MapReduce,
        StepKind::ToolCall,
        StepKind::Prompt,
        StepKind::SetValue,
        StepKind::GetValue,
        StepKind::Log,
        StepKind::Return,
        StepKind::Yield,
        StepKind::Evaluate,
        StepKind::WaitForInput,
        StepKind::Sleep,
        StepKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Switch => "switch",
            StepKind::IfElse => "if_else",
            StepKind::Foreach => "foreach",
            StepKind::MapReduce => "map_reduce",
            StepKind::ToolCall => "tool_call",
            StepKind::Prompt => "prompt",
            StepKind::SetValue => "set_value",
            StepKind::GetValue => "get_value",
            StepKind::Log => "log",
            StepKind::Return => "return",
            StepKind::Yield => "yield",
            StepKind::Evaluate => "evaluate",
            StepKind::WaitForInput => "wait_for_input",
            StepKind::Sleep => "sleep",
            StepKind::Error => "error",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step kind tag that names no known step type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown step kind '{0}'")]
pub struct UnknownStepKind(pub String);

impl FromStr for StepKind {
    type Err = UnknownStepKind;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == tag)
            .ok_or_else(|| UnknownStepKind(tag.to_string()))
    }
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// One DSL instruction. Exactly one kind is active per instance.
///
/// Internally tagged by `kind`:
/// ```yaml
/// kind: map_reduce
/// over: "_.documents"
/// map:
///   kind: prompt
///   prompt: "Summarize {{ _ }}"
/// parallelism: 4
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Ordered cases; the first case whose condition holds runs.
    Switch { switch: Vec<SwitchCase> },
    /// Two-way branch on a boolean condition.
    IfElse {
        #[serde(rename = "if")]
        condition: String,
        then: Box<WorkflowStep>,
        #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<WorkflowStep>>,
    },
    /// Run a step once per item of a list, collecting the outputs in order.
    Foreach { foreach: ForeachDo },
    /// Run `map` once per item of `over`, folding outputs with `reduce`.
    MapReduce {
        over: String,
        map: Box<WorkflowStep>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reduce: Option<String>,
        #[serde(default = "default_initial")]
        initial: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parallelism: Option<i64>,
    },
    /// Invoke a tool declared on the task.
    ToolCall {
        tool: String,
        #[serde(default)]
        arguments: Value,
    },
    /// Send a (possibly nested) prompt to the model.
    Prompt {
        prompt: Value,
        #[serde(default)]
        settings: Value,
        #[serde(default)]
        unwrap: bool,
        #[serde(default)]
        auto_run_tools: bool,
    },
    /// Evaluate expressions and overlay the result onto the user state.
    SetValue { set: BTreeMap<String, String> },
    /// Read a key from the user state.
    GetValue { get: String },
    /// Render a template into the transition log.
    Log { log: String },
    /// Finish the current (sub-)workflow with evaluated values.
    Return {
        #[serde(rename = "return")]
        value: BTreeMap<String, String>,
    },
    /// Transfer control to another workflow of the same task.
    Yield {
        workflow: String,
        #[serde(default)]
        arguments: BTreeMap<String, String>,
    },
    /// Evaluate a map of expressions into an object.
    Evaluate { evaluate: BTreeMap<String, String> },
    /// Suspend until an external signal supplies input.
    WaitForInput {
        #[serde(default)]
        info: Value,
    },
    /// Durable timer.
    Sleep {
        #[serde(default)]
        seconds: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        days: u64,
    },
    /// Fail the execution with a message.
    Error { error: String },
}

fn default_initial() -> Value {
    Value::Array(Vec::new())
}

/// Body of a `foreach` step.
///
/// ```yaml
/// kind: foreach
/// foreach:
///   in: "_.urls"
///   do:
///     kind: tool_call
///     tool: fetch
///     arguments: { url: "{{ _ }}" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeachDo {
    /// Expression producing the items.
    #[serde(rename = "in")]
    pub items: String,
    #[serde(rename = "do")]
    pub step: Box<WorkflowStep>,
}

/// A `switch` case: a condition and the step to run when it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    /// Condition expression; `_` marks the catch-all case.
    pub case: String,
    pub then: WorkflowStep,
}

impl SwitchCase {
    pub fn is_catch_all(&self) -> bool {
        self.case.trim() == CATCH_ALL_CASE
    }
}

impl WorkflowStep {
    /// The active kind tag.
    pub fn kind(&self) -> StepKind {
        match self {
            WorkflowStep::Switch { .. } => StepKind::Switch,
            WorkflowStep::IfElse { .. } => StepKind::IfElse,
            WorkflowStep::Foreach { .. } => StepKind::Foreach,
            WorkflowStep::MapReduce { .. } => StepKind::MapReduce,
            WorkflowStep::ToolCall { .. } => StepKind::ToolCall,
            WorkflowStep::Prompt { .. } => StepKind::Prompt,
            WorkflowStep::SetValue { .. } => StepKind::SetValue,
            WorkflowStep::GetValue { .. } => StepKind::GetValue,
            WorkflowStep::Log { .. } => StepKind::Log,
            WorkflowStep::Return { .. } => StepKind::Return,
            WorkflowStep::Yield { .. } => StepKind::Yield,
            WorkflowStep::Evaluate { .. } => StepKind::Evaluate,
            WorkflowStep::WaitForInput { .. } => StepKind::WaitForInput,
            WorkflowStep::Sleep { .. } => StepKind::Sleep,
            WorkflowStep::Error { .. } => StepKind::Error,
        }
    }

    /// Parse a step from raw JSON, reporting an unknown or missing kind tag
    /// separately from a malformed payload.
    pub fn from_value(value: Value) -> Result<Self, StepParseError> {
        check_step_tags(&value)?;
        serde_json::from_value(value).map_err(|e| StepParseError::Malformed(e.to_string()))
    }
}

/// Errors from parsing raw step JSON.
#[derive(Debug, thiserror::Error)]
pub enum StepParseError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownStepKind),

    #[error("malformed step: {0}")]
    Malformed(String),
}

/// Walk a raw step (and the steps nested inside it) checking every `kind` tag.
fn check_step_tags(value: &Value) -> Result<(), UnknownStepKind> {
    let tag = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| UnknownStepKind(String::new()))?;
    let kind: StepKind = tag.parse()?;

    match kind {
        StepKind::IfElse => {
            if let Some(then) = value.get("then") {
                check_step_tags(then)?;
            }
            if let Some(otherwise) = value.get("else") {
                check_step_tags(otherwise)?;
            }
        }
        StepKind::MapReduce => {
            if let Some(map) = value.get("map") {
                check_step_tags(map)?;
            }
        }
        StepKind::Foreach => {
            if let Some(body) = value.get("foreach").and_then(|f| f.get("do")) {
                check_step_tags(body)?;
            }
        }
        StepKind::Switch => {
            let cases = value.get("switch").and_then(Value::as_array);
            for case in cases.into_iter().flatten() {
                if let Some(then) = case.get("then") {
                    check_step_tags(then)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflow / TaskDefinition
// ---------------------------------------------------------------------------

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Synthetic single-step workflow used for branch and map sub-executions.
    pub fn single_step(name: impl Into<String>, step: WorkflowStep) -> Self {
        Self::new(name, vec![step])
    }
}

/// How a tool declared on a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Executed by the developer; the engine waits for the result.
    Function,
    Integration,
    ApiCall,
    System,
}

/// A tool available to `tool_call` and `prompt` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Kind-specific definition (function schema, integration setup, ...).
    #[serde(default)]
    pub spec: Value,
}

/// The declarative task: its workflows and the tools its steps may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl TaskDefinition {
    /// Parse a task from raw JSON, checking every step kind tag first.
    pub fn from_value(value: Value) -> Result<Self, StepParseError> {
        let workflows = value.get("workflows").and_then(Value::as_array);
        for workflow in workflows.into_iter().flatten() {
            let steps = workflow.get("steps").and_then(Value::as_array);
            for step in steps.into_iter().flatten() {
                check_step_tags(step)?;
            }
        }
        serde_json::from_value(value).map_err(|e| StepParseError::Malformed(e.to_string()))
    }

    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.name == name)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Resolve a cursor to its step, if both the workflow and index exist.
    pub fn step_at(&self, cursor: &Cursor) -> Option<&WorkflowStep> {
        self.workflow(&cursor.workflow)
            .and_then(|w| w.steps.get(cursor.step))
    }

    /// First workflow name that appears more than once, if any.
    pub fn duplicate_workflow_name(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.workflows
            .iter()
            .map(|w| w.name.as_str())
            .find(|name| !seen.insert(*name))
    }
}

// ---------------------------------------------------------------------------
// ExecutionInput
// ---------------------------------------------------------------------------

/// Immutable snapshot of the task plus the identifiers of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInput {
    pub task: TaskDefinition,
    pub execution_id: Uuid,
    pub agent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    /// Arguments the execution was submitted with.
    #[serde(default)]
    pub arguments: Value,
}

impl ExecutionInput {
    /// Derive an input whose task contains only `workflow`.
    ///
    /// Task metadata, tools and run identifiers are carried over unchanged.
    pub fn with_workflow(&self, workflow: Workflow) -> Self {
        let mut derived = self.clone();
        derived.task.workflows = vec![workflow];
        derived
    }
}
