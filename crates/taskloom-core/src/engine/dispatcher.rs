//! Step dispatcher: step kind -> handler.
//!
//! A pure lookup. The match is exhaustive over `StepKind`, so adding a step
//! kind does not compile until it has a handler.

use taskloom_types::task::StepKind;

/// Which part of the engine interprets a step once its local computation
/// has produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepHandler {
    /// `switch`, `if_else`: delegate one branch through the branching orchestrator.
    Branching,
    /// `map_reduce`, `foreach`: sequential or batched sub-executions plus a fold.
    MapReduce,
    /// `evaluate`, `log`, `return`: the local outcome is the step output.
    Local,
    /// `yield`: hand control to another workflow of the same task.
    Yield,
    /// `tool_call`: external tool invocation or developer-run function.
    Tool,
    /// `prompt`: model call, optionally resuming with tool results.
    Model,
    /// `wait_for_input`: suspend until an external signal.
    Suspend,
    /// `set_value`, `get_value`: read or overlay the carried user state.
    Memo,
    /// `sleep`: durable timer.
    Timer,
    /// `error`: fail the step.
    Fail,
}

pub struct StepDispatcher;

impl StepDispatcher {
    pub fn handler_for(kind: StepKind) -> StepHandler {
        match kind {
            StepKind::Switch | StepKind::IfElse => StepHandler::Branching,
            StepKind::MapReduce | StepKind::Foreach => StepHandler::MapReduce,
            StepKind::Evaluate | StepKind::Log | StepKind::Return => StepHandler::Local,
            StepKind::Yield => StepHandler::Yield,
            StepKind::ToolCall => StepHandler::Tool,
            StepKind::Prompt => StepHandler::Model,
            StepKind::WaitForInput => StepHandler::Suspend,
            StepKind::SetValue | StepKind::GetValue => StepHandler::Memo,
            StepKind::Sleep => StepHandler::Timer,
            StepKind::Error => StepHandler::Fail,
        }
    }

    /// Whether the step's local computation runs as an activity before its
    /// handler interprets the outcome.
    pub fn needs_activity(kind: StepKind) -> bool {
        !matches!(kind, StepKind::GetValue | StepKind::Sleep | StepKind::Error)
    }
}
