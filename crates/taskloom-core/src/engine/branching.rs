//! Branching orchestrator: `switch` and `if_else` become a single synthetic
//! one-step workflow that runs as a sub-execution.
//!
//! Branch workflow names are derived from the parent cursor and are the
//! execution log's only trace of which branch ran:
//! - switch: `` `main`[2].case ``
//! - if/else: `` `main`[2].if_else.then `` / `` `main`[2].if_else.else ``

use serde_json::Value;
use taskloom_types::remote::RemoteList;
use taskloom_types::task::{Cursor, SwitchCase, Workflow, WorkflowStep};

use super::context::StepContext;
use super::continuation::ContinuationManager;
use super::error::ExecutionError;
use super::expression::ExpressionError;

pub fn switch_branch_name(parent: &Cursor) -> String {
    format!("{}.case", parent.scope_name())
}

pub fn if_else_branch_name(parent: &Cursor, condition: bool) -> String {
    let arm = if condition { "then" } else { "else" };
    format!("{}.if_else.{arm}", parent.scope_name())
}

/// Index of the first case whose condition holds, in declaration order.
///
/// The catch-all case `_` always holds. `holds` is not called for cases
/// after the selected one.
pub fn select_switch_case<F>(cases: &[SwitchCase], mut holds: F) -> Result<Option<usize>, ExpressionError>
where
    F: FnMut(&str) -> Result<bool, ExpressionError>,
{
    for (index, case) in cases.iter().enumerate() {
        if case.is_catch_all() || holds(&case.case)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

pub struct BranchOrchestrator<'a> {
    continuation: &'a ContinuationManager,
}

impl<'a> BranchOrchestrator<'a> {
    pub fn new(continuation: &'a ContinuationManager) -> Self {
        Self { continuation }
    }

    /// Run the pre-selected switch case.
    pub async fn execute_switch_branch(
        &self,
        context: &StepContext,
        cases: &[SwitchCase],
        index: Option<usize>,
        previous_inputs: &RemoteList,
    ) -> Result<Value, ExecutionError> {
        let case = index
            .and_then(|i| cases.get(i))
            .ok_or_else(|| ExecutionError::NoMatchingBranch(context.cursor.clone()))?;

        tracing::info!(
            workflow = %context.cursor.workflow,
            step = context.cursor.step,
            case = %case.case,
            "switch branch selected"
        );
        self.run_branch(
            context,
            switch_branch_name(&context.cursor),
            case.then.clone(),
            previous_inputs,
        )
        .await
    }

    /// Run the `then` or `else` arm.
    ///
    /// A false condition with no `else` arm passes the current input through.
    pub async fn execute_if_else_branch(
        &self,
        context: &StepContext,
        then_branch: &WorkflowStep,
        else_branch: Option<&WorkflowStep>,
        condition: bool,
        previous_inputs: &RemoteList,
    ) -> Result<Value, ExecutionError> {
        let chosen = if condition {
            then_branch
        } else {
            match else_branch {
                Some(step) => step,
                None => {
                    tracing::info!(
                        workflow = %context.cursor.workflow,
                        step = context.cursor.step,
                        "condition false and no else branch, passing input through"
                    );
                    return Ok(context.current_input());
                }
            }
        };

        tracing::info!(
            workflow = %context.cursor.workflow,
            step = context.cursor.step,
            condition,
            "if/else branch selected"
        );
        self.run_branch(
            context,
            if_else_branch_name(&context.cursor, condition),
            chosen.clone(),
            previous_inputs,
        )
        .await
    }

    async fn run_branch(
        &self,
        context: &StepContext,
        name: String,
        step: WorkflowStep,
        previous_inputs: &RemoteList,
    ) -> Result<Value, ExecutionError> {
        let input = context
            .execution_input
            .with_workflow(Workflow::single_step(name.clone(), step));

        self.continuation
            .delegate(
                input,
                Cursor::start(name),
                previous_inputs.clone(),
                &context.user_state,
            )
            .await
    }
}
