//! Local computation of each step kind.
//!
//! Every step that needs one runs its local computation as an activity
//! (`<kind>_step`) that produces a `StepOutcome`: conditions and values are
//! evaluated, templates rendered, the model called. Control flow (branches,
//! map items, waits, continuations) is left to the workflow, which
//! interprets the outcome.

use std::sync::Arc;

use serde_json::{Value, json};

use taskloom_types::execution::StepOutcome;
use taskloom_types::task::{StepKind, ToolDef, WorkflowStep};

use super::activity::{ActivityCall, ActivityError};
use super::branching::select_switch_case;
use super::context::StepContext;
use super::expression::{ExpressionError, TaskEvaluator};
use super::ports::{ModelClient, ModelRequest, ToolExecutor, ToolInvocation};

/// Bindings hidden from prompt templates.
pub const PROMPT_SKIP_VARS: &[&str] = &["execution"];

/// Builds the activity calls that compute step outcomes.
#[derive(Clone)]
pub struct StepActivities {
    evaluator: Arc<TaskEvaluator>,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
}

impl StepActivities {
    pub fn new(
        evaluator: Arc<TaskEvaluator>,
        model: Arc<dyn ModelClient>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            evaluator,
            model,
            tools,
        }
    }

    pub fn evaluator(&self) -> &Arc<TaskEvaluator> {
        &self.evaluator
    }

    /// Activity name of a step kind's local computation.
    pub fn activity_name(kind: StepKind) -> String {
        format!("{kind}_step")
    }

    /// The activity computing the outcome of the context's current step.
    pub fn outcome_call(&self, context: &StepContext) -> ActivityCall {
        let name = Self::activity_name(context.current_step.kind());

        if let WorkflowStep::Prompt { .. } = context.current_step {
            return match self.prompt_messages(context) {
                Ok(messages) => self.prompt_call(context, messages),
                Err(err) => {
                    let err = ActivityError::from(err);
                    ActivityCall::new(name, move || {
                        let err = err.clone();
                        async move { Err(err) }
                    })
                }
            };
        }

        let this = self.clone();
        let context = context.clone();
        ActivityCall::new(name, move || {
            let outcome = this.compute(&context).and_then(outcome_to_value);
            async move { outcome }
        })
    }

    /// Synchronous outcome of every step kind except `prompt`.
    ///
    /// Expression failures surface as errors; problems with the task's own
    /// data (an unknown tool or workflow) become an error outcome.
    pub fn compute(&self, context: &StepContext) -> Result<StepOutcome, ActivityError> {
        let bindings = context.bindings();
        let eval = self.evaluator.as_ref();

        let outcome = match &context.current_step {
            WorkflowStep::Switch { switch } => {
                let index = select_switch_case(switch, |condition| {
                    eval.evaluate_bool(condition, &bindings)
                })?;
                StepOutcome::Output(index.map_or(json!(-1), |i| json!(i)))
            }
            WorkflowStep::IfElse { condition, .. } => {
                StepOutcome::Output(Value::Bool(eval.evaluate_bool(condition, &bindings)?))
            }
            WorkflowStep::MapReduce { over, .. } => {
                StepOutcome::Output(Value::Array(eval.evaluate_list(over, &bindings)?))
            }
            WorkflowStep::Foreach { foreach } => {
                StepOutcome::Output(Value::Array(eval.evaluate_list(&foreach.items, &bindings)?))
            }
            WorkflowStep::ToolCall { tool, arguments } => match context.execution_input.task.tool(tool) {
                Some(def) => {
                    let arguments = eval.render(arguments, &bindings, &[])?;
                    StepOutcome::Output(tool_call_value(def, arguments))
                }
                None => StepOutcome::Error(format!("tool '{tool}' is not defined on this task")),
            },
            WorkflowStep::SetValue { set: expressions }
            | WorkflowStep::Evaluate {
                evaluate: expressions,
            }
            | WorkflowStep::Return { value: expressions } => {
                StepOutcome::Output(eval.evaluate_map(expressions, &bindings)?)
            }
            WorkflowStep::Log { log } => StepOutcome::Output(Value::String(eval.render_str(log, &bindings)?)),
            WorkflowStep::Yield {
                workflow,
                arguments,
            } => {
                if context.execution_input.task.workflow(workflow).is_none() {
                    StepOutcome::Error(format!("workflow '{workflow}' not found"))
                } else {
                    StepOutcome::Output(eval.evaluate_map(arguments, &bindings)?)
                }
            }
            WorkflowStep::WaitForInput { info } => {
                StepOutcome::Output(eval.render(info, &bindings, &[])?)
            }
            WorkflowStep::Prompt { .. }
            | WorkflowStep::GetValue { .. }
            | WorkflowStep::Sleep { .. }
            | WorkflowStep::Error { .. } => {
                return Err(ActivityError::internal(format!(
                    "step kind '{}' has no synchronous computation",
                    context.current_step.kind()
                )));
            }
        };
        Ok(outcome)
    }

    /// Rendered chat messages of a `prompt` step.
    ///
    /// A string prompt becomes a single user message; a list is taken as a
    /// message list; a single object is one message.
    pub fn prompt_messages(&self, context: &StepContext) -> Result<Vec<Value>, ExpressionError> {
        let WorkflowStep::Prompt { prompt, .. } = &context.current_step else {
            return Ok(Vec::new());
        };
        let rendered = self
            .evaluator
            .render(prompt, &context.bindings(), PROMPT_SKIP_VARS)?;

        Ok(match rendered {
            Value::String(content) => vec![json!({ "role": "user", "content": content })],
            Value::Array(messages) => messages,
            other => vec![other],
        })
    }

    /// Model call for the context's prompt step with explicit `messages`.
    pub fn prompt_call(&self, context: &StepContext, messages: Vec<Value>) -> ActivityCall {
        let settings = match &context.current_step {
            WorkflowStep::Prompt { settings, .. } => settings.clone(),
            _ => Value::Null,
        };
        let request = ModelRequest {
            messages,
            settings,
            tools: context.tools().to_vec(),
        };
        let model = self.model.clone();

        ActivityCall::new(Self::activity_name(StepKind::Prompt), move || {
            let model = model.clone();
            let request = request.clone();
            async move {
                let response = model.complete(&request).await?;
                outcome_to_value(StepOutcome::Output(response))
            }
        })
    }

    /// Execution of a non-function tool through the tool executor.
    pub fn tool_execution_call(&self, context: &StepContext, tool: ToolDef, arguments: Value) -> ActivityCall {
        let invocation = ToolInvocation {
            tool,
            arguments,
            execution_id: context.execution_input.execution_id,
        };
        let executor = self.tools.clone();
        let name = format!("execute_{}", invocation.tool.name);

        ActivityCall::new(name, move || {
            let executor = executor.clone();
            let invocation = invocation.clone();
            async move { executor.execute(&invocation).await }
        })
    }
}

/// Tool call descriptor produced by a `tool_call` step.
pub fn tool_call_value(tool: &ToolDef, arguments: Value) -> Value {
    json!({
        "type": tool.kind,
        "name": tool.name,
        "arguments": arguments,
    })
}

fn outcome_to_value(outcome: StepOutcome) -> Result<Value, ActivityError> {
    serde_json::to_value(outcome).map_err(|e| ActivityError::internal(e.to_string()))
}

/// Decode an activity result back into a `StepOutcome`.
pub fn outcome_from_value(value: Value) -> Result<StepOutcome, ActivityError> {
    serde_json::from_value(value).map_err(|e| ActivityError::internal(format!("malformed step outcome: {e}")))
}
