//! The task execution workflow: one step per run.
//!
//! Each run executes the step at its start cursor and then either finishes
//! or hands the next cursor to the continuation manager:
//!
//! 1. Resolve the previous inputs and build the `StepContext`.
//! 2. Record `init` / `init_branch` on the first step of a fresh run.
//! 3. Run the step's local computation as an activity.
//! 4. Interpret the outcome through the step's handler (branch, map-reduce,
//!    wait, tool, model, state, timer).
//! 5. Record the transition, then finish or continue with the output
//!    appended to the previous inputs.
//!
//! Failures in steps 3 and 4 are recorded as an `error` (or `cancelled`)
//! transition at the failing cursor before they propagate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use taskloom_types::config::EngineConfig;
use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{StepOutcome, TransitionRecord, TransitionType, UserState};
use taskloom_types::remote::RemoteList;
use taskloom_types::task::{Cursor, ToolKind, WorkflowStep};

use super::activity::{ActivityCall, ActivityError, ActivityInvoker, CallPipeline};
use super::branching::BranchOrchestrator;
use super::context::StepContext;
use super::continuation::ContinuationManager;
use super::dispatcher::{StepDispatcher, StepHandler};
use super::error::ExecutionError;
use super::expression::value_to_bool;
use super::map_reduce::{MapRequest, MapReduceOrchestrator};
use super::offload::PayloadOffloader;
use super::ports::{first_choice, first_message_content, requested_tool_calls};
use super::retry::RetryPolicy;
use super::runtime::{BoxFuture, ExecutionArgs, RunOutcome, WorkflowEntry, WorkflowRuntime};
use super::steps::{StepActivities, outcome_from_value};
use super::wait::InputWait;
use crate::repository::execution::ExecutionRepository;

/// What a handler decided for the current step.
#[derive(Debug, Clone, PartialEq)]
struct StepResult {
    output: Value,
    transition: TransitionType,
    /// End the (sub-)workflow here, even if steps follow.
    finish: bool,
    metadata: BTreeMap<String, Value>,
    /// Values overlaid onto the user state for the following steps.
    user_state: Option<UserState>,
}

impl StepResult {
    fn step(output: Value) -> Self {
        Self {
            output,
            transition: TransitionType::Step,
            finish: false,
            metadata: BTreeMap::new(),
            user_state: None,
        }
    }

    fn resumed(output: Value) -> Self {
        Self {
            transition: TransitionType::Resume,
            ..Self::step(output)
        }
    }

    fn finished(output: Value) -> Self {
        Self {
            finish: true,
            ..Self::step(output)
        }
    }
}

pub struct TaskExecutionWorkflow<R> {
    repository: Arc<R>,
    steps: StepActivities,
    activities: ActivityInvoker,
    config: Arc<EngineConfig>,
}

impl<R> Clone for TaskExecutionWorkflow<R> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            steps: self.steps.clone(),
            activities: self.activities.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: ExecutionRepository + 'static> TaskExecutionWorkflow<R> {
    pub fn new(
        repository: Arc<R>,
        steps: StepActivities,
        offloader: PayloadOffloader,
        config: EngineConfig,
    ) -> Self {
        let pipeline = CallPipeline::standard(
            RetryPolicy::from_config(&config.retry),
            Duration::from_secs(config.step_timeout_secs),
            offloader.clone(),
        );
        Self {
            repository,
            steps,
            activities: ActivityInvoker::new(pipeline, offloader),
            config: Arc::new(config),
        }
    }

    async fn execute(
        self,
        runtime: Arc<dyn WorkflowRuntime>,
        args: ExecutionArgs,
    ) -> Result<RunOutcome, ExecutionError> {
        let ExecutionArgs {
            input,
            start,
            previous_inputs,
        } = args;
        let previous_inputs = match previous_inputs {
            Some(list) => list,
            None => {
                self.activities
                    .offloader()
                    .append(&RemoteList::new(), input.arguments.clone())
                    .await?
            }
        };
        let inputs = self.activities.offloader().resolve_list(&previous_inputs).await?;
        let context = StepContext::new(input, start, inputs, runtime.memo())?;

        tracing::info!(
            execution_id = %context.execution_input.execution_id,
            run_id = runtime.run_id(),
            workflow = %context.cursor.workflow,
            step = context.cursor.step,
            kind = %context.current_step.kind(),
            "executing step"
        );

        if context.is_first_step() && !runtime.is_continued() {
            let init = if context.is_main() {
                TransitionType::Init
            } else {
                TransitionType::InitBranch
            };
            self.transition(
                runtime.as_ref(),
                &context,
                init,
                context.current_input(),
                Some(context.cursor.clone()),
                BTreeMap::new(),
            )
            .await?;
        }

        let continuation = ContinuationManager::new(runtime.clone());
        let result = match self.interpret(&continuation, &context, &previous_inputs).await {
            Ok(result) => result,
            Err(err) => {
                self.record_failure(&context, &err).await;
                return Err(err);
            }
        };

        self.advance(&continuation, &context, previous_inputs, result)
            .await
    }

    /// Record the step's transition, then finish or continue.
    async fn advance(
        &self,
        continuation: &ContinuationManager,
        context: &StepContext,
        previous_inputs: RemoteList,
        result: StepResult,
    ) -> Result<RunOutcome, ExecutionError> {
        let StepResult {
            output,
            transition,
            finish,
            metadata,
            user_state,
        } = result;

        let (transition, next) = if finish || context.is_last_step() {
            let done = if context.is_main() {
                TransitionType::Finish
            } else {
                TransitionType::FinishBranch
            };
            (done, None)
        } else {
            (transition, Some(context.cursor.next()))
        };

        let stored = self.activities.offloader().offload(output.clone()).await?;
        self.transition(
            continuation.runtime().as_ref(),
            context,
            transition,
            stored.clone(),
            next.clone(),
            metadata,
        )
        .await?;

        if transition.is_terminal() {
            tracing::info!(
                execution_id = %context.execution_input.execution_id,
                workflow = %context.cursor.workflow,
                transition = ?transition,
                "workflow finished"
            );
            return Ok(RunOutcome::Completed(output));
        }

        let next = next.ok_or_else(|| ExecutionError::NoNextStep(context.cursor.clone()))?;
        let user_state = match user_state {
            Some(overlay) => context.user_state.merged(&overlay),
            None => context.user_state.clone(),
        };

        continuation
            .continue_as_child(
                context.execution_input.clone(),
                next,
                previous_inputs.with_appended(stored),
                &user_state,
            )
            .await
    }

    // -----------------------------------------------------------------------
    // Step interpretation
    // -----------------------------------------------------------------------

    async fn interpret(
        &self,
        continuation: &ContinuationManager,
        context: &StepContext,
        previous_inputs: &RemoteList,
    ) -> Result<StepResult, ExecutionError> {
        let runtime = continuation.runtime().as_ref();
        let kind = context.current_step.kind();

        let outcome = if StepDispatcher::needs_activity(kind) {
            self.step_outcome(runtime, context).await?
        } else {
            Value::Null
        };

        match (StepDispatcher::handler_for(kind), &context.current_step) {
            (StepHandler::Branching, WorkflowStep::Switch { switch }) => {
                let index = outcome.as_u64().and_then(|i| usize::try_from(i).ok());
                let output = BranchOrchestrator::new(continuation)
                    .execute_switch_branch(context, switch, index, previous_inputs)
                    .await?;
                Ok(StepResult::step(output))
            }

            (
                StepHandler::Branching,
                WorkflowStep::IfElse {
                    then, otherwise, ..
                },
            ) => {
                let output = BranchOrchestrator::new(continuation)
                    .execute_if_else_branch(
                        context,
                        then,
                        otherwise.as_deref(),
                        value_to_bool(&outcome),
                        previous_inputs,
                    )
                    .await?;
                Ok(StepResult::step(output))
            }

            (
                StepHandler::MapReduce,
                WorkflowStep::MapReduce {
                    map,
                    reduce,
                    initial,
                    parallelism,
                    ..
                },
            ) => {
                let request = MapRequest {
                    context,
                    map_step: map,
                    items: outcome_items(outcome),
                    reduce: reduce.as_deref(),
                    initial: initial.clone(),
                    previous_inputs,
                };
                let orchestrator = self.map_reduce(continuation);
                let output = match parallelism {
                    None | Some(1) => orchestrator.execute_sequential(request).await?,
                    Some(parallelism) => orchestrator.execute_parallel(request, *parallelism).await?,
                };
                Ok(StepResult::step(output))
            }

            (StepHandler::MapReduce, WorkflowStep::Foreach { foreach }) => {
                let request = MapRequest {
                    context,
                    map_step: &foreach.step,
                    items: outcome_items(outcome),
                    reduce: None,
                    initial: Value::Array(Vec::new()),
                    previous_inputs,
                };
                let output = self.map_reduce(continuation).execute_sequential(request).await?;
                Ok(StepResult::step(output))
            }

            (StepHandler::Local, WorkflowStep::Log { .. }) => {
                tracing::info!(
                    workflow = %context.cursor.workflow,
                    step = context.cursor.step,
                    message = %outcome.as_str().unwrap_or_default(),
                    "log step"
                );
                let mut result = StepResult::step(context.current_input());
                result.metadata.insert("step_type".into(), json!(kind.as_str()));
                result.metadata.insert("log".into(), outcome);
                Ok(result)
            }

            (StepHandler::Local, WorkflowStep::Evaluate { .. }) => Ok(StepResult::step(outcome)),

            (StepHandler::Local, WorkflowStep::Return { .. }) => Ok(StepResult::finished(outcome)),

            (StepHandler::Yield, WorkflowStep::Yield { workflow, .. }) => {
                let target = Cursor::start(workflow.clone());
                tracing::info!(
                    workflow = %context.cursor.workflow,
                    step = context.cursor.step,
                    target = %workflow,
                    "yielding to workflow"
                );
                self.transition(
                    runtime,
                    context,
                    TransitionType::Step,
                    outcome.clone(),
                    Some(target.clone()),
                    BTreeMap::new(),
                )
                .await?;

                let arguments = self
                    .activities
                    .offloader()
                    .append(&RemoteList::new(), outcome)
                    .await?;
                let output = continuation
                    .delegate(
                        context.execution_input.clone(),
                        target,
                        arguments,
                        &context.user_state,
                    )
                    .await?;
                Ok(StepResult::step(output))
            }

            (StepHandler::Tool, WorkflowStep::ToolCall { tool, .. }) => {
                let def = context
                    .execution_input
                    .task
                    .tool(tool)
                    .cloned()
                    .ok_or_else(|| ExecutionError::StepFailed {
                        cursor: context.cursor.clone(),
                        message: format!("tool '{tool}' is not defined on this task"),
                    })?;

                if def.kind == ToolKind::Function {
                    let response = self.wait_for_input(runtime, context, outcome).await?;
                    return Ok(StepResult::resumed(response));
                }

                let arguments = outcome.get("arguments").cloned().unwrap_or(Value::Null);
                let call = self.steps.tool_execution_call(context, def, arguments);
                let output = self.activities.invoke(runtime, call).await?;
                Ok(StepResult::step(output))
            }

            (
                StepHandler::Model,
                WorkflowStep::Prompt {
                    unwrap,
                    auto_run_tools,
                    ..
                },
            ) => {
                if *unwrap {
                    let content = first_message_content(&outcome).cloned().unwrap_or(Value::Null);
                    return Ok(StepResult::step(content));
                }

                let function_calls = requested_tool_calls(&outcome)
                    .filter(|calls| calls[0].get("type").and_then(Value::as_str) == Some("function"))
                    .cloned();

                match function_calls {
                    Some(calls) if *auto_run_tools => {
                        let output = self
                            .run_function_tools(runtime, context, &outcome, calls)
                            .await?;
                        Ok(StepResult::resumed(output))
                    }
                    _ => Ok(StepResult::step(outcome)),
                }
            }

            (StepHandler::Suspend, WorkflowStep::WaitForInput { .. }) => {
                let response = self.wait_for_input(runtime, context, outcome).await?;
                Ok(StepResult::resumed(response))
            }

            (StepHandler::Memo, WorkflowStep::SetValue { .. }) => {
                tracing::info!(
                    workflow = %context.cursor.workflow,
                    step = context.cursor.step,
                    "updating user state"
                );
                let mut result = StepResult::step(context.current_input());
                result.user_state = Some(UserState::from_value(&outcome));
                Ok(result)
            }

            (StepHandler::Memo, WorkflowStep::GetValue { get }) => {
                let value = context.user_state.get(get).cloned().unwrap_or(Value::Null);
                Ok(StepResult::step(value))
            }

            (
                StepHandler::Timer,
                WorkflowStep::Sleep {
                    seconds,
                    minutes,
                    hours,
                    days,
                },
            ) => {
                let total = seconds
                    .saturating_add(minutes.saturating_mul(60))
                    .saturating_add(hours.saturating_mul(3_600))
                    .saturating_add(days.saturating_mul(86_400));
                if total == 0 {
                    return Err(ExecutionError::StepFailed {
                        cursor: context.cursor.clone(),
                        message: "sleep duration must be greater than zero".to_string(),
                    });
                }
                runtime.sleep(Duration::from_secs(total)).await?;
                Ok(StepResult::step(context.current_input()))
            }

            (StepHandler::Fail, WorkflowStep::Error { error }) => Err(ExecutionError::StepFailed {
                cursor: context.cursor.clone(),
                message: error.clone(),
            }),

            (handler, step) => Err(ExecutionError::StepFailed {
                cursor: context.cursor.clone(),
                message: format!("handler {handler:?} cannot run a '{}' step", step.kind()),
            }),
        }
    }

    fn map_reduce<'a>(&'a self, continuation: &'a ContinuationManager) -> MapReduceOrchestrator<'a> {
        MapReduceOrchestrator::new(
            continuation,
            &self.activities,
            self.steps.evaluator().clone(),
            self.config.max_parallelism,
            Duration::from_secs(self.config.evaluate_timeout_secs),
        )
    }

    /// Run the step's local computation and unwrap its outcome.
    async fn step_outcome(
        &self,
        runtime: &dyn WorkflowRuntime,
        context: &StepContext,
    ) -> Result<Value, ExecutionError> {
        let call = self.steps.outcome_call(context);
        let name = call.name.clone();
        let value = self.activities.invoke(runtime, call).await?;

        match outcome_from_value(value).map_err(|e| ExecutionError::from_activity(name, e))? {
            StepOutcome::Output(output) => Ok(output),
            StepOutcome::Error(message) => Err(ExecutionError::StepFailed {
                cursor: context.cursor.clone(),
                message,
            }),
        }
    }

    /// Record a `wait` transition and suspend until input arrives.
    async fn wait_for_input(
        &self,
        runtime: &dyn WorkflowRuntime,
        context: &StepContext,
        info: Value,
    ) -> Result<Value, ExecutionError> {
        let signal = context.input_signal_name();
        let mut metadata = BTreeMap::new();
        metadata.insert("signal".to_string(), json!(signal));
        self.transition(
            runtime,
            context,
            TransitionType::Wait,
            info.clone(),
            Some(context.cursor.clone()),
            metadata,
        )
        .await?;

        let timeout = self
            .config
            .wait_for_input_timeout_secs
            .map(Duration::from_secs);
        InputWait::new(runtime, context.cursor.clone(), timeout)
            .wait(signal, info)
            .await
    }

    /// Hand function tool calls to the developer, then re-prompt once with
    /// the assistant message and their results appended.
    async fn run_function_tools(
        &self,
        runtime: &dyn WorkflowRuntime,
        context: &StepContext,
        response: &Value,
        calls: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        let results = self
            .wait_for_input(runtime, context, Value::Array(calls))
            .await?;

        let mut messages = self.steps.prompt_messages(context)?;
        if let Some(message) = first_choice(response).and_then(|choice| choice.get("message")) {
            messages.push(message.clone());
        }
        match results {
            Value::Array(items) => messages.extend(items),
            other => messages.push(other),
        }

        let call = self.steps.prompt_call(context, messages);
        let name = call.name.clone();
        let value = self.activities.invoke(runtime, call).await?;
        match outcome_from_value(value).map_err(|e| ExecutionError::from_activity(name, e))? {
            StepOutcome::Output(output) => Ok(output),
            StepOutcome::Error(message) => Err(ExecutionError::StepFailed {
                cursor: context.cursor.clone(),
                message,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Append a transition record through a `transition` activity.
    async fn transition(
        &self,
        runtime: &dyn WorkflowRuntime,
        context: &StepContext,
        transition_type: TransitionType,
        output: Value,
        next: Option<Cursor>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<(), ExecutionError> {
        let record = TransitionRecord {
            id: Uuid::now_v7(),
            execution_id: context.execution_input.execution_id,
            transition_type,
            current: context.cursor.clone(),
            next,
            output,
            metadata,
            created_at: Utc::now(),
        };

        tracing::info!(
            execution_id = %record.execution_id,
            workflow = %record.current.workflow,
            step = record.current.step,
            transition = ?transition_type,
            "recording transition"
        );

        let repository = self.repository.clone();
        let call = ActivityCall::new("transition", move || {
            let repository = repository.clone();
            let record = record.clone();
            async move {
                repository
                    .append_transition(&record)
                    .await
                    .map_err(repository_failure)?;
                Ok(Value::Null)
            }
        });
        self.activities.invoke(runtime, call).await.map(|_| ())
    }

    /// Record the terminal transition of a failed step.
    ///
    /// Written straight to the repository: a cancelled run can no longer
    /// schedule activities.
    async fn record_failure(&self, context: &StepContext, err: &ExecutionError) {
        let transition_type = if err.is_cancelled() {
            TransitionType::Cancelled
        } else {
            TransitionType::Error
        };

        tracing::error!(
            execution_id = %context.execution_input.execution_id,
            workflow = %context.cursor.workflow,
            step = context.cursor.step,
            error = %err,
            "step failed"
        );

        let record = TransitionRecord {
            id: Uuid::now_v7(),
            execution_id: context.execution_input.execution_id,
            transition_type,
            current: context.cursor.clone(),
            next: None,
            output: Value::String(err.to_string()),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.repository.append_transition(&record).await {
            tracing::warn!(
                execution_id = %record.execution_id,
                error = %e,
                "failed to record failure transition"
            );
        }
    }
}

/// Items of a `map_reduce` or `foreach` outcome; a scalar maps as one item.
fn outcome_items(outcome: Value) -> Vec<Value> {
    match outcome {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn repository_failure(error: RepositoryError) -> ActivityError {
    match error {
        RepositoryError::NotFound => ActivityError::not_found(error.to_string()),
        RepositoryError::Conflict(_) => ActivityError::validation(error.to_string()),
        RepositoryError::Connection | RepositoryError::Query(_) => {
            ActivityError::transient(error.to_string())
        }
    }
}

impl<R: ExecutionRepository + 'static> WorkflowEntry for TaskExecutionWorkflow<R> {
    fn run(
        &self,
        runtime: Arc<dyn WorkflowRuntime>,
        args: ExecutionArgs,
    ) -> BoxFuture<'static, Result<RunOutcome, ExecutionError>> {
        let this = self.clone();
        Box::pin(this.execute(runtime, args))
    }
}
