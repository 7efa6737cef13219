//! Durable execution substrate port.
//!
//! The engine never talks to a scheduler directly. Everything that must be
//! recorded in history (activities, child executions, timers, external
//! signals) goes through `WorkflowRuntime`, and the task workflow itself is
//! registered with the runtime as a `WorkflowEntry`.
//!
//! Continue-as-new is modelled as a return value: an entry that wants a
//! fresh history returns `RunOutcome::ContinueAsNew` and the runtime starts
//! the next run with those arguments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskloom_types::execution::UserState;
use taskloom_types::remote::RemoteList;
use taskloom_types::task::{Cursor, ExecutionInput};

use super::activity::{ActivityCall, ActivityError};
use super::error::ExecutionError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Arguments of one run of the task workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionArgs {
    pub input: ExecutionInput,
    pub start: Cursor,
    /// Outputs accumulated so far; `None` means "just the submitted arguments".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_inputs: Option<RemoteList>,
}

impl ExecutionArgs {
    pub fn new(input: ExecutionInput, start: Cursor, previous_inputs: Option<RemoteList>) -> Self {
        Self {
            input,
            start,
            previous_inputs,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.input.execution_id
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    /// Replace this run's history with a fresh run carrying the same state.
    ContinueAsNew { args: ExecutionArgs, memo: UserState },
}

/// A nested sub-execution request.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub args: ExecutionArgs,
    /// State carried into the child.
    pub memo: UserState,
}

/// Result of waiting for an external signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Received(Value),
    Cancelled,
    TimedOut,
}

/// Capabilities of the durable execution substrate, scoped to one run.
pub trait WorkflowRuntime: Send + Sync {
    /// Identifier of the current run (changes on continue-as-new).
    fn run_id(&self) -> &str;

    /// Invoke an activity, applying its retry policy and timeout.
    fn execute_activity(&self, call: ActivityCall) -> BoxFuture<'_, Result<Value, ActivityError>>;

    /// Run a nested execution of the registered entry and await its result.
    fn execute_child(&self, spec: ChildSpec) -> BoxFuture<'_, Result<Value, ExecutionError>>;

    /// True when this run's history is approaching its limit.
    fn continue_as_new_suggested(&self) -> bool;

    /// Suspend until the named signal arrives, the run is cancelled, or the
    /// optional timeout elapses.
    fn wait_for_signal(
        &self,
        name: String,
        timeout: Option<Duration>,
    ) -> BoxFuture<'_, SignalOutcome>;

    /// Durable timer.
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, Result<(), ExecutionError>>;

    /// State carried into this run.
    fn memo(&self) -> UserState;

    /// Whether this run was started by continue-as-new.
    fn is_continued(&self) -> bool;

    /// Cancellation token of this run; cancelled with its parent.
    fn cancellation(&self) -> &CancellationToken;
}

/// The workflow code a runtime executes for root and child runs.
pub trait WorkflowEntry: Send + Sync {
    fn run(
        &self,
        runtime: Arc<dyn WorkflowRuntime>,
        args: ExecutionArgs,
    ) -> BoxFuture<'static, Result<RunOutcome, ExecutionError>>;
}

/// Starts and controls root executions (implemented by runtimes).
pub trait ExecutionLauncher: Send + Sync {
    /// Run a root execution to completion.
    fn launch(&self, args: ExecutionArgs) -> BoxFuture<'_, Result<Value, ExecutionError>>;

    /// Cancel a running root execution and all its descendants.
    fn cancel(&self, execution_id: Uuid) -> bool;

    /// Deliver external input to a suspended step. With no signal name the
    /// oldest pending wait of the execution receives it.
    fn send_input(&self, execution_id: Uuid, signal: Option<&str>, value: Value) -> bool;

    /// Signal names of the waits currently suspended in an execution.
    fn pending_inputs(&self, execution_id: Uuid) -> Vec<String>;
}
