//! Continuation manager: the only place that touches the runtime's
//! child-execution and continue-as-new primitives.

use std::sync::Arc;

use serde_json::Value;
use taskloom_types::execution::UserState;
use taskloom_types::remote::RemoteList;
use taskloom_types::task::{Cursor, ExecutionInput};

use super::error::ExecutionError;
use super::runtime::{ChildSpec, ExecutionArgs, RunOutcome, WorkflowRuntime};

pub struct ContinuationManager {
    runtime: Arc<dyn WorkflowRuntime>,
}

impl ContinuationManager {
    pub fn new(runtime: Arc<dyn WorkflowRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn WorkflowRuntime> {
        &self.runtime
    }

    /// Hand the rest of the execution to `start`.
    ///
    /// When the runtime suggests it, the current run ends with
    /// `RunOutcome::ContinueAsNew` and a fresh history; otherwise a nested
    /// child runs and its result completes this run. Both paths carry the
    /// same arguments and the same merged user state.
    pub async fn continue_as_child(
        &self,
        input: ExecutionInput,
        start: Cursor,
        previous_inputs: RemoteList,
        user_state: &UserState,
    ) -> Result<RunOutcome, ExecutionError> {
        let (args, memo) = self.handoff(input, start, previous_inputs, user_state);

        if self.runtime.continue_as_new_suggested() {
            tracing::info!(
                run_id = self.runtime.run_id(),
                workflow = %args.start.workflow,
                step = args.start.step,
                "continuing as new"
            );
            return Ok(RunOutcome::ContinueAsNew { args, memo });
        }

        self.spawn(args, memo).await.map(RunOutcome::Completed)
    }

    /// Run a sub-execution whose result the caller folds.
    ///
    /// The caller is still waiting on the value, so this always nests; the
    /// child gets its own history and may continue-as-new internally.
    pub async fn delegate(
        &self,
        input: ExecutionInput,
        start: Cursor,
        previous_inputs: RemoteList,
        user_state: &UserState,
    ) -> Result<Value, ExecutionError> {
        let (args, memo) = self.handoff(input, start, previous_inputs, user_state);
        self.spawn(args, memo).await
    }

    fn handoff(
        &self,
        input: ExecutionInput,
        start: Cursor,
        previous_inputs: RemoteList,
        user_state: &UserState,
    ) -> (ExecutionArgs, UserState) {
        let memo = self.runtime.memo().merged(user_state);
        (ExecutionArgs::new(input, start, Some(previous_inputs)), memo)
    }

    async fn spawn(&self, args: ExecutionArgs, memo: UserState) -> Result<Value, ExecutionError> {
        tracing::info!(
            run_id = self.runtime.run_id(),
            workflow = %args.start.workflow,
            step = args.start.step,
            "starting child execution"
        );
        self.runtime
            .execute_child(ChildSpec { args, memo })
            .await
    }
}
