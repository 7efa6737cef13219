//! Scripted in-memory `WorkflowRuntime` and repository used by the engine's
//! unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use chrono::Utc;
use uuid::Uuid;

use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{
    ExecutionRecord, ExecutionStatus, TransitionRecord, TransitionType, UserState,
};

use super::activity::{ActivityCall, ActivityError};
use super::error::ExecutionError;
use super::runtime::{BoxFuture, ChildSpec, SignalOutcome, WorkflowRuntime};
use crate::repository::SortOrder;
use crate::repository::execution::ExecutionRepository;

type ChildHandler =
    Arc<dyn Fn(ChildSpec) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync>;

/// Runs activities once, records every child and answers them through a
/// scripted handler.
pub(crate) struct ScriptedRuntime {
    children: Mutex<Vec<ChildSpec>>,
    child_handler: Mutex<Option<ChildHandler>>,
    activities: Mutex<Vec<String>>,
    signals: Mutex<VecDeque<SignalOutcome>>,
    waited: Mutex<Vec<String>>,
    sleeps: Mutex<Vec<Duration>>,
    memo: Mutex<UserState>,
    suggest_continue: AtomicBool,
    continued: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    token: CancellationToken,
}

impl ScriptedRuntime {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            children: Mutex::new(Vec::new()),
            child_handler: Mutex::new(None),
            activities: Mutex::new(Vec::new()),
            signals: Mutex::new(VecDeque::new()),
            waited: Mutex::new(Vec::new()),
            sleeps: Mutex::new(Vec::new()),
            memo: Mutex::new(UserState::new()),
            suggest_continue: AtomicBool::new(false),
            continued: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            token: CancellationToken::new(),
        })
    }

    pub(crate) fn with_child_result(self: Arc<Self>, value: Value) -> Arc<Self> {
        self.with_child_handler(move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub(crate) fn with_child_handler<F, Fut>(self: Arc<Self>, handler: F) -> Arc<Self>
    where
        F: Fn(ChildSpec) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        let handler: ChildHandler =
            Arc::new(move |spec| -> BoxFuture<'static, Result<Value, ExecutionError>> {
                Box::pin(handler(spec))
            });
        *self.child_handler.lock().unwrap() = Some(handler);
        self
    }

    pub(crate) fn with_signals(self: Arc<Self>, outcomes: Vec<SignalOutcome>) -> Arc<Self> {
        self.signals.lock().unwrap().extend(outcomes);
        self
    }

    pub(crate) fn suggest_continue_as_new(self: Arc<Self>) -> Arc<Self> {
        self.suggest_continue.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn set_memo(&self, memo: UserState) {
        *self.memo.lock().unwrap() = memo;
    }

    pub(crate) fn children(&self) -> Vec<ChildSpec> {
        self.children.lock().unwrap().clone()
    }

    pub(crate) fn child_workflows(&self) -> Vec<String> {
        self.children()
            .into_iter()
            .map(|c| c.args.start.workflow)
            .collect()
    }

    pub(crate) fn activities(&self) -> Vec<String> {
        self.activities.lock().unwrap().clone()
    }

    pub(crate) fn waited(&self) -> Vec<String> {
        self.waited.lock().unwrap().clone()
    }

    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    /// Highest number of children observed running at once.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl WorkflowRuntime for ScriptedRuntime {
    fn run_id(&self) -> &str {
        "scripted-run"
    }

    fn execute_activity(&self, call: ActivityCall) -> BoxFuture<'_, Result<Value, ActivityError>> {
        self.activities.lock().unwrap().push(call.name.clone());
        Box::pin(async move {
            if self.token.is_cancelled() {
                return Err(ActivityError::cancelled());
            }
            call.invoke().await
        })
    }

    fn execute_child(&self, spec: ChildSpec) -> BoxFuture<'_, Result<Value, ExecutionError>> {
        self.children.lock().unwrap().push(spec.clone());
        let handler = self.child_handler.lock().unwrap().clone();
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = match handler {
                Some(handler) => {
                    tokio::select! {
                        _ = self.token.cancelled() => Err(ExecutionError::Cancelled),
                        r = handler(spec) => r,
                    }
                }
                None => Ok(Value::Null),
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn continue_as_new_suggested(&self) -> bool {
        self.suggest_continue.load(Ordering::SeqCst)
    }

    fn wait_for_signal(
        &self,
        name: String,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'_, SignalOutcome> {
        self.waited.lock().unwrap().push(name);
        let next = self.signals.lock().unwrap().pop_front();
        Box::pin(async move { next.unwrap_or(SignalOutcome::TimedOut) })
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, Result<(), ExecutionError>> {
        self.sleeps.lock().unwrap().push(duration);
        Box::pin(async { Ok(()) })
    }

    fn memo(&self) -> UserState {
        self.memo.lock().unwrap().clone()
    }

    fn is_continued(&self) -> bool {
        self.continued.load(Ordering::SeqCst)
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

/// Mutex-backed `ExecutionRepository`.
#[derive(Default)]
pub(crate) struct MemoryRepository {
    executions: Mutex<HashMap<Uuid, ExecutionRecord>>,
    transitions: Mutex<Vec<TransitionRecord>>,
}

impl MemoryRepository {
    pub(crate) fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.lock().unwrap().clone()
    }

    pub(crate) fn transition_types(&self) -> Vec<TransitionType> {
        self.transitions()
            .into_iter()
            .map(|t| t.transition_type)
            .collect()
    }
}

impl ExecutionRepository for MemoryRepository {
    async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), RepositoryError> {
        let mut executions = self.executions.lock().unwrap();
        if executions.contains_key(&execution.id) {
            return Err(RepositoryError::Conflict(execution.id.to_string()));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.executions.lock().unwrap().get(id).cloned())
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions.get_mut(id).ok_or(RepositoryError::NotFound)?;
        execution.status = status;
        if let Some(output) = output {
            execution.output = Some(output.clone());
        }
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn append_transition(&self, transition: &TransitionRecord) -> Result<(), RepositoryError> {
        if let Some(execution) = self
            .executions
            .lock()
            .unwrap()
            .get_mut(&transition.execution_id)
        {
            execution.status = transition.transition_type.execution_status();
            execution.updated_at = Utc::now();
        }
        self.transitions.lock().unwrap().push(transition.clone());
        Ok(())
    }

    async fn list_transitions(
        &self,
        execution_id: &Uuid,
        order: SortOrder,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let mut found: Vec<_> = self
            .transitions()
            .into_iter()
            .filter(|t| t.execution_id == *execution_id)
            .collect();
        if order == SortOrder::Desc {
            found.reverse();
        }
        Ok(found)
    }

    async fn latest_transition(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<TransitionRecord>, RepositoryError> {
        Ok(self
            .transitions()
            .into_iter()
            .rev()
            .find(|t| t.execution_id == *execution_id))
    }
}
