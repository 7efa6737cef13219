//! Local in-process workflow runtime.
//!
//! Every root execution gets a `CancellationToken`; each child execution
//! runs under a child token of its parent, so cancelling the root reaches
//! every descendant. A run ends either with a value or with
//! `RunOutcome::ContinueAsNew`, in which case the driver starts the next run
//! with a fresh history and the carried state.
//!
//! History is a per-run event counter (activities, children, timers,
//! signals). Continue-as-new is suggested once it reaches the configured
//! limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskloom_core::engine::activity::{ActivityCall, ActivityError};
use taskloom_core::engine::error::ExecutionError;
use taskloom_core::engine::retry::RetryPolicy;
use taskloom_core::engine::runtime::{
    BoxFuture, ChildSpec, ExecutionArgs, ExecutionLauncher, RunOutcome, SignalOutcome,
    WorkflowEntry, WorkflowRuntime,
};
use taskloom_types::execution::UserState;

use super::signal::SignalHub;

struct Shared {
    entry: Arc<dyn WorkflowEntry>,
    signals: SignalHub,
    history_event_limit: usize,
    /// Root execution tokens, for cancellation by id.
    executions: DashMap<Uuid, CancellationToken>,
    runs: AtomicU64,
}

/// Runs task executions in the current process.
#[derive(Clone)]
pub struct LocalRuntime {
    shared: Arc<Shared>,
}

impl LocalRuntime {
    pub fn new(entry: Arc<dyn WorkflowEntry>, history_event_limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                entry,
                signals: SignalHub::new(),
                history_event_limit: history_event_limit.max(1),
                executions: DashMap::new(),
                runs: AtomicU64::new(0),
            }),
        }
    }

    pub fn signals(&self) -> &SignalHub {
        &self.shared.signals
    }

    /// Whether a root execution with this id is in flight.
    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.shared.executions.contains_key(&execution_id)
    }

    /// Run a root execution to completion.
    pub async fn run_root(&self, args: ExecutionArgs) -> Result<Value, ExecutionError> {
        let execution_id = args.execution_id();
        let token = CancellationToken::new();
        self.shared.executions.insert(execution_id, token.clone());

        tracing::info!(execution_id = %execution_id, "root execution started");
        let result = drive(self.shared.clone(), token, args, UserState::new()).await;

        self.shared.executions.remove(&execution_id);
        self.shared.signals.clear(execution_id);
        tracing::info!(
            execution_id = %execution_id,
            ok = result.is_ok(),
            "root execution ended"
        );
        result
    }
}

impl ExecutionLauncher for LocalRuntime {
    fn launch(&self, args: ExecutionArgs) -> BoxFuture<'_, Result<Value, ExecutionError>> {
        Box::pin(self.run_root(args))
    }

    fn cancel(&self, execution_id: Uuid) -> bool {
        match self.shared.executions.get(&execution_id) {
            Some(token) => {
                tracing::info!(execution_id = %execution_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn send_input(&self, execution_id: Uuid, signal: Option<&str>, value: Value) -> bool {
        self.shared.signals.send(execution_id, signal, value)
    }

    fn pending_inputs(&self, execution_id: Uuid) -> Vec<String> {
        self.shared.signals.pending(execution_id)
    }
}

/// Run an execution (root or child) through its continue-as-new chain.
async fn drive(
    shared: Arc<Shared>,
    token: CancellationToken,
    mut args: ExecutionArgs,
    mut memo: UserState,
) -> Result<Value, ExecutionError> {
    let mut continued = false;
    loop {
        let run_number = shared.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let scope = Arc::new(RunScope {
            shared: shared.clone(),
            run_id: format!("{}/{run_number}", args.execution_id()),
            execution_id: args.execution_id(),
            history: AtomicUsize::new(0),
            memo,
            continued,
            token: token.clone(),
        });

        match shared.entry.run(scope, args).await? {
            RunOutcome::Completed(value) => return Ok(value),
            RunOutcome::ContinueAsNew {
                args: next,
                memo: next_memo,
            } => {
                tracing::debug!(
                    execution_id = %next.execution_id(),
                    workflow = %next.start.workflow,
                    step = next.start.step,
                    "starting continued run"
                );
                args = next;
                memo = next_memo;
                continued = true;
            }
        }
    }
}

/// One run of the workflow entry: its history, state and token.
struct RunScope {
    shared: Arc<Shared>,
    run_id: String,
    execution_id: Uuid,
    history: AtomicUsize,
    memo: UserState,
    continued: bool,
    token: CancellationToken,
}

impl RunScope {
    fn record_event(&self) {
        self.history.fetch_add(1, Ordering::SeqCst);
    }

    async fn attempt(&self, call: &ActivityCall) -> Result<Value, ActivityError> {
        let body = call.invoke();
        let bounded = async {
            match call.timeout {
                Some(limit) => match tokio::time::timeout(limit, body).await {
                    Ok(result) => result,
                    Err(_) => Err(ActivityError::timeout(limit)),
                },
                None => body.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ActivityError::cancelled()),
            result = bounded => result,
        }
    }

    /// Sleep for `duration` unless the run is cancelled first.
    async fn pause(&self, duration: Duration) -> Result<(), ExecutionError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl WorkflowRuntime for RunScope {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn execute_activity(&self, call: ActivityCall) -> BoxFuture<'_, Result<Value, ActivityError>> {
        Box::pin(async move {
            self.record_event();
            let policy = call.retry_policy.clone().unwrap_or_else(RetryPolicy::no_retry);

            let mut attempt = 1;
            loop {
                if self.token.is_cancelled() {
                    return Err(ActivityError::cancelled());
                }
                tracing::debug!(run_id = %self.run_id, activity = %call.name, attempt, "activity attempt");

                match self.attempt(&call).await {
                    Ok(value) => return Ok(value),
                    Err(err) if policy.should_retry(attempt, &err) => {
                        let backoff = policy.backoff_for(attempt);
                        tracing::warn!(
                            run_id = %self.run_id,
                            activity = %call.name,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "activity failed, retrying"
                        );
                        self.pause(backoff)
                            .await
                            .map_err(|_| ActivityError::cancelled())?;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }

    fn execute_child(&self, spec: ChildSpec) -> BoxFuture<'_, Result<Value, ExecutionError>> {
        Box::pin(async move {
            self.record_event();
            // A child is never re-run as a whole: its steps have already
            // recorded transitions and its activities retried on their own.
            let ChildSpec { args, memo } = spec;
            drive(self.shared.clone(), self.token.child_token(), args, memo).await
        })
    }

    fn continue_as_new_suggested(&self) -> bool {
        self.history.load(Ordering::SeqCst) >= self.shared.history_event_limit
    }

    fn wait_for_signal(
        &self,
        name: String,
        timeout: Option<Duration>,
    ) -> BoxFuture<'_, SignalOutcome> {
        Box::pin(async move {
            self.record_event();
            let receiver = self.shared.signals.register(self.execution_id, &name);
            tracing::info!(run_id = %self.run_id, signal = %name, "awaiting external signal");

            let expired = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => SignalOutcome::Cancelled,
                received = receiver => match received {
                    Ok(value) => SignalOutcome::Received(value),
                    Err(_) => SignalOutcome::Cancelled,
                },
                _ = expired => SignalOutcome::TimedOut,
            };

            if !matches!(outcome, SignalOutcome::Received(_)) {
                self.shared.signals.forget(&name);
            }
            outcome
        })
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, Result<(), ExecutionError>> {
        Box::pin(async move {
            self.record_event();
            tracing::info!(run_id = %self.run_id, seconds = duration.as_secs(), "timer started");
            self.pause(duration).await
        })
    }

    fn memo(&self) -> UserState {
        self.memo.clone()
    }

    fn is_continued(&self) -> bool {
        self.continued
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use serde_json::json;
    use taskloom_types::config::RetryPolicyConfig;
    use taskloom_types::error::ActivityErrorKind;
    use taskloom_types::task::{Cursor, ExecutionInput, TaskDefinition};

    fn args() -> ExecutionArgs {
        let input = ExecutionInput {
            task: TaskDefinition {
                id: Uuid::nil(),
                name: "t".into(),
                description: None,
                workflows: vec![],
                tools: vec![],
                metadata: Default::default(),
            },
            execution_id: Uuid::now_v7(),
            agent_id: Uuid::nil(),
            user_id: None,
            arguments: json!(null),
        };
        ExecutionArgs::new(input, Cursor::start("main"), None)
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryPolicyConfig {
            max_attempts,
            initial_interval_ms: 1,
            backoff_coefficient: 1.0,
            max_interval_ms: 1,
            ..RetryPolicyConfig::default()
        })
    }

    /// Entry that runs a closure against the scope it is given.
    struct FnEntry<F>(F);

    impl<F> WorkflowEntry for FnEntry<F>
    where
        F: Fn(Arc<dyn WorkflowRuntime>, ExecutionArgs) -> BoxFuture<'static, Result<RunOutcome, ExecutionError>>
            + Send
            + Sync,
    {
        fn run(
            &self,
            runtime: Arc<dyn WorkflowRuntime>,
            args: ExecutionArgs,
        ) -> BoxFuture<'static, Result<RunOutcome, ExecutionError>> {
            (self.0)(runtime, args)
        }
    }

    #[tokio::test]
    async fn transient_activity_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let entry = FnEntry(move |runtime: Arc<dyn WorkflowRuntime>, _args: ExecutionArgs| {
            let counter = counter.clone();
            Box::pin(async move {
                let mut call = ActivityCall::new("flaky", move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ActivityError::transient("try again"))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                });
                call.retry_policy = Some(fast_policy(4));
                let value = runtime
                    .execute_activity(call)
                    .await
                    .map_err(|e| ExecutionError::from_activity("flaky", e))?;
                Ok(RunOutcome::Completed(value))
            }) as BoxFuture<'static, _>
        });

        let runtime = LocalRuntime::new(Arc::new(entry), 100);
        assert_eq!(runtime.run_root(args()).await.unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let entry = FnEntry(move |runtime: Arc<dyn WorkflowRuntime>, _args: ExecutionArgs| {
            let counter = counter.clone();
            Box::pin(async move {
                let mut call = ActivityCall::new("bad", move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(ActivityError::validation("malformed")) }
                });
                call.retry_policy = Some(fast_policy(4));
                let err = runtime.execute_activity(call).await.unwrap_err();
                assert_eq!(err.kind(), ActivityErrorKind::Validation);
                Ok(RunOutcome::Completed(Value::Null))
            }) as BoxFuture<'static, _>
        });

        LocalRuntime::new(Arc::new(entry), 100)
            .run_root(args())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn activity_timeout_is_enforced() {
        let entry = FnEntry(|runtime: Arc<dyn WorkflowRuntime>, _args: ExecutionArgs| {
            Box::pin(async move {
                let call = ActivityCall::new("slow", || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                })
                .with_timeout(Duration::from_millis(20));
                let err = runtime.execute_activity(call).await.unwrap_err();
                assert_eq!(err.kind(), ActivityErrorKind::Timeout);
                Ok(RunOutcome::Completed(Value::Null))
            }) as BoxFuture<'static, _>
        });

        LocalRuntime::new(Arc::new(entry), 100)
            .run_root(args())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn continue_as_new_starts_fresh_run_with_memo() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let entry = FnEntry(move |runtime: Arc<dyn WorkflowRuntime>, args: ExecutionArgs| {
            let record = record.clone();
            Box::pin(async move {
                record.lock().unwrap().push((
                    runtime.run_id().to_string(),
                    runtime.is_continued(),
                    runtime.memo().to_value(),
                ));
                if args.start.step == 0 {
                    let mut memo = UserState::new();
                    memo.insert("k", json!(1));
                    let next = ExecutionArgs::new(args.input.clone(), args.start.next(), None);
                    return Ok(RunOutcome::ContinueAsNew { args: next, memo });
                }
                Ok(RunOutcome::Completed(json!("second")))
            }) as BoxFuture<'static, _>
        });

        let out = LocalRuntime::new(Arc::new(entry), 100)
            .run_root(args())
            .await
            .unwrap();
        assert_eq!(out, json!("second"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].0, seen[1].0);
        assert!(!seen[0].1);
        assert!(seen[1].1);
        assert_eq!(seen[1].2, json!({ "k": 1 }));
    }

    #[tokio::test]
    async fn history_limit_suggests_continue_as_new() {
        let entry = FnEntry(|runtime: Arc<dyn WorkflowRuntime>, _args: ExecutionArgs| {
            Box::pin(async move {
                assert!(!runtime.continue_as_new_suggested());
                runtime.sleep(Duration::from_millis(1)).await?;
                runtime.sleep(Duration::from_millis(1)).await?;
                Ok(RunOutcome::Completed(json!(runtime.continue_as_new_suggested())))
            }) as BoxFuture<'static, _>
        });

        let out = LocalRuntime::new(Arc::new(entry), 2)
            .run_root(args())
            .await
            .unwrap();
        assert_eq!(out, json!(true));
    }

    #[tokio::test]
    async fn signal_wait_times_out_and_is_forgotten() {
        let entry = FnEntry(|runtime: Arc<dyn WorkflowRuntime>, _args: ExecutionArgs| {
            Box::pin(async move {
                let outcome = runtime
                    .wait_for_signal("sig".into(), Some(Duration::from_millis(10)))
                    .await;
                Ok(RunOutcome::Completed(json!(outcome == SignalOutcome::TimedOut)))
            }) as BoxFuture<'static, _>
        });

        let runtime = LocalRuntime::new(Arc::new(entry), 100);
        let a = args();
        let id = a.execution_id();
        assert_eq!(runtime.run_root(a).await.unwrap(), json!(true));
        assert!(runtime.pending_inputs(id).is_empty());
    }

    #[tokio::test]
    async fn failed_child_is_not_run_again() {
        let child_runs = Arc::new(AtomicU32::new(0));
        let counter = child_runs.clone();
        let entry = FnEntry(move |runtime: Arc<dyn WorkflowRuntime>, args: ExecutionArgs| {
            let counter = counter.clone();
            Box::pin(async move {
                if args.start.workflow == "main" {
                    let child = ExecutionArgs::new(args.input.clone(), Cursor::start("child"), None);
                    let value = runtime
                        .execute_child(ChildSpec {
                            args: child,
                            memo: UserState::new(),
                        })
                        .await?;
                    return Ok(RunOutcome::Completed(value));
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ExecutionError::from_activity(
                    "svc",
                    ActivityError::transient("service unavailable"),
                ))
            }) as BoxFuture<'static, _>
        });

        let runtime = LocalRuntime::new(Arc::new(entry), 100);
        let err = runtime.run_root(args()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ActivityFailure { .. }));
        assert_eq!(child_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_root_cancels_waiting_child() {
        let entry = FnEntry(|runtime: Arc<dyn WorkflowRuntime>, args: ExecutionArgs| {
            Box::pin(async move {
                if args.start.workflow == "main" {
                    let child = ExecutionArgs::new(args.input.clone(), Cursor::start("child"), None);
                    let value = runtime
                        .execute_child(ChildSpec {
                            args: child,
                            memo: UserState::new(),
                        })
                        .await?;
                    return Ok(RunOutcome::Completed(value));
                }
                match runtime.wait_for_signal("never".into(), None).await {
                    SignalOutcome::Received(v) => Ok(RunOutcome::Completed(v)),
                    _ => Err(ExecutionError::Cancelled),
                }
            }) as BoxFuture<'static, _>
        });

        let runtime = LocalRuntime::new(Arc::new(entry), 100);
        let a = args();
        let id = a.execution_id();

        let handle = {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.run_root(a).await })
        };
        while runtime.pending_inputs(id).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(runtime.cancel(id));
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!runtime.is_running(id));
        assert!(!runtime.cancel(id));
    }
}
