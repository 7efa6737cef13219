//! Wait-for-input as an explicit state machine.
//!
//! ```text
//! Pending --suspend--> AwaitingExternalSignal --signal--> Resumed
//!    |                        |  \--timeout--> TimedOut
//!    \-------cancel-----------+--cancel--> Cancelled
//! ```
//!
//! `Resumed`, `Cancelled` and `TimedOut` are terminal: further events leave
//! them unchanged.

use std::time::Duration;

use serde_json::Value;
use taskloom_types::task::Cursor;

use super::error::ExecutionError;
use super::runtime::{SignalOutcome, WorkflowRuntime};

#[derive(Debug, Clone, PartialEq)]
pub enum WaitState {
    Pending,
    AwaitingExternalSignal { signal: String, info: Value },
    Resumed(Value),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitEvent {
    Suspend { signal: String, info: Value },
    Signal(Value),
    Cancel,
    Timeout,
}

impl WaitState {
    pub fn on(self, event: WaitEvent) -> WaitState {
        match (self, event) {
            (WaitState::Pending, WaitEvent::Suspend { signal, info }) => {
                WaitState::AwaitingExternalSignal { signal, info }
            }
            (WaitState::Pending, WaitEvent::Cancel) => WaitState::Cancelled,
            (WaitState::AwaitingExternalSignal { .. }, WaitEvent::Signal(value)) => {
                WaitState::Resumed(value)
            }
            (WaitState::AwaitingExternalSignal { .. }, WaitEvent::Cancel) => WaitState::Cancelled,
            (WaitState::AwaitingExternalSignal { .. }, WaitEvent::Timeout) => WaitState::TimedOut,
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaitState::Resumed(_) | WaitState::Cancelled | WaitState::TimedOut
        )
    }
}

/// One suspension of a step until external input arrives.
pub struct InputWait<'a> {
    runtime: &'a dyn WorkflowRuntime,
    cursor: Cursor,
    timeout: Option<Duration>,
}

impl<'a> InputWait<'a> {
    pub fn new(runtime: &'a dyn WorkflowRuntime, cursor: Cursor, timeout: Option<Duration>) -> Self {
        Self {
            runtime,
            cursor,
            timeout,
        }
    }

    /// Suspend on `signal` and return the delivered value.
    ///
    /// Fails with `Cancelled` when the run is cancelled while waiting and
    /// with `InputTimeout` when the optional timeout elapses first.
    pub async fn wait(self, signal: String, info: Value) -> Result<Value, ExecutionError> {
        let mut state = WaitState::Pending.on(WaitEvent::Suspend {
            signal: signal.clone(),
            info,
        });

        tracing::info!(
            workflow = %self.cursor.workflow,
            step = self.cursor.step,
            signal = %signal,
            "awaiting external input"
        );

        let event = if self.runtime.cancellation().is_cancelled() {
            WaitEvent::Cancel
        } else {
            match self.runtime.wait_for_signal(signal, self.timeout).await {
                SignalOutcome::Received(value) => WaitEvent::Signal(value),
                SignalOutcome::Cancelled => WaitEvent::Cancel,
                SignalOutcome::TimedOut => WaitEvent::Timeout,
            }
        };
        state = state.on(event);

        match state {
            WaitState::Resumed(value) => {
                tracing::info!(
                    workflow = %self.cursor.workflow,
                    step = self.cursor.step,
                    "resumed with external input"
                );
                Ok(value)
            }
            WaitState::Cancelled => Err(ExecutionError::Cancelled),
            WaitState::TimedOut => Err(ExecutionError::InputTimeout(self.cursor)),
            WaitState::Pending | WaitState::AwaitingExternalSignal { .. } => {
                Err(ExecutionError::StepFailed {
                    cursor: self.cursor,
                    message: "wait ended without a terminal state".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedRuntime;
    use serde_json::json;

    fn awaiting() -> WaitState {
        WaitState::Pending.on(WaitEvent::Suspend {
            signal: "s".into(),
            info: json!({}),
        })
    }

    #[test]
    fn transitions_out_of_awaiting() {
        assert_eq!(awaiting().on(WaitEvent::Signal(json!(1))), WaitState::Resumed(json!(1)));
        assert_eq!(awaiting().on(WaitEvent::Cancel), WaitState::Cancelled);
        assert_eq!(awaiting().on(WaitEvent::Timeout), WaitState::TimedOut);
    }

    #[test]
    fn terminal_states_absorb_events() {
        let resumed = awaiting().on(WaitEvent::Signal(json!("a")));
        assert!(resumed.is_terminal());
        assert_eq!(resumed.clone().on(WaitEvent::Cancel), resumed);
        assert_eq!(WaitState::Cancelled.on(WaitEvent::Signal(json!(2))), WaitState::Cancelled);
    }

    #[test]
    fn signal_before_suspend_is_ignored() {
        assert_eq!(WaitState::Pending.on(WaitEvent::Signal(json!(1))), WaitState::Pending);
    }

    #[tokio::test]
    async fn wait_returns_delivered_value() {
        let runtime = ScriptedRuntime::new()
            .with_signals(vec![SignalOutcome::Received(json!({ "answer": 42 }))]);
        let value = InputWait::new(runtime.as_ref(), Cursor::start("main"), None)
            .wait("exec:`main`[0]".into(), json!({ "q": "?" }))
            .await
            .unwrap();
        assert_eq!(value, json!({ "answer": 42 }));
        assert_eq!(runtime.waited(), vec!["exec:`main`[0]"]);
    }

    #[tokio::test]
    async fn timeout_and_cancel_are_errors() {
        let runtime = ScriptedRuntime::new()
            .with_signals(vec![SignalOutcome::TimedOut, SignalOutcome::Cancelled]);

        let err = InputWait::new(runtime.as_ref(), Cursor::new("main", 2), Some(Duration::from_secs(1)))
            .wait("s".into(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InputTimeout(_)));

        let err = InputWait::new(runtime.as_ref(), Cursor::new("main", 2), None)
            .wait("s".into(), Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_run_does_not_wait() {
        let runtime = ScriptedRuntime::new();
        runtime.token().cancel();
        let err = InputWait::new(runtime.as_ref(), Cursor::start("main"), None)
            .wait("s".into(), Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(runtime.waited().is_empty());
    }
}
