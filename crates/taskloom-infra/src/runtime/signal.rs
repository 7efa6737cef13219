//! External signal delivery.
//!
//! A suspended wait registers its signal name and receives a oneshot
//! receiver. Names are `{execution_id}:{scope}`. A signal sent to a name of
//! the execution that nobody waits on yet is buffered and handed to the first
//! wait that registers it, so input may arrive before the workflow reaches
//! the step. Names outside the execution are refused.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

struct PendingWait {
    execution_id: Uuid,
    /// Registration order, used to pick the oldest wait.
    seq: u64,
    sender: oneshot::Sender<Value>,
}

#[derive(Default)]
pub struct SignalHub {
    waiters: DashMap<String, PendingWait>,
    buffered: DashMap<String, Value>,
    seq: AtomicU64,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait on `name` for `execution_id`.
    pub fn register(&self, execution_id: Uuid, name: &str) -> oneshot::Receiver<Value> {
        let (sender, receiver) = oneshot::channel();

        if let Some((_, value)) = self.buffered.remove(name) {
            tracing::debug!(execution_id = %execution_id, signal = %name, "delivering buffered signal");
            // The receiver is still in hand, so this send cannot fail.
            let _ = sender.send(value);
            return receiver;
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.waiters.insert(
            name.to_string(),
            PendingWait {
                execution_id,
                seq,
                sender,
            },
        );
        receiver
    }

    /// Deliver `value` to the named wait, or to the oldest pending wait of
    /// the execution when no name is given.
    ///
    /// Returns false when nothing could take the value: no name was given
    /// and nothing is pending, the name does not belong to the execution, or
    /// the named wait has already gone away.
    pub fn send(&self, execution_id: Uuid, signal: Option<&str>, value: Value) -> bool {
        let name = match signal {
            Some(name) if name.starts_with(&signal_prefix(execution_id)) => name.to_string(),
            Some(name) => {
                tracing::warn!(execution_id = %execution_id, signal = %name, "signal refused: name belongs to another execution");
                return false;
            }
            None => match self.pending(execution_id).into_iter().next() {
                Some(name) => name,
                None => return false,
            },
        };

        match self.waiters.remove(&name) {
            Some((_, wait)) => {
                tracing::info!(execution_id = %execution_id, signal = %name, "signal delivered");
                wait.sender.send(value).is_ok()
            }
            None => {
                tracing::info!(execution_id = %execution_id, signal = %name, "signal buffered");
                self.buffered.insert(name, value);
                true
            }
        }
    }

    /// Names of the pending waits of an execution, oldest first.
    pub fn pending(&self, execution_id: Uuid) -> Vec<String> {
        let mut pending: Vec<(u64, String)> = self
            .waiters
            .iter()
            .filter(|entry| entry.value().execution_id == execution_id)
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, name)| name).collect()
    }

    /// Drop a wait that ended without a signal.
    pub fn forget(&self, name: &str) {
        self.waiters.remove(name);
    }

    /// Drop every wait and buffered signal of a finished execution.
    pub fn clear(&self, execution_id: Uuid) {
        let prefix = signal_prefix(execution_id);
        self.waiters
            .retain(|_, wait| wait.execution_id != execution_id);
        self.buffered.retain(|name, _| !name.starts_with(&prefix));
    }
}

fn signal_prefix(execution_id: Uuid) -> String {
    format!("{execution_id}:")
}
