//! In-process implementation of the durable execution substrate.
//!
//! - `local` -- `LocalRuntime`: root executions, run scopes, child
//!   executions with cancellation trees, activity retries, durable timers
//! - `signal` -- `SignalHub`: delivery of external input to suspended waits

pub mod local;
pub mod signal;

pub use local::LocalRuntime;
pub use signal::SignalHub;
