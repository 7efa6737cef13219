//! Step-at-a-time task execution engine.
//!
//! - `context` -- cursor resolution and the bindings steps evaluate against
//! - `expression` -- JEXL evaluator and template renderer
//! - `retry` -- activity retry policy
//! - `offload` -- large-payload offload behind a `BlobStore`
//! - `activity` -- activity calls and the layered call pipeline
//! - `runtime` -- the durable execution substrate (ports)
//! - `continuation` -- continue-as-new vs child-execution handoff
//! - `branching` -- switch and if/else sub-executions
//! - `map_reduce` -- sequential and batched parallel map-reduce
//! - `dispatcher` -- step kind to handler lookup
//! - `steps` -- per-kind local computation run as activities
//! - `wait` -- the wait-for-input state machine
//! - `ports` -- model and tool backends
//! - `workflow` -- the run loop tying it together

pub mod activity;
pub mod branching;
pub mod context;
pub mod continuation;
pub mod dispatcher;
pub mod error;
pub mod expression;
pub mod map_reduce;
pub mod offload;
pub mod ports;
pub mod retry;
pub mod runtime;
pub mod steps;
pub mod wait;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
