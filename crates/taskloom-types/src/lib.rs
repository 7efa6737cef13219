//! Shared domain types for Taskloom.
//!
//! This crate contains the domain types used across the Taskloom engine:
//! task definitions and cursors, step outcomes, offloaded payload references,
//! transition and execution records, engine configuration, and error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod remote;
pub mod task;
