//! Task execution orchestration engine and port definitions for Taskloom.
//!
//! This crate defines the engine and the "ports" (traits) it consumes:
//! the durable runtime, blob storage, execution persistence, the model and
//! tool backends. It depends only on `taskloom-types` and pure libraries,
//! never on `taskloom-infra` or any database/IO crate.

pub mod engine;
pub mod repository;
pub mod service;
