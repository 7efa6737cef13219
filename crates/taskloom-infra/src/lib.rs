//! Infrastructure layer for Taskloom.
//!
//! Contains implementations of the ports defined in `taskloom-core`: a
//! local in-process workflow runtime, content-addressed blob stores, SQLite
//! and in-memory execution repositories, and the TOML config loader.

pub mod blob;
pub mod config;
pub mod engine;
pub mod memory;
pub mod runtime;
pub mod sqlite;
