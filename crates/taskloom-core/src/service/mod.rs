//! Use cases built on the engine.
//!
//! Services depend on traits (ports), never on concrete infrastructure.

pub mod execution;
