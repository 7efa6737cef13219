//! Repository trait definitions (ports).
//!
//! The infrastructure layer (taskloom-infra) implements these traits; the
//! engine never depends on a specific storage technology.

pub mod execution;

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}
