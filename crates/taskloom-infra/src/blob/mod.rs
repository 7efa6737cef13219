//! Content-addressed blob stores for offloaded payloads.
//!
//! Keys are lowercase hex SHA-256 digests of the stored bytes, so storing
//! the same payload twice yields the same key.

pub mod fs;
pub mod memory;

use sha2::{Digest, Sha256};

/// Content key of `bytes`.
pub fn content_key(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
