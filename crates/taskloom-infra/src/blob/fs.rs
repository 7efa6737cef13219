//! Filesystem blob store.
//!
//! Layout under the root directory:
//! ```text
//! {root}/
//!   2c/
//!     2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
//! ```
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never sees a partially written blob.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use taskloom_core::engine::offload::BlobStore;
use taskloom_types::error::OffloadError;
use uuid::Uuid;

use super::content_key;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root` (created on first write).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, OffloadError> {
        if key.len() < 3 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(OffloadError::Missing(key.to_string()));
        }
        Ok(self.root.join(&key[..2]).join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put<'a>(
        &'a self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<String, OffloadError>> + Send + 'a>> {
        Box::pin(async move {
            let key = content_key(&bytes);
            let path = self.blob_path(&key)?;
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(key);
            }

            let dir = path
                .parent()
                .ok_or_else(|| OffloadError::Io(format!("no parent for {}", path.display())))?;
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| OffloadError::Io(format!("create {}: {e}", dir.display())))?;

            let tmp = dir.join(format!(".{key}.{}", Uuid::now_v7()));
            tokio::fs::write(&tmp, &bytes)
                .await
                .map_err(|e| OffloadError::Io(format!("write {}: {e}", tmp.display())))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| OffloadError::Io(format!("rename {}: {e}", path.display())))?;

            tracing::debug!(key = %key, size_bytes = bytes.len(), "stored blob");
            Ok(key)
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, OffloadError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.blob_path(key)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(OffloadError::Missing(key.to_string()))
                }
                Err(e) => Err(OffloadError::Io(format!("read {}: {e}", path.display()))),
            }
        })
    }
}
