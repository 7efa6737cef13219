//! In-memory blob store.

use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;

use taskloom_core::engine::offload::BlobStore;
use taskloom_types::error::OffloadError;

use super::content_key;

/// `BlobStore` kept in a concurrent map. Contents are lost on drop.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put<'a>(
        &'a self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<String, OffloadError>> + Send + 'a>> {
        Box::pin(async move {
            let key = content_key(&bytes);
            self.blobs.entry(key.clone()).or_insert(bytes);
            Ok(key)
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, OffloadError>> + Send + 'a>> {
        Box::pin(async move {
            self.blobs
                .get(key)
                .map(|bytes| bytes.value().clone())
                .ok_or_else(|| OffloadError::Missing(key.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_bytes_share_a_key() {
        let store = InMemoryBlobStore::new();
        let a = store.put(b"payload".to_vec()).await.unwrap();
        let b = store.put(b"payload".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap(), b"payload".to_vec());
    }

    #[tokio::test]
    async fn unknown_key_is_missing() {
        let store = InMemoryBlobStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, OffloadError::Missing(ref k) if k == "nope"));
    }
}
