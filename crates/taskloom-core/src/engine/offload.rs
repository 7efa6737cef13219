//! Large-payload offload layer.
//!
//! Values whose serialized size exceeds the configured threshold are written
//! to a content-addressed `BlobStore` and replaced by a `RemoteRef` marker
//! before they are recorded in execution history. Reading resolves markers
//! back to the original values, so callers never observe which elements of a
//! `RemoteList` are inline and which are remote. Inline values that look like
//! a marker are escaped on the way in and restored on the way out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use taskloom_types::error::OffloadError;
use taskloom_types::remote::{
    RemoteList, RemoteRef, escape_inline, is_marker_shaped, unescape_inline,
};

/// Content-addressed blob storage.
///
/// `put` must be idempotent: storing identical bytes twice yields the same key.
pub trait BlobStore: Send + Sync {
    fn put<'a>(
        &'a self,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<String, OffloadError>> + Send + 'a>>;

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, OffloadError>> + Send + 'a>>;
}

/// Moves oversized values to a `BlobStore` and resolves them back.
#[derive(Clone)]
pub struct PayloadOffloader {
    store: Arc<dyn BlobStore>,
    threshold_bytes: usize,
}

impl PayloadOffloader {
    pub fn new(store: Arc<dyn BlobStore>, threshold_bytes: usize) -> Self {
        Self {
            store,
            threshold_bytes,
        }
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Encode a plain value for history: a reference if it is larger than
    /// the threshold, the value itself (escaped if marker-shaped) otherwise.
    pub async fn offload(&self, value: Value) -> Result<Value, OffloadError> {
        let bytes =
            serde_json::to_vec(&value).map_err(|e| OffloadError::Serialization(e.to_string()))?;
        if bytes.len() <= self.threshold_bytes {
            return Ok(escape_inline(value));
        }

        let size_bytes = bytes.len();
        let store_key = self.store.put(bytes).await?;
        tracing::debug!(store_key = %store_key, size_bytes, "offloaded payload");

        Ok(RemoteRef {
            store_key,
            size_bytes,
        }
        .to_value())
    }

    /// Load the value behind a reference. Non-reference values pass through.
    pub async fn resolve(&self, value: Value) -> Result<Value, OffloadError> {
        let Some(reference) = RemoteRef::from_value(&value) else {
            return Ok(unescape_inline(value));
        };

        let bytes = self.store.get(&reference.store_key).await?;
        tracing::debug!(store_key = %reference.store_key, size_bytes = bytes.len(), "resolved payload");
        serde_json::from_slice(&bytes).map_err(|e| OffloadError::Serialization(e.to_string()))
    }

    /// Offload the inline elements of an encoded list that have grown past
    /// the threshold. References and escaped values are kept, so offloading
    /// a list twice changes nothing the second time.
    pub async fn offload_list(&self, list: &RemoteList) -> Result<RemoteList, OffloadError> {
        let mut items = Vec::with_capacity(list.len());
        for item in list.items() {
            if is_marker_shaped(item) {
                items.push(item.clone());
            } else {
                items.push(self.offload(item.clone()).await?);
            }
        }
        Ok(RemoteList::from_items(items))
    }

    /// Resolve every element of a list into plain values, in order.
    pub async fn resolve_list(&self, list: &RemoteList) -> Result<Vec<Value>, OffloadError> {
        let mut values = Vec::with_capacity(list.len());
        for item in list.items() {
            values.push(self.resolve(item.clone()).await?);
        }
        Ok(values)
    }

    /// Copy of `list` with `value` (offloaded if large) appended.
    pub async fn append(&self, list: &RemoteList, value: Value) -> Result<RemoteList, OffloadError> {
        let item = self.offload(value).await?;
        Ok(list.with_appended(item))
    }
}
