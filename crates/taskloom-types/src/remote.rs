//! Reference-or-inline payload encoding.
//!
//! Values above the offload threshold travel through history as a small
//! `RemoteRef` marker object instead of the payload itself:
//!
//! ```json
//! { "$remote": { "store_key": "3f2a...", "size_bytes": 81234 } }
//! ```
//!
//! `RemoteList` is the append-only sequence of step outputs carried across
//! continuation boundaries; each element is either an inline value or such a
//! marker.
//!
//! `$remote` and `$inline` are reserved. An inline value that is itself a
//! single-key object under either key is stored as `{ "$inline": value }` so
//! it is never mistaken for a reference.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key of the marker object wrapping an offloaded reference.
pub const REMOTE_MARKER: &str = "$remote";

/// Key of the wrapper around an inline value shaped like a marker.
pub const INLINE_MARKER: &str = "$inline";

/// True for a single-key object under a reserved key.
pub fn is_marker_shaped(value: &Value) -> bool {
    value.as_object().is_some_and(|object| {
        object.len() == 1
            && (object.contains_key(REMOTE_MARKER) || object.contains_key(INLINE_MARKER))
    })
}

/// Encode a value that stays inline.
pub fn escape_inline(value: Value) -> Value {
    if !is_marker_shaped(&value) {
        return value;
    }
    let mut wrapper = serde_json::Map::new();
    wrapper.insert(INLINE_MARKER.to_string(), value);
    Value::Object(wrapper)
}

/// Reverse `escape_inline`; anything else is returned as is.
pub fn unescape_inline(value: Value) -> Value {
    match value {
        Value::Object(mut object) if object.len() == 1 && object.contains_key(INLINE_MARKER) => {
            object.remove(INLINE_MARKER).unwrap_or_default()
        }
        other => other,
    }
}

/// Pointer to a payload held in the external blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    /// Content-derived key in the blob store.
    pub store_key: String,
    /// Size of the serialized payload in bytes.
    pub size_bytes: usize,
}

impl RemoteRef {
    /// Encode as the `{"$remote": {...}}` marker value.
    pub fn to_value(&self) -> Value {
        let mut marker = serde_json::Map::new();
        marker.insert(
            REMOTE_MARKER.to_string(),
            serde_json::json!({
                "store_key": self.store_key,
                "size_bytes": self.size_bytes,
            }),
        );
        Value::Object(marker)
    }

    /// Decode a marker value. Returns `None` for anything that is not a
    /// single-key `$remote` object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        let inner = object.get(REMOTE_MARKER)?;
        serde_json::from_value(inner.clone()).ok()
    }

    pub fn is_reference(value: &Value) -> bool {
        Self::from_value(value).is_some()
    }
}

/// Append-only sequence of step outputs, each inline or a `RemoteRef` marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteList {
    items: Vec<Value>,
}

impl RemoteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap already-encoded items (inline values or markers).
    pub fn from_items(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encoded items in order.
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn last(&self) -> Option<&Value> {
        self.items.last()
    }

    /// Append an already-encoded item.
    pub fn push(&mut self, item: Value) {
        self.items.push(item);
    }

    /// Copy of this list with `item` appended; the receiver is unchanged.
    pub fn with_appended(&self, item: Value) -> Self {
        let mut next = self.clone();
        next.push(item);
        next
    }

    /// Number of items stored as references.
    pub fn reference_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| RemoteRef::is_reference(item))
            .count()
    }
}
