//! In-memory memo backend.
//!
//! [`InMemoryMemo`] keeps values in a `DashMap<String, Value>`. Shard-level
//! locking makes each operation atomic per key, and `put_if_absent` goes
//! through the entry API so two handlers racing on the same key cannot both
//! win.
//!
//! # Examples
//!
//! ```
//! use aide::memo::{InMemoryMemo, MemoStore};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let memo = InMemoryMemo::new();
//! memo.put("t.progress", &json!(42.0)).await.unwrap();
//! assert_eq!(memo.get("t.progress").await.unwrap(), json!(42.0));
//! # });
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::{MemoError, MemoStore};

/// Thread-safe in-process memo.
#[derive(Debug, Default)]
pub struct InMemoryMemo {
    data: DashMap<String, Value>,
}

impl InMemoryMemo {
    /// Creates an empty memo.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl MemoStore for InMemoryMemo {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Value, MemoError> {
        self.data
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MemoError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), MemoError> {
        self.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &Value) -> Result<bool, MemoError> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
                Ok(true)
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, MemoError> {
        Ok(self.data.remove(key).is_some())
    }
}
