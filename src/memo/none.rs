//! Memo that stores nothing.
//!
//! Used by sides that need no storage (the worker) and in deployments where
//! the public-facing side relies purely on round trips to the persistence
//! side.

use async_trait::async_trait;
use serde_json::Value;

use super::{MemoError, MemoStore};

/// Accepts every write and forgets it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneMemo;

impl NoneMemo {
    /// Creates the no-op memo.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MemoStore for NoneMemo {
    fn name(&self) -> &str {
        "none"
    }

    async fn get(&self, key: &str) -> Result<Value, MemoError> {
        tracing::trace!(key, "Read from none memo");
        Err(MemoError::NotFound {
            key: key.to_string(),
        })
    }

    async fn put(&self, key: &str, _value: &Value) -> Result<(), MemoError> {
        tracing::trace!(key, "Discarded write to none memo");
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, _value: &Value) -> Result<bool, MemoError> {
        tracing::trace!(key, "Discarded write to none memo");
        Ok(true)
    }

    async fn delete(&self, _key: &str) -> Result<bool, MemoError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn forgets_everything() {
        let memo = NoneMemo::new();
        memo.put("k", &json!(1)).await.unwrap();
        assert!(memo.put_if_absent("k", &json!(2)).await.unwrap());
        assert!(memo.get("k").await.unwrap_err().is_not_found());
        assert!(!memo.delete("k").await.unwrap());
    }
}
