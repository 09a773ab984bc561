//! Pluggable key/value persistence.
//!
//! The persistence side uses a [`MemoStore`] as durable storage for the
//! latest progress and the result of every task; the public-facing side uses
//! one as a cache for answers and for its current context.
//!
//! # Backends
//!
//! - [`InMemoryMemo`](memory::InMemoryMemo) - `DashMap` backed, per process.
//! - [`FilesystemMemo`](filesystem::FilesystemMemo) - one JSON file per key.
//! - [`NoneMemo`](none::NoneMemo) - stores nothing.
//!
//! Backends are dumb KV stores; duplicate handling and key layout live in
//! the sides. Every operation is atomic for a single key.

pub mod filesystem;
pub mod memory;
pub mod none;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use filesystem::FilesystemMemo;
pub use memory::InMemoryMemo;
pub use none::NoneMemo;

use crate::types::TaskUid;

/// Key of the public-facing side's current context.
pub const CONTEXT_KEY: &str = "context";

/// Errors raised by memo backends.
#[derive(Error, Debug)]
pub enum MemoError {
    /// Nothing is stored under the key.
    #[error("key not found: {key}")]
    NotFound {
        /// The missing key
        key: String,
    },

    /// Filesystem failure.
    #[error("memo I/O error on '{key}': {source}")]
    Io {
        /// Key being accessed
        key: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored bytes are not valid JSON.
    #[error("memo value under '{key}' is not valid JSON: {source}")]
    Serialization {
        /// Key being accessed
        key: String,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// Any other backend-specific failure.
    #[error("memo backend error: {0}")]
    Backend(String),
}

impl MemoError {
    /// Returns `true` for [`MemoError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Key/value persistence used by the sides.
///
/// Implementations must be `Send + Sync`; sides share them through
/// `Arc<dyn MemoStore>` across concurrently running handlers.
#[async_trait]
pub trait MemoStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`MemoError::NotFound`] if nothing is stored.
    async fn get(&self, key: &str) -> Result<Value, MemoError>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &Value) -> Result<(), MemoError>;

    /// Stores `value` only if `key` is vacant.
    ///
    /// Returns `true` if the value was written, `false` if something was
    /// already stored (the stored value is left untouched).
    async fn put_if_absent(&self, key: &str, value: &Value) -> Result<bool, MemoError>;

    /// Removes `key`. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, MemoError>;

    /// Like [`get`](MemoStore::get) but maps "not found" to `None`.
    async fn find(&self, key: &str) -> Result<Option<Value>, MemoError> {
        match self.get(key).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// `{uid}.progress` - latest progress on the persistence side.
pub fn progress_key(uid: &TaskUid) -> String {
    format!("{uid}.progress")
}

/// `{uid}.result` - result on the persistence side.
pub fn result_key(uid: &TaskUid) -> String {
    format!("{uid}.result")
}

/// `{uid}.response_progress` - cached progress on the public-facing side.
pub fn response_progress_key(uid: &TaskUid) -> String {
    format!("{uid}.response_progress")
}

/// `{uid}.response_result` - cached result on the public-facing side.
pub fn response_result_key(uid: &TaskUid) -> String {
    format!("{uid}.response_result")
}
