//! Filesystem memo backend: one JSON file per key.
//!
//! Keys are percent-encoded into file names (`[A-Za-z0-9_.~-]` pass through,
//! everything else becomes `%XX`), so distinct keys never share a file.
//! Writes go to a temporary file first and are then renamed or hard-linked
//! into place, which keeps readers from ever observing a half-written value.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{MemoError, MemoStore};

/// Memo persisted under a directory.
#[derive(Debug, Clone)]
pub struct FilesystemMemo {
    root: PathBuf,
}

impl FilesystemMemo {
    /// Opens (creating if needed) a memo rooted at `root`.
    ///
    /// With `clear = true` any existing content is purged first.
    ///
    /// # Errors
    ///
    /// [`MemoError::Io`] if the directory cannot be purged or created.
    pub async fn open(root: impl Into<PathBuf>, clear: bool) -> Result<Self, MemoError> {
        let root = root.into();
        let io = |source| MemoError::Io {
            key: root.display().to_string(),
            source,
        };

        if clear && tokio::fs::try_exists(&root).await.map_err(io)? {
            tracing::info!(path = %root.display(), "Purging filesystem memo");
            tokio::fs::remove_dir_all(&root).await.map_err(io)?;
        }
        tokio::fs::create_dir_all(&root).await.map_err(io)?;

        tracing::info!(path = %root.display(), "Opened filesystem memo");
        Ok(Self { root })
    }

    /// Directory holding the memo files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(format!(".{}.tmp", Uuid::new_v4()))
    }

    async fn write_temp(&self, key: &str, value: &Value) -> Result<PathBuf, MemoError> {
        let bytes = serde_json::to_vec(value).map_err(|source| MemoError::Serialization {
            key: key.to_string(),
            source,
        })?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|source| MemoError::Io {
                key: key.to_string(),
                source,
            })?;
        Ok(temp)
    }
}

/// Percent-encodes a key into a file-name-safe string.
fn encode_key(key: &str) -> String {
    let mut out = urlencoding::encode(key).into_owned();
    // Leading dots would hide the file and collide with temp files.
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

#[async_trait]
impl MemoStore for FilesystemMemo {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn get(&self, key: &str) -> Result<Value, MemoError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MemoError::NotFound {
                    key: key.to_string(),
                })
            },
            Err(source) => {
                return Err(MemoError::Io {
                    key: key.to_string(),
                    source,
                })
            },
        };
        serde_json::from_slice(&bytes).map_err(|source| MemoError::Serialization {
            key: key.to_string(),
            source,
        })
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), MemoError> {
        let temp = self.write_temp(key, value).await?;
        tokio::fs::rename(&temp, self.path_for(key))
            .await
            .map_err(|source| MemoError::Io {
                key: key.to_string(),
                source,
            })
    }

    async fn put_if_absent(&self, key: &str, value: &Value) -> Result<bool, MemoError> {
        let temp = self.write_temp(key, value).await?;
        // hard_link fails with AlreadyExists instead of replacing the target.
        let linked = tokio::fs::hard_link(&temp, self.path_for(key)).await;
        if let Err(err) = tokio::fs::remove_file(&temp).await {
            tracing::warn!(path = %temp.display(), error = %err, "Failed to remove temporary memo file");
        }
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(MemoError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, MemoError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(MemoError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_key_is_injective_on_lookalikes() {
        assert_eq!(encode_key("abc.result"), "abc.result");
        assert_ne!(encode_key("a/b"), encode_key("a_b"));
        assert_ne!(encode_key("a%2Fb"), encode_key("a/b"));
        assert_eq!(encode_key(".hidden"), "%2Ehidden");
        assert_eq!(encode_key("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_key("ünï"), "%C3%BCn%C3%AF");
    }

    #[tokio::test]
    async fn put_if_absent_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let memo = FilesystemMemo::open(dir.path(), false).await.unwrap();
        memo.put_if_absent("k", &json!(1)).await.unwrap();
        memo.put_if_absent("k", &json!(2)).await.unwrap();

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let memo = FilesystemMemo::open(dir.path().join("memo"), false)
            .await
            .unwrap();

        memo.put("t.result", &json!({"raw_result": [1, 2]}))
            .await
            .unwrap();
        assert_eq!(
            memo.get("t.result").await.unwrap(),
            json!({"raw_result": [1, 2]})
        );
        assert!(memo.delete("t.result").await.unwrap());
        assert!(memo.get("t.result").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn put_if_absent_does_not_replace() {
        let dir = tempfile::tempdir().unwrap();
        let memo = FilesystemMemo::open(dir.path(), false).await.unwrap();

        assert!(memo.put_if_absent("k", &json!(1)).await.unwrap());
        assert!(!memo.put_if_absent("k", &json!(2)).await.unwrap());
        assert_eq!(memo.get("k").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn clear_purges_existing_values() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("memo");

        let memo = FilesystemMemo::open(&root, false).await.unwrap();
        memo.put("k", &json!("v")).await.unwrap();

        let reopened = FilesystemMemo::open(&root, false).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), json!("v"));

        let cleared = FilesystemMemo::open(&root, true).await.unwrap();
        assert!(cleared.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let memo = FilesystemMemo::open(dir.path(), false).await.unwrap();
        tokio::fs::write(dir.path().join("bad.json"), b"{not json")
            .await
            .unwrap();
        assert!(matches!(
            memo.get("bad").await,
            Err(MemoError::Serialization { .. })
        ));
    }
}
