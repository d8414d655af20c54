//! Durable key-value JSON document store
//!
//! Each document ("pool-state", "cache-entries", ...) is one JSON file in the
//! data directory, read and written whole. Writes use temp-file + rename so a
//! crash mid-write never leaves a truncated document behind.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;

/// Whole-document JSON store rooted at a data directory.
///
/// The Mutex serializes writes so a debounced background save and a
/// shutdown flush of the same document never interleave their temp files.
pub struct JsonStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open the store, creating the data directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!(path = %dir.display(), "opened document store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path backing a document.
    pub fn path_for(&self, document: &str) -> PathBuf {
        self.dir.join(format!("{document}.json"))
    }

    /// Read a document. Returns `Ok(None)` when it has never been written.
    ///
    /// A document that exists but does not parse is an `Error::Json`; callers
    /// decide whether that is recoverable.
    pub async fn read<T: DeserializeOwned>(&self, document: &str) -> Result<Option<T>> {
        let path = self.path_for(document);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&contents)?;
        debug!(document, "read document");
        Ok(Some(value))
    }

    /// Replace a document atomically.
    pub async fn write<T: Serialize>(&self, document: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path_for(document), &json).await?;
        debug!(document, bytes = json.len(), "persisted document");
        Ok(())
    }

    /// Delete a document. Missing documents are not an error.
    pub async fn remove(&self, document: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(document)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write bytes to a file atomically with 0600 permissions.
///
/// Documents can hold GitHub tokens, so they are owner read/write only.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::collections::HashMap;

    #[tokio::test]
    async fn roundtrip_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();

        let mut doc = HashMap::new();
        doc.insert("cursor".to_string(), 3u64);
        store.write("pool-state", &doc).await.unwrap();

        let read: HashMap<String, u64> = store.read("pool-state").await.unwrap().unwrap();
        assert_eq!(read["cursor"], 3);
    }

    #[tokio::test]
    async fn missing_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        let read: Option<serde_json::Value> = store.read("never-written").await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn malformed_document_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        tokio::fs::write(store.path_for("cache-entries"), "{ not json")
            .await
            .unwrap();

        let result: Result<Option<serde_json::Value>> = store.read("cache-entries").await;
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn open_creates_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = JsonStore::open(&nested).await.unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.dir(), nested.as_path());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        store.write("doc", &serde_json::json!({"a": 1})).await.unwrap();
        store.remove("doc").await.unwrap();
        store.remove("doc").await.unwrap();
        assert!(!store.path_for("doc").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).await.unwrap();
        store.write("pool-state", &serde_json::json!({})).await.unwrap();

        let metadata = tokio::fs::metadata(store.path_for("pool-state"))
            .await
            .unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "document must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonStore::open(dir.path()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .write("counter", &serde_json::json!({ "value": i }))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let read: serde_json::Value = store.read("counter").await.unwrap().unwrap();
        assert!(read["value"].as_u64().unwrap() < 10);
    }
}
