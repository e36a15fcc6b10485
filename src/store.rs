use std::path::{Path, PathBuf};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::warn;

use crate::TermKeepError;

/// Key-to-JSON-document storage with atomic writes and automatic backup.
///
/// Keys are slash-segmented strings (`terminals/<projectId>`, `window-state`)
/// mapping to `<root>/<key>.json` on disk. Each write goes through a temp
/// file and a rename, so a crash mid-write never leaves a partial document:
/// the previous committed document survives until the rename commits the new
/// one. The superseded document is kept at `<key>.json.backup`.
pub struct DurableStore {
    root: PathBuf,
}

// Keys are restricted before anything touches the file system. A bad key is
// a caller bug, not an I/O condition, so it fails fast instead of returning
// a recoverable error.
fn validate_key(key: &str) {
    if key.is_empty() {
        panic!("Invalid storage key: empty");
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            panic!("Invalid storage key '{}': empty path segment", key);
        }
        if segment == ".." {
            panic!("Invalid storage key '{}': path traversal", key);
        }
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-')
    {
        panic!("Invalid storage key '{}': illegal character", key);
    }
}

impl DurableStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, key: &str) -> PathBuf {
        validate_key(key);
        self.root.join(format!("{}.json", key))
    }

    fn backup_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json.backup", key))
    }

    /// Read the document stored under `key`. A missing file is the expected
    /// fresh-install state and returns `Ok(None)`; malformed JSON is reported
    /// as a distinct parse error so callers can treat corruption differently
    /// from absence.
    pub async fn read(&self, key: &str) -> crate::Result<Option<Value>> {
        let path = self.document_path(key);
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TermKeepError::FileSystem(e.to_string())),
        };
        match serde_json::from_str(&data) {
            Ok(document) => Ok(Some(document)),
            Err(e) => Err(TermKeepError::Parse {
                key: key.to_string(),
                detail: e.to_string(),
            }),
        }
    }

    pub async fn read_as<T: DeserializeOwned>(&self, key: &str) -> crate::Result<Option<T>> {
        match self.read(key).await? {
            Some(document) => {
                let value = serde_json::from_value(document).map_err(|e| TermKeepError::Parse {
                    key: key.to_string(),
                    detail: e.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write `document` under `key`.
    ///
    /// The sequence is: serialize to an indented temp file next to the final
    /// path, move any existing document aside as the backup, then rename the
    /// temp file into place. The rename is the single commit point; any
    /// failure before it cleans up the temp file and leaves the previous
    /// document intact.
    pub async fn write(&self, key: &str, document: &Value) -> crate::Result<()> {
        let path = self.document_path(key);

        let parent = path
            .parent()
            .ok_or_else(|| TermKeepError::FileSystem(format!("No parent directory for '{}'", key)))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| write_error(key, &e))?;

        let data = serde_json::to_string_pretty(document)?;

        // Random suffix so a concurrent write to a sibling key can never
        // collide on the temp name.
        let suffix: u64 = rand::thread_rng().gen();
        let tmp = self.root.join(format!("{}.json.{}.tmp", key, suffix));

        if let Err(e) = fs::write(&tmp, data.as_bytes()).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(write_error(key, &e));
        }

        // Keep the superseded document around as a backup. Best-effort: a
        // failure here must not abort the primary write.
        if path.exists() {
            if let Err(e) = fs::rename(&path, self.backup_path(key)).await {
                warn!("Failed to back up previous document for '{}': {}", key, e);
            }
        }

        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(write_error(key, &e));
        }

        Ok(())
    }

    pub async fn write_as<T: Serialize>(&self, key: &str, value: &T) -> crate::Result<()> {
        let document = serde_json::to_value(value)?;
        self.write(key, &document).await
    }

    /// Remove the document stored under `key`. Removing a key that does not
    /// exist succeeds.
    pub async fn remove(&self, key: &str) -> crate::Result<()> {
        let path = self.document_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TermKeepError::FileSystem(e.to_string())),
        }
    }
}

fn write_error(key: &str, e: &std::io::Error) -> TermKeepError {
    TermKeepError::Write {
        key: key.to_string(),
        detail: e.to_string(),
    }
}

/// Per-OS application data directory for the default store root.
pub fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("termkeep")
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("Library/Application Support/termkeep")
    } else {
        // Linux and others
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".local/share/termkeep")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, DurableStore) {
        let tmp_dir = TempDir::new().unwrap();
        let store = DurableStore::new(tmp_dir.path().to_path_buf());
        (tmp_dir, store)
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let (_tmp, store) = store();
        assert!(store.read("window-state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let (_tmp, store) = store();
        let doc = json!({"a": 1});
        store.write("terminals/project-1", &doc).await.unwrap();
        let read = store.read("terminals/project-1").await.unwrap().unwrap();
        assert_eq!(read, doc);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_backup() {
        let (tmp, store) = store();
        store.write("k", &json!({"a": 1})).await.unwrap();
        store.write("k", &json!({"a": 2})).await.unwrap();

        let read = store.read("k").await.unwrap().unwrap();
        assert_eq!(read, json!({"a": 2}));

        let backup = std::fs::read_to_string(tmp.path().join("k.json.backup")).unwrap();
        let backup: Value = serde_json::from_str(&backup).unwrap();
        assert_eq!(backup, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_crash_before_rename_leaves_no_document() {
        let (tmp, store) = store();
        // Simulate a crash between the temp-file write and the commit
        // rename: the temp file exists, the final path was never created.
        let data = serde_json::to_string_pretty(&json!({"a": 1})).unwrap();
        std::fs::write(tmp.path().join("k.json.123.tmp"), data).unwrap();

        assert!(store.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crash_before_rename_preserves_previous_document() {
        let (tmp, store) = store();
        store.write("k", &json!({"a": 1})).await.unwrap();

        // A later write that died before its rename leaves only temp litter.
        std::fs::write(tmp.path().join("k.json.456.tmp"), "{\"a\": 2}").unwrap();

        let read = store.read("k").await.unwrap().unwrap();
        assert_eq!(read, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_tmp, store) = store();
        store.write("k", &json!({"a": 1})).await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.read("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_parse_error() {
        let (tmp, store) = store();
        std::fs::write(tmp.path().join("k.json"), "{not json").unwrap();
        match store.read("k").await {
            Err(TermKeepError::Parse { key, .. }) => assert_eq!(key, "k"),
            other => panic!("expected parse error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_nested_key_creates_parent_directories() {
        let (tmp, store) = store();
        store
            .write_as("snapshots/project-9", &vec![1, 2, 3])
            .await
            .unwrap();
        assert!(tmp.path().join("snapshots/project-9.json").exists());
    }

    #[test]
    #[should_panic(expected = "path traversal")]
    fn test_key_with_traversal_panics() {
        validate_key("snapshots/../secrets");
    }

    #[test]
    #[should_panic(expected = "illegal character")]
    fn test_key_with_illegal_character_panics() {
        validate_key("snapshots/a b");
    }

    #[test]
    #[should_panic(expected = "empty path segment")]
    fn test_key_with_empty_segment_panics() {
        validate_key("snapshots//x");
    }
}
