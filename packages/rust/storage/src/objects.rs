//! Key-value object storage for result documents and research files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use designlens_shared::{DesignLensError, Result};
use tracing::debug;
use uuid::Uuid;

/// Listing entry for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Minimal object-store capability.
///
/// Keys are `/`-separated relative paths such as `analysis/<id>.json`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Returns `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Objects whose key starts with `prefix`, newest first.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Returns `false` when the key did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Object store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Use `root` as the store directory, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| DesignLensError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, seg| path.join(seg)))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(segments.join("/"))
    }
}

/// Reject keys that could escape the store root.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != ".." && !seg.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(DesignLensError::validation(format!("invalid object key '{key}'")))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path_for(key)?;
        let parent = target
            .parent()
            .ok_or_else(|| DesignLensError::validation(format!("invalid object key '{key}'")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DesignLensError::io(parent, e))?;

        // Write to temp file first, then rename into place
        let temp = parent.join(format!(".{}.tmp", Uuid::now_v7().simple()));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| DesignLensError::io(&temp, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(DesignLensError::io(&target, e));
        }

        debug!(key, size = bytes.len(), "stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DesignLensError::io(&path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(DesignLensError::io(&dir, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| DesignLensError::io(&dir, e))?
            {
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| DesignLensError::io(&path, e))?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(ObjectMeta {
                    key,
                    size_bytes: metadata.len(),
                    modified,
                });
            }
        }

        objects.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.key.cmp(&a.key)));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "deleted object");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DesignLensError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> LocalObjectStore {
        let dir = std::env::temp_dir().join(format!("dl_objects_{}", Uuid::now_v7()));
        LocalObjectStore::open(dir).expect("open store")
    }

    #[tokio::test]
    async fn put_get_delete() {
        let store = temp_store();
        store.put("analysis/a.json", b"{}").await.unwrap();

        assert_eq!(store.get("analysis/a.json").await.unwrap(), Some(b"{}".to_vec()));
        assert!(store.get("analysis/missing.json").await.unwrap().is_none());

        assert!(store.delete("analysis/a.json").await.unwrap());
        assert!(!store.delete("analysis/a.json").await.unwrap());
        assert!(store.get("analysis/a.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_without_leaving_temp_files() {
        let store = temp_store();
        store.put("research-data/f1/notes.txt", b"one").await.unwrap();
        store.put("research-data/f1/notes.txt", b"two").await.unwrap();

        assert_eq!(
            store.get("research-data/f1/notes.txt").await.unwrap(),
            Some(b"two".to_vec())
        );

        let dir = store.root().join("research-data").join("f1");
        let names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["notes.txt".to_string()]);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = temp_store();
        store.put("analysis/one.json", b"1").await.unwrap();
        store.put("analysis/two.json", b"22").await.unwrap();
        store.put("research-data/x/r.txt", b"333").await.unwrap();

        let analyses = store.list("analysis/").await.unwrap();
        assert_eq!(analyses.len(), 2);
        assert!(analyses.iter().all(|o| o.key.starts_with("analysis/")));

        let research = store.list("research-data/").await.unwrap();
        assert_eq!(research.len(), 1);
        assert_eq!(research[0].key, "research-data/x/r.txt");
        assert_eq!(research[0].size_bytes, 3);

        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let store = temp_store();
        std::fs::remove_dir_all(store.root()).unwrap();
        assert!(store.list("analysis/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let store = temp_store();
        for key in ["", "/abs", "../up", "a/../b", "a//b", ".hidden", "a\\b"] {
            assert!(store.put(key, b"x").await.is_err(), "key {key:?} should be rejected");
        }
    }
}
