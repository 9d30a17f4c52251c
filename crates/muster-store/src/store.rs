use async_trait::async_trait;
use muster_core::{MusterError, MusterResult};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Durable storage for named blobs.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read a blob; `None` when nothing is stored under `name`.
    async fn get(&self, name: &str) -> MusterResult<Option<Vec<u8>>>;
    /// Store a blob, replacing any previous one as a whole.
    async fn put(&self, name: &str, blob: &[u8]) -> MusterResult<()>;
    /// Whether a blob is stored under `name`.
    async fn exists(&self, name: &str) -> MusterResult<bool>;
    /// Remove a blob. Deleting a missing blob is not an error.
    async fn delete(&self, name: &str) -> MusterResult<()>;
}

fn check_name(name: &str) -> MusterResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(MusterError::Persistence(format!(
            "invalid snapshot name '{name}'"
        )));
    }
    Ok(())
}

/// File-based store: one `<name>.json` file per blob under `dir`.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn new(dir: PathBuf) -> MusterResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn get(&self, name: &str) -> MusterResult<Option<Vec<u8>>> {
        check_name(name)?;
        let path = self.blob_path(name);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let data = tokio::fs::read(path).await?;
        Ok(Some(data))
    }

    async fn put(&self, name: &str, blob: &[u8]) -> MusterResult<()> {
        check_name(name)?;
        let path = self.blob_path(name);
        // Write to a per-call temp file, then rename over the target.
        let tmp = self
            .dir
            .join(format!(".{name}.{}.json.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, blob).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(path = %path.display(), bytes = blob.len(), "Snapshot written");
        Ok(())
    }

    async fn exists(&self, name: &str) -> MusterResult<bool> {
        check_name(name)?;
        Ok(tokio::fs::try_exists(self.blob_path(name)).await?)
    }

    async fn delete(&self, name: &str) -> MusterResult<()> {
        check_name(name)?;
        let path = self.blob_path(name);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// In-memory store, for tests and ephemeral engines.
#[derive(Default)]
pub struct MemorySnapshotStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get(&self, name: &str) -> MusterResult<Option<Vec<u8>>> {
        check_name(name)?;
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn put(&self, name: &str, blob: &[u8]) -> MusterResult<()> {
        check_name(name)?;
        self.blobs
            .write()
            .await
            .insert(name.to_string(), blob.to_vec());
        Ok(())
    }

    async fn exists(&self, name: &str) -> MusterResult<bool> {
        check_name(name)?;
        Ok(self.blobs.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> MusterResult<()> {
        check_name(name)?;
        self.blobs.write().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_put_get() {
        let store = MemorySnapshotStore::new();
        assert!(!store.exists("state").await.unwrap());
        store.put("state", b"{}").await.unwrap();
        assert!(store.exists("state").await.unwrap());
        assert_eq!(store.get("state").await.unwrap().unwrap(), b"{}".to_vec());
        store.delete("state").await.unwrap();
        assert!(store.get("state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let store = MemorySnapshotStore::new();
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.put("a/b", b"x").await.is_err());
        assert!(store.put("", b"x").await.is_err());
        assert!(store.get("../escape").await.is_err());
        assert!(store.exists("a\\b").await.is_err());
        assert!(store.delete("").await.is_err());
    }

    #[tokio::test]
    async fn test_backends_agree_on_invalid_names() {
        let tmp = tempfile::tempdir().unwrap();
        let file = FileSnapshotStore::new(tmp.path().to_path_buf())
            .await
            .unwrap();
        let memory = MemorySnapshotStore::new();
        let stores: [&dyn SnapshotStore; 2] = [&file, &memory];
        for store in stores {
            for name in ["", "../up", "a/b", "a\\b"] {
                assert!(store.get(name).await.is_err(), "get {name:?}");
                assert!(store.put(name, b"x").await.is_err(), "put {name:?}");
                assert!(store.exists(name).await.is_err(), "exists {name:?}");
                assert!(store.delete(name).await.is_err(), "delete {name:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_file_store_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(tmp.path().join("snapshots"))
            .await
            .unwrap();
        store.put("state", b"one").await.unwrap();
        store.put("state", b"two").await.unwrap();
        assert_eq!(store.get("state").await.unwrap().unwrap(), b"two".to_vec());
    }

    #[tokio::test]
    async fn test_file_store_concurrent_puts_leave_one_whole_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            FileSnapshotStore::new(tmp.path().to_path_buf())
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..32u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let blob = vec![i; 64 * 1024];
                store.put("state", &blob).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let blob = store.get("state").await.unwrap().unwrap();
        assert_eq!(blob.len(), 64 * 1024);
        assert!(blob.iter().all(|b| *b == blob[0]));

        // No temp files are left behind.
        let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["state.json".to_string()]);
    }
}
