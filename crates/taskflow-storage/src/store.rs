use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use taskflow_core::{TaskflowError, TaskflowResult};
use tokio::sync::RwLock;
use tracing::debug;

/// Key/value persistence for serialized workflow and task state.
///
/// Keys are `/`-separated paths such as `workflows/<id>/tasks/<task_id>`.
/// Storage is only written for durability; nothing reads it back to make
/// scheduling decisions.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn store(&self, key: &str, data: &serde_json::Value) -> TaskflowResult<()>;
    async fn retrieve(&self, key: &str) -> TaskflowResult<Option<serde_json::Value>>;
    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> TaskflowResult<bool>;
    async fn exists(&self, key: &str) -> TaskflowResult<bool>;
    /// All keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> TaskflowResult<Vec<String>>;
}

/// Normalize a key into its path segments, dropping empty, `.` and `..`.
fn key_segments(key: &str) -> TaskflowResult<Vec<String>> {
    let segments: Vec<String> = key
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        return Err(TaskflowError::Storage(format!("invalid storage key: {key:?}")));
    }
    Ok(segments)
}

/// JSON-file storage: one pretty-printed file per key under a root directory.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub async fn new(root: impl Into<PathBuf>) -> TaskflowResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> TaskflowResult<PathBuf> {
        let segments = key_segments(key)?;
        let mut path = self.root.clone();
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if i == last {
                path.push(format!("{segment}.json"));
            } else {
                path.push(segment);
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn store(&self, key: &str, data: &serde_json::Value) -> TaskflowResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&path, json).await?;
        debug!(key, path = %path.display(), "Stored value");
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> TaskflowResult<Option<serde_json::Value>> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let value = serde_json::from_str(&data).map_err(|e| {
            TaskflowError::Storage(format!("Failed to parse stored value for {key}: {e}"))
        })?;
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> TaskflowResult<bool> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> TaskflowResult<bool> {
        Ok(self.key_path(key)?.exists())
    }

    async fn list_keys(&self, prefix: &str) -> TaskflowResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, rel)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let joined = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), joined));
                } else if let Some(key) = joined.strip_suffix(".json") {
                    if key.starts_with(prefix) {
                        keys.push(key.to_string());
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process storage backed by a sorted map.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, key: &str, data: &serde_json::Value) -> TaskflowResult<()> {
        let key = key_segments(key)?.join("/");
        self.entries.write().await.insert(key, data.clone());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> TaskflowResult<Option<serde_json::Value>> {
        let key = key_segments(key)?.join("/");
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn delete(&self, key: &str) -> TaskflowResult<bool> {
        let key = key_segments(key)?.join("/");
        Ok(self.entries.write().await.remove(&key).is_some())
    }

    async fn exists(&self, key: &str) -> TaskflowResult<bool> {
        let key = key_segments(key)?.join("/");
        Ok(self.entries.read().await.contains_key(&key))
    }

    async fn list_keys(&self, prefix: &str) -> TaskflowResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
