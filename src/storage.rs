use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::StoreError;

/// Per-tenant object namespaces, one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Upload,
    Processing,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Processing => "processing",
            Stage::Complete => "complete",
        }
    }
}

pub fn namespace(tenant_id: &str, stage: Stage) -> String {
    format!("tenant-{}-{}", tenant_id, stage.as_str())
}

/// Key-value byte store with container-scoped namespaces. The blob service
/// behind it is external; everything here goes through this seam so tests can
/// substitute an in-memory store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        bytes: &[u8],
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StoreError>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
}

/// Filesystem-backed object store: `{root}/{namespace}/{key}`, with optional
/// metadata as a JSON sidecar under `{namespace}/.meta/{key}.json`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    fn object_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        check_component(namespace)?;
        check_component(key)?;
        Ok(self.root.join(namespace).join(key))
    }

    fn meta_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        check_component(namespace)?;
        check_component(key)?;
        Ok(self
            .root
            .join(namespace)
            .join(".meta")
            .join(format!("{key}.json")))
    }
}

fn check_component(raw: &str) -> Result<(), StoreError> {
    if raw.is_empty()
        || raw == "."
        || raw == ".."
        || raw.contains('/')
        || raw.contains('\\')
        || raw.contains('\0')
    {
        return Err(StoreError::InvalidKey(raw.to_string()));
    }
    Ok(())
}

fn map_io(err: std::io::Error, what: String) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(what)
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        bytes: &[u8],
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<(), StoreError> {
        let path = self.object_path(namespace, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        if let Some(metadata) = metadata {
            let meta_path = self.meta_path(namespace, key)?;
            if let Some(parent) = meta_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&meta_path, serde_json::to_vec(metadata)?).await?;
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(namespace, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| map_io(err, format!("{namespace}/{key}")))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(namespace, key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| map_io(err, format!("{namespace}/{key}")))?;
        if let Ok(meta_path) = self.meta_path(namespace, key) {
            let _ = tokio::fs::remove_file(&meta_path).await;
        }
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        check_component(namespace)?;
        let dir = self.root.join(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl std::fmt::Debug for FsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsObjectStore")
            .field("root", &self.root)
            .finish()
    }
}
