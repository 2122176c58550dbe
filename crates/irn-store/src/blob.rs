//! Blob storage for recording files.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::traits::{content_type_for, Blob, BlobStore};

/// Reject names that are empty, absolute, or escape the store root.
fn validate_name(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let well_formed = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !well_formed {
        return Err(StoreError::InvalidData(format!("invalid blob name: {name:?}")));
    }
    Ok(path)
}

/// Blobs as files under a root directory.
///
/// Writes go to a temporary sibling and are renamed into place, so a reader
/// never sees a partial file. Content type is derived from the extension.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Use `root`, creating it if missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_name(name)?))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, name: &str, bytes: Bytes, _content_type: &str) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(blob = name, size = bytes.len(), "stored blob");
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Option<Blob>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Blob {
                bytes: Bytes::from(bytes),
                content_type: content_type_for(name).to_string(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(name)?).await?)
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, name: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        validate_name(name)?;
        let mut blobs = self
            .blobs
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        blobs.insert(
            name.to_string(),
            Blob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Option<Blob>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        Ok(blobs.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_upload_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs")).await.unwrap();

        store.upload("rec/one.edf", Bytes::from_static(b"v1"), "application/edf").await.unwrap();
        store.upload("rec/one.edf", Bytes::from_static(b"v2"), "application/edf").await.unwrap();

        let blob = store.download("rec/one.edf").await.unwrap().unwrap();
        assert_eq!(blob.bytes, Bytes::from_static(b"v2"));
        assert_eq!(blob.content_type, "application/edf");
        assert!(store.exists("rec/one.edf").await.unwrap());
        assert!(store.download("missing.wav").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        for name in ["", "../x", "/etc/passwd", "a/../../b"] {
            assert!(matches!(
                store.upload(name, Bytes::new(), "text/plain").await,
                Err(StoreError::InvalidData(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_store_keeps_content_type() {
        let store = MemoryBlobStore::new();
        store.upload("a.bin", Bytes::from_static(b"x"), "audio/wav").await.unwrap();
        assert_eq!(store.download("a.bin").await.unwrap().unwrap().content_type, "audio/wav");
        assert_eq!(store.len(), 1);
    }
}
