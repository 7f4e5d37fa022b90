//! Byte-blob backends.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

use crate::types::{Error, Result};

/// External byte storage addressed by path.
#[async_trait]
pub trait BlobBackend: Send + Sync + std::fmt::Debug {
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Read a blob; `NotFound` if absent.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Delete blobs, ignoring missing ones; returns how many were requested.
    async fn delete(&self, paths: &[String]) -> Result<usize>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Move a blob. Backends without a native move get copy+delete.
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(&[from.to_string()]).await?;
        Ok(())
    }
}

/// In-process blob backend.
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.blobs.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobs {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.blobs.write().await.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("blob {}", path)))
    }

    async fn delete(&self, paths: &[String]) -> Result<usize> {
        let mut blobs = self.blobs.write().await;
        for path in paths {
            blobs.remove(path);
        }
        Ok(paths.len())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(path))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        let data = blobs
            .get(from)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("blob {}", from)))?;
        blobs.insert(to.to_string(), data);
        Ok(())
    }
}

/// Blob backend rooted in a local (or shared network) directory.
#[derive(Debug, Clone)]
pub struct FsBlobs {
    root: PathBuf,
}

impl FsBlobs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !clean {
            return Err(Error::validation(format!("invalid blob path: {:?}", path)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobBackend for FsBlobs {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &data).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("blob {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, paths: &[String]) -> Result<usize> {
        for path in paths {
            match tokio::fs::remove_file(self.resolve(path)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(paths.len())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(self.resolve(from)?, target).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(self.resolve(from)?, target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_rename_is_copy_then_delete() {
        let blobs = MemoryBlobs::new();
        blobs.put("a", Bytes::from_static(b"1")).await.unwrap();
        blobs.rename("a", "b").await.unwrap();
        assert!(!blobs.exists("a").await.unwrap());
        assert_eq!(blobs.get("b").await.unwrap(), Bytes::from_static(b"1"));
        assert!(blobs.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fs_round_trip_with_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobs::new(dir.path());
        blobs
            .put("jobs/x/job-1.job", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(blobs.exists("jobs/x/job-1.job").await.unwrap());
        blobs.rename("jobs/x/job-1.job", "jobs/y.job").await.unwrap();
        assert_eq!(
            blobs.get("jobs/y.job").await.unwrap(),
            Bytes::from_static(b"payload")
        );
        blobs
            .delete(&["jobs/y.job".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(!blobs.exists("jobs/y.job").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobs::new(dir.path());
        assert!(blobs.put("../evil", Bytes::new()).await.is_err());
        assert!(blobs.put("/etc/passwd", Bytes::new()).await.is_err());
    }
}
