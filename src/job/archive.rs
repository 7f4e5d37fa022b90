//! Job archives: the payload command plus its auxiliary files in one blob.
//!
//! The archive is a JSON manifest with base64 file bodies. Directories are
//! stored recursively under their base name, so a checkpoint can repack the
//! same `paths` from a task's scratch directory.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::types::{Error, Result};

/// The command a task runs inside its scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobPayload {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// Relative path inside the scratch directory.
    pub name: String,
    #[serde(with = "base64_body")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArchive {
    pub payload: JobPayload,
    #[serde(default)]
    pub files: Vec<ArchivedFile>,
}

impl JobArchive {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            files: Vec::new(),
        }
    }

    /// Pack files and directories from anywhere on disk under their base names.
    pub async fn pack(payload: JobPayload, paths: &[PathBuf]) -> Result<Self> {
        let mut archive = Self::new(payload);
        for path in paths {
            let name = base_name(path)?;
            archive.add_path(path, &name).await?;
        }
        Ok(archive)
    }

    /// Pack named entries of a directory (a task's scratch directory).
    /// Missing entries are skipped.
    pub async fn pack_dir(payload: JobPayload, dir: &Path, names: &[String]) -> Result<Self> {
        let mut archive = Self::new(payload);
        for name in names {
            let path = dir.join(checked_relative(name)?);
            if tokio::fs::try_exists(&path).await? {
                archive.add_path(&path, name).await?;
            } else {
                tracing::warn!("archive_entry_missing: name={}", name);
            }
        }
        Ok(archive)
    }

    async fn add_path(&mut self, path: &Path, name: &str) -> Result<()> {
        let mut pending = vec![(path.to_path_buf(), name.to_string())];
        while let Some((path, name)) = pending.pop() {
            if tokio::fs::metadata(&path).await?.is_dir() {
                let mut entries = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let child = entry.file_name().to_string_lossy().into_owned();
                    pending.push((entry.path(), format!("{}/{}", name, child)));
                }
            } else {
                let data = tokio::fs::read(&path).await?;
                self.files.push(ArchivedFile { name, data });
            }
        }
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Write every file under `dir`.
    pub async fn extract(&self, dir: &Path) -> Result<()> {
        for file in &self.files {
            let target = dir.join(checked_relative(&file.name)?);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.data).await?;
        }
        Ok(())
    }
}

fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::validation(format!("path {} has no file name", path.display())))
}

fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    if name.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(Error::validation(format!("invalid archive entry: {:?}", name)));
    }
    Ok(path)
}

mod base64_body {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pack_and_extract_directories() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("input.txt"), b"data")
            .await
            .unwrap();
        tokio::fs::create_dir_all(src.path().join("state/deep"))
            .await
            .unwrap();
        tokio::fs::write(src.path().join("state/deep/ckpt"), b"42")
            .await
            .unwrap();

        let archive = JobArchive::pack(
            JobPayload::shell("cat input.txt"),
            &[src.path().join("input.txt"), src.path().join("state")],
        )
        .await
        .unwrap();
        let names: Vec<_> = archive.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["input.txt", "state/deep/ckpt"]);

        let bytes = archive.to_bytes().unwrap();
        let restored = JobArchive::from_bytes(&bytes).unwrap();
        assert_eq!(restored, archive);

        let dest = tempfile::tempdir().unwrap();
        restored.extract(dest.path()).await.unwrap();
        assert_eq!(
            tokio::fs::read(dest.path().join("state/deep/ckpt"))
                .await
                .unwrap(),
            b"42"
        );
    }

    #[tokio::test]
    async fn test_pack_dir_skips_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a"), b"1").await.unwrap();
        let archive = JobArchive::pack_dir(
            JobPayload::new("true"),
            dir.path(),
            &["a".to_string(), "gone".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(archive.files.len(), 1);
    }

    #[test]
    fn test_extract_rejects_escaping_names() {
        assert!(checked_relative("../x").is_err());
        assert!(checked_relative("/abs").is_err());
        assert!(checked_relative("ok/fine").is_ok());
    }

    #[test]
    fn test_bodies_are_base64() {
        let mut archive = JobArchive::new(JobPayload::new("true"));
        archive.files.push(ArchivedFile {
            name: "f".to_string(),
            data: b"hi".to_vec(),
        });
        let json = serde_json::to_value(&archive).unwrap();
        assert_eq!(json["files"][0]["data"], "aGk=");
    }
}
