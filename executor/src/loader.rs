//! Fetches compiled artifacts from durable storage.
//!
//! Objects live at `policies/{name}/{version}/{hash}.wasm` and are never
//! overwritten; a changed artifact gets a new hash and therefore a new path.
//! The signature sits next to the artifact as `{path}.sig`.

use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::client::Storage;
use signing::signature::normalize_hash;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct LoadedArtifact {
    pub bytes: Bytes,
    pub sidecar: Option<Bytes>,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum LoadError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    #[error("load was cancelled")]
    Cancelled,
}

pub fn object_path(name: &str, version: &str, hash: &str) -> String {
    format!("policies/{name}/{version}/{}.wasm", normalize_hash(hash))
}

#[async_trait]
pub trait PolicyLoader: Send + Sync {
    async fn load(&self, name: &str, version: &str, hash: &str)
    -> Result<LoadedArtifact, LoadError>;

    fn describe(&self) -> String;
}

/// Reads objects from a local directory laid out like the bucket.
pub struct FilesystemLoader {
    root: PathBuf,
}

impl FilesystemLoader {
    pub fn new(root: &Path) -> Self {
        FilesystemLoader {
            root: root.to_path_buf(),
        }
    }

    pub fn artifact_path(&self, name: &str, version: &str, hash: &str) -> PathBuf {
        self.root.join(object_path(name, version, hash))
    }
}

#[async_trait]
impl PolicyLoader for FilesystemLoader {
    async fn load(
        &self,
        name: &str,
        version: &str,
        hash: &str,
    ) -> Result<LoadedArtifact, LoadError> {
        let path = self.artifact_path(name, version, hash);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(LoadError::Storage(e.to_string())),
        };

        let sidecar_path = signing::sidecar::sidecar_path(&path);
        let sidecar = match tokio::fs::read(&sidecar_path).await {
            Ok(sidecar) => Some(Bytes::from(sidecar)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(LoadError::Storage(e.to_string())),
        };

        Ok(LoadedArtifact {
            bytes: Bytes::from(bytes),
            sidecar,
        })
    }

    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }
}

pub struct GcsLoader {
    client: Storage,
    bucket: String,
}

impl GcsLoader {
    pub async fn new(bucket: &str) -> Result<Self, LoadError> {
        let client = Storage::builder()
            .build()
            .await
            .map_err(|e| LoadError::Storage(e.to_string()))?;
        Ok(GcsLoader {
            client,
            bucket: bucket.to_string(),
        })
    }

    fn bucket_name(&self) -> String {
        format!("projects/_/buckets/{}", self.bucket)
    }

    /// `Ok(None)` when the object does not exist.
    async fn read(&self, object: &str) -> Result<Option<Bytes>, LoadError> {
        let mut reader = match self
            .client
            .read_object(self.bucket_name(), object)
            .send()
            .await
        {
            Ok(reader) => reader,
            Err(e) if e.http_status_code() == Some(404) => return Ok(None),
            Err(e) => return Err(LoadError::Storage(e.to_string())),
        };

        let mut contents = Vec::new();
        while let Some(chunk) = reader.next().await {
            let chunk = chunk.map_err(|e| LoadError::Storage(e.to_string()))?;
            contents.extend_from_slice(&chunk);
        }
        Ok(Some(Bytes::from(contents)))
    }
}

#[async_trait]
impl PolicyLoader for GcsLoader {
    async fn load(
        &self,
        name: &str,
        version: &str,
        hash: &str,
    ) -> Result<LoadedArtifact, LoadError> {
        let object = object_path(name, version, hash);
        let bytes = self
            .read(&object)
            .await?
            .ok_or_else(|| LoadError::NotFound(format!("gs://{}/{object}", self.bucket)))?;
        let sidecar = self.read(&format!("{object}.sig")).await?;
        Ok(LoadedArtifact { bytes, sidecar })
    }

    fn describe(&self) -> String {
        format!("gcs:{}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path() {
        assert_eq!(
            object_path("auth", "1.0.0", "sha256:ABC"),
            "policies/auth/1.0.0/abc.wasm"
        );
    }

    #[tokio::test]
    async fn test_filesystem_loader() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FilesystemLoader::new(dir.path());
        let path = loader.artifact_path("auth", "1.0.0", "abc");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\0asm").unwrap();

        let loaded = loader.load("auth", "1.0.0", "abc").await.unwrap();
        assert_eq!(loaded.bytes, Bytes::from_static(b"\0asm"));
        assert!(loaded.sidecar.is_none());

        std::fs::write(signing::sidecar::sidecar_path(&path), [1u8; 64]).unwrap();
        let loaded = loader.load("auth", "1.0.0", "abc").await.unwrap();
        assert_eq!(loaded.sidecar.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_filesystem_loader_missing() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FilesystemLoader::new(dir.path());
        assert!(matches!(
            loader.load("auth", "1.0.0", "abc").await,
            Err(LoadError::NotFound(_))
        ));
    }
}
