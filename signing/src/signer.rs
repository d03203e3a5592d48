use crate::config::{DEFAULT_PRIVATE_KEY_PATH, SignerConfig};
use crate::key_source::{KeyLoadError, KeySource};
use crate::keys::parse_private_key;
use crate::metrics_defs::SIGNATURES_ISSUED;
use crate::sidecar::{self, SignatureMetadata};
use crate::signature::{self, artifact_digest, digest_with_metadata};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use shared::counter;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug)]
pub enum SignError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not encode signature metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signs compiled artifacts with a P-256 private key that is loaded once.
pub struct ArtifactSigner {
    key: SigningKey,
    source: String,
}

impl ArtifactSigner {
    pub async fn from_config(config: &SignerConfig) -> Result<Self, KeyLoadError> {
        let source = KeySource::for_environment(
            config.environment,
            config.key_path.as_deref(),
            config.secret.as_ref(),
            DEFAULT_PRIVATE_KEY_PATH,
        )?;
        let pem = source.fetch().await?;
        let key = parse_private_key(&pem)?;
        tracing::info!(key_source = %source, "loaded signing key");

        Ok(ArtifactSigner {
            key,
            source: source.to_string(),
        })
    }

    pub fn from_key(key: SigningKey) -> Self {
        ArtifactSigner {
            key,
            source: "inline".to_string(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }

    /// 64-byte `r‖s` signature over SHA-256 of the artifact.
    pub fn sign(&self, artifact: &[u8]) -> Result<Vec<u8>, SignError> {
        self.sign_digest(&artifact_digest(artifact))
    }

    /// Returns the complete metadata-aware sidecar contents.
    pub fn sign_with_metadata(
        &self,
        artifact: &[u8],
        metadata: &SignatureMetadata,
    ) -> Result<Vec<u8>, SignError> {
        let json = serde_json::to_vec(metadata)?;
        let signature = self.sign_digest(&digest_with_metadata(artifact, &json))?;
        Ok(sidecar::render(&json, &signature))
    }

    /// Signs the file at `path` and writes `{path}.sig`.
    pub async fn sign_file(&self, path: &Path) -> Result<PathBuf, SignError> {
        let artifact = read(path).await?;
        let signature = self.sign(&artifact)?;
        self.write_sidecar(path, &signature).await
    }

    pub async fn sign_file_with_metadata(
        &self,
        path: &Path,
        version: &str,
        policy_id: &str,
    ) -> Result<PathBuf, SignError> {
        let artifact = read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = SignatureMetadata::new(&name, version, policy_id, unix_now());
        let contents = self.sign_with_metadata(&artifact, &metadata)?;
        self.write_sidecar(path, &contents).await
    }

    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, SignError> {
        let signature: Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| SignError::Signing(e.to_string()))?;
        counter!(SIGNATURES_ISSUED).increment(1);
        Ok(signature::encode(&signature))
    }

    async fn write_sidecar(&self, artifact: &Path, contents: &[u8]) -> Result<PathBuf, SignError> {
        let path = sidecar::sidecar_path(artifact);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| SignError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::info!(
            artifact = %artifact.display(),
            sidecar = %path.display(),
            key_source = %self.source,
            "wrote signature"
        );
        Ok(path)
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, SignError> {
    tokio::fs::read(path).await.map_err(|source| SignError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
