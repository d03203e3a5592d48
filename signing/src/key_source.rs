//! Resolves PEM key material either from a local file (development) or from
//! the managed secret store (staging and production). The variant is picked
//! once, when the signer or verifier is constructed.

use crate::config::{Environment, SecretRef};
use google_cloud_secretmanager_v1::client::SecretManagerService;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum KeyLoadError {
    #[error("could not read key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed PEM: {0}")]
    Pem(String),

    #[error("unsupported key: {0}")]
    UnsupportedKey(&'static str),

    #[error("{0:?} requires a secret reference")]
    MissingSecretRef(Environment),

    #[error("secret store error: {0}")]
    SecretStore(String),

    #[error("secret {0} has no payload")]
    EmptySecret(String),

    #[error("could not encode key: {0}")]
    Encode(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeySource {
    File { path: PathBuf },
    SecretManager { name: String },
}

impl KeySource {
    pub fn for_environment(
        environment: Environment,
        key_path: Option<&Path>,
        secret: Option<&SecretRef>,
        default_path: &str,
    ) -> Result<Self, KeyLoadError> {
        if environment.uses_secret_store() {
            let secret = secret.ok_or(KeyLoadError::MissingSecretRef(environment))?;
            return Ok(KeySource::SecretManager {
                name: secret.resource_name(),
            });
        }

        let path = key_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(default_path));
        Ok(KeySource::File { path })
    }

    /// Fetches the PEM bytes. Called once per component.
    pub async fn fetch(&self) -> Result<Vec<u8>, KeyLoadError> {
        match self {
            KeySource::File { path } => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| KeyLoadError::Io {
                        path: path.clone(),
                        source,
                    })
            }
            KeySource::SecretManager { name } => fetch_secret(name).await,
        }
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::File { path } => write!(f, "file:{}", path.display()),
            KeySource::SecretManager { name } => write!(f, "secret:{name}"),
        }
    }
}

async fn fetch_secret(name: &str) -> Result<Vec<u8>, KeyLoadError> {
    let client = SecretManagerService::builder()
        .build()
        .await
        .map_err(|e| KeyLoadError::SecretStore(e.to_string()))?;

    let response = client
        .access_secret_version()
        .set_name(name)
        .send()
        .await
        .map_err(|e| KeyLoadError::SecretStore(e.to_string()))?;

    match response.payload {
        Some(payload) if !payload.data.is_empty() => Ok(payload.data.to_vec()),
        _ => Err(KeyLoadError::EmptySecret(name.to_string())),
    }
}
