//! The document store that owns policy metadata. The router only reads
//! snapshots from it and writes canary percentage updates back.

use crate::metrics_defs::POLICY_REJECTED;
use crate::types::{PolicyBundle, PolicyRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use shared::counter;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid policy document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("policy {0} not found")]
    NotFound(String),
    #[error("metadata store unavailable")]
    RetriesExceeded,
    #[error("operation not supported by the {0} store")]
    Unsupported(&'static str),
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Every policy document, used for bulk refresh.
    async fn list_all(&self) -> Result<Vec<PolicyBundle>, StoreError>;

    async fn get(&self, reference: &PolicyRef) -> Result<PolicyBundle, StoreError>;

    async fn update_canary_percentage(
        &self,
        reference: &PolicyRef,
        percentage: u8,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn kind(&self) -> &'static str;
}

/// Decodes documents one at a time. A malformed document is logged, counted
/// and skipped; the rest of the snapshot is kept.
pub fn decode_documents(documents: Vec<Value>) -> Vec<PolicyBundle> {
    documents
        .into_iter()
        .filter_map(|document| {
            let label = document_label(&document);
            match serde_json::from_value::<PolicyBundle>(document) {
                Ok(bundle) => Some(bundle),
                Err(err) => {
                    tracing::warn!(policy = %label, error = %err, "rejecting policy document");
                    counter!(POLICY_REJECTED).increment(1);
                    None
                }
            }
        })
        .collect()
}

fn document_label(document: &Value) -> String {
    let field = |name: &str| document.get(name).and_then(Value::as_str).unwrap_or("?");
    format!("{}@{}", field("name"), field("version"))
}

/// Keeps documents in process memory. Used for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<String, PolicyBundle>>,
}

impl MemoryStore {
    pub fn new(bundles: impl IntoIterator<Item = PolicyBundle>) -> Self {
        let documents = bundles.into_iter().map(|b| (b.key(), b)).collect();
        MemoryStore {
            documents: Mutex::new(documents),
        }
    }

    pub fn insert(&self, bundle: PolicyBundle) {
        self.documents.lock().insert(bundle.key(), bundle);
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn list_all(&self) -> Result<Vec<PolicyBundle>, StoreError> {
        Ok(self.documents.lock().values().cloned().collect())
    }

    async fn get(&self, reference: &PolicyRef) -> Result<PolicyBundle, StoreError> {
        let key = reference.to_string();
        self.documents
            .lock()
            .get(&key)
            .cloned()
            .ok_or(StoreError::NotFound(key))
    }

    async fn update_canary_percentage(
        &self,
        reference: &PolicyRef,
        percentage: u8,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = reference.to_string();
        let mut documents = self.documents.lock();
        let bundle = documents.get_mut(&key).ok_or(StoreError::NotFound(key))?;
        bundle.canary_percentage = percentage;
        bundle.updated_at = updated_at;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// A JSON array of policy documents in a single file. Updates rewrite the
/// whole file through a temporary file and a rename.
pub struct FilesystemStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FilesystemStore {
    pub fn new(path: &Path) -> Self {
        FilesystemStore {
            path: path.to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Vec<Value>, StoreError> {
        let contents = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    async fn write(&self, documents: &[Value]) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(documents)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FilesystemStore {
    async fn list_all(&self) -> Result<Vec<PolicyBundle>, StoreError> {
        Ok(decode_documents(self.read().await?))
    }

    async fn get(&self, reference: &PolicyRef) -> Result<PolicyBundle, StoreError> {
        self.list_all()
            .await?
            .into_iter()
            .find(|b| b.name == reference.name && b.version == reference.version)
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    async fn update_canary_percentage(
        &self,
        reference: &PolicyRef,
        percentage: u8,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Undecodable documents are written back untouched.
        let _guard = self.write_lock.lock().await;
        let mut documents = self.read().await?;
        let document = documents
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|d| {
                d.get("name").and_then(Value::as_str) == Some(reference.name.as_str())
                    && d.get("version").and_then(Value::as_str) == Some(reference.version.as_str())
            })
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))?;
        document.insert("canary_percentage".into(), percentage.into());
        document.insert("updated_at".into(), serde_json::to_value(updated_at)?);
        self.write(&documents).await
    }

    fn kind(&self) -> &'static str {
        "filesystem"
    }
}
