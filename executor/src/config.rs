use crate::loader::{FilesystemLoader, GcsLoader, LoadError, PolicyLoader};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ObjectStoreConfig {
    Filesystem { root: PathBuf },
    Gcs { bucket: String },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which a cached artifact is evicted.
    pub ttl_secs: u64,
    pub eviction_interval_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: 24 * 60 * 60,
            eviction_interval_secs: 5 * 60,
            fetch_timeout_secs: 10,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 || self.eviction_interval_secs == 0 {
            return Err("cache ttl and eviction interval must be greater than 0".into());
        }
        if self.fetch_timeout_secs == 0 {
            return Err("cache.fetch_timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}

pub async fn get_loader(config: &ObjectStoreConfig) -> Result<Arc<dyn PolicyLoader>, LoadError> {
    let loader: Arc<dyn PolicyLoader> = match config {
        ObjectStoreConfig::Filesystem { root } => Arc::new(FilesystemLoader::new(root)),
        ObjectStoreConfig::Gcs { bucket } => Arc::new(GcsLoader::new(bucket).await?),
    };
    tracing::info!(loader = %loader.describe(), "configured policy loader");
    Ok(loader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_store_config() {
        let config: ObjectStoreConfig =
            serde_yaml::from_str("type: gcs\nbucket: apx-policies").unwrap();
        assert_eq!(
            config,
            ObjectStoreConfig::Gcs {
                bucket: "apx-policies".into()
            }
        );
        assert!(serde_yaml::from_str::<ObjectStoreConfig>("type: s3\nbucket: x").is_err());
    }

    #[tokio::test]
    async fn test_filesystem_loader_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig::Filesystem {
            root: dir.path().to_path_buf(),
        };
        let loader = get_loader(&config).await.unwrap();
        assert!(loader.describe().starts_with("filesystem:"));
    }

    #[test]
    fn test_cache_defaults() {
        let config: CacheConfig = serde_yaml::from_str("ttl_secs: 3600").unwrap();
        assert_eq!(config.ttl(), Duration::from_secs(3600));
        assert_eq!(config.eviction_interval(), Duration::from_secs(300));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let zero = CacheConfig {
            fetch_timeout_secs: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
