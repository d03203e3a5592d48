use crate::control_plane::ControlPlaneStore;
use crate::metadata_store::{FilesystemStore, MemoryStore, MetadataStore};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum MetadataStoreConfig {
    ControlPlane {
        url: String,
        #[serde(default = "default_retry_base_delay_ms")]
        retry_base_delay_ms: u64,
    },
    Filesystem {
        path: PathBuf,
    },
    Memory,
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub initial_timeout_secs: u64,
    pub sync_timeout_secs: u64,
    pub negative_cache_ttl_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            interval_secs: 30,
            initial_timeout_secs: 5,
            sync_timeout_secs: 10,
            negative_cache_ttl_secs: 5,
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("refresh.interval_secs must be greater than 0".into());
        }
        if self.initial_timeout_secs == 0 || self.sync_timeout_secs == 0 {
            return Err("refresh timeouts must be greater than 0".into());
        }
        Ok(())
    }
}

pub fn get_store(config: &MetadataStoreConfig) -> Arc<dyn MetadataStore> {
    match config {
        MetadataStoreConfig::ControlPlane {
            url,
            retry_base_delay_ms,
        } => Arc::new(
            ControlPlaneStore::new(url).with_base_delay(Duration::from_millis(*retry_base_delay_ms)),
        ),
        MetadataStoreConfig::Filesystem { path } => Arc::new(FilesystemStore::new(path)),
        MetadataStoreConfig::Memory => {
            tracing::warn!("using the in-memory metadata store, policies will not persist");
            Arc::new(MemoryStore::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config() {
        let yaml = r#"
type: control_plane
url: http://control-plane.internal
"#;
        let config: MetadataStoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config,
            MetadataStoreConfig::ControlPlane {
                url: "http://control-plane.internal".into(),
                retry_base_delay_ms: 500,
            }
        );
        assert_eq!(get_store(&config).kind(), "control_plane");

        let config: MetadataStoreConfig =
            serde_yaml::from_str("type: filesystem\npath: /var/lib/apx/policies.json").unwrap();
        assert_eq!(get_store(&config).kind(), "filesystem");

        assert!(serde_yaml::from_str::<MetadataStoreConfig>("type: firestore").is_err());
    }

    #[test]
    fn test_refresh_defaults() {
        let config: RefreshConfig = serde_yaml::from_str("interval_secs: 60").unwrap();
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.initial_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());

        let zero = RefreshConfig {
            interval_secs: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
