use executor::config::{CacheConfig, ObjectStoreConfig};
use policy_store::config::{MetadataStoreConfig, RefreshConfig};
use serde::Deserialize;
use signing::config::{SignerConfig, VerifierConfig};
use std::fs::File;

#[derive(Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub sentry_dsn: Option<String>,
    pub environment: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            sentry_dsn: None,
            environment: None,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "apx".into()
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

/// A policy to load before the worker reports ready, together with the
/// version it replaces.
#[derive(Deserialize, Debug, PartialEq)]
pub struct PreloadConfig {
    pub name: String,
    pub version: String,
    pub previous: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub admin_listener: Listener,
    #[serde(default)]
    pub signing: SignerConfig,
    #[serde(default)]
    pub verification: VerifierConfig,
    #[serde(default = "default_policy_store")]
    pub policy_store: MetadataStoreConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub preload: Vec<PreloadConfig>,
}

fn default_policy_store() -> MetadataStoreConfig {
    MetadataStoreConfig::Memory
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_listener.port == 0 {
            return Err(ConfigError::Invalid("admin_listener.port must not be 0".into()));
        }
        if let Some(metrics) = &self.metrics
            && metrics.statsd_port == 0
        {
            return Err(ConfigError::Invalid("metrics.statsd_port must not be 0".into()));
        }
        if self
            .verification
            .allowed_versions
            .iter()
            .any(|v| v.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "verification.allowed_versions contains an empty entry".into(),
            ));
        }
        self.refresh.validate().map_err(ConfigError::Invalid)?;
        self.cache.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use signing::config::Environment;
    use std::io::Write;
    use std::time::Duration;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            logging:
                level: debug
                sentry_dsn: https://key@sentry.example.com/1
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            admin_listener:
                host: 0.0.0.0
                port: 9000
            verification:
                environment: production
                secret:
                    project: apx-prod
                    secret: policy-signing-pub
                allowed_versions: ["1.0.0", "2.0.0"]
                strict_mode: true
            policy_store:
                type: control_plane
                url: http://control-plane.internal
            object_store:
                type: gcs
                bucket: apx-policies
            cache:
                ttl_secs: 3600
            preload:
                - name: auth
                  version: 2.0.0
                  previous: 1.0.0
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.metrics.unwrap().prefix, "apx");
        assert_eq!(config.admin_listener.port, 9000);
        assert_eq!(config.verification.environment, Environment::Production);
        assert_eq!(
            config.verification.secret.unwrap().resource_name(),
            "projects/apx-prod/secrets/policy-signing-pub/versions/latest"
        );
        assert!(config.verification.strict_mode);
        assert_eq!(
            config.policy_store,
            MetadataStoreConfig::ControlPlane {
                url: "http://control-plane.internal".into(),
                retry_base_delay_ms: 500,
            }
        );
        assert_eq!(
            config.object_store,
            Some(ObjectStoreConfig::Gcs {
                bucket: "apx-policies".into()
            })
        );
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.cache.eviction_interval(), Duration::from_secs(300));
        assert_eq!(config.refresh.interval(), Duration::from_secs(30));
        assert_eq!(config.preload[0].previous.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file("{}");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.admin_listener, Listener::default());
        assert_eq!(config.policy_store, MetadataStoreConfig::Memory);
        assert!(config.object_store.is_none());
        assert!(!config.verification.strict_mode);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "admin_listener:\n  host: 0.0.0.0\n  port: 0\n",
            "refresh:\n  interval_secs: 0\n",
            "cache:\n  eviction_interval_secs: 0\n",
            "verification:\n  allowed_versions: [\"1.0.0\", \" \"]\n",
            "metrics:\n  statsd_host: localhost\n  statsd_port: 0\n",
        ];
        for yaml in cases {
            let tmp = write_tmp_file(yaml);
            assert!(
                matches!(Config::from_file(tmp.path()), Err(ConfigError::Invalid(_))),
                "{yaml}"
            );
        }
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/apx.yaml")),
            Err(ConfigError::LoadError(_))
        ));
        let tmp = write_tmp_file("policy_store:\n  type: firestore\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
