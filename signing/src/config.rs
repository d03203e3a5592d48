use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_PRIVATE_KEY_PATH: &str = "keys/cosign.key";
pub const DEFAULT_PUBLIC_KEY_PATH: &str = "keys/cosign.pub";
pub const DEFAULT_SECRET_VERSION: &str = "latest";
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 10 * 1024 * 1024;

/// Deployment environment. Decides where key material comes from.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Staging and production never read keys from local disk.
    pub fn uses_secret_store(&self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }
}

/// A secret in the managed secret store.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SecretRef {
    pub project: String,
    pub secret: String,
    #[serde(default = "default_secret_version")]
    pub version: String,
}

impl SecretRef {
    pub fn resource_name(&self) -> String {
        format!(
            "projects/{}/secrets/{}/versions/{}",
            self.project, self.secret, self.version
        )
    }
}

fn default_secret_version() -> String {
    DEFAULT_SECRET_VERSION.into()
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SignerConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Private key path for development. Defaults to `keys/cosign.key`.
    pub key_path: Option<PathBuf>,
    /// Required outside development.
    pub secret: Option<SecretRef>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct VerifierConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Public key path for development. Defaults to `keys/cosign.pub`.
    pub key_path: Option<PathBuf>,
    /// Required outside development.
    pub secret: Option<SecretRef>,
    /// Versions that may be loaded. Empty allows every version.
    #[serde(default)]
    pub allowed_versions: Vec<String>,
    /// Reject artifacts that have no signature sidecar.
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            environment: Environment::default(),
            key_path: None,
            secret: None,
            allowed_versions: Vec::new(),
            strict_mode: false,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }
}

fn default_max_artifact_bytes() -> usize {
    DEFAULT_MAX_ARTIFACT_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_config_defaults() {
        let config: VerifierConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, VerifierConfig::default());
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.max_artifact_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_production_config() {
        let yaml = r#"
environment: production
secret:
    project: apx-prod
    secret: policy-signing-pub
allowed_versions: ["1.0.0", "1.1.0"]
strict_mode: true
"#;
        let config: VerifierConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.environment.uses_secret_store());
        assert!(config.strict_mode);
        assert_eq!(
            config.secret.unwrap().resource_name(),
            "projects/apx-prod/secrets/policy-signing-pub/versions/latest"
        );
    }

    #[test]
    fn test_unknown_environment() {
        assert!(serde_yaml::from_str::<Environment>("qa").is_err());
    }
}
