use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compat {
    #[default]
    Backward,
    Breaking,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Transform {
    pub wasm: String,
    pub phase: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One compiled policy version as stored in the metadata store.
///
/// A bundle with `canary_percentage` strictly between 0 and 100 is the active
/// canary for its name; a bundle at 100 is stable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyBundle {
    pub name: String,
    pub version: String,
    pub hash: String,
    #[serde(default)]
    pub compat: Compat,
    #[serde(default, deserialize_with = "percentage")]
    pub canary_percentage: u8,
    /// Version this canary rolls back to. Stored as "" when unset.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub stable_version: Option<String>,

    #[serde(default)]
    pub auth: serde_json::Value,
    #[serde(default)]
    pub authz_rego: String,
    #[serde(default)]
    pub quotas: serde_json::Value,
    #[serde(default)]
    pub rate_limit: serde_json::Value,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub observability: serde_json::Value,
    #[serde(default)]
    pub security: serde_json::Value,
    #[serde(default)]
    pub cache: serde_json::Value,

    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl PolicyBundle {
    pub fn new<N, V, H>(name: N, version: V, hash: H, canary_percentage: u8) -> Self
    where
        N: Into<String>,
        V: Into<String>,
        H: Into<String>,
    {
        PolicyBundle {
            name: name.into(),
            version: version.into(),
            hash: hash.into(),
            compat: Compat::default(),
            canary_percentage,
            stable_version: None,
            auth: serde_json::Value::Null,
            authz_rego: String::new(),
            quotas: serde_json::Value::Null,
            rate_limit: serde_json::Value::Null,
            transforms: Vec::new(),
            observability: serde_json::Value::Null,
            security: serde_json::Value::Null,
            cache: serde_json::Value::Null,
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn with_stable_version(mut self, version: impl Into<String>) -> Self {
        self.stable_version = Some(version.into());
        self
    }

    pub fn reference(&self) -> PolicyRef {
        PolicyRef::new(&self.name, &self.version)
    }

    pub fn key(&self) -> String {
        self.reference().to_string()
    }

    pub fn is_canary(&self) -> bool {
        self.canary_percentage > 0 && self.canary_percentage < 100
    }

    pub fn is_stable(&self) -> bool {
        self.canary_percentage == 100
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()))
}

fn percentage<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    u8::try_from(value)
        .ok()
        .filter(|pct| *pct <= 100)
        .ok_or_else(|| D::Error::custom(format!("canary_percentage {value} is outside 0..=100")))
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("invalid policy reference {0:?}, expected name@version")]
pub struct InvalidRef(pub String);

/// `name@version`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyRef {
    pub name: String,
    pub version: String,
}

impl PolicyRef {
    pub fn new(name: &str, version: &str) -> Self {
        PolicyRef {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for PolicyRef {
    type Err = InvalidRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(PolicyRef::new(name, version))
            }
            _ => Err(InvalidRef(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_decoding() {
        let doc = r#"{
            "name": "payments",
            "version": "2.0.0",
            "hash": "sha256:abc",
            "compat": "breaking",
            "canary_percentage": 20,
            "stable_version": "1.0.0",
            "auth": {"mode": "jwt"},
            "transforms": [{"wasm": "strip.wasm", "phase": "request"}],
            "updated_at": "2025-01-02T03:04:05Z"
        }"#;
        let bundle: PolicyBundle = serde_json::from_str(doc).unwrap();
        assert_eq!(bundle.compat, Compat::Breaking);
        assert!(bundle.is_canary());
        assert_eq!(bundle.stable_version.as_deref(), Some("1.0.0"));
        assert_eq!(bundle.transforms[0].phase, "request");
        assert_eq!(bundle.key(), "payments@2.0.0");
    }

    #[test]
    fn test_empty_stable_version() {
        let doc = r#"{"name": "a", "version": "1", "hash": "h", "stable_version": ""}"#;
        let bundle: PolicyBundle = serde_json::from_str(doc).unwrap();
        assert_eq!(bundle.stable_version, None);
        assert_eq!(bundle.canary_percentage, 0);
        assert!(!bundle.is_canary() && !bundle.is_stable());
    }

    #[test]
    fn test_out_of_range_percentage_rejected() {
        for pct in [-5, 101, 300] {
            let doc = format!(r#"{{"name": "a", "version": "1", "hash": "h", "canary_percentage": {pct}}}"#);
            let err = serde_json::from_str::<PolicyBundle>(&doc).unwrap_err();
            assert!(err.to_string().contains("outside 0..=100"), "{err}");
        }
        let doc = r#"{"name": "a", "version": "1", "hash": "h", "canary_percentage": 100}"#;
        assert!(serde_json::from_str::<PolicyBundle>(doc).unwrap().is_stable());
    }

    #[test]
    fn test_policy_ref() {
        let r: PolicyRef = "org@team/auth@1.2.3".parse().unwrap();
        assert_eq!(r.name, "org@team/auth");
        assert_eq!(r.version, "1.2.3");
        assert_eq!(r.to_string(), "org@team/auth@1.2.3");

        assert!("auth".parse::<PolicyRef>().is_err());
        assert!("auth@".parse::<PolicyRef>().is_err());
        assert!("@1.0.0".parse::<PolicyRef>().is_err());
    }
}
