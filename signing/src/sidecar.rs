//! The `.sig` file stored next to an artifact.
//!
//! Two layouts exist: raw signature bytes, or a metadata-aware blob
//! `<compact JSON>\n---\n<signature bytes>` where the signature covers the
//! artifact followed by the JSON text exactly as stored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SEPARATOR: &[u8] = b"\n---\n";
pub const ALGORITHM: &str = "ECDSA-SHA256";
pub const EXTENSION: &str = "sig";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignatureMetadata {
    pub artifact: String,
    pub version: String,
    pub policy_id: String,
    pub algorithm: String,
    /// Unix seconds at signing time.
    pub timestamp: u64,
}

impl SignatureMetadata {
    pub fn new(artifact: &str, version: &str, policy_id: &str, timestamp: u64) -> Self {
        SignatureMetadata {
            artifact: artifact.to_string(),
            version: version.to_string(),
            policy_id: policy_id.to_string(),
            algorithm: ALGORITHM.to_string(),
            timestamp,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Sidecar<'a> {
    Raw(&'a [u8]),
    WithMetadata {
        /// The JSON text as stored; the signed digest covers these bytes.
        metadata_json: &'a [u8],
        signature: &'a [u8],
    },
}

impl<'a> Sidecar<'a> {
    pub fn parse(bytes: &'a [u8]) -> Sidecar<'a> {
        if bytes.first() != Some(&b'{') {
            return Sidecar::Raw(bytes);
        }
        match find(bytes, SEPARATOR) {
            Some(at) => Sidecar::WithMetadata {
                metadata_json: &bytes[..at],
                signature: &bytes[at + SEPARATOR.len()..],
            },
            None => Sidecar::Raw(bytes),
        }
    }

    pub fn metadata(&self) -> Option<Result<SignatureMetadata, serde_json::Error>> {
        match self {
            Sidecar::Raw(_) => None,
            Sidecar::WithMetadata { metadata_json, .. } => {
                Some(serde_json::from_slice(metadata_json))
            }
        }
    }
}

pub fn render(metadata_json: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(metadata_json.len() + SEPARATOR.len() + signature.len());
    out.extend_from_slice(metadata_json);
    out.extend_from_slice(SEPARATOR);
    out.extend_from_slice(signature);
    out
}

/// `{artifact}.sig`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".");
    name.push(EXTENSION);
    PathBuf::from(name)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw() {
        let raw = [7u8; 64];
        assert_eq!(Sidecar::parse(&raw), Sidecar::Raw(&raw));
        assert!(Sidecar::parse(&raw).metadata().is_none());
    }

    #[test]
    fn test_parse_with_metadata() {
        let metadata = SignatureMetadata::new("auth.wasm", "1.2.0", "auth", 1_700_000_000);
        let json = serde_json::to_vec(&metadata).unwrap();
        // Signature bytes may contain the separator themselves.
        let signature = b"\n---\nsig";
        let blob = render(&json, signature);

        let sidecar = Sidecar::parse(&blob);
        assert_eq!(
            sidecar,
            Sidecar::WithMetadata {
                metadata_json: &json,
                signature,
            }
        );
        assert_eq!(sidecar.metadata().unwrap().unwrap(), metadata);
    }

    #[test]
    fn test_brace_without_separator_is_raw() {
        let raw = b"{not metadata";
        assert_eq!(Sidecar::parse(raw), Sidecar::Raw(raw));
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("policies/auth/1.0.0/abc.wasm")),
            PathBuf::from("policies/auth/1.0.0/abc.wasm.sig")
        );
    }
}
