use crate::config::{DEFAULT_PUBLIC_KEY_PATH, VerifierConfig};
use crate::key_source::{KeyLoadError, KeySource};
use crate::keys::parse_public_key;
use crate::metrics_defs::{VERIFY_FAILURE, VERIFY_SUCCESS, VERIFY_UNSIGNED};
use crate::sidecar::{self, SignatureMetadata, Sidecar};
use crate::signature::{self, artifact_digest, digest_with_metadata, hash_matches};
use p256::ecdsa::VerifyingKey;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use shared::counter;
use std::collections::HashSet;
use std::path::Path;

/// Leading bytes of every WebAssembly module.
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum VerifyError {
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("signature missing: {0}")]
    SignatureMissing(String),
    #[error("version {version} not allowed (allowed: {allowed:?})")]
    VersionNotAllowed {
        version: String,
        allowed: Vec<String>,
    },
    #[error("artifact rejected: {0}")]
    ArtifactRejected(String),
}

impl VerifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            VerifyError::SignatureInvalid(_) => "signature_invalid",
            VerifyError::SignatureMissing(_) => "signature_missing",
            VerifyError::VersionNotAllowed { .. } => "version_not_allowed",
            VerifyError::ArtifactRejected(_) => "artifact_rejected",
        }
    }

    fn is_security_event(&self) -> bool {
        matches!(
            self,
            VerifyError::SignatureInvalid(_) | VerifyError::ArtifactRejected(_)
        )
    }
}

/// An artifact as fetched from storage, before it is trusted.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub version: &'a str,
    /// Hash recorded in policy metadata, when known.
    pub expected_hash: Option<&'a str>,
    pub bytes: &'a [u8],
    pub sidecar: Option<&'a [u8]>,
}

#[derive(Debug, PartialEq)]
pub struct Verified {
    /// False when an unsigned artifact was accepted outside strict mode.
    pub signed: bool,
    pub metadata: Option<SignatureMetadata>,
}

pub struct ArtifactVerifier {
    key: VerifyingKey,
    allowed_versions: HashSet<String>,
    strict_mode: bool,
    max_artifact_bytes: usize,
}

impl ArtifactVerifier {
    pub async fn from_config(config: &VerifierConfig) -> Result<Self, KeyLoadError> {
        let source = KeySource::for_environment(
            config.environment,
            config.key_path.as_deref(),
            config.secret.as_ref(),
            DEFAULT_PUBLIC_KEY_PATH,
        )?;
        let pem = source.fetch().await?;
        let key = parse_public_key(&pem)?;
        tracing::info!(
            key_source = %source,
            strict_mode = config.strict_mode,
            allowed_versions = config.allowed_versions.len(),
            "loaded verification key"
        );
        Ok(Self::new(key, config))
    }

    pub fn new(key: VerifyingKey, config: &VerifierConfig) -> Self {
        ArtifactVerifier {
            key,
            allowed_versions: config.allowed_versions.iter().cloned().collect(),
            strict_mode: config.strict_mode,
            max_artifact_bytes: config.max_artifact_bytes,
        }
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// An empty allow-list permits every version.
    pub fn check_version(&self, version: &str) -> Result<(), VerifyError> {
        if self.allowed_versions.is_empty() || self.allowed_versions.contains(version) {
            return Ok(());
        }
        let mut allowed: Vec<String> = self.allowed_versions.iter().cloned().collect();
        allowed.sort();
        Err(VerifyError::VersionNotAllowed {
            version: version.to_string(),
            allowed,
        })
    }

    pub fn check_artifact(&self, bytes: &[u8]) -> Result<(), VerifyError> {
        if bytes.len() > self.max_artifact_bytes {
            return Err(VerifyError::ArtifactRejected(format!(
                "artifact is {} bytes, limit is {}",
                bytes.len(),
                self.max_artifact_bytes
            )));
        }
        if !bytes.starts_with(&WASM_MAGIC) {
            return Err(VerifyError::ArtifactRejected(
                "missing WebAssembly magic bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn check_hash(&self, expected: &str, bytes: &[u8]) -> Result<(), VerifyError> {
        if hash_matches(expected, bytes) {
            Ok(())
        } else {
            Err(VerifyError::SignatureInvalid(format!(
                "content hash mismatch: expected {expected}, computed {}",
                signature::content_hash(bytes)
            )))
        }
    }

    /// Checks a raw `r‖s` signature over SHA-256 of the artifact.
    pub fn verify_signature(&self, bytes: &[u8], raw: &[u8]) -> Result<(), VerifyError> {
        self.verify_digest(&artifact_digest(bytes), raw)
    }

    /// Checks either sidecar layout. For the metadata-aware layout the
    /// metadata must name `version`.
    pub fn verify_sidecar(
        &self,
        bytes: &[u8],
        sidecar: &[u8],
        version: &str,
    ) -> Result<Option<SignatureMetadata>, VerifyError> {
        match Sidecar::parse(sidecar) {
            Sidecar::Raw(raw) => {
                self.verify_signature(bytes, raw)?;
                Ok(None)
            }
            Sidecar::WithMetadata {
                metadata_json,
                signature: raw,
            } => {
                let metadata: SignatureMetadata = serde_json::from_slice(metadata_json)
                    .map_err(|e| {
                        VerifyError::SignatureInvalid(format!("unreadable metadata: {e}"))
                    })?;
                if metadata.version != version {
                    return Err(VerifyError::SignatureInvalid(format!(
                        "signature issued for version {}, not {version}",
                        metadata.version
                    )));
                }
                self.verify_digest(&digest_with_metadata(bytes, metadata_json), raw)?;
                Ok(Some(metadata))
            }
        }
    }

    /// Runs every check in order: allow-list, artifact sanity, content hash,
    /// then signature.
    pub fn verify(&self, candidate: &Candidate<'_>) -> Result<Verified, VerifyError> {
        let result = self.run_checks(candidate);
        match &result {
            Ok(verified) => {
                if verified.signed {
                    counter!(VERIFY_SUCCESS).increment(1);
                } else {
                    counter!(VERIFY_UNSIGNED).increment(1);
                    tracing::warn!(
                        policy = %candidate.name,
                        version = %candidate.version,
                        "accepted unsigned artifact outside strict mode"
                    );
                }
            }
            Err(err) => {
                counter!(VERIFY_FAILURE, "kind" => err.kind()).increment(1);
                if err.is_security_event() {
                    tracing::error!(
                        security = true,
                        policy = %candidate.name,
                        version = %candidate.version,
                        error = %err,
                        "artifact failed verification"
                    );
                } else {
                    tracing::warn!(
                        policy = %candidate.name,
                        version = %candidate.version,
                        error = %err,
                        "artifact failed verification"
                    );
                }
            }
        }
        result
    }

    /// Reads `path` and its optional `{path}.sig`, then verifies them.
    pub async fn verify_file(
        &self,
        path: &Path,
        version: &str,
        expected_hash: Option<&str>,
    ) -> Result<Verified, VerifyError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            VerifyError::ArtifactRejected(format!("cannot read {}: {e}", path.display()))
        })?;
        let sidecar = match tokio::fs::read(sidecar::sidecar_path(path)).await {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(VerifyError::SignatureInvalid(format!(
                    "cannot read signature: {e}"
                )));
            }
        };

        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.verify(&Candidate {
            name: &name,
            version,
            expected_hash,
            bytes: &bytes,
            sidecar: sidecar.as_deref(),
        })
    }

    fn run_checks(&self, candidate: &Candidate<'_>) -> Result<Verified, VerifyError> {
        self.check_version(candidate.version)?;
        self.check_artifact(candidate.bytes)?;
        if let Some(expected) = candidate.expected_hash {
            self.check_hash(expected, candidate.bytes)?;
        }

        match candidate.sidecar {
            Some(sidecar) => {
                let metadata = self.verify_sidecar(candidate.bytes, sidecar, candidate.version)?;
                Ok(Verified {
                    signed: true,
                    metadata,
                })
            }
            None if self.strict_mode => Err(VerifyError::SignatureMissing(format!(
                "{}@{}",
                candidate.name, candidate.version
            ))),
            None => Ok(Verified {
                signed: false,
                metadata: None,
            }),
        }
    }

    fn verify_digest(&self, digest: &[u8], raw: &[u8]) -> Result<(), VerifyError> {
        let sig = signature::decode(raw).map_err(VerifyError::SignatureInvalid)?;
        self.key
            .verify_prehash(digest, &sig)
            .map_err(|_| VerifyError::SignatureInvalid("signature does not match".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_secret;
    use crate::signer::ArtifactSigner;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    const ARTIFACT: &[u8] = b"\0asm\x01\0\0\0policy-body";

    fn signer() -> ArtifactSigner {
        ArtifactSigner::from_key(SigningKey::from(test_secret()))
    }

    fn verifier(config: VerifierConfig) -> ArtifactVerifier {
        ArtifactVerifier::new(signer().verifying_key(), &config)
    }

    fn candidate<'a>(bytes: &'a [u8], sidecar: Option<&'a [u8]>) -> Candidate<'a> {
        Candidate {
            name: "auth",
            version: "1.0.0",
            expected_hash: None,
            bytes,
            sidecar,
        }
    }

    #[test]
    fn test_round_trip() {
        let sig = signer().sign(ARTIFACT).unwrap();
        let verified = verifier(VerifierConfig::default())
            .verify(&candidate(ARTIFACT, Some(&sig)))
            .unwrap();
        assert!(verified.signed);
        assert_eq!(verified.metadata, None);
    }

    #[test]
    fn test_any_flipped_byte_fails() {
        let sig = signer().sign(ARTIFACT).unwrap();
        let v = verifier(VerifierConfig::default());

        // Skip the magic so the failure comes from the signature check.
        for i in WASM_MAGIC.len()..ARTIFACT.len() {
            let mut tampered = ARTIFACT.to_vec();
            tampered[i] ^= 0x01;
            assert!(matches!(
                v.verify_signature(&tampered, &sig),
                Err(VerifyError::SignatureInvalid(_))
            ));
        }
        for i in 0..sig.len() {
            let mut tampered = sig.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(
                v.verify_signature(ARTIFACT, &tampered),
                Err(VerifyError::SignatureInvalid(_))
            ));
        }
    }

    #[test]
    fn test_malformed_signature_length() {
        let v = verifier(VerifierConfig::default());
        assert!(matches!(
            v.verify(&candidate(ARTIFACT, Some(&[1u8; 63]))),
            Err(VerifyError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_strict_mode_requires_signature() {
        let lenient = verifier(VerifierConfig::default());
        assert_eq!(
            lenient.verify(&candidate(ARTIFACT, None)).unwrap(),
            Verified {
                signed: false,
                metadata: None
            }
        );

        let strict = verifier(VerifierConfig {
            strict_mode: true,
            ..Default::default()
        });
        assert_eq!(
            strict.verify(&candidate(ARTIFACT, None)),
            Err(VerifyError::SignatureMissing("auth@1.0.0".into()))
        );
    }

    #[test]
    fn test_allow_list_checked_first() {
        let v = verifier(VerifierConfig {
            allowed_versions: vec!["2.0.0".into(), "1.1.0".into()],
            ..Default::default()
        });
        // Not even a WASM module, but the version check wins.
        assert_eq!(
            v.verify(&candidate(b"garbage", None)),
            Err(VerifyError::VersionNotAllowed {
                version: "1.0.0".into(),
                allowed: vec!["1.1.0".into(), "2.0.0".into()],
            })
        );
    }

    #[test]
    fn test_artifact_sanity() {
        let v = verifier(VerifierConfig {
            max_artifact_bytes: 16,
            ..Default::default()
        });
        let sig = signer().sign(b"not wasm").unwrap();
        assert!(matches!(
            v.verify(&candidate(b"not wasm", Some(&sig))),
            Err(VerifyError::ArtifactRejected(_))
        ));

        let mut large = WASM_MAGIC.to_vec();
        large.resize(17, 0);
        assert!(matches!(
            v.check_artifact(&large),
            Err(VerifyError::ArtifactRejected(_))
        ));
        large.truncate(16);
        assert!(v.check_artifact(&large).is_ok());
    }

    #[test]
    fn test_hash_mismatch_is_invalid() {
        let sig = signer().sign(ARTIFACT).unwrap();
        let v = verifier(VerifierConfig::default());
        let wrong = signature::content_hash(b"other");
        let right = format!("sha256:{}", signature::content_hash(ARTIFACT));

        let mut c = candidate(ARTIFACT, Some(&sig));
        c.expected_hash = Some(&wrong);
        assert!(matches!(v.verify(&c), Err(VerifyError::SignatureInvalid(_))));

        c.expected_hash = Some(&right);
        assert!(v.verify(&c).is_ok());
    }

    #[test]
    fn test_metadata_sidecar() {
        let metadata = SignatureMetadata::new("auth.wasm", "1.0.0", "auth", 7);
        let blob = signer().sign_with_metadata(ARTIFACT, &metadata).unwrap();
        let v = verifier(VerifierConfig::default());

        let verified = v.verify(&candidate(ARTIFACT, Some(&blob))).unwrap();
        assert_eq!(verified.metadata, Some(metadata));

        // Same sidecar presented for another version.
        let mut c = candidate(ARTIFACT, Some(&blob));
        c.version = "1.0.1";
        assert!(matches!(v.verify(&c), Err(VerifyError::SignatureInvalid(_))));

        // Metadata edited after signing.
        let Sidecar::WithMetadata { signature: raw, .. } = Sidecar::parse(&blob) else {
            panic!("expected metadata sidecar");
        };
        let edited = SignatureMetadata::new("auth.wasm", "1.0.0", "authz", 7);
        let tampered = sidecar::render(&serde_json::to_vec(&edited).unwrap(), raw);
        assert!(matches!(
            v.verify(&candidate(ARTIFACT, Some(&tampered))),
            Err(VerifyError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_file_with_configured_key() {
        let dir = tempfile::tempdir().unwrap();
        let pub_path = dir.path().join("cosign.pub");
        std::fs::write(
            &pub_path,
            test_secret()
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .unwrap(),
        )
        .unwrap();

        let artifact = dir.path().join("auth.wasm");
        std::fs::write(&artifact, ARTIFACT).unwrap();
        signer()
            .sign_file_with_metadata(&artifact, "1.0.0", "auth")
            .await
            .unwrap();

        let v = ArtifactVerifier::from_config(&VerifierConfig {
            key_path: Some(pub_path),
            strict_mode: true,
            ..Default::default()
        })
        .await
        .unwrap();

        let verified = v.verify_file(&artifact, "1.0.0", None).await.unwrap();
        assert!(verified.signed);
        assert_eq!(verified.metadata.unwrap().policy_id, "auth");
    }
}
