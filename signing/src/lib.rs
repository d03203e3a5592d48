//! Signing and verification of compiled policy artifacts.
//!
//! Keys are ECDSA P-256, resolved once through a [`KeySource`]. Signatures
//! are raw 64-byte `r‖s` over SHA-256 of the artifact, stored in a `.sig`
//! sidecar next to it.

pub mod config;
pub mod key_source;
pub mod keys;
pub mod metrics_defs;
pub mod sidecar;
pub mod signature;
pub mod signer;
pub mod verifier;

pub use key_source::{KeyLoadError, KeySource};
pub use keys::generate_dev_key_pair;
pub use sidecar::SignatureMetadata;
pub use signer::{ArtifactSigner, SignError};
pub use verifier::{ArtifactVerifier, Candidate, Verified, VerifyError};
