//! PEM decoding for P-256 keys, plus development key generation.

use crate::key_source::KeyLoadError;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};

pub const PRIVATE_KEY_FILE: &str = "cosign.key";
pub const PUBLIC_KEY_FILE: &str = "cosign.pub";

fn pem_text(pem: &[u8]) -> Result<&str, KeyLoadError> {
    let text =
        std::str::from_utf8(pem).map_err(|_| KeyLoadError::Pem("not valid UTF-8".into()))?;
    if !text.contains("-----BEGIN ") {
        return Err(KeyLoadError::Pem("no PEM block found".into()));
    }
    Ok(text)
}

/// Accepts PKCS#8 (`PRIVATE KEY`) and SEC1 (`EC PRIVATE KEY`) encodings.
pub fn parse_private_key(pem: &[u8]) -> Result<SigningKey, KeyLoadError> {
    let text = pem_text(pem)?;
    let secret = SecretKey::from_pkcs8_pem(text)
        .or_else(|_| SecretKey::from_sec1_pem(text))
        .map_err(|_| KeyLoadError::UnsupportedKey("expected a PKCS#8 or SEC1 P-256 private key"))?;
    Ok(SigningKey::from(secret))
}

/// Accepts PKIX (`PUBLIC KEY`) encoding only.
pub fn parse_public_key(pem: &[u8]) -> Result<VerifyingKey, KeyLoadError> {
    let text = pem_text(pem)?;
    let public = PublicKey::from_public_key_pem(text)
        .map_err(|_| KeyLoadError::UnsupportedKey("expected a PKIX P-256 public key"))?;
    Ok(VerifyingKey::from(public))
}

/// Writes a fresh development key pair into `dir` as `cosign.key` (SEC1) and
/// `cosign.pub` (PKIX). Not for production use.
pub fn generate_dev_key_pair(dir: &Path) -> Result<(PathBuf, PathBuf), KeyLoadError> {
    let secret = SecretKey::random(&mut OsRng);

    let private_pem = secret
        .to_sec1_pem(LineEnding::LF)
        .map_err(|e| KeyLoadError::Encode(e.to_string()))?;
    let public_pem = secret
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyLoadError::Encode(e.to_string()))?;

    fs::create_dir_all(dir).map_err(|source| KeyLoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let private_path = dir.join(PRIVATE_KEY_FILE);
    write_key(&private_path, private_pem.as_bytes(), 0o600)?;

    let public_path = dir.join(PUBLIC_KEY_FILE);
    write_key(&public_path, public_pem.as_bytes(), 0o644)?;

    Ok((private_path, public_path))
}

fn write_key(path: &Path, contents: &[u8], mode: u32) -> Result<(), KeyLoadError> {
    let to_err = |source| KeyLoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(path, contents).map_err(to_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(to_err)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
