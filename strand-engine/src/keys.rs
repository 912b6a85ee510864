//! Author identity keys: Ed25519 generation, hex forms, and on-disk storage.
//!
//! Secret keys are persisted as `<data_dir>/keys/<pub_hex>.key`, hex-encoded
//! 64-byte keypair bytes (secret ‖ public), owner-readable only.

use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Generate a fresh signing key.
pub fn generate() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// 32-byte public key, lowercase hex.
pub fn public_hex(key: &SigningKey) -> String {
    HEXLOWER.encode(&key.verifying_key().to_bytes())
}

/// 64-byte keypair bytes (secret ‖ public), lowercase hex.
pub fn secret_hex(key: &SigningKey) -> String {
    HEXLOWER.encode(&key.to_keypair_bytes())
}

/// Parse a 64-byte keypair hex string; the embedded public half must match
/// the secret half.
pub fn parse_secret(hex: &str) -> Result<SigningKey, KeyError> {
    let bytes = HEXLOWER
        .decode(hex.trim().as_bytes())
        .map_err(|_| KeyError::BadHex)?;
    let bytes: [u8; 64] = bytes.try_into().map_err(|_| KeyError::BadLength)?;
    SigningKey::from_keypair_bytes(&bytes).map_err(|_| KeyError::BadKey)
}

/// Parse and validate a 32-byte public key hex string.
pub fn parse_public(hex: &str) -> Result<[u8; 32], KeyError> {
    let bytes = HEXLOWER
        .decode(hex.trim().as_bytes())
        .map_err(|_| KeyError::BadHex)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::BadLength)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::BadKey)?;
    Ok(bytes)
}

/// Persist a key under `keys_dir`, mode 0600. Returns the file path.
pub fn save_key(keys_dir: &Path, key: &SigningKey) -> Result<PathBuf, KeyError> {
    std::fs::create_dir_all(keys_dir)?;
    let path = keys_dir.join(format!("{}.key", public_hex(key)));
    std::fs::write(&path, secret_hex(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::info!(path = %path.display(), "key saved");
    Ok(path)
}

/// Load the key for a public key hex from `keys_dir`.
pub fn load_key(keys_dir: &Path, pub_hex: &str) -> Result<SigningKey, KeyError> {
    let contents = std::fs::read_to_string(keys_dir.join(format!("{pub_hex}.key")))?;
    let key = parse_secret(&contents)?;
    if public_hex(&key) != pub_hex {
        return Err(KeyError::BadKey);
    }
    Ok(key)
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid lowercase hex")]
    BadHex,
    #[error("wrong key length")]
    BadLength,
    #[error("invalid ed25519 key")]
    BadKey,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
