//! Credential vault: symmetric encryption-at-rest for API keys and tokens.
//!
//! Uses AES-256-GCM with a process-wide key sourced from `HUB_SECRET_KEY`.
//! Ciphertext is stored as `enc:v1:BASE64(nonce||ciphertext)` so legacy
//! plaintext rows (no prefix) remain readable. The vault is the only
//! component that ever handles plaintext credentials; everything that leaves
//! the process (API responses, logs) sees masked values only.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Key length in bytes (256 bits for AES-256)
const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

/// Environment variable name for the encryption key
pub const SECRET_KEY_ENV: &str = "HUB_SECRET_KEY";

/// Prefix marking an encrypted value (with format version)
const ENCRYPTED_PREFIX: &str = "enc:v1:";

/// Check whether a stored value carries the encryption prefix.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Process-wide credential vault. Immutable after startup; cheap to clone.
#[derive(Clone)]
pub struct Vault {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never reveal key material, even in debug output.
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Encrypt a plaintext credential for storage.
    ///
    /// Already-encrypted values pass through unchanged so callers can feed
    /// stored rows back without double-wrapping.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
    }

    /// Decrypt a stored credential.
    ///
    /// Values without the encryption prefix are legacy plaintext and pass
    /// through unchanged. Wrapped values fail on tamper or key mismatch.
    pub fn decrypt(&self, value: &str) -> Result<String> {
        let payload = match value.strip_prefix(ENCRYPTED_PREFIX) {
            Some(p) => p,
            None => return Ok(value.to_string()),
        };

        let combined = BASE64
            .decode(payload)
            .context("Failed to decode encrypted value")?;

        if combined.len() < NONCE_LENGTH {
            return Err(anyhow!("Encrypted value too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("Decryption failed: invalid key or corrupted data"))?;

        String::from_utf8(plaintext).context("Decrypted value is not valid UTF-8")
    }
}

/// Derive the display form of a credential: first 4 + ellipsis + last 4.
///
/// Strings shorter than 8 characters render as `****`; empty input renders
/// as an empty string.
pub fn mask(plaintext: &str) -> String {
    if plaintext.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = plaintext.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Parse a key from hex or base64 format.
fn parse_key(key_str: &str) -> Result<[u8; KEY_LENGTH]> {
    let trimmed = key_str.trim();

    // Try hex first (64 characters = 32 bytes)
    if trimmed.len() == KEY_LENGTH * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(trimmed).context("Invalid hex key")?;
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    // Try base64
    let bytes = BASE64
        .decode(trimmed)
        .context("Key is neither valid hex nor base64")?;

    if bytes.len() != KEY_LENGTH {
        return Err(anyhow!(
            "Key must be {} bytes, got {} bytes",
            KEY_LENGTH,
            bytes.len()
        ));
    }

    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Load the encryption key from the environment.
/// Returns None if `HUB_SECRET_KEY` is not set.
pub fn load_secret_key_from_env() -> Result<Option<[u8; KEY_LENGTH]>> {
    let key_str = match std::env::var(SECRET_KEY_ENV) {
        Ok(k) if !k.trim().is_empty() => k,
        _ => return Ok(None),
    };

    parse_key(&key_str)
        .map(Some)
        .context("Invalid HUB_SECRET_KEY format")
}

/// Generate a new random encryption key.
pub fn generate_secret_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Load the encryption key from the environment, generating one if missing.
///
/// A generated key is appended to the configuration file at `env_file_path`
/// so restarts keep decrypting existing rows, and a one-time warning is
/// logged. The key deliberately lives outside the database file.
pub async fn load_or_create_secret_key(env_file_path: &Path) -> Result<[u8; KEY_LENGTH]> {
    if let Some(key) = load_secret_key_from_env()? {
        return Ok(key);
    }

    let key = generate_secret_key();
    let key_hex = hex::encode(key);

    let env_line = format!(
        "\n# Auto-generated credential encryption key\n{}={}\n",
        SECRET_KEY_ENV, key_hex
    );

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(env_file_path)
        .await
        .context("Failed to open config file for writing")?;

    file.write_all(env_line.as_bytes())
        .await
        .context("Failed to write HUB_SECRET_KEY to config file")?;

    // Also set in the current process environment
    std::env::set_var(SECRET_KEY_ENV, &key_hex);

    tracing::warn!(
        "No HUB_SECRET_KEY configured; generated a fresh key and saved it to {}",
        env_file_path.display()
    );

    Ok(key)
}
