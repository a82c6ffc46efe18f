//! AES-256-GCM sealing for secrets persisted to disk.
//!
//! Every seal operation uses a fresh random nonce, stored alongside the
//! ciphertext in a small JSON envelope. The master key comes from the
//! environment or, failing that, from a per-install key file generated on
//! first run — it is never compiled into the binary.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Size of the master key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Environment variable holding a base64-encoded 32-byte master key.
pub const KEY_ENV_VAR: &str = "POCKETSYNC_VAULT_KEY";

/// Name of the per-install key file inside the data directory.
const KEY_FILE_NAME: &str = "vault.key";

/// An encrypted secret as persisted to disk.
///
/// Both fields are base64. The nonce is public; only the key is secret.
#[derive(Debug, Serialize, Deserialize)]
pub struct SecretEnvelope {
    pub nonce: String,
    pub ciphertext: String,
}

/// Decodes and length-checks a base64 master key.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 master key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Master key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Resolves the master key for a data directory.
///
/// Order: `POCKETSYNC_VAULT_KEY` from the environment, then the key file
/// under `data_dir`. A missing key file is created with 32 random bytes on
/// first use (mode 0600 on unix).
pub fn master_key(data_dir: &Path) -> Result<Vec<u8>> {
    master_key_from(std::env::var(KEY_ENV_VAR).ok().as_deref(), data_dir)
}

fn master_key_from(env_value: Option<&str>, data_dir: &Path) -> Result<Vec<u8>> {
    if let Some(encoded) = env_value {
        return validate_key(encoded).context("Invalid key in environment");
    }

    let key_path = data_dir.join(KEY_FILE_NAME);
    if key_path.exists() {
        let encoded = std::fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read key file {}", key_path.display()))?;
        return validate_key(&encoded).context("Invalid key file contents");
    }

    // First run: generate and persist a fresh key
    let mut key_bytes = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
    std::fs::write(&key_path, BASE64.encode(key_bytes))
        .with_context(|| format!("Failed to write key file {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict key file permissions")?;
    }

    Ok(key_bytes.to_vec())
}

/// Encrypts plaintext with a fresh random nonce.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<SecretEnvelope> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Master key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Never reuse a nonce
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(SecretEnvelope {
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(&ciphertext_bytes),
    })
}

/// Decrypts an envelope. Fails on a wrong key, corrupted data, or tampering.
pub fn open(envelope: &SecretEnvelope, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Master key must be {} bytes", KEY_SIZE));
    }

    let ciphertext_bytes = BASE64
        .decode(&envelope.ciphertext)
        .context("Failed to decode ciphertext")?;
    let nonce_bytes = BASE64
        .decode(&envelope.nonce)
        .context("Failed to decode nonce")?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let plaintext_bytes = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext_bytes.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext_bytes).context("Decrypted data is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());

        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0u8; 32];
        let plaintext = "my-secret-access-token-12345";

        let envelope = seal(plaintext, &key).expect("seal failed");
        assert_ne!(envelope.ciphertext, plaintext);

        let opened = open(&envelope, &key).expect("open failed");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = [0u8; 32];
        let plaintext = "same-plaintext";

        let a = seal(plaintext, &key).unwrap();
        let b = seal(plaintext, &key).unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);

        assert_eq!(open(&a, &key).unwrap(), plaintext);
        assert_eq!(open(&b, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = seal("secret", &[0u8; 32]).unwrap();
        assert!(open(&envelope, &[1u8; 32]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0u8; 32];
        let mut envelope = seal("secret", &key).unwrap();
        envelope.ciphertext.push('X');
        assert!(open(&envelope, &key).is_err());
    }

    #[test]
    fn test_env_key_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = BASE64.encode([7u8; 32]);

        let key = master_key_from(Some(&encoded), dir.path()).unwrap();
        assert_eq!(key, vec![7u8; 32]);
        // No key file was created
        assert!(!dir.path().join(KEY_FILE_NAME).exists());
    }

    #[test]
    fn test_key_file_created_once_and_stable() {
        let dir = tempfile::tempdir().unwrap();

        let first = master_key_from(None, dir.path()).unwrap();
        assert!(dir.path().join(KEY_FILE_NAME).exists());

        let second = master_key_from(None, dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_env_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(master_key_from(Some("too-short"), dir.path()).is_err());
    }
}
