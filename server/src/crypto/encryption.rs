//! Encryption of mnemonics at rest
//!
//! Mnemonics are wrapped with AES-256-GCM under a key derived from the
//! process-wide secret (`SHA-256(secret)`). The stored form is
//! `base64(JSON({iv, tag, ciphertext}))` with a 16-byte random IV, so
//! records are portable across service instances sharing the secret.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 16;

// AES-256-GCM with the 16-byte IV used by the stored envelope format
type EnvelopeCipher = AesGcm<Aes256, U16>;

#[derive(Serialize, Deserialize)]
struct Envelope {
    iv: String,
    tag: String,
    ciphertext: String,
}

/// Derives the AES key from the process-wide secret.
fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Encrypts plaintext into the base64 envelope form.
pub fn encrypt_data(plaintext: &str, secret: &str) -> Result<String> {
    let key = derive_key(secret);
    let cipher =
        EnvelopeCipher::new_from_slice(&key).context("Failed to create cipher from key")?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::<U16>::from_slice(&iv);

    let mut sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext.as_bytes(),
                aad: &[],
            },
        )
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    // The AEAD output is ciphertext || tag; the envelope stores them apart
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);
    let envelope = Envelope {
        iv: BASE64.encode(iv),
        tag: BASE64.encode(tag),
        ciphertext: BASE64.encode(sealed),
    };

    let json = serde_json::to_vec(&envelope).context("Failed to serialize envelope")?;
    Ok(BASE64.encode(json))
}

/// Decrypts the base64 envelope form back into plaintext.
pub fn decrypt_data(encrypted: &str, secret: &str) -> Result<String> {
    let json = BASE64
        .decode(encrypted)
        .context("Encrypted payload is not valid base64")?;
    let envelope: Envelope =
        serde_json::from_slice(&json).context("Encrypted payload is not a valid envelope")?;

    let iv = BASE64.decode(&envelope.iv).context("Invalid envelope iv")?;
    let tag = BASE64.decode(&envelope.tag).context("Invalid envelope tag")?;
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .context("Invalid envelope ciphertext")?;

    if iv.len() != IV_SIZE {
        anyhow::bail!("Envelope iv must be {} bytes, got {}", IV_SIZE, iv.len());
    }

    let key = derive_key(secret);
    let cipher =
        EnvelopeCipher::new_from_slice(&key).context("Failed to create cipher from key")?;
    let nonce = Nonce::<U16>::from_slice(&iv);

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed,
                aad: &[],
            },
        )
        .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

    String::from_utf8(plaintext).context("Failed to convert decrypted bytes to UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-process-secret";

    #[test]
    fn round_trip() {
        let plaintext = "abandon abandon abandon abandon abandon abandon \
                         abandon abandon abandon abandon abandon about";
        let encrypted = encrypt_data(plaintext, SECRET).unwrap();
        assert_ne!(encrypted, plaintext);
        let decrypted = decrypt_data(&encrypted, SECRET).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn envelope_shape() {
        let encrypted = encrypt_data("payload", SECRET).unwrap();
        let json = BASE64.decode(&encrypted).unwrap();
        let envelope: Envelope = serde_json::from_slice(&json).unwrap();
        assert_eq!(BASE64.decode(&envelope.iv).unwrap().len(), IV_SIZE);
        assert_eq!(BASE64.decode(&envelope.tag).unwrap().len(), TAG_SIZE);
    }

    #[test]
    fn wrong_secret_fails() {
        let encrypted = encrypt_data("payload", SECRET).unwrap();
        assert!(decrypt_data(&encrypted, "other-secret").is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let encrypted = encrypt_data("payload", SECRET).unwrap();
        let json = BASE64.decode(&encrypted).unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&json).unwrap();
        let mut ct = BASE64.decode(&envelope.ciphertext).unwrap();
        if let Some(byte) = ct.first_mut() {
            *byte ^= 0xff;
        }
        envelope.ciphertext = BASE64.encode(ct);
        let tampered = BASE64.encode(serde_json::to_vec(&envelope).unwrap());
        assert!(decrypt_data(&tampered, SECRET).is_err());
    }

    #[test]
    fn distinct_ivs_per_encryption() {
        let a = encrypt_data("payload", SECRET).unwrap();
        let b = encrypt_data("payload", SECRET).unwrap();
        assert_ne!(a, b);
    }
}
