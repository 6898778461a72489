//! Signing-key handling for administrative and escrow wallets

use anyhow::{Context, Result};
use bip39::Mnemonic;
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::Sha512;
use sha3::{Digest, Keccak256};

/// Generate a fresh 12-word BIP-39 mnemonic.
pub fn generate_mnemonic() -> Result<String> {
    let mnemonic = Mnemonic::generate(12).context("Failed to generate mnemonic")?;
    Ok(mnemonic.to_string())
}

/// Derive the signing key from a mnemonic phrase.
///
/// BIP-39 seed (empty passphrase) fed through the BIP-32 master-key HMAC.
pub fn private_key_from_mnemonic(mnemonic: &str) -> Result<SecretKey> {
    let mnemonic = Mnemonic::parse(mnemonic.trim()).context("Invalid mnemonic phrase")?;
    let seed = mnemonic.to_seed("");

    let mut mac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
        .map_err(|e| anyhow::anyhow!("HMAC init failed: {e}"))?;
    mac.update(&seed);
    let output = mac.finalize().into_bytes();

    SecretKey::from_slice(&output[..32]).context("Derived key is not a valid secp256k1 scalar")
}

/// Derive the base58check Tron address for a signing key.
pub fn tron_address_from_key(secret_key: &SecretKey) -> String {
    let secp = Secp256k1::signing_only();
    let public_key = PublicKey::from_secret_key(&secp, secret_key);
    let uncompressed = public_key.serialize_uncompressed();

    let mut hasher = Keccak256::new();
    hasher.update(&uncompressed[1..]);
    let digest = hasher.finalize();

    let mut payload = vec![0x41u8];
    payload.extend_from_slice(&digest[12..]);
    bs58::encode(payload).with_check().into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
                            abandon abandon abandon abandon abandon about";

    #[test]
    fn generated_mnemonic_is_valid() {
        let phrase = generate_mnemonic().unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
        assert!(private_key_from_mnemonic(&phrase).is_ok());
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = private_key_from_mnemonic(MNEMONIC).unwrap();
        let b = private_key_from_mnemonic(MNEMONIC).unwrap();
        assert_eq!(a, b);
        assert!(private_key_from_mnemonic("definitely not a mnemonic").is_err());
    }

    #[test]
    fn address_shape() {
        let key = private_key_from_mnemonic(MNEMONIC).unwrap();
        let address = tron_address_from_key(&key);
        assert!(address.starts_with('T'));
        assert_eq!(address.len(), 34);
        // stable for the same key
        assert_eq!(address, tron_address_from_key(&key));
    }
}
