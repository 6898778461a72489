//! Multisig transaction toolbox
//!
//! Builds the 2-of-3 account-permission update, converts between base58 and
//! hex address forms, ABI-encodes payout contract calls, and signs/combines
//! transactions for broadcast.

use anyhow::{Context, Result};
use secp256k1::{Message, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AccountPermissionUpdate, PermissionKey, PermissionSpec};

/// Operations bitmap granted to the active multisig permission
pub const MULTISIG_OPERATIONS: &str =
    "7fff1fc0033e0000000000000000000000000000000000000000000000000000";

/// Name of the active permission installed by the provisioner
pub const MULTISIG_PERMISSION_NAME: &str = "multisig_2_of_3";

/// Threshold policy plus the ordered owner list.
///
/// Stored on the escrow as `multisig_config` and snapshotted into each
/// payout payload; the owner order fixes the signature order at assembly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MultisigConfig {
    pub required_signatures: u32,
    pub total_owners: u32,
    pub owner_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<i64>>,
}

impl MultisigConfig {
    pub fn new(required_signatures: u32, owner_addresses: Vec<String>) -> Self {
        Self {
            required_signatures,
            total_owners: owner_addresses.len() as u32,
            owner_addresses,
            weights: None,
        }
    }

    /// Sum of owner weights; owners default to weight 1.
    pub fn weight_sum(&self) -> i64 {
        match &self.weights {
            Some(weights) => weights.iter().sum(),
            None => self.owner_addresses.len() as i64,
        }
    }

    /// A config whose weights cannot reach the threshold would lock the
    /// account permanently.
    pub fn validate(&self) -> Result<()> {
        if self.owner_addresses.is_empty() {
            anyhow::bail!("Multisig config has no owners");
        }
        if self.required_signatures == 0 {
            anyhow::bail!("Multisig config requires zero signatures");
        }
        if self.weight_sum() < self.required_signatures as i64 {
            anyhow::bail!(
                "Multisig config weight sum ({}) below threshold ({})",
                self.weight_sum(),
                self.required_signatures
            );
        }
        Ok(())
    }
}

/// Build the owner + active permission update installing 2-of-3 control
/// over `{participant1, participant2, arbiter}` with equal weights.
pub fn permission_update_2_of_3(
    participant1: &str,
    participant2: &str,
    arbiter: &str,
) -> Result<AccountPermissionUpdate> {
    let keys = vec![
        PermissionKey {
            address: participant1.to_string(),
            weight: 1,
        },
        PermissionKey {
            address: participant2.to_string(),
            weight: 1,
        },
        PermissionKey {
            address: arbiter.to_string(),
            weight: 1,
        },
    ];

    let owner = PermissionSpec {
        kind: 0,
        permission_name: "owner".to_string(),
        threshold: 2,
        operations: None,
        keys: keys.clone(),
    };
    let active = PermissionSpec {
        kind: 2,
        permission_name: MULTISIG_PERMISSION_NAME.to_string(),
        threshold: 2,
        operations: Some(MULTISIG_OPERATIONS.to_string()),
        keys,
    };

    check_weights(&owner)?;
    check_weights(&active)?;

    Ok(AccountPermissionUpdate {
        owner,
        actives: vec![active],
    })
}

/// Refuse any permission whose weight sum is below its threshold.
pub fn check_weights(spec: &PermissionSpec) -> Result<()> {
    let sum = spec.weight_sum();
    if sum < spec.threshold {
        anyhow::bail!(
            "Permission '{}': weight sum ({}) < threshold ({})",
            spec.permission_name,
            sum,
            spec.threshold
        );
    }
    Ok(())
}

/// Convert a base58check address to its hex form (`41` + 20 bytes).
pub fn address_to_hex(address: &str) -> Result<String> {
    let bytes = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .with_context(|| format!("Invalid base58check address: {address}"))?;
    Ok(hex::encode(bytes))
}

/// Convert a hex address (`41` + 20 bytes) back to base58check.
pub fn hex_to_address(hex_address: &str) -> Result<String> {
    let cleaned = hex_address.trim_start_matches("0x");
    let bytes =
        hex::decode(cleaned).with_context(|| format!("Invalid hex address: {hex_address}"))?;
    Ok(bs58::encode(bytes).with_check().into_string())
}

/// Strip a leading `0x` and surrounding whitespace from a signature.
pub fn normalize_signature(signature: &str) -> String {
    let trimmed = signature.trim();
    trimmed
        .strip_prefix("0x")
        .unwrap_or(trimmed)
        .to_string()
}

/// Sign a transaction id (the SHA-256 of the raw data) with a recoverable
/// ECDSA signature, hex `r || s || v` as the node expects.
pub fn sign_tx_id(tx_id_hex: &str, secret_key: &SecretKey) -> Result<String> {
    let digest: [u8; 32] = hex::decode(tx_id_hex.trim())
        .context("Transaction id is not valid hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("Transaction id must be 32 bytes"))?;
    let message = Message::from_digest(digest);
    let secp = Secp256k1::signing_only();
    let signature = secp.sign_ecdsa_recoverable(&message, secret_key);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut bytes = compact.to_vec();
    bytes.push(recovery_id.to_i32() as u8);
    Ok(hex::encode(bytes))
}

/// Attach ordered signatures to an unsigned transaction, producing the
/// broadcast payload `{ txID, raw_data, raw_data_hex, signature: [...] }`.
pub fn signed_transaction(unsigned_tx: &Value, signatures: Vec<String>) -> Value {
    let mut signed = unsigned_tx.clone();
    signed["signature"] = json!(signatures);
    signed
}

// ---------------------------------------------------------------------------
// ABI encoding for the payout-executor contract
// ---------------------------------------------------------------------------

/// ABI word: 20-byte address left-padded to 32 bytes.
pub fn abi_address_word(hex_addr: &str) -> String {
    let mut h = hex_addr.trim().trim_start_matches("0x").to_lowercase();
    if h.len() == 42 && h.starts_with("41") {
        h = h[2..].to_string();
    }
    format!("{h:0>64}")
}

/// ABI word: uint256 as 32 bytes hex.
pub fn abi_u256_word(n: u128) -> String {
    format!("{n:064x}")
}

/// Parameters for a plain `transfer(address,uint256)` token call.
pub fn encode_transfer(to_hex: &str, amount_units: u128) -> String {
    format!("{}{}", abi_address_word(to_hex), abi_u256_word(amount_units))
}

/// Parameters for `executePayoutAndFees(address token, uint256 nonce,
/// address mainRecipient, uint256 mainAmount, address[] feeRecipients,
/// uint256[] feeAmounts)`.
pub fn encode_execute_payout_and_fees(
    token_hex: &str,
    nonce: u128,
    main_recipient_hex: &str,
    main_amount: u128,
    fee_recipients_hex: &[String],
    fee_amounts: &[u128],
) -> Result<String> {
    if fee_recipients_hex.len() != fee_amounts.len() {
        anyhow::bail!("fee_recipients and fee_amounts length mismatch");
    }
    let n = fee_recipients_hex.len() as u128;
    let head_size = 6 * 32u128;
    let offset_fee_rec = head_size;
    let offset_fee_amt = head_size + 32 + n * 32;

    let mut out = String::new();
    out.push_str(&abi_address_word(token_hex));
    out.push_str(&abi_u256_word(nonce));
    out.push_str(&abi_address_word(main_recipient_hex));
    out.push_str(&abi_u256_word(main_amount));
    out.push_str(&abi_u256_word(offset_fee_rec));
    out.push_str(&abi_u256_word(offset_fee_amt));
    out.push_str(&abi_u256_word(n));
    for addr in fee_recipients_hex {
        out.push_str(&abi_address_word(addr));
    }
    out.push_str(&abi_u256_word(n));
    for amount in fee_amounts {
        out.push_str(&abi_u256_word(*amount));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_weight_guard() {
        let mut config = MultisigConfig::new(2, vec!["a".into(), "b".into(), "c".into()]);
        assert!(config.validate().is_ok());
        assert_eq!(config.weight_sum(), 3);

        config.weights = Some(vec![1, 0, 0]);
        assert!(config.validate().is_err());

        config.weights = Some(vec![1, 1, 0]);
        assert!(config.validate().is_ok());

        let empty = MultisigConfig::new(2, vec![]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn permission_update_shape() {
        let update = permission_update_2_of_3("TP1", "TP2", "TArb").unwrap();
        assert_eq!(update.owner.threshold, 2);
        assert_eq!(update.owner.keys.len(), 3);
        assert_eq!(update.actives.len(), 1);
        let active = &update.actives[0];
        assert_eq!(active.permission_name, MULTISIG_PERMISSION_NAME);
        assert_eq!(active.operations.as_deref(), Some(MULTISIG_OPERATIONS));
        assert!(active.keys.iter().all(|k| k.weight == 1));
    }

    #[test]
    fn weight_guard_refuses_locked_permission() {
        let spec = PermissionSpec {
            kind: 0,
            permission_name: "owner".into(),
            threshold: 3,
            operations: None,
            keys: vec![
                PermissionKey {
                    address: "a".into(),
                    weight: 1,
                },
                PermissionKey {
                    address: "b".into(),
                    weight: 1,
                },
            ],
        };
        assert!(check_weights(&spec).is_err());
    }

    #[test]
    fn signature_normalization() {
        assert_eq!(normalize_signature("0xabc123"), "abc123");
        assert_eq!(normalize_signature("  abc123  "), "abc123");
        assert_eq!(normalize_signature("abc123"), "abc123");
    }

    #[test]
    fn address_hex_round_trip() {
        // USDT mainnet contract address
        let address = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
        let hex_form = address_to_hex(address).unwrap();
        assert!(hex_form.starts_with("41"));
        assert_eq!(hex_form.len(), 42);
        assert_eq!(hex_to_address(&hex_form).unwrap(), address);
    }

    #[test]
    fn sign_tx_id_produces_recoverable_signature() {
        let secret = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        let tx_id = "0a".repeat(32);
        let signature = sign_tx_id(&tx_id, &secret).unwrap();
        assert_eq!(signature.len(), 130); // 65 bytes hex
        assert!(sign_tx_id("deadbeef", &secret).is_err()); // wrong length
    }

    #[test]
    fn signed_transaction_appends_signature_array() {
        let unsigned = json!({"txID": "ab", "raw_data_hex": "cd", "raw_data": {}});
        let signed = signed_transaction(&unsigned, vec!["s1".into(), "s2".into()]);
        assert_eq!(signed["txID"], "ab");
        assert_eq!(signed["signature"], json!(["s1", "s2"]));
    }

    #[test]
    fn abi_words() {
        assert_eq!(abi_u256_word(1), format!("{:0>64}", "1"));
        let word = abi_address_word("0x41a614f803b6fd780986a42c78ec9c7f77e6ded13c");
        assert_eq!(word.len(), 64);
        assert!(word.starts_with("000000000000000000000000a614f803"));
    }

    #[test]
    fn executor_encoding_layout() {
        let encoded = encode_execute_payout_and_fees(
            "41a614f803b6fd780986a42c78ec9c7f77e6ded13c",
            7,
            "41b0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9",
            1_000_000,
            &[],
            &[],
        )
        .unwrap();
        // head (6 words) + two empty dynamic arrays (1 word each)
        assert_eq!(encoded.len(), 8 * 64);
        // offsets point at the dynamic section
        assert_eq!(&encoded[4 * 64..5 * 64], &abi_u256_word(192));
        assert_eq!(&encoded[5 * 64..6 * 64], &abi_u256_word(224));

        assert!(encode_execute_payout_and_fees("41aa", 0, "41bb", 1, &["41cc".into()], &[])
            .is_err());
    }
}
