//! Common identifier types for the escrow marketplace

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// On-chain wallet address
pub type WalletAddress = String;

/// Blockchain transaction hash
pub type TxHash = String;

/// Deal unique identifier (base58-encoded UUID)
pub type DealUid = String;

/// Decentralized identifier, formatted `did:{method}:{address}`.
///
/// The method names the blockchain family (`tron`, `ethr`, `bitcoin`,
/// `polkadot`) or the synthetic `deal` method used for conversation ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did {
    method: String,
    address: String,
}

impl Did {
    /// Parse and validate a DID string.
    pub fn parse(value: &str) -> Result<Did> {
        if value.is_empty() {
            return Err(Error::InvalidDid("DID cannot be empty".into()));
        }

        let mut parts = value.splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        let address = parts.next().unwrap_or_default();

        if prefix != "did" {
            return Err(Error::InvalidDid(format!(
                "must start with 'did:' (got: {value})"
            )));
        }
        if method.trim().is_empty() {
            return Err(Error::InvalidDid(format!(
                "method cannot be empty (got: {value})"
            )));
        }
        if address.trim().is_empty() {
            return Err(Error::InvalidDid(format!(
                "address cannot be empty (got: {value})"
            )));
        }

        Ok(Did {
            method: method.to_string(),
            address: address.to_string(),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "did:{}:{}", self.method, self.address)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Did::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Did::parse(&value)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> String {
        did.to_string()
    }
}

/// Validate a DID string without keeping the parsed form.
pub fn validate_did(value: &str) -> Result<()> {
    Did::parse(value).map(|_| ())
}

/// Build the DID for a user wallet on a given blockchain.
///
/// Ethereum uses the `ethr` method; substrate chains map to `polkadot`;
/// unknown blockchains default to `ethr` (secp256k1 family). Addresses are
/// lowercased so the identifier is stable across checksum casings.
pub fn did_for_wallet(wallet_address: &str, blockchain: &str) -> String {
    let method = match blockchain.to_lowercase().as_str() {
        "ethereum" => "ethr".to_string(),
        chain @ ("tron" | "bitcoin") => chain.to_string(),
        "polkadot" | "substrate" => "polkadot".to_string(),
        _ => "ethr".to_string(),
    };
    format!("did:{}:{}", method, wallet_address.to_lowercase())
}

/// Conversation identifier for a deal chat thread.
pub fn deal_did(deal_uid: &str) -> String {
    format!("did:{}:{}", crate::DEAL_DID_METHOD, deal_uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_dids() {
        let did = Did::parse("did:tron:TY2fKadTUrYmjuKkrsy2hzTNFHrFKzHA7w").unwrap();
        assert_eq!(did.method(), "tron");
        assert_eq!(did.address(), "TY2fKadTUrYmjuKkrsy2hzTNFHrFKzHA7w");
        assert_eq!(
            did.to_string(),
            "did:tron:TY2fKadTUrYmjuKkrsy2hzTNFHrFKzHA7w"
        );
    }

    #[test]
    fn rejects_malformed_dids() {
        assert!(Did::parse("").is_err());
        assert!(Did::parse("did").is_err());
        assert!(Did::parse("did:tron").is_err());
        assert!(Did::parse("did::addr").is_err());
        assert!(Did::parse("did:tron:").is_err());
        assert!(Did::parse("nid:tron:addr").is_err());
    }

    #[test]
    fn keeps_colons_inside_address() {
        // The address segment may itself contain colons (e.g. substrate keys)
        let did = Did::parse("did:polkadot:5f:ab").unwrap();
        assert_eq!(did.address(), "5f:ab");
    }

    #[test]
    fn wallet_did_methods() {
        assert_eq!(did_for_wallet("0xAbC", "ethereum"), "did:ethr:0xabc");
        assert_eq!(did_for_wallet("TAbc", "tron"), "did:tron:tabc");
        assert_eq!(did_for_wallet("1Abc", "bitcoin"), "did:bitcoin:1abc");
        assert_eq!(did_for_wallet("5Abc", "substrate"), "did:polkadot:5abc");
        assert_eq!(did_for_wallet("zzz", "unknown-chain"), "did:ethr:zzz");
    }

    #[test]
    fn deal_conversation_id() {
        assert_eq!(deal_did("3mJr7AoUXx2Wqd"), "did:deal:3mJr7AoUXx2Wqd");
    }
}
