//! End-to-end offline payout flow over payload values
//!
//! Exercises the sequence a client walks through after the builder has
//! produced an unsigned transaction: both parties sign with real keys,
//! the aggregator validates and orders the signatures, and the assembled
//! payload is ready for the chain's broadcast endpoint.

use serde_json::json;

use server::chain::keys::{private_key_from_mnemonic, tron_address_from_key};
use server::chain::multisig::sign_tx_id;
use server::models::deal::{PayoutPayload, PayoutSignature};
use server::services::deals::assemble_signed_tx;

const SENDER_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
                               abandon abandon abandon abandon abandon about";
const RECEIVER_MNEMONIC: &str = "legal winner thank year wave sausage worth useful \
                                 legal winner thank yellow";

fn build_payload(owner_addresses: Vec<String>) -> PayoutPayload {
    PayoutPayload {
        blockchain: "tron".to_string(),
        network: "mainnet".to_string(),
        escrow_id: 1,
        to_address: owner_addresses[1].clone(),
        amount: 250.0,
        token_contract: Some("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string()),
        unsigned_tx: json!({
            "txID": "2b".repeat(32),
            "raw_data_hex": "0a02deadbeef",
            "raw_data": {"contract": []},
            "visible": true,
        }),
        contract_data: json!({"contract": []}),
        required_signatures: 2,
        participants: owner_addresses[..2].to_vec(),
        arbiter: owner_addresses[2].clone(),
        owner_addresses: Some(owner_addresses),
        contract_type: "TriggerSmartContract".to_string(),
        signatures: vec![],
    }
}

#[test]
fn two_of_three_sign_and_assemble() {
    let sender_key = private_key_from_mnemonic(SENDER_MNEMONIC).unwrap();
    let receiver_key = private_key_from_mnemonic(RECEIVER_MNEMONIC).unwrap();
    let sender_address = tron_address_from_key(&sender_key);
    let receiver_address = tron_address_from_key(&receiver_key);
    let arbiter_address = "TY2fKadTUrYmjuKkrsy2hzTNFHrFKzHA7w".to_string();

    let mut payload = build_payload(vec![
        sender_address.clone(),
        receiver_address.clone(),
        arbiter_address,
    ]);

    let tx_id = payload
        .unsigned_tx
        .get("txID")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    // Receiver signs first, then the sender; arrival order must not matter
    let receiver_sig = sign_tx_id(&tx_id, &receiver_key).unwrap();
    let sender_sig = sign_tx_id(&tx_id, &sender_key).unwrap();
    assert!(assemble_signed_tx(&payload).is_none(), "no signatures yet");

    payload.signatures.push(PayoutSignature {
        signer_address: receiver_address.clone(),
        signature: format!("0x{receiver_sig}"),
        signature_index: Some(1),
    });
    assert!(
        assemble_signed_tx(&payload).is_none(),
        "one signature is below the 2-of-3 threshold"
    );

    payload.signatures.push(PayoutSignature {
        signer_address: sender_address.clone(),
        signature: sender_sig.clone(),
        signature_index: Some(0),
    });

    let signed = assemble_signed_tx(&payload).expect("threshold reached");

    // The broadcast payload is the unsigned transaction plus the ordered
    // signature array
    assert_eq!(signed["txID"], json!(tx_id));
    assert_eq!(signed["raw_data_hex"], payload.unsigned_tx["raw_data_hex"]);
    let signatures = signed["signature"].as_array().unwrap();
    assert_eq!(signatures.len(), 2);
    // Owner order: sender (index 0) before receiver (index 1), and the
    // 0x prefix is stripped
    assert_eq!(signatures[0], json!(sender_sig));
    assert_eq!(signatures[1], json!(receiver_sig));

    // 65-byte recoverable signatures as the node expects
    for sig in signatures {
        assert_eq!(sig.as_str().unwrap().len(), 130);
    }
}

#[test]
fn round_trips_through_stored_json() {
    let sender_key = private_key_from_mnemonic(SENDER_MNEMONIC).unwrap();
    let sender_address = tron_address_from_key(&sender_key);

    let payload = build_payload(vec![
        sender_address,
        "TLsV52sRDL79HXGGm9yzwKibb6BeruhUzy".to_string(),
        "TY2fKadTUrYmjuKkrsy2hzTNFHrFKzHA7w".to_string(),
    ]);

    // The payload survives the JSONB round trip byte-for-byte in meaning
    let stored = payload.to_value();
    let restored = PayoutPayload::from_value(&stored).unwrap();
    assert_eq!(restored.to_value(), stored);
    assert_eq!(restored.required_signatures, 2);
    assert_eq!(restored.signatures.len(), 0);
}
