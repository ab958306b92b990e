// crypto.rs - Keccak digests and ECDSA signature handling
//
// This file handles the broker's cryptographic operations:
// - Parsing addresses, hashes, and uint256 values from strings
// - Signing canonical RPC payload bytes and recovering signer addresses
// - Encoding/decoding the 65-byte wire signature format
// - Computing the channel state digests that drive on-chain transitions

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::signers::{local::PrivateKeySigner, Signer};
use std::str::FromStr;

use crate::error::AppError;
use crate::model::StateAllocation;

// =============================================================================
// PARSING FUNCTIONS
// =============================================================================
// Convert hex strings from JSON into typed values.

/// Parse an Ethereum address from a hex string (with or without 0x prefix)
pub fn parse_address(input: &str) -> Result<Address, AppError> {
    Address::from_str(input)
        .map_err(|_| AppError::Malformed(format!("invalid address: {}", input)))
}

/// Parse a 32-byte hash (channel ID) from hex string
pub fn parse_b256(input: &str) -> Result<B256, AppError> {
    B256::from_str(input)
        .map_err(|_| AppError::Malformed(format!("invalid channel id: {}", input)))
}

/// Parse a U256 (big integer) from decimal string
pub fn parse_u256(input: &str) -> Result<U256, AppError> {
    U256::from_str(input)
        .map_err(|_| AppError::Malformed(format!("invalid uint256: {}", input)))
}

// =============================================================================
// WIRE SIGNATURE FORMAT
// =============================================================================
// Signatures travel as 0x-prefixed 130-hex-char strings: R (32 bytes) ||
// S (32 bytes) || V (1 byte), with V in {0, 1}. Parsing also accepts the
// pre-EIP-155 27/28 convention and normalizes it.

/// Encode a signature into the wire format.
pub fn encode_signature(sig: &Signature) -> String {
    let mut out = sig.as_bytes();
    // as_bytes emits the pre-EIP-155 recovery byte; the wire wants {0, 1}
    if out[64] >= 27 {
        out[64] -= 27;
    }
    format!("0x{}", hex::encode(out))
}

/// Decode a wire signature string into its components.
pub fn decode_signature(input: &str) -> Result<Signature, AppError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(trimmed)
        .map_err(|e| AppError::InvalidSignature(format!("invalid signature hex: {}", e)))?;
    if bytes.len() != 65 {
        return Err(AppError::InvalidSignature(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let r = U256::from_be_slice(&bytes[0..32]);
    let s = U256::from_be_slice(&bytes[32..64]);
    let parity = match bytes[64] {
        0 | 27 => false,
        1 | 28 => true,
        v => {
            return Err(AppError::InvalidSignature(format!(
                "invalid recovery byte: {}",
                v
            )))
        }
    };

    Ok(Signature::new(r, s, parity))
}

// =============================================================================
// PAYLOAD SIGNING AND RECOVERY
// =============================================================================
// The signable bytes of an RPC message are the canonical JSON of its
// 4-element payload array. Both sides hash those bytes with keccak256 and
// sign/recover over the digest.

/// Sign canonical payload bytes with the broker's key.
pub async fn sign_payload(
    signer: &PrivateKeySigner,
    payload_bytes: &[u8],
) -> Result<String, AppError> {
    let digest = keccak256(payload_bytes);
    let signature = signer
        .sign_hash(&digest)
        .await
        .map_err(|e| AppError::Internal(format!("broker signing failed: {}", e)))?;
    Ok(encode_signature(&signature))
}

/// Recover the signer address of one wire signature over payload bytes.
pub fn recover_signer(payload_bytes: &[u8], signature: &str) -> Result<Address, AppError> {
    let digest = keccak256(payload_bytes);
    let sig = decode_signature(signature)?;
    sig.recover_address_from_prehash(&digest)
        .map_err(|e| AppError::InvalidSignature(format!("signature recovery failed: {}", e)))
}

/// Recover every signer of a message. Order follows the signature list.
pub fn recover_signers(
    payload_bytes: &[u8],
    signatures: &[String],
) -> Result<Vec<Address>, AppError> {
    signatures
        .iter()
        .map(|sig| recover_signer(payload_bytes, sig))
        .collect()
}

// =============================================================================
// CHANNEL STATE DIGESTS
// =============================================================================
// The broker co-signs state objects that the participant submits on-chain.
// The digest is a keccak256 over a fixed 32-byte-word encoding:
//
//   channel_id || intent || version || keccak(state_data) ||
//   (destination || token || amount) per allocation

/// Enumerated tag on a signed state, telling the custody contract which
/// transition the state authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateIntent {
    Initialize = 0,
    Finalize = 1,
    Resize = 2,
}

impl StateIntent {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Compute the digest of a channel state transition.
pub fn channel_state_digest(
    channel_id: B256,
    intent: StateIntent,
    version: u64,
    state_data: &[u8],
    allocations: &[StateAllocation],
) -> B256 {
    let mut words = Vec::with_capacity((4 + allocations.len() * 3) * 32);
    words.extend_from_slice(channel_id.as_slice());
    words.extend_from_slice(&pad_u256(U256::from(intent.as_u8())));
    words.extend_from_slice(&pad_u256(U256::from(version)));
    words.extend_from_slice(keccak256(state_data).as_slice());
    for allocation in allocations {
        words.extend_from_slice(&pad_address(allocation.destination));
        words.extend_from_slice(&pad_address(allocation.token));
        words.extend_from_slice(&pad_u256(allocation.amount));
    }
    keccak256(&words)
}

/// Sign a channel state with the broker's key, returning the digest and the
/// wire signature over it.
pub async fn sign_channel_state(
    signer: &PrivateKeySigner,
    channel_id: B256,
    intent: StateIntent,
    version: u64,
    state_data: &[u8],
    allocations: &[StateAllocation],
) -> Result<(B256, String), AppError> {
    let digest = channel_state_digest(channel_id, intent, version, state_data, allocations);
    let signature = signer
        .sign_hash(&digest)
        .await
        .map_err(|e| AppError::Internal(format!("state signing failed: {}", e)))?;
    Ok((digest, encode_signature(&signature)))
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Pad a U256 to 32 bytes (big-endian)
fn pad_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

/// Left-pad a 20-byte address to a 32-byte word
fn pad_address(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_then_recover_roundtrip() {
        let signer = PrivateKeySigner::random();
        let payload = br#"[1,"ping",[],1700000000]"#;

        let signature = sign_payload(&signer, payload).await.expect("signing failed");
        let recovered = recover_signer(payload, &signature).expect("recovery failed");

        assert_eq!(recovered, signer.address());
    }

    #[tokio::test]
    async fn recovery_fails_on_different_payload() {
        let signer = PrivateKeySigner::random();
        let signature = sign_payload(&signer, b"payload-a").await.unwrap();

        let recovered = recover_signer(b"payload-b", &signature).unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[tokio::test]
    async fn decode_normalizes_legacy_recovery_byte() {
        let signer = PrivateKeySigner::random();
        let payload = b"legacy-v";
        let signature = sign_payload(&signer, payload).await.unwrap();

        // Rewrite the final byte to the 27/28 convention
        let mut bytes = hex::decode(signature.strip_prefix("0x").unwrap()).unwrap();
        bytes[64] += 27;
        let legacy = format!("0x{}", hex::encode(&bytes));

        let recovered = recover_signer(payload, &legacy).expect("legacy v rejected");
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn decode_rejects_wrong_length_and_bad_v() {
        assert!(decode_signature("0xdeadbeef").is_err());

        let mut bytes = [0u8; 65];
        bytes[64] = 5;
        assert!(decode_signature(&format!("0x{}", hex::encode(bytes))).is_err());
    }

    #[test]
    fn state_digest_is_deterministic_and_binds_fields() {
        let channel_id = B256::repeat_byte(0x11);
        let allocations = vec![StateAllocation {
            destination: Address::repeat_byte(0x22),
            token: Address::repeat_byte(0x33),
            amount: U256::from(1000u64),
        }];

        let a = channel_state_digest(channel_id, StateIntent::Resize, 2, b"", &allocations);
        let b = channel_state_digest(channel_id, StateIntent::Resize, 2, b"", &allocations);
        assert_eq!(a, b);

        let other_intent =
            channel_state_digest(channel_id, StateIntent::Finalize, 2, b"", &allocations);
        assert_ne!(a, other_intent);

        let other_version =
            channel_state_digest(channel_id, StateIntent::Resize, 3, b"", &allocations);
        assert_ne!(a, other_version);
    }
}
