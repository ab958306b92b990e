// accounts.rs - Account id constructors
//
// The ledger addresses three account kinds through one opaque string
// namespace; the kind is implicit in how the id was built and nothing
// downstream branches on it.

use alloy::primitives::{keccak256, Address};

use crate::crypto::parse_address;
use crate::error::AppError;
use crate::model::AppDefinition;

/// Participant account: the participant's own address, lowercased hex.
pub fn participant_account(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Channel account: the on-chain channel id.
pub fn channel_account(channel_id: &str) -> String {
    channel_id.to_ascii_lowercase()
}

/// App-session account: keccak of the canonical definition JSON.
pub fn session_account(definition: &AppDefinition) -> Result<String, AppError> {
    let canonical = canonical_definition(definition)?;
    Ok(format!("{:#x}", keccak256(canonical.as_bytes())))
}

/// Canonical JSON of a session definition: participant addresses normalized
/// to lowercase hex, compact output, keys in lexicographic order. Two
/// definitions that differ only in address casing hash identically.
pub fn canonical_definition(definition: &AppDefinition) -> Result<String, AppError> {
    let normalized = normalize_definition(definition)?;
    serde_json::to_value(&normalized)
        .map(|v| v.to_string())
        .map_err(|e| AppError::Internal(format!("definition serialization failed: {}", e)))
}

/// Validate and normalize a definition's participant list.
pub fn normalize_definition(definition: &AppDefinition) -> Result<AppDefinition, AppError> {
    let participants = definition
        .participants
        .iter()
        .map(|p| parse_address(p).map(|a| format!("{:#x}", a)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AppDefinition {
        protocol: definition.protocol.clone(),
        participants,
        weights: definition.weights.clone(),
        quorum: definition.quorum,
        challenge: definition.challenge,
        nonce: definition.nonce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn definition(nonce: u64) -> AppDefinition {
        AppDefinition {
            protocol: "nitro-rpc".into(),
            participants: vec![
                "0x00000000000000000000000000000000000000Aa".into(),
                "0x00000000000000000000000000000000000000bB".into(),
            ],
            weights: vec![1, 1],
            quorum: 2,
            challenge: 86400,
            nonce,
        }
    }

    #[test]
    fn session_account_ignores_address_case() {
        let mut upper = definition(1);
        upper.participants = upper
            .participants
            .iter()
            .map(|p| p.to_ascii_uppercase().replace("0X", "0x"))
            .collect();

        assert_eq!(
            session_account(&definition(1)).unwrap(),
            session_account(&upper).unwrap()
        );
    }

    #[test]
    fn session_account_binds_the_nonce() {
        assert_ne!(
            session_account(&definition(1)).unwrap(),
            session_account(&definition(2)).unwrap()
        );
    }

    #[test]
    fn participant_account_is_lowercase_hex() {
        let addr = address!("00000000000000000000000000000000000000Aa");
        let id = participant_account(&addr);
        assert_eq!(id, id.to_ascii_lowercase());
        assert!(id.starts_with("0x"));
        assert_eq!(id.len(), 42);
    }

    #[test]
    fn rejects_invalid_participant_addresses() {
        let mut bad = definition(1);
        bad.participants[0] = "nothex".into();
        assert!(session_account(&bad).is_err());
    }
}
