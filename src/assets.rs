// assets.rs - Asset registry and unit conversion
//
// An asset is the tuple (symbol, token_address, chain_id, decimals).
// (token_address, chain_id) is unique; symbol groups tokens across chains
// into one logical asset. Ledger amounts are symbol-denominated decimals,
// on-chain amounts are integers in token base units.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::config::AssetConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Asset {
    pub symbol: String,
    pub token: Address,
    pub chain_id: u64,
    pub decimals: u8,
}

/// In-memory bijection over the configured assets. Built once at startup;
/// lookups never touch the store.
#[derive(Debug)]
pub struct AssetRegistry {
    assets: Vec<Asset>,
    by_token: HashMap<(Address, u64), usize>,
    by_symbol: HashMap<(String, u64), usize>,
}

impl AssetRegistry {
    pub fn new(configs: &[AssetConfig]) -> Result<Self, AppError> {
        let mut assets = Vec::with_capacity(configs.len());
        let mut by_token = HashMap::new();
        let mut by_symbol = HashMap::new();

        for config in configs {
            let asset = Asset {
                symbol: config.symbol.to_ascii_lowercase(),
                token: config.token,
                chain_id: config.chain_id,
                decimals: config.decimals,
            };
            let index = assets.len();
            if by_token
                .insert((asset.token, asset.chain_id), index)
                .is_some()
            {
                return Err(AppError::Internal(format!(
                    "duplicate asset for token {:#x} on chain {}",
                    asset.token, asset.chain_id
                )));
            }
            if by_symbol
                .insert((asset.symbol.clone(), asset.chain_id), index)
                .is_some()
            {
                return Err(AppError::Internal(format!(
                    "duplicate asset symbol {} on chain {}",
                    asset.symbol, asset.chain_id
                )));
            }
            assets.push(asset);
        }

        Ok(Self {
            assets,
            by_token,
            by_symbol,
        })
    }

    pub fn by_token(&self, token: Address, chain_id: u64) -> Option<&Asset> {
        self.by_token
            .get(&(token, chain_id))
            .map(|&i| &self.assets[i])
    }

    pub fn by_symbol(&self, symbol: &str, chain_id: u64) -> Option<&Asset> {
        self.by_symbol
            .get(&(symbol.to_ascii_lowercase(), chain_id))
            .map(|&i| &self.assets[i])
    }

    /// Whether any chain carries this symbol.
    pub fn knows_symbol(&self, symbol: &str) -> bool {
        let symbol = symbol.to_ascii_lowercase();
        self.assets.iter().any(|a| a.symbol == symbol)
    }

    pub fn all(&self) -> &[Asset] {
        &self.assets
    }
}

// =============================================================================
// UNIT CONVERSION
// =============================================================================

/// Convert a raw base-unit amount to a symbol-denominated Decimal.
///
/// E.g. U256(1_000_000) with 6 decimals -> 1.000000. Amounts beyond
/// Decimal's 28-digit range are rejected rather than truncated.
pub fn to_asset_units(raw: U256, decimals: u8) -> Result<Decimal, AppError> {
    let digits = raw.to_string();
    let value = Decimal::from_str_exact(&digits)
        .map_err(|_| AppError::Internal(format!("amount {} exceeds decimal range", digits)))?;
    // Decimal::new(1, scale) gives 10^(-scale); multiplying shifts the point.
    let scale = Decimal::new(1, decimals as u32);
    value
        .checked_mul(scale)
        .ok_or_else(|| AppError::Internal(format!("amount {} exceeds decimal range", digits)))
}

/// Convert a symbol-denominated Decimal to raw base units.
///
/// Rejects negative amounts and amounts with more fractional digits than
/// the token carries.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256, AppError> {
    if amount.is_sign_negative() {
        return Err(AppError::Malformed(format!(
            "amount must be non-negative, got {}",
            amount
        )));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals as u32 {
        return Err(AppError::Malformed(format!(
            "amount {} has more than {} decimal places",
            amount, decimals
        )));
    }

    let mantissa = normalized.mantissa();
    let base = U256::from(mantissa as u128);
    let shift = U256::from(10u64).pow(U256::from(decimals as u32 - scale));
    base.checked_mul(shift)
        .ok_or_else(|| AppError::Internal(format!("amount {} overflows base units", amount)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn registry() -> AssetRegistry {
        AssetRegistry::new(&[
            AssetConfig {
                symbol: "usdc".into(),
                token: address!("00000000000000000000000000000000000000a1"),
                chain_id: 137,
                decimals: 6,
            },
            AssetConfig {
                symbol: "usdc".into(),
                token: address!("00000000000000000000000000000000000000a2"),
                chain_id: 8453,
                decimals: 6,
            },
            AssetConfig {
                symbol: "weth".into(),
                token: address!("00000000000000000000000000000000000000b1"),
                chain_id: 137,
                decimals: 18,
            },
        ])
        .expect("registry build failed")
    }

    #[test]
    fn token_and_symbol_lookups_agree() {
        let registry = registry();
        let token = address!("00000000000000000000000000000000000000a1");

        let by_token = registry.by_token(token, 137).expect("token lookup");
        assert_eq!(by_token.symbol, "usdc");

        let by_symbol = registry.by_symbol("USDC", 137).expect("symbol lookup");
        assert_eq!(by_symbol.token, token);

        // Same symbol on another chain resolves to a different token
        let other = registry.by_symbol("usdc", 8453).expect("symbol lookup");
        assert_ne!(other.token, token);
    }

    #[test]
    fn unknown_token_misses() {
        let registry = registry();
        let unknown = address!("00000000000000000000000000000000000000ff");
        assert!(registry.by_token(unknown, 137).is_none());
        assert!(registry.by_symbol("usdc", 1).is_none());
        assert!(!registry.knows_symbol("dai"));
        assert!(registry.knows_symbol("weth"));
    }

    #[test]
    fn duplicate_token_rejected() {
        let token = address!("00000000000000000000000000000000000000a1");
        let duplicate = AssetConfig {
            symbol: "usdc".into(),
            token,
            chain_id: 137,
            decimals: 6,
        };
        assert!(AssetRegistry::new(&[duplicate.clone(), duplicate]).is_err());
    }

    #[test]
    fn base_unit_conversions_roundtrip() {
        let raw = U256::from(1_500_000u64);
        let amount = to_asset_units(raw, 6).unwrap();
        assert_eq!(amount, Decimal::from_str("1.5").unwrap().normalize());
        assert_eq!(to_base_units(amount, 6).unwrap(), raw);
    }

    #[test]
    fn to_base_units_rejects_excess_precision_and_negatives() {
        let too_precise = Decimal::from_str("1.0000001").unwrap();
        assert!(to_base_units(too_precise, 6).is_err());

        let negative = Decimal::from_str("-1").unwrap();
        assert!(to_base_units(negative, 6).is_err());
    }

    #[test]
    fn to_asset_units_rejects_out_of_range() {
        // 10^40 has more significant digits than Decimal can carry
        let huge = U256::from(10u64).pow(U256::from(40u64));
        assert!(to_asset_units(huge, 18).is_err());
    }
}
