// model.rs - Data structures for the broker
//
// This file defines the types used throughout the application:
// - Internal state rows (Channel, AppSession, RpcRecord)
// - RPC parameter types deserialized from request params
// - RPC view types serialized into responses and notifications
//
// Internal types use alloy primitives; wire types use strings for
// addresses, hashes, and big amounts.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

// =============================================================================
// INTERNAL STATE TYPES
// =============================================================================

/// On-chain channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created on-chain, waiting for the broker's join to land
    Joining,
    /// Joined; deposits are credited to the participant's account
    Open,
    /// Terminal
    Closed,
}

impl ChannelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Joining => "joining",
            ChannelStatus::Open => "open",
            ChannelStatus::Closed => "closed",
        }
    }

    pub fn parse(input: &str) -> Result<Self, AppError> {
        match input {
            "joining" => Ok(ChannelStatus::Joining),
            "open" => Ok(ChannelStatus::Open),
            "closed" => Ok(ChannelStatus::Closed),
            other => Err(AppError::Internal(format!(
                "unknown channel status: {}",
                other
            ))),
        }
    }
}

/// One bilateral deposit channel between a participant and the broker.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Keccak fingerprint assigned by the custody contract (0x-hex)
    pub channel_id: String,

    /// The user side of the channel; the broker is always the other side
    pub participant: Address,

    pub token: Address,
    pub chain_id: u64,

    /// On-chain contract that would settle a dispute; recorded, never called
    pub adjudicator: Address,

    /// Total on-chain deposit in token base units
    pub amount: U256,

    pub nonce: u64,

    /// Monotonic per on-chain mutation
    pub version: u64,

    pub status: ChannelStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Virtual application session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSessionStatus {
    Open,
    Closed,
}

impl AppSessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppSessionStatus::Open => "open",
            AppSessionStatus::Closed => "closed",
        }
    }

    pub fn parse(input: &str) -> Result<Self, AppError> {
        match input {
            "open" => Ok(AppSessionStatus::Open),
            "closed" => Ok(AppSessionStatus::Closed),
            other => Err(AppError::Internal(format!(
                "unknown session status: {}",
                other
            ))),
        }
    }
}

/// A broker-adjudicated pool of balances among N participants.
#[derive(Debug, Clone)]
pub struct AppSession {
    /// Keccak of the canonical definition JSON (0x-hex)
    pub session_id: String,

    pub protocol: String,

    /// Ordered; parallel to `weights`
    pub participants: Vec<Address>,
    pub weights: Vec<i64>,

    /// Minimum summed positive signer weight to close the session
    pub quorum: u64,

    /// Challenge window in seconds, recorded for the definition hash
    pub challenge: u64,

    pub nonce: u64,
    pub version: u64,
    pub status: AppSessionStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Per-request audit log row.
#[derive(Debug, Clone)]
pub struct RpcRecord {
    pub sender: String,
    pub req_id: u64,
    pub method: String,
    pub params: String,
    pub timestamp: u64,
    pub req_sig: Vec<String>,
    pub response: String,
    pub res_sig: Vec<String>,
}

/// One allocation slot of a signed channel state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAllocation {
    pub destination: Address,
    pub token: Address,
    pub amount: U256,
}

// =============================================================================
// RPC PARAMETER TYPES
// =============================================================================
// Deserialized from the first element of a request's params array.

#[derive(Debug, Deserialize)]
pub struct AuthRequestParams {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthVerifyParams {
    pub address: String,
    pub challenge: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GetLedgerBalancesParams {
    /// Defaults to the caller's own participant account
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetChannelsParams {
    pub participant: String,
}

#[derive(Debug, Deserialize)]
pub struct GetAppDefinitionParams {
    pub app_session_id: String,
}

/// The session definition whose canonical JSON keccak becomes the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDefinition {
    pub protocol: String,
    pub participants: Vec<String>,
    pub weights: Vec<i64>,
    pub quorum: u64,
    pub challenge: u64,
    pub nonce: u64,
}

/// One `{participant, asset_symbol, amount}` entry of a create/close request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationParam {
    pub participant: String,
    pub asset_symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppSessionParams {
    pub definition: AppDefinition,
    pub allocations: Vec<AllocationParam>,
}

#[derive(Debug, Deserialize)]
pub struct CloseAppSessionParams {
    pub app_session_id: String,
    pub allocations: Vec<AllocationParam>,
}

#[derive(Debug, Deserialize)]
pub struct ResizeChannelParams {
    pub channel_id: String,
    /// Signed decimal in asset units; positive moves off-chain balance into
    /// the channel, negative withdraws
    #[serde(with = "rust_decimal::serde::str")]
    pub participant_change: Decimal,
    pub funds_destination: String,
}

#[derive(Debug, Deserialize)]
pub struct CloseChannelParams {
    pub channel_id: String,
    pub funds_destination: String,
}

// =============================================================================
// RPC VIEW TYPES
// =============================================================================
// Serialized into response params and push notifications.

#[derive(Debug, Serialize)]
pub struct AuthChallengeView {
    pub challenge_message: String,
}

#[derive(Debug, Serialize)]
pub struct AuthVerifyView {
    pub address: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkView {
    pub chain_id: u64,
    pub custody_address: String,
}

#[derive(Debug, Serialize)]
pub struct AssetView {
    pub symbol: String,
    pub token: String,
    pub chain_id: u64,
    pub decimals: u8,
}

#[derive(Debug, Serialize)]
pub struct ConfigView {
    pub broker_address: String,
    pub networks: Vec<NetworkView>,
    pub assets: Vec<AssetView>,
}

/// One `(asset, amount)` pair of an account's balance listing.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerBalance {
    pub asset_symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct ChannelView {
    pub channel_id: String,
    pub participant: String,
    pub status: &'static str,
    pub token: String,
    pub chain_id: u64,
    pub amount: String,
    pub nonce: u64,
    pub version: u64,
    pub adjudicator: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ChannelView {
    pub fn from_channel(channel: &Channel) -> Self {
        Self {
            channel_id: channel.channel_id.clone(),
            participant: format!("{:#x}", channel.participant),
            status: channel.status.as_str(),
            token: format!("{:#x}", channel.token),
            chain_id: channel.chain_id,
            amount: channel.amount.to_string(),
            nonce: channel.nonce,
            version: channel.version,
            adjudicator: format!("{:#x}", channel.adjudicator),
            created_at: channel.created_at,
            updated_at: channel.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AppSessionView {
    pub app_session_id: String,
    pub version: u64,
    pub status: &'static str,
}

impl AppSessionView {
    pub fn from_session(session: &AppSession) -> Self {
        Self {
            app_session_id: session.session_id.clone(),
            version: session.version,
            status: session.status.as_str(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcRecordView {
    pub sender: String,
    pub req_id: u64,
    pub method: String,
    pub params: String,
    pub timestamp: u64,
    pub req_sig: Vec<String>,
    pub response: String,
    pub res_sig: Vec<String>,
}

impl RpcRecordView {
    pub fn from_record(record: &RpcRecord) -> Self {
        Self {
            sender: record.sender.clone(),
            req_id: record.req_id,
            method: record.method.clone(),
            params: record.params.clone(),
            timestamp: record.timestamp,
            req_sig: record.req_sig.clone(),
            response: record.response.clone(),
            res_sig: record.res_sig.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StateAllocationView {
    pub destination: String,
    pub token: String,
    pub amount: String,
}

impl StateAllocationView {
    pub fn from_allocation(allocation: &StateAllocation) -> Self {
        Self {
            destination: format!("{:#x}", allocation.destination),
            token: format!("{:#x}", allocation.token),
            amount: allocation.amount.to_string(),
        }
    }
}

/// Broker-signed state object returned by resize_channel / close_channel.
/// The participant submits this to the custody contract.
#[derive(Debug, Serialize)]
pub struct ChannelStateView {
    pub channel_id: String,
    pub intent: u8,
    pub version: u64,
    pub state_data: String,
    pub allocations: Vec<StateAllocationView>,
    pub state_hash: String,
    pub server_signature: String,
}
