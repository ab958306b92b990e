// service.rs - Ledger operations
//
// The business logic behind every RPC method:
// - Balance, channel, definition, and history queries
// - App session create/close with quorum-weighted signature checks
// - Broker-signed resize/close states for on-chain channel transitions
//
// Every handler that mutates ledger state does all of its work inside a
// single store transaction; balances are always aggregated inside the
// transaction that consumes them.

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::accounts::{channel_account, normalize_definition, participant_account, session_account};
use crate::assets::{to_base_units, AssetRegistry};
use crate::config::Config;
use crate::crypto::{
    parse_address, parse_b256, recover_signers, sign_channel_state, StateIntent,
};
use crate::error::AppError;
use crate::model::{
    AllocationParam, AppDefinition, AppSession, AppSessionStatus, AppSessionView, AssetView,
    Channel, ChannelStateView, ChannelStatus, ChannelView, CloseAppSessionParams,
    CloseChannelParams, ConfigView, CreateAppSessionParams, GetAppDefinitionParams,
    GetChannelsParams, GetLedgerBalancesParams, NetworkView, ResizeChannelParams, RpcRecordView,
    StateAllocation, StateAllocationView,
};
use crate::pubsub::Subscriptions;
use crate::rpc::{first_param, now_secs, RpcMessage};
use crate::{pubsub, store};

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Shared state passed to every handler and reconciler.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: PgPool,

    /// Configuration loaded from environment
    pub config: Arc<Config>,

    /// Supported token registry
    pub assets: Arc<AssetRegistry>,

    /// Broker's signing key; signs responses, notifications, channel states
    pub signer: PrivateKeySigner,

    /// Derived once from the signer
    pub broker_address: Address,

    /// Live per-participant subscription index
    pub subscriptions: Arc<Subscriptions>,
}

fn value_of<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("response serialization failed: {}", e)))
}

// =============================================================================
// QUERIES
// =============================================================================

pub async fn get_config(state: &AppState) -> Result<Vec<Value>, AppError> {
    let view = ConfigView {
        broker_address: format!("{:#x}", state.broker_address),
        networks: state
            .config
            .chains
            .iter()
            .map(|c| NetworkView {
                chain_id: c.chain_id,
                custody_address: format!("{:#x}", c.custody),
            })
            .collect(),
        assets: state
            .assets
            .all()
            .iter()
            .map(|a| AssetView {
                symbol: a.symbol.clone(),
                token: format!("{:#x}", a.token),
                chain_id: a.chain_id,
                decimals: a.decimals,
            })
            .collect(),
    };
    Ok(vec![value_of(&view)?])
}

/// Balances of one account, always scoped to the authenticated participant.
pub async fn get_ledger_balances(
    state: &AppState,
    caller: Address,
    req: &RpcMessage,
) -> Result<Vec<Value>, AppError> {
    let params: GetLedgerBalancesParams = if req.payload.params.is_empty() {
        GetLedgerBalancesParams::default()
    } else {
        first_param(&req.payload.params)?
    };

    let account_id = params
        .account_id
        .map(|id| id.to_ascii_lowercase())
        .unwrap_or_else(|| participant_account(&caller));

    let balances =
        store::account_balances(&state.db, &account_id, &participant_account(&caller)).await?;
    Ok(vec![value_of(&balances)?])
}

/// Channels of the requested participant, newest first. Requires that
/// participant's signature on the request.
pub async fn get_channels(state: &AppState, req: &RpcMessage) -> Result<Vec<Value>, AppError> {
    let params: GetChannelsParams = first_param(&req.payload.params)?;
    let participant = parse_address(&params.participant)?;

    let signers = recover_signers(&req.payload.canonical_bytes(), &req.signatures)?;
    if !signers.contains(&participant) {
        return Err(AppError::InvalidSignature(format!(
            "request is not signed by {:#x}",
            participant
        )));
    }

    let channels = store::channels_for_participant(&state.db, &participant).await?;
    let views: Vec<ChannelView> = channels.iter().map(ChannelView::from_channel).collect();
    Ok(vec![value_of(&views)?])
}

pub async fn get_app_definition(
    state: &AppState,
    req: &RpcMessage,
) -> Result<Vec<Value>, AppError> {
    let params: GetAppDefinitionParams = first_param(&req.payload.params)?;
    let session = store::get_app_session(&state.db, &params.app_session_id.to_ascii_lowercase())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("app session {}", params.app_session_id)))?;

    let definition = AppDefinition {
        protocol: session.protocol.clone(),
        participants: session
            .participants
            .iter()
            .map(|p| format!("{:#x}", p))
            .collect(),
        weights: session.weights.clone(),
        quorum: session.quorum,
        challenge: session.challenge,
        nonce: session.nonce,
    };
    Ok(vec![value_of(&definition)?])
}

/// Audit records of the authenticated caller, newest first.
pub async fn get_rpc_history(state: &AppState, caller: Address) -> Result<Vec<Value>, AppError> {
    let records = store::rpc_history(&state.db, &participant_account(&caller)).await?;
    let views: Vec<RpcRecordView> = records.iter().map(RpcRecordView::from_record).collect();
    Ok(vec![value_of(&views)?])
}

// =============================================================================
// APP SESSIONS
// =============================================================================

/// Open a virtual application session and pool the participants' funds.
pub async fn create_app_session(
    state: &AppState,
    req: &RpcMessage,
) -> Result<Vec<Value>, AppError> {
    let params: CreateAppSessionParams = first_param(&req.payload.params)?;
    let mut definition = normalize_definition(&params.definition)?;

    validate_definition(&definition, params.allocations.len())?;

    // A zero nonce is filled in from the request timestamp, making retries
    // of the same signed request land on the same session id.
    if definition.nonce == 0 {
        definition.nonce = req.payload.timestamp;
    }

    let session_id = session_account(&definition)?;
    let participants = definition
        .participants
        .iter()
        .map(|p| parse_address(p))
        .collect::<Result<Vec<_>, _>>()?;

    let allocations = normalize_allocations(&participants, &params.allocations)?;
    for (_, asset, amount) in &allocations {
        if *amount > Decimal::ZERO && !state.assets.knows_symbol(asset) {
            return Err(AppError::NotFound(format!("asset {}", asset)));
        }
    }

    // Every allocation with a positive amount must be signed by its
    // participant; zero allocations need no signature.
    let signers = recover_signers(&req.payload.canonical_bytes(), &req.signatures)?;
    for (participant, _, amount) in &allocations {
        if *amount > Decimal::ZERO && !signers.contains(participant) {
            return Err(AppError::InvalidSignature(format!(
                "missing signature from {:#x}",
                participant
            )));
        }
    }

    let now = now_secs();
    let mut tx = state.db.begin().await?;

    if store::get_app_session(&mut *tx, &session_id).await?.is_some() {
        return Err(AppError::Conflict(format!(
            "app session {} already exists",
            session_id
        )));
    }

    for (participant, asset, amount) in &allocations {
        store::transfer(
            &mut tx,
            &participant_account(participant),
            &session_id,
            &participant_account(participant),
            asset,
            *amount,
            now,
        )
        .await?;
    }

    let session = AppSession {
        session_id: session_id.clone(),
        protocol: definition.protocol.clone(),
        participants: participants.clone(),
        weights: definition.weights.clone(),
        quorum: definition.quorum,
        challenge: definition.challenge,
        nonce: definition.nonce,
        version: req.payload.timestamp,
        status: AppSessionStatus::Open,
        created_at: now,
        updated_at: now,
    };
    store::insert_app_session(&mut tx, &session).await?;

    tx.commit().await?;

    info!(
        session_id = %session.session_id,
        participants = session.participants.len(),
        "app session created"
    );

    notify_balances(state, &participants).await;

    Ok(vec![value_of(&AppSessionView::from_session(&session))?])
}

/// Close a session and redistribute its pooled funds.
pub async fn close_app_session(
    state: &AppState,
    req: &RpcMessage,
) -> Result<Vec<Value>, AppError> {
    let params: CloseAppSessionParams = first_param(&req.payload.params)?;
    let session_id = params.app_session_id.to_ascii_lowercase();

    for allocation in &params.allocations {
        if !state.assets.knows_symbol(&allocation.asset_symbol) {
            return Err(AppError::NotFound(format!(
                "asset {}",
                allocation.asset_symbol
            )));
        }
    }

    let now = now_secs();
    let mut tx = state.db.begin().await?;

    let session = store::get_app_session(&mut *tx, &session_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("app session {}", session_id)))?;
    if session.status != AppSessionStatus::Open {
        return Err(AppError::Conflict(format!(
            "app session {} is not open",
            session_id
        )));
    }

    let signers = recover_signers(&req.payload.canonical_bytes(), &req.signatures)?;
    let got = signer_weights(&session, &signers)?;
    if got < session.quorum as i64 {
        return Err(AppError::QuorumNotMet {
            got,
            need: session.quorum as i64,
        });
    }

    let balances = store::session_balances(&mut tx, &session.session_id).await?;
    let postings = close_plan(&session.participants, &balances, &params.allocations)?;

    for posting in &postings {
        store::debit(
            &mut tx,
            &session.session_id,
            &posting.participant,
            &posting.asset,
            posting.release,
            now,
        )
        .await?;
        store::credit(
            &mut tx,
            &posting.participant,
            &posting.participant,
            &posting.asset,
            posting.payout,
            now,
        )
        .await?;
    }

    store::mark_session_closed(&mut tx, &session.session_id, req.payload.timestamp, now).await?;
    tx.commit().await?;

    info!(session_id = %session.session_id, "app session closed");

    notify_balances(state, &session.participants).await;

    let view = AppSessionView {
        app_session_id: session.session_id,
        version: req.payload.timestamp,
        status: AppSessionStatus::Closed.as_str(),
    };
    Ok(vec![value_of(&view)?])
}

// =============================================================================
// CHANNEL STATE SIGNING
// =============================================================================

/// Produce a broker-signed RESIZE state. The ledger is untouched here; the
/// chain reconciler applies the balance change when Resized lands on-chain.
pub async fn resize_channel(state: &AppState, req: &RpcMessage) -> Result<Vec<Value>, AppError> {
    let params: ResizeChannelParams = first_param(&req.payload.params)?;
    let channel = load_open_channel(state, &params.channel_id, req).await?;
    let destination = parse_address(&params.funds_destination)?;

    let asset = state
        .assets
        .by_token(channel.token, channel.chain_id)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "asset for token {:#x} on chain {}",
                channel.token, channel.chain_id
            ))
        })?;

    let change = params.participant_change;
    if change > Decimal::ZERO {
        // Moving off-chain balance into the channel requires cover.
        let mut tx = state.db.begin().await?;
        let available = store::balance(
            &mut tx,
            &participant_account(&channel.participant),
            &participant_account(&channel.participant),
            &asset.symbol,
        )
        .await?;
        tx.commit().await?;
        if available < change {
            return Err(AppError::InsufficientFunds {
                account: participant_account(&channel.participant),
                asset: asset.symbol.clone(),
                available: available.to_string(),
            });
        }
    }

    let raw_change = to_base_units(change.abs(), asset.decimals)?;
    if change < Decimal::ZERO && channel.amount < raw_change {
        return Err(AppError::Conflict(format!(
            "withdrawal {} exceeds channel amount {}",
            raw_change, channel.amount
        )));
    }

    let next_version = channel.version + 1;
    let state_data = signed_delta_word(raw_change, change < Decimal::ZERO);
    let allocations = vec![
        StateAllocation {
            destination,
            token: channel.token,
            amount: if change > Decimal::ZERO {
                raw_change
            } else {
                U256::ZERO
            },
        },
        StateAllocation {
            destination: state.broker_address,
            token: channel.token,
            amount: U256::ZERO,
        },
    ];

    signed_state_response(
        state,
        &channel,
        StateIntent::Resize,
        next_version,
        &state_data,
        allocations,
    )
    .await
}

/// Produce a broker-signed FINALIZE state paying the participant's tracked
/// balance out of the channel. The Closed event performs the debit.
pub async fn close_channel(state: &AppState, req: &RpcMessage) -> Result<Vec<Value>, AppError> {
    let params: CloseChannelParams = first_param(&req.payload.params)?;
    let channel = load_open_channel(state, &params.channel_id, req).await?;
    let destination = parse_address(&params.funds_destination)?;

    let asset = state
        .assets
        .by_token(channel.token, channel.chain_id)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "asset for token {:#x} on chain {}",
                channel.token, channel.chain_id
            ))
        })?;

    let mut tx = state.db.begin().await?;
    let balance = store::balance(
        &mut tx,
        &participant_account(&channel.participant),
        &participant_account(&channel.participant),
        &asset.symbol,
    )
    .await?;
    tx.commit().await?;

    let raw_balance = to_base_units(balance, asset.decimals)?;
    if channel.amount < raw_balance {
        // The deposit no longer covers the off-chain balance.
        return Err(AppError::ResizeFirst);
    }

    let allocations = vec![
        StateAllocation {
            destination,
            token: channel.token,
            amount: raw_balance,
        },
        StateAllocation {
            destination: state.broker_address,
            token: channel.token,
            amount: channel.amount - raw_balance,
        },
    ];

    signed_state_response(
        state,
        &channel,
        StateIntent::Finalize,
        channel.version + 1,
        &[],
        allocations,
    )
    .await
}

async fn load_open_channel(
    state: &AppState,
    channel_id: &str,
    req: &RpcMessage,
) -> Result<Channel, AppError> {
    let channel_id = channel_account(channel_id);
    let channel = store::get_channel(&state.db, &channel_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("channel {}", channel_id)))?;
    if channel.status != ChannelStatus::Open {
        return Err(AppError::Conflict(format!(
            "channel {} is {}",
            channel_id,
            channel.status.as_str()
        )));
    }

    let signers = recover_signers(&req.payload.canonical_bytes(), &req.signatures)?;
    if !signers.contains(&channel.participant) {
        return Err(AppError::InvalidSignature(format!(
            "request is not signed by channel participant {:#x}",
            channel.participant
        )));
    }
    Ok(channel)
}

async fn signed_state_response(
    state: &AppState,
    channel: &Channel,
    intent: StateIntent,
    version: u64,
    state_data: &[u8],
    allocations: Vec<StateAllocation>,
) -> Result<Vec<Value>, AppError> {
    let channel_hash = parse_b256(&channel.channel_id)?;
    let (digest, signature) = sign_channel_state(
        &state.signer,
        channel_hash,
        intent,
        version,
        state_data,
        &allocations,
    )
    .await?;

    let view = ChannelStateView {
        channel_id: channel.channel_id.clone(),
        intent: intent.as_u8(),
        version,
        state_data: format!("0x{}", hex::encode(state_data)),
        allocations: allocations
            .iter()
            .map(StateAllocationView::from_allocation)
            .collect(),
        state_hash: format!("{:#x}", digest),
        server_signature: signature,
    };
    Ok(vec![value_of(&view)?])
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Push a balance-update to every live connection of each participant.
pub async fn notify_balances(state: &AppState, participants: &[Address]) {
    let mut seen = HashSet::new();
    for participant in participants {
        if !seen.insert(*participant) {
            continue;
        }
        match store::account_balances(
            &state.db,
            &participant_account(participant),
            &participant_account(participant),
        )
        .await
        {
            Ok(balances) => {
                pubsub::push_balance_update(
                    &state.subscriptions,
                    &state.signer,
                    *participant,
                    &balances,
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(participant = %format!("{:#x}", participant), error = %e,
                    "balance notification skipped");
            }
        }
    }
}

// =============================================================================
// PURE VALIDATION HELPERS
// =============================================================================

/// Structural checks on a session definition before any store work.
fn validate_definition(
    definition: &AppDefinition,
    allocation_count: usize,
) -> Result<(), AppError> {
    let n = definition.participants.len();
    if n < 2 {
        return Err(AppError::Malformed(
            "definition needs at least 2 participants".into(),
        ));
    }
    if definition.weights.len() != n || allocation_count != n {
        return Err(AppError::Malformed(format!(
            "participants ({}), weights ({}), allocations ({}) must have equal length",
            n,
            definition.weights.len(),
            allocation_count
        )));
    }
    let achievable: i64 = definition.weights.iter().filter(|w| **w > 0).sum();
    if achievable < definition.quorum as i64 {
        return Err(AppError::Malformed(format!(
            "quorum {} is not achievable with positive weights summing to {}",
            definition.quorum, achievable
        )));
    }
    Ok(())
}

/// Parse and validate create-allocations: known participants, no duplicates,
/// non-negative amounts. Returns (participant, asset, amount) triples.
fn normalize_allocations(
    participants: &[Address],
    allocations: &[AllocationParam],
) -> Result<Vec<(Address, String, Decimal)>, AppError> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        let participant = parse_address(&allocation.participant)?;
        if !participants.contains(&participant) {
            return Err(AppError::Malformed(format!(
                "allocation participant {:#x} is not in the definition",
                participant
            )));
        }
        if !seen.insert(participant) {
            return Err(AppError::Malformed(format!(
                "duplicate allocation for {:#x}",
                participant
            )));
        }
        if allocation.amount.is_sign_negative() {
            return Err(AppError::Malformed(format!(
                "allocation amount {} is negative",
                allocation.amount
            )));
        }
        normalized.push((
            participant,
            allocation.asset_symbol.to_ascii_lowercase(),
            allocation.amount,
        ));
    }
    Ok(normalized)
}

/// Sum the weights of the recovered signers against the session policy.
/// Duplicate, unknown, and non-positive-weight signers are rejected.
fn signer_weights(session: &AppSession, signers: &[Address]) -> Result<i64, AppError> {
    let mut seen = HashSet::new();
    let mut total = 0i64;
    for signer in signers {
        if !seen.insert(*signer) {
            return Err(AppError::InvalidSignature(format!(
                "duplicate signature from {:#x}",
                signer
            )));
        }
        let index = session
            .participants
            .iter()
            .position(|p| p == signer)
            .ok_or_else(|| {
                AppError::InvalidSignature(format!("{:#x} is not a session participant", signer))
            })?;
        let weight = session.weights[index];
        if weight <= 0 {
            return Err(AppError::InvalidSignature(format!(
                "{:#x} has no voting weight",
                signer
            )));
        }
        total += weight;
    }
    Ok(total)
}

/// One settlement leg of a session close: release the participant's full
/// in-session balance and pay out the allocated amount.
#[derive(Debug, PartialEq)]
struct ClosePosting {
    /// Lowercased participant address; doubles as the payout account id
    participant: String,
    asset: String,
    /// Debited from the session account (the recorded in-session balance)
    release: Decimal,
    /// Credited to the participant account (the stated allocation)
    payout: Decimal,
}

/// Validate close-allocations against pooled balances and produce the
/// settlement postings. Per-asset allocation sums must match the pooled
/// per-asset totals exactly; nothing may be created, destroyed, or left
/// behind.
fn close_plan(
    session_participants: &[Address],
    balances: &BTreeMap<(String, String), Decimal>,
    allocations: &[AllocationParam],
) -> Result<Vec<ClosePosting>, AppError> {
    let mut allocated: BTreeMap<(String, String), Decimal> = BTreeMap::new();
    let mut covered: HashSet<String> = HashSet::new();

    for allocation in allocations {
        let participant = parse_address(&allocation.participant)?;
        if !session_participants.contains(&participant) {
            return Err(AppError::AllocationMismatch(format!(
                "{:#x} is not a session participant",
                participant
            )));
        }
        if allocation.amount.is_sign_negative() {
            return Err(AppError::AllocationMismatch(format!(
                "allocation amount {} is negative",
                allocation.amount
            )));
        }
        let key = (
            format!("{:#x}", participant),
            allocation.asset_symbol.to_ascii_lowercase(),
        );
        if allocated.insert(key.clone(), allocation.amount).is_some() {
            return Err(AppError::AllocationMismatch(format!(
                "duplicate allocation for {} / {}",
                key.0, key.1
            )));
        }
        covered.insert(key.0);
    }

    for participant in session_participants {
        if !covered.contains(&format!("{:#x}", participant)) {
            return Err(AppError::AllocationMismatch(format!(
                "no allocation for participant {:#x}",
                participant
            )));
        }
    }

    // Per-asset conservation across the whole allocation set.
    let mut pooled_per_asset: BTreeMap<String, Decimal> = BTreeMap::new();
    for ((_, asset), amount) in balances {
        *pooled_per_asset.entry(asset.clone()).or_default() += *amount;
    }
    let mut allocated_per_asset: BTreeMap<String, Decimal> = BTreeMap::new();
    for ((_, asset), amount) in &allocated {
        *allocated_per_asset.entry(asset.clone()).or_default() += *amount;
    }
    let assets: HashSet<&String> = pooled_per_asset
        .keys()
        .chain(allocated_per_asset.keys())
        .collect();
    for asset in assets {
        let pooled = pooled_per_asset.get(asset).copied().unwrap_or_default();
        let stated = allocated_per_asset.get(asset).copied().unwrap_or_default();
        if pooled != stated {
            return Err(AppError::AllocationMismatch(format!(
                "{}: allocations sum to {}, session holds {}",
                asset, stated, pooled
            )));
        }
    }

    // Union of recorded balances and stated allocations.
    let mut keys: HashSet<(String, String)> = balances.keys().cloned().collect();
    keys.extend(allocated.keys().cloned());

    let mut postings: Vec<ClosePosting> = keys
        .into_iter()
        .map(|key| {
            let release = balances.get(&key).copied().unwrap_or_default();
            let payout = allocated.get(&key).copied().unwrap_or_default();
            ClosePosting {
                participant: key.0,
                asset: key.1,
                release,
                payout,
            }
        })
        .filter(|p| !p.release.is_zero() || !p.payout.is_zero())
        .collect();
    postings.sort_by(|a, b| (&a.participant, &a.asset).cmp(&(&b.participant, &b.asset)));
    Ok(postings)
}

/// 32-byte two's-complement word of a signed base-unit delta.
fn signed_delta_word(magnitude: U256, negative: bool) -> [u8; 32] {
    let value = if negative {
        (!magnitude).wrapping_add(U256::from(1u64))
    } else {
        magnitude
    };
    value.to_be_bytes::<32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::str::FromStr;

    const A: Address = address!("00000000000000000000000000000000000000aa");
    const B: Address = address!("00000000000000000000000000000000000000bb");
    const C: Address = address!("00000000000000000000000000000000000000cc");

    fn session(weights: Vec<i64>, quorum: u64) -> AppSession {
        AppSession {
            session_id: "0xsession".into(),
            protocol: "nitro-rpc".into(),
            participants: vec![A, B],
            weights,
            quorum,
            challenge: 86400,
            nonce: 1,
            version: 1,
            status: AppSessionStatus::Open,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn alloc(participant: Address, asset: &str, amount: &str) -> AllocationParam {
        AllocationParam {
            participant: format!("{:#x}", participant),
            asset_symbol: asset.into(),
            amount: Decimal::from_str(amount).unwrap(),
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn signer_weights_sums_known_signers() {
        let session = session(vec![1, 2], 2);
        assert_eq!(signer_weights(&session, &[A, B]).unwrap(), 3);
        assert_eq!(signer_weights(&session, &[B]).unwrap(), 2);
    }

    #[test]
    fn signer_weights_rejects_duplicates_unknowns_and_zero_weight() {
        let session = session(vec![1, 0], 1);
        assert!(matches!(
            signer_weights(&session, &[A, A]),
            Err(AppError::InvalidSignature(_))
        ));
        assert!(matches!(
            signer_weights(&session, &[C]),
            Err(AppError::InvalidSignature(_))
        ));
        assert!(matches!(
            signer_weights(&session, &[B]),
            Err(AppError::InvalidSignature(_))
        ));
    }

    #[test]
    fn definition_validation_catches_bad_shapes() {
        let mut definition = AppDefinition {
            protocol: "nitro-rpc".into(),
            participants: vec![format!("{:#x}", A), format!("{:#x}", B)],
            weights: vec![1, 1],
            quorum: 2,
            challenge: 0,
            nonce: 0,
        };
        assert!(validate_definition(&definition, 2).is_ok());

        // Mismatched allocation count
        assert!(validate_definition(&definition, 3).is_err());

        // Unachievable quorum: positive weights sum below quorum
        definition.weights = vec![1, -5];
        assert!(validate_definition(&definition, 2).is_err());

        // Fewer than two participants
        definition.participants.truncate(1);
        definition.weights = vec![1];
        assert!(validate_definition(&definition, 1).is_err());
    }

    #[test]
    fn close_plan_redistributes_pooled_funds() {
        // A funded 100, B funded nothing; close pays A 30, B 70
        let mut balances = BTreeMap::new();
        balances.insert((format!("{:#x}", A), "usdc".to_string()), dec("100"));

        let postings = close_plan(
            &[A, B],
            &balances,
            &[alloc(A, "usdc", "30"), alloc(B, "usdc", "70")],
        )
        .expect("plan failed");

        assert_eq!(
            postings,
            vec![
                ClosePosting {
                    participant: format!("{:#x}", A),
                    asset: "usdc".into(),
                    release: dec("100"),
                    payout: dec("30"),
                },
                ClosePosting {
                    participant: format!("{:#x}", B),
                    asset: "usdc".into(),
                    release: Decimal::ZERO,
                    payout: dec("70"),
                },
            ]
        );

        // Session drains exactly: releases equal pooled, payouts equal pooled
        let released: Decimal = postings.iter().map(|p| p.release).sum();
        let paid: Decimal = postings.iter().map(|p| p.payout).sum();
        assert_eq!(released, dec("100"));
        assert_eq!(paid, dec("100"));
    }

    #[test]
    fn close_plan_rejects_sum_mismatch() {
        let mut balances = BTreeMap::new();
        balances.insert((format!("{:#x}", A), "usdc".to_string()), dec("100"));

        // 50 + 30 = 80 != 100
        let err = close_plan(
            &[A, B],
            &balances,
            &[alloc(A, "usdc", "50"), alloc(B, "usdc", "30")],
        )
        .unwrap_err();
        assert!(matches!(err, AppError::AllocationMismatch(_)));
    }

    #[test]
    fn close_plan_rejects_unknown_missing_and_duplicate_participants() {
        let mut balances = BTreeMap::new();
        balances.insert((format!("{:#x}", A), "usdc".to_string()), dec("10"));

        // C is not in the session
        assert!(close_plan(
            &[A, B],
            &balances,
            &[alloc(A, "usdc", "10"), alloc(C, "usdc", "0")],
        )
        .is_err());

        // B never appears
        assert!(close_plan(&[A, B], &balances, &[alloc(A, "usdc", "10")]).is_err());

        // Duplicate (participant, asset) rows
        assert!(close_plan(
            &[A, B],
            &balances,
            &[
                alloc(A, "usdc", "5"),
                alloc(A, "usdc", "5"),
                alloc(B, "usdc", "0"),
            ],
        )
        .is_err());
    }

    #[test]
    fn close_plan_conserves_every_asset_independently() {
        let mut balances = BTreeMap::new();
        balances.insert((format!("{:#x}", A), "usdc".to_string()), dec("10"));
        balances.insert((format!("{:#x}", B), "weth".to_string()), dec("2"));

        // Swapping asset totals across assets must not pass
        let err = close_plan(
            &[A, B],
            &balances,
            &[alloc(A, "weth", "10"), alloc(B, "usdc", "2")],
        )
        .unwrap_err();
        assert!(matches!(err, AppError::AllocationMismatch(_)));

        // Correct per-asset totals pass
        assert!(close_plan(
            &[A, B],
            &balances,
            &[alloc(A, "usdc", "10"), alloc(B, "weth", "2")],
        )
        .is_ok());
    }

    #[test]
    fn signed_delta_word_encodes_two_complement() {
        let positive = signed_delta_word(U256::from(5u64), false);
        assert_eq!(positive[31], 5);
        assert_eq!(positive[0], 0);

        let negative = signed_delta_word(U256::from(1u64), true);
        assert_eq!(negative, [0xff; 32]);
    }
}
