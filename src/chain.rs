// chain.rs - Custody contract event reconciler
//
// One reconciler task per supported chain. Each tails the custody
// contract's event log from a persisted checkpoint, decodes the four event
// kinds, and applies each one inside a single store transaction that also
// advances the checkpoint, so replays after a crash are idempotent.
//
// A Created event for a channel naming this broker triggers the auto-join:
// the broker signs the INITIALIZE state and submits join(channel_id, 1, sig)
// back to the contract.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, I256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolEvent;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::accounts::participant_account;
use crate::assets::{to_asset_units, AssetRegistry};
use crate::config::ChainConfig;
use crate::crypto::{sign_channel_state, StateIntent};
use crate::error::AppError;
use crate::model::{Channel, ChannelStatus, StateAllocation};
use crate::pubsub::{self, Subscriptions};
use crate::rpc::now_secs;
use crate::service::AppState;
use crate::store;

sol! {
    #[sol(rpc)]
    contract Custody {
        struct ChannelDef {
            address[] participants;
            address adjudicator;
            uint64 challenge;
            uint64 nonce;
        }

        struct Allocation {
            address destination;
            address token;
            uint256 amount;
        }

        event Created(bytes32 indexed channelId, ChannelDef channel, Allocation[] initial);
        event Joined(bytes32 indexed channelId, uint256 index);
        event Resized(bytes32 indexed channelId, int256[] deltaAllocations);
        event Closed(bytes32 indexed channelId, Allocation[] finalAllocations);

        function join(bytes32 channelId, uint256 index, bytes calldata sig) external;
    }
}

/// Idle delay between successful polls.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential backoff bounds for failed polls.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Bounded attempts for the auto-join submission.
const JOIN_ATTEMPTS: u32 = 3;

/// The broker's on-chain position in one token.
#[derive(Debug, Clone)]
pub struct TokenHolding {
    pub token: Address,
    pub available: U256,
    pub channel_count: u64,
}

pub struct ChainReconciler {
    chain: ChainConfig,
    db: PgPool,
    assets: Arc<AssetRegistry>,
    signer: PrivateKeySigner,
    broker_address: Address,
    subscriptions: Arc<Subscriptions>,
}

impl ChainReconciler {
    pub fn from_state(state: &AppState, chain: ChainConfig) -> Self {
        Self {
            chain,
            db: state.db.clone(),
            assets: state.assets.clone(),
            signer: state.signer.clone(),
            broker_address: state.broker_address,
            subscriptions: state.subscriptions.clone(),
        }
    }

    /// Poll the chain forever. Failures back off exponentially and never
    /// advance the checkpoint, so the failed event is retried.
    pub async fn run(self) {
        let url = match self.chain.rpc_url.parse() {
            Ok(url) => url,
            Err(e) => {
                warn!(chain_id = self.chain.chain_id, error = %e, "invalid chain rpc url");
                return;
            }
        };
        let provider = ProviderBuilder::new()
            .disable_recommended_fillers()
            .connect_http(url);

        info!(
            chain_id = self.chain.chain_id,
            custody = %format!("{:#x}", self.chain.custody),
            "chain reconciler started"
        );

        let mut backoff = BACKOFF_BASE;
        loop {
            match self.poll_once(&provider).await {
                Ok(applied) => {
                    backoff = BACKOFF_BASE;
                    if applied > 0 {
                        self.log_holdings().await;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    warn!(
                        chain_id = self.chain.chain_id,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "reconciler poll failed"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Fetch and apply any new custody logs. Returns how many were applied.
    async fn poll_once(&self, provider: &RootProvider) -> Result<u64, AppError> {
        let latest = provider
            .get_block_number()
            .await
            .map_err(|e| AppError::ChainRpc(e.to_string()))?;

        let mut last_applied = store::checkpoint(&self.db, self.chain.chain_id).await?;
        let from_block = last_applied.map(|(block, _)| block).unwrap_or(0);
        if latest < from_block {
            return Ok(0);
        }

        let filter = Filter::new()
            .address(self.chain.custody)
            .from_block(from_block)
            .to_block(latest);
        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| AppError::ChainRpc(e.to_string()))?;

        let mut applied = 0;
        for log in logs {
            let (Some(block), Some(index)) = (log.block_number, log.log_index) else {
                continue; // pending log, wait for inclusion
            };
            if !is_new(last_applied, block, index) {
                continue;
            }
            self.apply_log(&log, block, index).await?;
            last_applied = Some((block, index));
            applied += 1;
        }
        Ok(applied)
    }

    async fn apply_log(&self, log: &Log, block: u64, index: u64) -> Result<(), AppError> {
        let topic = log.topic0().copied().unwrap_or_default();
        if topic == Custody::Created::SIGNATURE_HASH {
            let event = decode_event::<Custody::Created>(log)?;
            self.apply_created(event, block, index).await
        } else if topic == Custody::Joined::SIGNATURE_HASH {
            let event = decode_event::<Custody::Joined>(log)?;
            self.apply_joined(event, block, index).await
        } else if topic == Custody::Resized::SIGNATURE_HASH {
            let event = decode_event::<Custody::Resized>(log)?;
            self.apply_resized(event, block, index).await
        } else if topic == Custody::Closed::SIGNATURE_HASH {
            let event = decode_event::<Custody::Closed>(log)?;
            self.apply_closed(event, block, index).await
        } else {
            // Unrelated custody log; just move the checkpoint along.
            self.advance_only(block, index).await
        }
    }

    // =========================================================================
    // EVENT APPLICATION
    // =========================================================================

    async fn apply_created(
        &self,
        event: Custody::Created,
        block: u64,
        index: u64,
    ) -> Result<(), AppError> {
        let channel_id = format!("{:#x}", event.channelId);

        if event.channel.participants.len() < 2 || event.initial.is_empty() {
            warn!(channel_id = %channel_id, "malformed Created event, skipping");
            return self.advance_only(block, index).await;
        }
        let participant = event.channel.participants[0];
        if event.channel.participants[1] != self.broker_address {
            // Someone else's channel on the shared custody contract.
            debug!(channel_id = %channel_id, "Created for another broker, skipping");
            return self.advance_only(block, index).await;
        }

        let token = event.initial[0].token;
        // An unknown token is retried: the operator may still be rolling out
        // the asset configuration.
        self.assets
            .by_token(token, self.chain.chain_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "asset for token {:#x} on chain {}",
                    token, self.chain.chain_id
                ))
            })?;

        let total = event
            .initial
            .iter()
            .fold(U256::ZERO, |acc, allocation| acc + allocation.amount);
        let now = now_secs();

        let mut tx = self.db.begin().await?;
        if store::get_channel(&mut *tx, &channel_id).await?.is_some() {
            store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
            tx.commit().await?;
            return Ok(());
        }
        if store::open_channel_exists(&mut tx, &participant, &token, self.chain.chain_id).await? {
            warn!(
                channel_id = %channel_id,
                participant = %format!("{:#x}", participant),
                "conflicting open channel exists, ignoring Created"
            );
            store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
            tx.commit().await?;
            return Ok(());
        }

        let channel = Channel {
            channel_id: channel_id.clone(),
            participant,
            token,
            chain_id: self.chain.chain_id,
            adjudicator: event.channel.adjudicator,
            amount: total,
            nonce: event.channel.nonce,
            version: 0,
            status: ChannelStatus::Joining,
            created_at: now,
            updated_at: now,
        };
        store::upsert_channel(&mut tx, &channel).await?;
        store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
        tx.commit().await?;

        info!(channel_id = %channel_id, amount = %total, "channel created, joining");

        // Auto-join runs after the row is durable; a failed submission
        // leaves the channel in `joining` and is visible in the logs.
        let allocations: Vec<StateAllocation> = event
            .initial
            .iter()
            .map(|a| StateAllocation {
                destination: a.destination,
                token: a.token,
                amount: a.amount,
            })
            .collect();
        if let Err(e) = self.submit_join(event.channelId, &allocations).await {
            warn!(channel_id = %channel_id, error = %e, "auto-join failed");
        }
        Ok(())
    }

    async fn apply_joined(
        &self,
        event: Custody::Joined,
        block: u64,
        index: u64,
    ) -> Result<(), AppError> {
        let channel_id = format!("{:#x}", event.channelId);
        let Some(mut channel) = store::get_channel(&self.db, &channel_id).await? else {
            // Foreign channels share the custody log; nothing to reconcile.
            debug!(channel_id = %channel_id, "Joined for unknown channel, skipping");
            return self.advance_only(block, index).await;
        };
        if channel.status == ChannelStatus::Open {
            return self.advance_only(block, index).await;
        }

        let asset = self
            .assets
            .by_token(channel.token, self.chain.chain_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "asset for token {:#x} on chain {}",
                    channel.token, self.chain.chain_id
                ))
            })?;
        let amount = to_asset_units(channel.amount, asset.decimals)?;
        let now = now_secs();

        let mut tx = self.db.begin().await?;
        channel.status = ChannelStatus::Open;
        channel.updated_at = now;
        store::upsert_channel(&mut tx, &channel).await?;
        store::credit(
            &mut tx,
            &participant_account(&channel.participant),
            &participant_account(&channel.participant),
            &asset.symbol,
            amount,
            now,
        )
        .await?;
        store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
        tx.commit().await?;

        info!(channel_id = %channel_id, amount = %amount, asset = %asset.symbol, "channel open");
        self.notify(&channel).await;
        Ok(())
    }

    async fn apply_resized(
        &self,
        event: Custody::Resized,
        block: u64,
        index: u64,
    ) -> Result<(), AppError> {
        let channel_id = format!("{:#x}", event.channelId);
        let Some(mut channel) = store::get_channel(&self.db, &channel_id).await? else {
            debug!(channel_id = %channel_id, "Resized for unknown channel, skipping");
            return self.advance_only(block, index).await;
        };
        if event.deltaAllocations.is_empty() {
            warn!(channel_id = %channel_id, "Resized without deltas, skipping");
            return self.advance_only(block, index).await;
        }

        let asset = self
            .assets
            .by_token(channel.token, self.chain.chain_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "asset for token {:#x} on chain {}",
                    channel.token, self.chain.chain_id
                ))
            })?;

        let delta_sum = event
            .deltaAllocations
            .iter()
            .fold(I256::ZERO, |acc, delta| acc + *delta);
        let participant_delta = event.deltaAllocations[0];
        let delta_amount = to_asset_units(participant_delta.unsigned_abs(), asset.decimals)?;
        let now = now_secs();

        channel.amount = apply_delta(channel.amount, delta_sum)?;
        channel.version += 1;
        channel.updated_at = now;

        let account = participant_account(&channel.participant);
        let mut tx = self.db.begin().await?;
        store::upsert_channel(&mut tx, &channel).await?;
        if participant_delta.is_negative() {
            store::debit(&mut tx, &account, &account, &asset.symbol, delta_amount, now).await?;
        } else {
            store::credit(&mut tx, &account, &account, &asset.symbol, delta_amount, now).await?;
        }
        store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
        tx.commit().await?;

        info!(
            channel_id = %channel_id,
            delta = %participant_delta,
            amount = %channel.amount,
            "channel resized"
        );
        self.notify(&channel).await;
        Ok(())
    }

    async fn apply_closed(
        &self,
        event: Custody::Closed,
        block: u64,
        index: u64,
    ) -> Result<(), AppError> {
        let channel_id = format!("{:#x}", event.channelId);
        let Some(mut channel) = store::get_channel(&self.db, &channel_id).await? else {
            debug!(channel_id = %channel_id, "Closed for unknown channel, skipping");
            return self.advance_only(block, index).await;
        };
        if channel.status == ChannelStatus::Closed {
            return self.advance_only(block, index).await;
        }

        let asset = self
            .assets
            .by_token(channel.token, self.chain.chain_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "asset for token {:#x} on chain {}",
                    channel.token, self.chain.chain_id
                ))
            })?;
        let amount = to_asset_units(channel.amount, asset.decimals)?;
        let now = now_secs();

        let account = participant_account(&channel.participant);
        let mut tx = self.db.begin().await?;
        // The deposit leaving the channel zeroes whatever part of it is
        // still attributed to the participant off-chain.
        let debited =
            store::debit_clamped(&mut tx, &account, &account, &asset.symbol, amount, now).await?;
        channel.amount = U256::ZERO;
        channel.status = ChannelStatus::Closed;
        channel.version += 1;
        channel.updated_at = now;
        store::upsert_channel(&mut tx, &channel).await?;
        store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
        tx.commit().await?;

        info!(channel_id = %channel_id, debited = %debited, "channel closed");
        self.notify(&channel).await;
        Ok(())
    }

    /// Advance the checkpoint without any ledger effect.
    async fn advance_only(&self, block: u64, index: u64) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;
        store::advance_checkpoint(&mut tx, self.chain.chain_id, block, index).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Sign the INITIALIZE state and submit join(channel_id, 1, sig) through
    /// a wallet-attached provider, with bounded retries.
    async fn submit_join(
        &self,
        channel_id: B256,
        allocations: &[StateAllocation],
    ) -> Result<(), AppError> {
        let (_, signature) = sign_channel_state(
            &self.signer,
            channel_id,
            StateIntent::Initialize,
            0,
            &[],
            allocations,
        )
        .await?;
        let sig_bytes = hex::decode(signature.strip_prefix("0x").unwrap_or(&signature))
            .map_err(|e| AppError::Internal(format!("signature encoding failed: {}", e)))?;

        let url = self
            .chain
            .rpc_url
            .parse()
            .map_err(|e| AppError::Internal(format!("invalid rpc url: {}", e)))?;
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url);
        let custody = Custody::new(self.chain.custody, provider);

        let mut backoff = BACKOFF_BASE;
        let mut last_error = String::new();
        for attempt in 1..=JOIN_ATTEMPTS {
            let call = custody.join(channel_id, U256::from(1u64), sig_bytes.clone().into());
            match call.send().await {
                Ok(pending) => match pending.watch().await {
                    Ok(tx_hash) => {
                        info!(
                            channel_id = %format!("{:#x}", channel_id),
                            tx_hash = %format!("{:#x}", tx_hash),
                            "join submitted"
                        );
                        return Ok(());
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                channel_id = %format!("{:#x}", channel_id),
                attempt,
                error = %last_error,
                "join attempt failed"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
        Err(AppError::ChainRpc(last_error))
    }

    async fn notify(&self, channel: &Channel) {
        let account = participant_account(&channel.participant);
        match store::account_balances(&self.db, &account, &account).await {
            Ok(balances) => {
                pubsub::push_balance_update(
                    &self.subscriptions,
                    &self.signer,
                    channel.participant,
                    &balances,
                )
                .await;
            }
            Err(e) => warn!(error = %e, "balance notification skipped"),
        }
        pubsub::push_channel_update(&self.subscriptions, &self.signer, channel).await;
    }

    /// The broker's on-chain position per token, for metrics consumers.
    pub async fn holdings(&self) -> Result<Vec<TokenHolding>, AppError> {
        let rows = store::broker_holdings(&self.db, self.chain.chain_id).await?;
        Ok(rows
            .into_iter()
            .map(|(token, available, channel_count)| TokenHolding {
                token,
                available,
                channel_count,
            })
            .collect())
    }

    async fn log_holdings(&self) {
        match self.holdings().await {
            Ok(holdings) => {
                for holding in holdings {
                    info!(
                        chain_id = self.chain.chain_id,
                        token = %format!("{:#x}", holding.token),
                        available = %holding.available,
                        channels = holding.channel_count,
                        "broker holdings"
                    );
                }
            }
            Err(e) => warn!(error = %e, "holdings query failed"),
        }
    }
}

// =============================================================================
// PURE HELPERS
// =============================================================================

/// Whether a log at (block, index) is past the checkpoint.
fn is_new(checkpoint: Option<(u64, u64)>, block: u64, index: u64) -> bool {
    match checkpoint {
        None => true,
        Some((cp_block, cp_index)) => (block, index) > (cp_block, cp_index),
    }
}

/// Apply a signed delta to an unsigned channel amount.
fn apply_delta(amount: U256, delta: I256) -> Result<U256, AppError> {
    if delta.is_negative() {
        amount
            .checked_sub(delta.unsigned_abs())
            .ok_or_else(|| AppError::Internal("channel amount underflow".into()))
    } else {
        amount
            .checked_add(delta.unsigned_abs())
            .ok_or_else(|| AppError::Internal("channel amount overflow".into()))
    }
}

fn decode_event<E: SolEvent>(log: &Log) -> Result<E, AppError> {
    log.log_decode::<E>()
        .map(|decoded| decoded.inner.data)
        .map_err(|e| AppError::ChainRpc(format!("event decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn checkpoint_predicate_orders_by_block_then_index() {
        assert!(is_new(None, 0, 0));

        let checkpoint = Some((10, 3));
        assert!(!is_new(checkpoint, 9, 9));
        assert!(!is_new(checkpoint, 10, 2));
        assert!(!is_new(checkpoint, 10, 3)); // replay of the same log
        assert!(is_new(checkpoint, 10, 4));
        assert!(is_new(checkpoint, 11, 0));
    }

    #[test]
    fn delta_application_handles_both_signs() {
        let amount = U256::from(100u64);

        let grown = apply_delta(amount, I256::from_str("50").unwrap()).unwrap();
        assert_eq!(grown, U256::from(150u64));

        let shrunk = apply_delta(amount, I256::from_str("-40").unwrap()).unwrap();
        assert_eq!(shrunk, U256::from(60u64));

        // Withdrawing more than the deposit cannot produce a channel amount
        assert!(apply_delta(amount, I256::from_str("-101").unwrap()).is_err());
    }

    #[test]
    fn event_signatures_are_distinct() {
        let signatures = [
            Custody::Created::SIGNATURE_HASH,
            Custody::Joined::SIGNATURE_HASH,
            Custody::Resized::SIGNATURE_HASH,
            Custody::Closed::SIGNATURE_HASH,
        ];
        for (i, a) in signatures.iter().enumerate() {
            for b in signatures.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
