// pubsub.rs - Balance and channel push notifications
//
// The router registers each authenticated connection here; handlers and
// chain reconcilers push "bu" / "cu" frames to every live connection of an
// affected participant. Delivery is best-effort: a disconnected subscriber
// misses updates and reconciles on reconnect via get_ledger_balances and
// get_channels.

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use tracing::{debug, warn};

use crate::crypto::sign_payload;
use crate::error::AppError;
use crate::model::{Channel, ChannelView, LedgerBalance};
use crate::rpc::{now_secs, Direction, RpcMessage, RpcPayload};

/// Balance update notification method
pub const METHOD_BALANCE_UPDATE: &str = "bu";
/// Channel update notification method
pub const METHOD_CHANNEL_UPDATE: &str = "cu";

static NEXT_NOTIFICATION_ID: AtomicU64 = AtomicU64::new(1);

/// Live connections per authenticated participant. A participant may hold
/// several connections; each registers under its connection id.
#[derive(Default)]
pub struct Subscriptions {
    inner: RwLock<HashMap<Address, HashMap<u64, UnboundedSender<String>>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, address: Address, conn_id: u64, sender: UnboundedSender<String>) {
        let mut inner = self.inner.write().await;
        inner.entry(address).or_default().insert(conn_id, sender);
    }

    pub async fn unsubscribe(&self, address: Address, conn_id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(connections) = inner.get_mut(&address) {
            connections.remove(&conn_id);
            if connections.is_empty() {
                inner.remove(&address);
            }
        }
    }

    /// Deliver a frame to every live connection of `address`, pruning any
    /// connection whose channel has gone away.
    pub async fn send_to(&self, address: Address, frame: &str) {
        let mut inner = self.inner.write().await;
        if let Some(connections) = inner.get_mut(&address) {
            connections.retain(|_, sender| sender.send(frame.to_string()).is_ok());
            if connections.is_empty() {
                inner.remove(&address);
            }
        }
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, address: Address) -> usize {
        self.inner
            .read()
            .await
            .get(&address)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

/// Build a broker-signed notification frame.
async fn signed_notification(
    signer: &PrivateKeySigner,
    method: &str,
    params: Vec<serde_json::Value>,
) -> Result<String, AppError> {
    let payload = RpcPayload::new(
        NEXT_NOTIFICATION_ID.fetch_add(1, Ordering::Relaxed),
        method,
        params,
        now_secs(),
    );
    let signature = sign_payload(signer, &payload.canonical_bytes()).await?;
    Ok(RpcMessage {
        direction: Direction::Response,
        payload,
        signatures: vec![signature],
    }
    .to_wire())
}

/// Push the participant's current balances to all their connections.
pub async fn push_balance_update(
    subscriptions: &Subscriptions,
    signer: &PrivateKeySigner,
    address: Address,
    balances: &[LedgerBalance],
) {
    let params = match serde_json::to_value(balances) {
        Ok(value) => vec![value],
        Err(e) => {
            warn!(error = %e, "balance update serialization failed");
            return;
        }
    };
    match signed_notification(signer, METHOD_BALANCE_UPDATE, params).await {
        Ok(frame) => {
            debug!(participant = %format!("{:#x}", address), "balance update pushed");
            subscriptions.send_to(address, &frame).await;
        }
        Err(e) => warn!(error = %e, "balance update signing failed"),
    }
}

/// Push a channel state change to the channel's participant.
pub async fn push_channel_update(
    subscriptions: &Subscriptions,
    signer: &PrivateKeySigner,
    channel: &Channel,
) {
    let view = ChannelView::from_channel(channel);
    let params = match serde_json::to_value(&view) {
        Ok(value) => vec![value],
        Err(e) => {
            warn!(error = %e, "channel update serialization failed");
            return;
        }
    };
    match signed_notification(signer, METHOD_CHANNEL_UPDATE, params).await {
        Ok(frame) => {
            debug!(channel_id = %channel.channel_id, "channel update pushed");
            subscriptions.send_to(channel.participant, &frame).await;
        }
        Err(e) => warn!(error = %e, "channel update signing failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::recover_signer;
    use alloy::primitives::address;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn notifications_reach_every_connection_of_the_participant() {
        let subscriptions = Subscriptions::new();
        let addr = address!("00000000000000000000000000000000000000aa");
        let other = address!("00000000000000000000000000000000000000bb");

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        subscriptions.subscribe(addr, 1, tx1).await;
        subscriptions.subscribe(addr, 2, tx2).await;
        subscriptions.subscribe(other, 3, tx3).await;

        subscriptions.send_to(addr, "frame").await;

        assert_eq!(rx1.recv().await.unwrap(), "frame");
        assert_eq!(rx2.recv().await.unwrap(), "frame");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connections_are_pruned_on_send() {
        let subscriptions = Subscriptions::new();
        let addr = address!("00000000000000000000000000000000000000aa");

        let (tx, rx) = mpsc::unbounded_channel();
        subscriptions.subscribe(addr, 1, tx).await;
        drop(rx);

        subscriptions.send_to(addr, "frame").await;
        assert_eq!(subscriptions.subscriber_count(addr).await, 0);
    }

    #[tokio::test]
    async fn balance_update_is_a_signed_response_envelope() {
        let subscriptions = Subscriptions::new();
        let signer = PrivateKeySigner::random();
        let addr = address!("00000000000000000000000000000000000000aa");

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriptions.subscribe(addr, 1, tx).await;

        let balances = vec![LedgerBalance {
            asset_symbol: "usdc".into(),
            amount: Decimal::new(100, 0),
        }];
        push_balance_update(&subscriptions, &signer, addr, &balances).await;

        let frame = rx.recv().await.expect("no frame delivered");
        let message = RpcMessage::parse(&frame).expect("unparseable notification");
        assert_eq!(message.direction, Direction::Response);
        assert_eq!(message.payload.method, METHOD_BALANCE_UPDATE);
        assert_eq!(message.signatures.len(), 1);

        let recovered = recover_signer(
            &message.payload.canonical_bytes(),
            &message.signatures[0],
        )
        .expect("recovery failed");
        assert_eq!(recovered, signer.address());
    }
}
