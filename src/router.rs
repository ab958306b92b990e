// router.rs - Websocket transport and RPC dispatch
//
// One logical task per connection. The connection owns its auth state
// machine privately:
//
//   UNAUTH --auth_request--> CHALLENGED --auth_verify--> AUTH --*--> AUTH
//
// Every other method requires AUTH. Responses carry a single broker
// signature, and every request/response pair is written to the audit log
// before the response goes out on the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use alloy::primitives::Address;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{parse_address, recover_signers, sign_payload};
use crate::error::AppError;
use crate::model::{AuthChallengeView, AuthRequestParams, AuthVerifyParams, AuthVerifyView, RpcRecord};
use crate::rpc::{first_param, now_secs, Direction, RpcMessage, RpcPayload};
use crate::service::{self, AppState};
use crate::store;

/// Challenges expire this many seconds after issuance.
const CHALLENGE_TTL_SECS: u64 = 60;

/// Keep-alive ping cadence on idle sockets.
const KEEPALIVE_SECS: u64 = 30;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// ROUTER SETUP
// =============================================================================

/// Create the axum router: a health probe and the websocket endpoint.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Health check endpoint for load balancers and probes.
async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| connection_loop(state, socket))
}

// =============================================================================
// CONNECTION STATE
// =============================================================================

/// An outstanding auth challenge: the UUID we issued, who requested it, and
/// when it stops being acceptable.
#[derive(Debug, Clone)]
struct Challenge {
    nonce: String,
    address: Address,
    expires_at: u64,
}

/// Per-connection session state; private to the connection's task.
#[derive(Debug, Default)]
struct ConnSession {
    auth: Option<Address>,
    challenge: Option<Challenge>,
}

/// Check an auth_verify attempt against the outstanding challenge.
fn verify_challenge(
    challenge: &Challenge,
    address: Address,
    nonce: &str,
    now: u64,
) -> Result<(), AppError> {
    if challenge.address != address {
        return Err(AppError::InvalidSignature(
            "challenge was issued to a different address".into(),
        ));
    }
    if challenge.nonce != nonce {
        return Err(AppError::InvalidSignature("challenge mismatch".into()));
    }
    // Expiry exactly at the TTL boundary rejects.
    if now >= challenge.expires_at {
        return Err(AppError::InvalidSignature("challenge expired".into()));
    }
    Ok(())
}

// =============================================================================
// CONNECTION LOOP
// =============================================================================

async fn connection_loop(state: AppState, socket: WebSocket) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    debug!(conn_id, "connection opened");

    // Writer task: owns the sink, forwards queued frames, emits keep-alive
    // pings while idle. Ends when every sender is gone.
    let writer = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut session = ConnSession::default();
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if let Some(frame) =
                    handle_frame(&state, &mut session, conn_id, &tx, &text).await
                {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            // Pongs and binary frames are ignored; axum answers pings itself.
            _ => {}
        }
    }

    if let Some(address) = session.auth {
        state.subscriptions.unsubscribe(address, conn_id).await;
    }
    drop(tx);
    let _ = writer.await;
    debug!(conn_id, "connection closed");
}

/// Process one inbound frame and produce the signed response frame, if any.
async fn handle_frame(
    state: &AppState,
    session: &mut ConnSession,
    conn_id: u64,
    tx: &UnboundedSender<String>,
    text: &str,
) -> Option<String> {
    let message = match RpcMessage::parse(text) {
        Ok(message) => message,
        Err(malformed) => {
            warn!(conn_id, reason = %malformed.reason, "malformed frame");
            let error = AppError::Malformed(malformed.reason);
            let (frame, _) = sign_response(
                state,
                malformed.req_id,
                "error",
                vec![json!({"error": error.code()})],
            )
            .await?;
            return Some(frame);
        }
    };

    // Responses and notifications never originate from clients.
    if message.direction != Direction::Request {
        return None;
    }

    info!(
        conn_id,
        req_id = message.payload.req_id,
        method = %message.payload.method,
        "rpc request"
    );

    let (method, params) = match dispatch(state, session, conn_id, tx, &message).await {
        Ok(reply) => reply,
        Err(error) => {
            warn!(
                conn_id,
                method = %message.payload.method,
                code = error.code(),
                error = %error,
                "rpc request failed"
            );
            ("error".to_string(), vec![json!({"error": error.code()})])
        }
    };

    let (frame, res_sig) =
        sign_response(state, message.payload.req_id, &method, params).await?;

    // The audit record lands before the response leaves the broker.
    let record = RpcRecord {
        sender: session
            .auth
            .map(|a| format!("{:#x}", a))
            .unwrap_or_default(),
        req_id: message.payload.req_id,
        method: message.payload.method.clone(),
        params: Value::Array(message.payload.params.clone()).to_string(),
        timestamp: message.payload.timestamp,
        req_sig: message.signatures.clone(),
        response: frame.clone(),
        res_sig: vec![res_sig],
    };
    if let Err(e) = store::insert_rpc_record(&state.db, &record).await {
        warn!(conn_id, error = %e, "rpc record insert failed");
    }

    Some(frame)
}

/// Build and sign an outgoing response envelope.
async fn sign_response(
    state: &AppState,
    req_id: u64,
    method: &str,
    params: Vec<Value>,
) -> Option<(String, String)> {
    let payload = RpcPayload::new(req_id, method, params, now_secs());
    let signature = match sign_payload(&state.signer, &payload.canonical_bytes()).await {
        Ok(signature) => signature,
        Err(e) => {
            warn!(error = %e, "response signing failed");
            return None;
        }
    };
    let frame = RpcMessage {
        direction: Direction::Response,
        payload,
        signatures: vec![signature.clone()],
    }
    .to_wire();
    Some((frame, signature))
}

// =============================================================================
// DISPATCH
// =============================================================================

async fn dispatch(
    state: &AppState,
    session: &mut ConnSession,
    conn_id: u64,
    tx: &UnboundedSender<String>,
    message: &RpcMessage,
) -> Result<(String, Vec<Value>), AppError> {
    match message.payload.method.as_str() {
        "auth_request" => auth_request(session, message),
        "auth_verify" => auth_verify(state, session, conn_id, tx, message).await,
        method => {
            let caller = session.auth.ok_or(AppError::Unauthenticated)?;
            let params = match method {
                "ping" => return Ok(("pong".to_string(), Vec::new())),
                "get_config" => service::get_config(state).await?,
                "get_ledger_balances" => {
                    service::get_ledger_balances(state, caller, message).await?
                }
                "get_channels" => service::get_channels(state, message).await?,
                "get_app_definition" => service::get_app_definition(state, message).await?,
                "get_rpc_history" => service::get_rpc_history(state, caller).await?,
                "create_app_session" => service::create_app_session(state, message).await?,
                "close_app_session" => service::close_app_session(state, message).await?,
                "resize_channel" => service::resize_channel(state, message).await?,
                "close_channel" => service::close_channel(state, message).await?,
                other => {
                    return Err(AppError::Malformed(format!("unknown method: {}", other)))
                }
            };
            Ok((method.to_string(), params))
        }
    }
}

/// Issue a fresh challenge to a claimed address. The request itself must be
/// signed by that address.
fn auth_request(
    session: &mut ConnSession,
    message: &RpcMessage,
) -> Result<(String, Vec<Value>), AppError> {
    let params: AuthRequestParams = first_param(&message.payload.params)?;
    let address = parse_address(&params.address)?;

    let signers = recover_signers(&message.payload.canonical_bytes(), &message.signatures)?;
    if !signers.contains(&address) {
        return Err(AppError::InvalidSignature(
            "auth request is not signed by the claimed address".into(),
        ));
    }

    let nonce = Uuid::new_v4().to_string();
    session.challenge = Some(Challenge {
        nonce: nonce.clone(),
        address,
        expires_at: now_secs() + CHALLENGE_TTL_SECS,
    });

    let view = AuthChallengeView {
        challenge_message: nonce,
    };
    Ok((
        "auth_challenge".to_string(),
        vec![serde_json::to_value(view)
            .map_err(|e| AppError::Internal(format!("challenge serialization failed: {}", e)))?],
    ))
}

/// Complete the handshake: the signature must recover the claimed address
/// and the echoed challenge must be the outstanding, unexpired one. The
/// challenge is consumed either way.
async fn auth_verify(
    state: &AppState,
    session: &mut ConnSession,
    conn_id: u64,
    tx: &UnboundedSender<String>,
    message: &RpcMessage,
) -> Result<(String, Vec<Value>), AppError> {
    let params: AuthVerifyParams = first_param(&message.payload.params)?;
    let address = parse_address(&params.address)?;

    let challenge = session
        .challenge
        .take()
        .ok_or_else(|| AppError::InvalidSignature("no outstanding challenge".into()))?;
    verify_challenge(&challenge, address, &params.challenge, now_secs())?;

    let signers = recover_signers(&message.payload.canonical_bytes(), &message.signatures)?;
    if !signers.contains(&address) {
        return Err(AppError::InvalidSignature(
            "auth verify is not signed by the claimed address".into(),
        ));
    }

    session.auth = Some(address);
    state
        .subscriptions
        .subscribe(address, conn_id, tx.clone())
        .await;

    info!(conn_id, address = %format!("{:#x}", address), "connection authenticated");

    let view = AuthVerifyView {
        address: format!("{:#x}", address),
        success: true,
    };
    Ok((
        "auth_verify".to_string(),
        vec![serde_json::to_value(view)
            .map_err(|e| AppError::Internal(format!("verify serialization failed: {}", e)))?],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetRegistry;
    use crate::config::Config;
    use crate::pubsub::Subscriptions;
    use alloy::primitives::address;
    use alloy::signers::local::PrivateKeySigner;
    use std::sync::Arc;

    fn test_state() -> AppState {
        let signer = PrivateKeySigner::random();
        let broker_address = signer.address();
        AppState {
            // Lazy pool: no connection is made until a query runs, and these
            // tests never run one.
            db: sqlx::PgPool::connect_lazy("postgres://localhost/clearnode-test")
                .expect("lazy pool"),
            config: Arc::new(Config {
                port: 0,
                database_url: String::new(),
                broker_private_key: String::new(),
                chains: Vec::new(),
                assets: Vec::new(),
            }),
            assets: Arc::new(AssetRegistry::new(&[]).unwrap()),
            signer,
            broker_address,
            subscriptions: Arc::new(Subscriptions::new()),
        }
    }

    async fn signed_request(
        signer: &PrivateKeySigner,
        req_id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> RpcMessage {
        let payload = RpcPayload::new(req_id, method, params, now_secs());
        let signature = sign_payload(signer, &payload.canonical_bytes())
            .await
            .expect("signing failed");
        RpcMessage {
            direction: Direction::Request,
            payload,
            signatures: vec![signature],
        }
    }

    #[tokio::test]
    async fn methods_require_authentication() {
        let state = test_state();
        let mut session = ConnSession::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let message = RpcMessage {
            direction: Direction::Request,
            payload: RpcPayload::new(1, "ping", Vec::new(), now_secs()),
            signatures: Vec::new(),
        };
        let err = dispatch(&state, &mut session, 1, &tx, &message)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "fails-unauthenticated");
    }

    #[tokio::test]
    async fn full_handshake_then_ping() {
        let state = test_state();
        let mut session = ConnSession::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let user = PrivateKeySigner::random();
        let user_hex = format!("{:#x}", user.address());

        // auth_request issues a challenge
        let request = signed_request(
            &user,
            1,
            "auth_request",
            vec![json!({"address": user_hex})],
        )
        .await;
        let (method, params) = dispatch(&state, &mut session, 1, &tx, &request)
            .await
            .expect("auth_request failed");
        assert_eq!(method, "auth_challenge");
        let nonce = params[0]["challenge_message"].as_str().unwrap().to_string();
        assert!(session.auth.is_none());

        // auth_verify flips the connection to AUTH
        let verify = signed_request(
            &user,
            2,
            "auth_verify",
            vec![json!({"address": user_hex, "challenge": nonce})],
        )
        .await;
        let (method, _) = dispatch(&state, &mut session, 1, &tx, &verify)
            .await
            .expect("auth_verify failed");
        assert_eq!(method, "auth_verify");
        assert_eq!(session.auth, Some(user.address()));

        // ping now answers pong
        let ping = signed_request(&user, 3, "ping", Vec::new()).await;
        let (method, params) = dispatch(&state, &mut session, 1, &tx, &ping)
            .await
            .expect("ping failed");
        assert_eq!(method, "pong");
        assert!(params.is_empty());
    }

    #[tokio::test]
    async fn auth_request_rejects_foreign_signature() {
        let state = test_state();
        let mut session = ConnSession::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let user = PrivateKeySigner::random();
        let impostor = PrivateKeySigner::random();

        // Signed by the impostor but claiming the user's address
        let request = signed_request(
            &impostor,
            1,
            "auth_request",
            vec![json!({"address": format!("{:#x}", user.address())})],
        )
        .await;
        let err = dispatch(&state, &mut session, 1, &tx, &request)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "fails-invalid-signature");
        assert!(session.challenge.is_none());
    }

    #[tokio::test]
    async fn auth_verify_consumes_the_challenge() {
        let state = test_state();
        let mut session = ConnSession::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let user = PrivateKeySigner::random();
        let user_hex = format!("{:#x}", user.address());

        session.challenge = Some(Challenge {
            nonce: "right".into(),
            address: user.address(),
            expires_at: now_secs() + 60,
        });

        let verify = signed_request(
            &user,
            1,
            "auth_verify",
            vec![json!({"address": user_hex, "challenge": "wrong"})],
        )
        .await;
        let err = dispatch(&state, &mut session, 1, &tx, &verify)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "fails-invalid-signature");

        // A second attempt with the right nonce fails too: consumed
        let retry = signed_request(
            &user,
            2,
            "auth_verify",
            vec![json!({"address": user_hex, "challenge": "right"})],
        )
        .await;
        let err = dispatch(&state, &mut session, 1, &tx, &retry)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "fails-invalid-signature");
        assert!(session.auth.is_none());
    }

    #[test]
    fn challenge_expiry_is_exact() {
        let addr = address!("00000000000000000000000000000000000000aa");
        let challenge = Challenge {
            nonce: "n".into(),
            address: addr,
            expires_at: 1_000,
        };

        assert!(verify_challenge(&challenge, addr, "n", 999).is_ok());
        assert!(verify_challenge(&challenge, addr, "n", 1_000).is_err());
        assert!(verify_challenge(&challenge, addr, "n", 1_001).is_err());
    }

    #[test]
    fn challenge_binds_address_and_nonce() {
        let addr = address!("00000000000000000000000000000000000000aa");
        let other = address!("00000000000000000000000000000000000000bb");
        let challenge = Challenge {
            nonce: "n".into(),
            address: addr,
            expires_at: 1_000,
        };

        assert!(verify_challenge(&challenge, other, "n", 0).is_err());
        assert!(verify_challenge(&challenge, addr, "m", 0).is_err());
    }
}
