// main.rs - Entry point for the clearnode broker

mod accounts; // Account id constructors
mod assets; // Asset registry and unit conversion
mod chain; // Custody event reconciler
mod config; // Configuration from environment
mod crypto; // Keccak digests and ECDSA signatures
mod error; // Custom error types
mod model; // Data structures
mod pubsub; // Balance/channel push notifications
mod router; // Websocket transport and dispatch
mod rpc; // Wire envelope codec
mod service; // Ledger operations
mod store; // Database operations

use std::net::SocketAddr;
use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use tracing::info;

use crate::assets::{Asset, AssetRegistry};
use crate::chain::ChainReconciler;
use crate::config::Config;
use crate::pubsub::Subscriptions;
use crate::router::create_router;
use crate::service::AppState;
use crate::store::{init_db, seed_assets};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // RUST_LOG=info cargo run  <- set log level via env var
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env()?);
    let port = config.port;

    // Connect to PostgreSQL and make sure the schema exists
    let db = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    init_db(&db).await?;

    // Build the asset registry and mirror it into the store
    let registry = Arc::new(AssetRegistry::new(&config.assets)?);
    let assets: Vec<Asset> = registry.all().to_vec();
    seed_assets(&db, &assets).await?;
    info!("{} assets registered", assets.len());

    // The broker's one signing key; losing it is fatal at startup
    let signer: PrivateKeySigner = config.broker_private_key.parse()?;
    let broker_address = signer.address();
    info!("Broker address: {}", broker_address);

    let state = AppState {
        db,
        config: config.clone(),
        assets: registry,
        signer,
        broker_address,
        subscriptions: Arc::new(Subscriptions::new()),
    };

    // One reconciler task per configured chain
    for chain in &config.chains {
        let reconciler = ChainReconciler::from_state(&state, chain.clone());
        tokio::spawn(reconciler.run());
    }

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Clearnode listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
