// store.rs - Database operations
//
// All PostgreSQL interactions live here:
// - Schema bootstrap on startup
// - The append-only double-entry ledger and its balance aggregation
// - Channel, app-session, audit-record, and checkpoint queries
//
// Mutating business logic always runs inside a Transaction passed down from
// the handler; balances are aggregated inside the same transaction that
// consumes them.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::assets::Asset;
use crate::crypto::parse_address;
use crate::error::AppError;
use crate::model::{
    AppSession, AppSessionStatus, Channel, ChannelStatus, LedgerBalance, RpcRecord,
};

pub type Tx<'a> = Transaction<'a, Postgres>;

// =============================================================================
// DATABASE INITIALIZATION
// =============================================================================

/// Create tables and indexes if they don't exist. Safe to run repeatedly.
pub async fn init_db(db: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ledger (\
            id BIGSERIAL PRIMARY KEY,\
            account_id TEXT NOT NULL,\
            participant TEXT NOT NULL,\
            asset_symbol TEXT NOT NULL,\
            credit NUMERIC(38,18) NOT NULL DEFAULT 0,\
            debit NUMERIC(38,18) NOT NULL DEFAULT 0,\
            created_at BIGINT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ledger_account_asset_idx \
         ON ledger (account_id, asset_symbol)",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ledger_account_participant_idx \
         ON ledger (account_id, participant)",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channels (\
            channel_id TEXT PRIMARY KEY,\
            participant TEXT NOT NULL,\
            status TEXT NOT NULL,\
            token TEXT NOT NULL,\
            chain_id BIGINT NOT NULL,\
            amount TEXT NOT NULL,\
            nonce BIGINT NOT NULL,\
            version BIGINT NOT NULL,\
            adjudicator TEXT NOT NULL,\
            created_at BIGINT NOT NULL,\
            updated_at BIGINT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS app_sessions (\
            session_id TEXT PRIMARY KEY,\
            protocol TEXT NOT NULL,\
            participants TEXT[] NOT NULL,\
            weights BIGINT[] NOT NULL,\
            quorum BIGINT NOT NULL,\
            challenge BIGINT NOT NULL,\
            nonce BIGINT NOT NULL,\
            version BIGINT NOT NULL,\
            status TEXT NOT NULL,\
            created_at BIGINT NOT NULL,\
            updated_at BIGINT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS assets (\
            token_address TEXT NOT NULL,\
            chain_id BIGINT NOT NULL,\
            symbol TEXT NOT NULL,\
            decimals INT NOT NULL,\
            PRIMARY KEY (token_address, chain_id)\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS rpc_records (\
            id BIGSERIAL PRIMARY KEY,\
            sender TEXT NOT NULL,\
            req_id BIGINT NOT NULL,\
            method TEXT NOT NULL,\
            params TEXT NOT NULL,\
            ts BIGINT NOT NULL,\
            req_sig TEXT[] NOT NULL,\
            response TEXT NOT NULL,\
            res_sig TEXT[] NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chain_checkpoints (\
            chain_id BIGINT PRIMARY KEY,\
            block_number BIGINT NOT NULL,\
            log_index BIGINT NOT NULL\
        )",
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Mirror the configured assets into the assets table.
pub async fn seed_assets(db: &PgPool, assets: &[Asset]) -> Result<(), sqlx::Error> {
    for asset in assets {
        sqlx::query(
            "INSERT INTO assets (token_address, chain_id, symbol, decimals) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (token_address, chain_id) DO UPDATE SET \
                symbol = EXCLUDED.symbol, \
                decimals = EXCLUDED.decimals",
        )
        .bind(format!("{:#x}", asset.token))
        .bind(asset.chain_id as i64)
        .bind(&asset.symbol)
        .bind(asset.decimals as i32)
        .execute(db)
        .await?;
    }
    Ok(())
}

// =============================================================================
// LEDGER
// =============================================================================
// Rows are append-only. Exactly one of credit/debit is non-zero per row;
// zero-amount operations emit no row at all.

async fn insert_entry(
    tx: &mut Tx<'_>,
    account_id: &str,
    participant: &str,
    asset: &str,
    credit: Decimal,
    debit: Decimal,
    at: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ledger (account_id, participant, asset_symbol, credit, debit, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(account_id)
    .bind(participant)
    .bind(asset)
    .bind(credit)
    .bind(debit)
    .bind(at as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Balance of one (account, participant, asset) triple, inside the caller's
/// transaction.
pub async fn balance(
    tx: &mut Tx<'_>,
    account_id: &str,
    participant: &str,
    asset: &str,
) -> Result<Decimal, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(credit - debit), 0) AS balance \
         FROM ledger \
         WHERE account_id = $1 AND participant = $2 AND asset_symbol = $3",
    )
    .bind(account_id)
    .bind(participant)
    .bind(asset)
    .fetch_one(&mut **tx)
    .await?;
    row.try_get("balance")
}

/// Per-asset balances of one (account, participant) pair, outside any
/// transaction. Used for queries and push notifications.
pub async fn account_balances(
    db: &PgPool,
    account_id: &str,
    participant: &str,
) -> Result<Vec<LedgerBalance>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT asset_symbol, SUM(credit - debit) AS amount \
         FROM ledger \
         WHERE account_id = $1 AND participant = $2 \
         GROUP BY asset_symbol \
         ORDER BY asset_symbol",
    )
    .bind(account_id)
    .bind(participant)
    .fetch_all(db)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(LedgerBalance {
                asset_symbol: row.try_get("asset_symbol")?,
                amount: row.try_get("amount")?,
            })
        })
        .collect()
}

/// All (participant, asset) balances pooled under a session account, keyed
/// for deterministic iteration.
pub async fn session_balances(
    tx: &mut Tx<'_>,
    session_account: &str,
) -> Result<BTreeMap<(String, String), Decimal>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT participant, asset_symbol, SUM(credit - debit) AS amount \
         FROM ledger \
         WHERE account_id = $1 \
         GROUP BY participant, asset_symbol",
    )
    .bind(session_account)
    .fetch_all(&mut **tx)
    .await?;

    let mut balances = BTreeMap::new();
    for row in rows {
        let participant: String = row.try_get("participant")?;
        let asset: String = row.try_get("asset_symbol")?;
        let amount: Decimal = row.try_get("amount")?;
        balances.insert((participant, asset), amount);
    }
    Ok(balances)
}

/// Move `amount` of `asset` from `src` to `dst` for one participant.
/// Zero amounts are a no-op; a short source balance rejects the transfer.
pub async fn transfer(
    tx: &mut Tx<'_>,
    src: &str,
    dst: &str,
    participant: &str,
    asset: &str,
    amount: Decimal,
    at: u64,
) -> Result<(), AppError> {
    if amount.is_zero() {
        return Ok(());
    }
    let available = balance(tx, src, participant, asset).await?;
    if available < amount {
        return Err(AppError::InsufficientFunds {
            account: src.to_string(),
            asset: asset.to_string(),
            available: available.to_string(),
        });
    }
    insert_entry(tx, src, participant, asset, Decimal::ZERO, amount, at).await?;
    insert_entry(tx, dst, participant, asset, amount, Decimal::ZERO, at).await?;
    Ok(())
}

/// Append a credit row. Zero amounts emit nothing.
pub async fn credit(
    tx: &mut Tx<'_>,
    account_id: &str,
    participant: &str,
    asset: &str,
    amount: Decimal,
    at: u64,
) -> Result<(), sqlx::Error> {
    if amount.is_zero() {
        return Ok(());
    }
    insert_entry(tx, account_id, participant, asset, amount, Decimal::ZERO, at).await
}

/// Append a debit row, rejecting any debit that would drive the balance
/// negative.
pub async fn debit(
    tx: &mut Tx<'_>,
    account_id: &str,
    participant: &str,
    asset: &str,
    amount: Decimal,
    at: u64,
) -> Result<(), AppError> {
    if amount.is_zero() {
        return Ok(());
    }
    let available = balance(tx, account_id, participant, asset).await?;
    if available < amount {
        return Err(AppError::InsufficientFunds {
            account: account_id.to_string(),
            asset: asset.to_string(),
            available: available.to_string(),
        });
    }
    insert_entry(tx, account_id, participant, asset, Decimal::ZERO, amount, at).await?;
    Ok(())
}

/// Append a debit row clamped to the current balance, returning what was
/// actually debited. A channel close with a partially spent deposit leaves
/// the account at exactly zero.
pub async fn debit_clamped(
    tx: &mut Tx<'_>,
    account_id: &str,
    participant: &str,
    asset: &str,
    amount: Decimal,
    at: u64,
) -> Result<Decimal, sqlx::Error> {
    let available = balance(tx, account_id, participant, asset).await?;
    let debited = amount.min(available);
    if debited > Decimal::ZERO {
        insert_entry(tx, account_id, participant, asset, Decimal::ZERO, debited, at).await?;
    }
    Ok(debited)
}

// =============================================================================
// CHANNELS
// =============================================================================

fn channel_from_row(row: &PgRow) -> Result<Channel, AppError> {
    let participant: String = row.try_get("participant").map_err(AppError::Database)?;
    let token: String = row.try_get("token").map_err(AppError::Database)?;
    let adjudicator: String = row.try_get("adjudicator").map_err(AppError::Database)?;
    let amount: String = row.try_get("amount").map_err(AppError::Database)?;
    let status: String = row.try_get("status").map_err(AppError::Database)?;

    Ok(Channel {
        channel_id: row.try_get("channel_id").map_err(AppError::Database)?,
        participant: parse_address(&participant)?,
        token: parse_address(&token)?,
        chain_id: row.try_get::<i64, _>("chain_id").map_err(AppError::Database)? as u64,
        adjudicator: parse_address(&adjudicator)?,
        amount: U256::from_str(&amount)
            .map_err(|_| AppError::Internal(format!("corrupt channel amount: {}", amount)))?,
        nonce: row.try_get::<i64, _>("nonce").map_err(AppError::Database)? as u64,
        version: row.try_get::<i64, _>("version").map_err(AppError::Database)? as u64,
        status: ChannelStatus::parse(&status)?,
        created_at: row.try_get::<i64, _>("created_at").map_err(AppError::Database)? as u64,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(AppError::Database)? as u64,
    })
}

const CHANNEL_COLUMNS: &str = "channel_id, participant, status, token, chain_id, amount, \
                               nonce, version, adjudicator, created_at, updated_at";

/// Insert or update a channel row.
pub async fn upsert_channel(tx: &mut Tx<'_>, channel: &Channel) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channels \
            (channel_id, participant, status, token, chain_id, amount, \
             nonce, version, adjudicator, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         ON CONFLICT (channel_id) DO UPDATE SET \
            status = EXCLUDED.status, \
            amount = EXCLUDED.amount, \
            version = EXCLUDED.version, \
            updated_at = EXCLUDED.updated_at",
    )
    .bind(&channel.channel_id)
    .bind(format!("{:#x}", channel.participant))
    .bind(channel.status.as_str())
    .bind(format!("{:#x}", channel.token))
    .bind(channel.chain_id as i64)
    .bind(channel.amount.to_string())
    .bind(channel.nonce as i64)
    .bind(channel.version as i64)
    .bind(format!("{:#x}", channel.adjudicator))
    .bind(channel.created_at as i64)
    .bind(channel.updated_at as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Load one channel by id.
pub async fn get_channel<'e, E>(executor: E, channel_id: &str) -> Result<Option<Channel>, AppError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {} FROM channels WHERE channel_id = $1",
        CHANNEL_COLUMNS
    ))
    .bind(channel_id)
    .fetch_optional(executor)
    .await
    .map_err(AppError::Database)?;

    row.as_ref().map(channel_from_row).transpose()
}

/// Channels owned by one participant, newest first.
pub async fn channels_for_participant(
    db: &PgPool,
    participant: &Address,
) -> Result<Vec<Channel>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM channels WHERE participant = $1 ORDER BY created_at DESC, channel_id DESC",
        CHANNEL_COLUMNS
    ))
    .bind(format!("{:#x}", participant))
    .fetch_all(db)
    .await
    .map_err(AppError::Database)?;

    rows.iter().map(channel_from_row).collect()
}

/// Whether a joining/open channel already exists for (participant, token, chain).
pub async fn open_channel_exists(
    tx: &mut Tx<'_>,
    participant: &Address,
    token: &Address,
    chain_id: u64,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM channels \
         WHERE participant = $1 AND token = $2 AND chain_id = $3 \
           AND status IN ('joining', 'open')",
    )
    .bind(format!("{:#x}", participant))
    .bind(format!("{:#x}", token))
    .bind(chain_id as i64)
    .fetch_one(&mut **tx)
    .await?;
    let count: i64 = row.try_get("cnt")?;
    Ok(count > 0)
}

/// The broker's on-chain position per token: (total open amount, channel count).
pub async fn broker_holdings(
    db: &PgPool,
    chain_id: u64,
) -> Result<Vec<(Address, U256, u64)>, AppError> {
    let rows = sqlx::query(
        "SELECT token, amount FROM channels WHERE chain_id = $1 AND status = 'open'",
    )
    .bind(chain_id as i64)
    .fetch_all(db)
    .await
    .map_err(AppError::Database)?;

    let mut per_token: BTreeMap<String, (U256, u64)> = BTreeMap::new();
    for row in rows {
        let token: String = row.try_get("token").map_err(AppError::Database)?;
        let amount: String = row.try_get("amount").map_err(AppError::Database)?;
        let amount = U256::from_str(&amount)
            .map_err(|_| AppError::Internal(format!("corrupt channel amount: {}", amount)))?;
        let entry = per_token.entry(token).or_insert((U256::ZERO, 0));
        entry.0 += amount;
        entry.1 += 1;
    }

    per_token
        .into_iter()
        .map(|(token, (total, count))| Ok((parse_address(&token)?, total, count)))
        .collect()
}

// =============================================================================
// APP SESSIONS
// =============================================================================

fn session_from_row(row: &PgRow) -> Result<AppSession, AppError> {
    let participants: Vec<String> = row.try_get("participants").map_err(AppError::Database)?;
    let status: String = row.try_get("status").map_err(AppError::Database)?;

    Ok(AppSession {
        session_id: row.try_get("session_id").map_err(AppError::Database)?,
        protocol: row.try_get("protocol").map_err(AppError::Database)?,
        participants: participants
            .iter()
            .map(|p| parse_address(p))
            .collect::<Result<Vec<_>, _>>()?,
        weights: row.try_get("weights").map_err(AppError::Database)?,
        quorum: row.try_get::<i64, _>("quorum").map_err(AppError::Database)? as u64,
        challenge: row.try_get::<i64, _>("challenge").map_err(AppError::Database)? as u64,
        nonce: row.try_get::<i64, _>("nonce").map_err(AppError::Database)? as u64,
        version: row.try_get::<i64, _>("version").map_err(AppError::Database)? as u64,
        status: AppSessionStatus::parse(&status)?,
        created_at: row.try_get::<i64, _>("created_at").map_err(AppError::Database)? as u64,
        updated_at: row.try_get::<i64, _>("updated_at").map_err(AppError::Database)? as u64,
    })
}

pub async fn insert_app_session(tx: &mut Tx<'_>, session: &AppSession) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO app_sessions \
            (session_id, protocol, participants, weights, quorum, challenge, \
             nonce, version, status, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(&session.session_id)
    .bind(&session.protocol)
    .bind(
        session
            .participants
            .iter()
            .map(|p| format!("{:#x}", p))
            .collect::<Vec<_>>(),
    )
    .bind(&session.weights)
    .bind(session.quorum as i64)
    .bind(session.challenge as i64)
    .bind(session.nonce as i64)
    .bind(session.version as i64)
    .bind(session.status.as_str())
    .bind(session.created_at as i64)
    .bind(session.updated_at as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_app_session<'e, E>(
    executor: E,
    session_id: &str,
) -> Result<Option<AppSession>, AppError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    // session_id is the primary key; the nonce ordering keeps the newest
    // definition first if historic duplicates ever exist.
    let row = sqlx::query(
        "SELECT session_id, protocol, participants, weights, quorum, challenge, \
                nonce, version, status, created_at, updated_at \
         FROM app_sessions WHERE session_id = $1 \
         ORDER BY nonce DESC LIMIT 1",
    )
    .bind(session_id)
    .fetch_optional(executor)
    .await
    .map_err(AppError::Database)?;

    row.as_ref().map(session_from_row).transpose()
}

pub async fn mark_session_closed(
    tx: &mut Tx<'_>,
    session_id: &str,
    version: u64,
    at: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE app_sessions SET status = 'closed', version = $2, updated_at = $3 \
         WHERE session_id = $1",
    )
    .bind(session_id)
    .bind(version as i64)
    .bind(at as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// =============================================================================
// RPC RECORDS
// =============================================================================

pub async fn insert_rpc_record(db: &PgPool, record: &RpcRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO rpc_records \
            (sender, req_id, method, params, ts, req_sig, response, res_sig) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&record.sender)
    .bind(record.req_id as i64)
    .bind(&record.method)
    .bind(&record.params)
    .bind(record.timestamp as i64)
    .bind(&record.req_sig)
    .bind(&record.response)
    .bind(&record.res_sig)
    .execute(db)
    .await?;
    Ok(())
}

/// Audit records for one sender, newest first.
pub async fn rpc_history(db: &PgPool, sender: &str) -> Result<Vec<RpcRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT sender, req_id, method, params, ts, req_sig, response, res_sig \
         FROM rpc_records WHERE sender = $1 \
         ORDER BY id DESC LIMIT 100",
    )
    .bind(sender)
    .fetch_all(db)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(RpcRecord {
                sender: row.try_get("sender")?,
                req_id: row.try_get::<i64, _>("req_id")? as u64,
                method: row.try_get("method")?,
                params: row.try_get("params")?,
                timestamp: row.try_get::<i64, _>("ts")? as u64,
                req_sig: row.try_get("req_sig")?,
                response: row.try_get("response")?,
                res_sig: row.try_get("res_sig")?,
            })
        })
        .collect()
}

// =============================================================================
// CHAIN CHECKPOINTS
// =============================================================================

/// The last applied (block_number, log_index) for a chain, if any event was
/// ever applied.
pub async fn checkpoint(db: &PgPool, chain_id: u64) -> Result<Option<(u64, u64)>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT block_number, log_index FROM chain_checkpoints WHERE chain_id = $1",
    )
    .bind(chain_id as i64)
    .fetch_optional(db)
    .await?;

    match row {
        Some(row) => {
            let block: i64 = row.try_get("block_number")?;
            let log: i64 = row.try_get("log_index")?;
            Ok(Some((block as u64, log as u64)))
        }
        None => Ok(None),
    }
}

/// Advance the checkpoint inside the transaction applying the event, so an
/// event and its checkpoint commit or roll back together.
pub async fn advance_checkpoint(
    tx: &mut Tx<'_>,
    chain_id: u64,
    block_number: u64,
    log_index: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO chain_checkpoints (chain_id, block_number, log_index) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (chain_id) DO UPDATE SET \
            block_number = EXCLUDED.block_number, \
            log_index = EXCLUDED.log_index",
    )
    .bind(chain_id as i64)
    .bind(block_number as i64)
    .bind(log_index as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
