// error.rs - Error types for the broker

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // =========================================================================
    // Protocol Errors - problems with the RPC envelope or parameters
    // =========================================================================
    /// Envelope, array length, or field type invalid
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Method requires an authenticated connection
    #[error("connection is not authenticated")]
    Unauthenticated,

    /// A signature does not recover the required address, or the challenge is stale
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Required parameter absent or empty
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    // =========================================================================
    // Ledger Errors - problems with balances and sessions
    // =========================================================================
    /// Balance check in a transfer failed
    #[error("insufficient funds: account {account} has {available} {asset}")]
    InsufficientFunds {
        account: String,
        asset: String,
        available: String,
    },

    /// Summed signer weights below the session quorum
    #[error("quorum not met: got {got}, need {need}")]
    QuorumNotMet { got: i64, need: i64 },

    /// Close-session allocations disagree with the pooled balances
    #[error("allocation mismatch: {0}")]
    AllocationMismatch(String),

    /// Referenced channel/session/asset does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation conflicts with current state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Off-chain balance exceeds the on-chain channel amount
    #[error("channel must be resized before close")]
    ResizeFirst,

    // =========================================================================
    // Infrastructure Errors - store and chain failures
    // =========================================================================
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Chain RPC call or contract write failed
    #[error("chain rpc failed: {0}")]
    ChainRpc(String),

    /// Catch-all for unexpected internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wire error code surfaced to clients in an `error` response.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Malformed(_) => "fails-malformed",
            AppError::Unauthenticated => "fails-unauthenticated",
            AppError::InvalidSignature(_) => "fails-invalid-signature",
            AppError::MissingParameter(_) => "fails-missing-parameter",
            AppError::InsufficientFunds { .. } => "fails-insufficient-funds",
            AppError::QuorumNotMet { .. } => "fails-quorum-not-met",
            AppError::AllocationMismatch(_) => "fails-allocation-mismatch",
            AppError::NotFound(_) => "fails-not-found",
            AppError::Conflict(_) => "fails-conflict",
            AppError::ResizeFirst => "fails-resize-first",
            AppError::Database(_) | AppError::ChainRpc(_) | AppError::Internal(_) => {
                "fails-internal"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_stay_internal() {
        assert_eq!(AppError::ChainRpc("timeout".into()).code(), "fails-internal");
        assert_eq!(AppError::Internal("boom".into()).code(), "fails-internal");
    }

    #[test]
    fn ledger_errors_map_to_their_codes() {
        let err = AppError::InsufficientFunds {
            account: "0xabc".into(),
            asset: "usdc".into(),
            available: "10".into(),
        };
        assert_eq!(err.code(), "fails-insufficient-funds");
        assert_eq!(
            AppError::QuorumNotMet { got: 1, need: 2 }.code(),
            "fails-quorum-not-met"
        );
        assert_eq!(AppError::ResizeFirst.code(), "fails-resize-first");
    }
}
