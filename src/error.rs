//! Error types for the transaction manager

use ethers::types::Address;
use thiserror::Error;

/// Main error type for the transaction manager
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Signing key for {address:?} unavailable on chain {chain_id}")]
    KeyUnavailable { address: Address, chain_id: u64 },

    #[error("Network error on chain {chain_id}: {message}")]
    Network { chain_id: u64, message: String },

    #[error("Transaction underpriced on chain {chain_id}: {message}")]
    Underpriced { chain_id: u64, message: String },

    #[error("Transaction rejected by chain {chain_id}: {reason}")]
    Rejected { chain_id: u64, reason: String },

    #[error("Account {address:?} on chain {chain_id} is already in use by another process")]
    ResourceBusy { chain_id: u64, address: Address },

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Gas price ceiling exceeded: fee {fee} above limit {limit}")]
    FeeCeilingExceeded { fee: String, limit: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Queue full for {address:?} on chain {chain_id}: {queued} unstarted transactions")]
    QueueFull {
        chain_id: u64,
        address: Address,
        queued: u64,
    },

    #[error("Rebroadcast aborted at nonce {nonce} (succeeded: {succeeded:?}): {source}")]
    RebroadcastAborted {
        nonce: u64,
        succeeded: Vec<u64>,
        #[source]
        source: Box<TxmError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxmError::Network { .. }
                | TxmError::Timeout { .. }
                | TxmError::KeyUnavailable { .. }
                | TxmError::Underpriced { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxmError::Rejected { .. }
                | TxmError::FeeCeilingExceeded { .. }
                | TxmError::Wallet(_)
                | TxmError::RebroadcastAborted { .. }
        )
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;
