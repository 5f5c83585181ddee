//! Ledger store: durable record of transactions and their attempts
//!
//! Handles:
//! - Transaction creation and point queries scoped by (chain, account)
//! - Attempt history with a single canonical attempt per transaction
//! - Idempotent terminal transitions
//! - Reaping of old finished transactions
//!
//! Every multi-row transition is atomic: either the full change is written
//! or none of it is.

mod memory;
mod models;
mod postgres;

pub use memory::InMemoryTxStore;
pub use models::{
    AttemptId, AttemptState, BlockInfo, NewTransaction, Transaction, TransactionStats, TxAttempt,
    TxId, TxState,
};
pub use postgres::PgTxStore;

use crate::error::TxmResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};

#[async_trait]
pub trait TxStore: Send + Sync {
    /// Insert a validated request as an Unstarted transaction
    async fn create_transaction(&self, request: &NewTransaction) -> TxmResult<TxId>;

    /// Load a transaction with its attempts, newest first
    async fn get_transaction(&self, tx_id: TxId) -> TxmResult<Transaction>;

    /// Non-terminal transactions: InProgress by nonce, then Unstarted by age
    async fn find_in_flight(&self, chain_id: u64, address: Address) -> TxmResult<Vec<Transaction>>;

    /// Transactions holding a nonce in `[begin, end]`, by nonce
    async fn find_in_nonce_range(
        &self,
        chain_id: u64,
        address: Address,
        begin: u64,
        end: u64,
    ) -> TxmResult<Vec<Transaction>>;

    /// Confirmed transactions whose receipt block is at or above `min_block`
    async fn find_recently_confirmed(
        &self,
        chain_id: u64,
        address: Address,
        min_block: u64,
    ) -> TxmResult<Vec<Transaction>>;

    /// Accounts with InProgress transactions, or Confirmed ones whose receipt
    /// block is at or above `min_block`, sorted
    async fn find_active_accounts(&self, chain_id: u64, min_block: u64) -> TxmResult<Vec<Address>>;

    /// Highest nonce ever assigned to the account
    async fn latest_nonce(&self, chain_id: u64, address: Address) -> TxmResult<Option<u64>>;

    async fn count_by_state(&self, chain_id: u64, address: Address, state: TxState)
        -> TxmResult<u64>;

    /// Move an Unstarted transaction to InProgress with its first attempt.
    ///
    /// Fails if the transaction already left Unstarted or the nonce is taken.
    async fn start_transaction(&self, tx_id: TxId, attempt: &TxAttempt) -> TxmResult<()>;

    /// Append a new attempt for an InProgress transaction at its nonce;
    /// every earlier unconfirmed attempt becomes Superseded.
    async fn record_attempt(&self, attempt: &TxAttempt) -> TxmResult<()>;

    /// Make an existing attempt canonical again for a resubmission of its
    /// exact bytes; every other unconfirmed attempt becomes Superseded.
    /// Returns the attempt as stored.
    async fn reuse_attempt(&self, attempt_id: AttemptId) -> TxmResult<TxAttempt>;

    /// A node accepted (or already had) the attempt. Sets `broadcast_at`
    /// once and `last_sent_at` every time.
    async fn mark_attempt_broadcast(&self, attempt_id: AttemptId, at: DateTime<Utc>)
        -> TxmResult<()>;

    async fn mark_attempt_underpriced(&self, attempt_id: AttemptId) -> TxmResult<()>;

    /// Stamp broadcast attempts of in-progress transactions that have no
    /// broadcast block yet; returns how many were stamped.
    async fn set_broadcast_before_block(&self, chain_id: u64, head: u64) -> TxmResult<u64>;

    /// Record the block holding the receipt, or clear it with `None`
    async fn set_attempt_inclusion(
        &self,
        attempt_id: AttemptId,
        block: Option<(u64, Option<H256>)>,
    ) -> TxmResult<()>;

    /// Confirm with the given attempt; the others are Superseded.
    /// Returns false when the transaction was already terminal.
    async fn mark_confirmed(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
        block: &BlockInfo,
    ) -> TxmResult<bool>;

    /// Demote a Confirmed transaction whose receipt vanished back to InProgress
    async fn revert_confirmation(&self, tx_id: TxId) -> TxmResult<()>;

    /// Returns false when the transaction was already terminal
    async fn mark_errored(&self, tx_id: TxId, reason: &str) -> TxmResult<bool>;

    /// Returns false when the transaction was already terminal
    async fn mark_fatal(&self, tx_id: TxId, reason: &str) -> TxmResult<bool>;

    /// Operator action: Errored or Fatal back into the queue
    async fn requeue(&self, tx_id: TxId) -> TxmResult<TxState>;

    /// Delete Confirmed transactions whose receipt block is below
    /// `min_block_to_keep` and Fatal ones, both only if created before
    /// `created_before`. Returns how many transactions were deleted.
    async fn reap_before(
        &self,
        chain_id: u64,
        min_block_to_keep: u64,
        created_before: DateTime<Utc>,
    ) -> TxmResult<u64>;

    async fn stats(&self) -> TxmResult<TransactionStats>;

    async fn health_check(&self) -> TxmResult<()>;
}
