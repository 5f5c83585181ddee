//! Head-driven reconciliation of in-flight transactions
//!
//! On every new head, for each enabled account and each account with work
//! left in the ledger:
//! 1. Resync the nonce cursor (also yields the mined count)
//! 2. Re-check recently confirmed transactions for re-orgs
//! 3. Match in-flight attempts against receipts; confirm, wait, resend or bump
//! 4. Start queued transactions
//!
//! Accounts whose key is no longer enabled only get steps 1 to 3, without
//! anything that needs a signature.

use super::context::ChainContext;
use crate::chain::ReceiptInfo;
use crate::error::{TxmError, TxmResult};
use crate::locks::{AccountLease, AccountLeases};
use crate::store::{AttemptState, BlockInfo, Transaction, TxAttempt, TxState};

use chrono::Utc;
use ethers::types::Address;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often finished transactions are deleted, and how old they must be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperPolicy {
    pub interval: Duration,
    pub threshold: Duration,
}

/// Reconciliation loop for one chain
pub struct Confirmer {
    ctx: Arc<ChainContext>,
    leases: Arc<dyn AccountLeases>,
    head_timeout: Duration,
    reaper: Option<ReaperPolicy>,
}

impl Confirmer {
    pub fn new(ctx: Arc<ChainContext>, leases: Arc<dyn AccountLeases>, head_timeout: Duration) -> Self {
        Self {
            ctx,
            leases,
            head_timeout,
            reaper: None,
        }
    }

    pub fn with_reaper(mut self, policy: ReaperPolicy) -> Self {
        self.reaper = Some(policy);
        self
    }

    /// Take the leases for every enabled account, then process heads until
    /// shutdown. Fails fast with `ResourceBusy` if an account is owned elsewhere.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> TxmResult<()> {
        let chain_id = self.ctx.chain_id;
        let _leases = self.acquire_leases().await?;

        let mut heads = self
            .ctx
            .client
            .clone()
            .subscribe_new_heads(self.ctx.policy.poll_interval);

        let mut reap_timer = tokio::time::interval(
            self.reaper
                .map_or(Duration::from_secs(3_600), |reaper| reaper.interval),
        );
        reap_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_head = None;

        info!("Confirmer started for chain {}", chain_id);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Confirmer for chain {} shutting down", chain_id);
                    break;
                }
                _ = reap_timer.tick(), if self.reaper.is_some() => {
                    if let Some(head) = last_head {
                        if let Err(e) = self.reap(head).await {
                            error!("Reaper failed on chain {}: {}", chain_id, e);
                        }
                    }
                }
                head = heads.next() => match head {
                    Some(head) => {
                        last_head = Some(head);
                        if let Err(e) = self.process_head(head).await {
                            error!("Failed to process head {} on chain {}: {}", head, chain_id, e);
                        }
                    }
                    None => {
                        warn!("Head stream for chain {} ended", chain_id);
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn acquire_leases(&self) -> TxmResult<Vec<AccountLease>> {
        let mut leases = Vec::new();
        for address in self.accounts() {
            leases.push(self.leases.try_acquire(self.ctx.account(address)).await?);
        }
        Ok(leases)
    }

    fn accounts(&self) -> Vec<Address> {
        self.ctx.keystore.enabled_addresses(self.ctx.chain_id)
    }

    /// Delete finished transactions older than the reaper threshold.
    ///
    /// Confirmed transactions still inside the re-org window are kept.
    /// Returns 0 when no reaper is configured.
    pub async fn reap(&self, head: u64) -> TxmResult<u64> {
        let Some(reaper) = self.reaper else {
            return Ok(0);
        };
        let chain_id = self.ctx.chain_id;

        let threshold = chrono::Duration::from_std(reaper.threshold)
            .map_err(|e| TxmError::Config(format!("reaper threshold: {}", e)))?;
        let min_block = head.saturating_sub(self.ctx.policy.reorg_window);

        let reaped = self
            .ctx
            .store
            .reap_before(chain_id, min_block, Utc::now() - threshold)
            .await?;
        if reaped > 0 {
            crate::metrics::record_reaped(chain_id, reaped);
            info!(
                "Chain {}: reaped {} finished transactions below block {}",
                chain_id, reaped, min_block
            );
        }
        Ok(reaped)
    }

    /// Reconcile every account against `head`, bounded by the head timeout
    pub async fn process_head(&self, head: u64) -> TxmResult<()> {
        let started = Instant::now();

        tokio::time::timeout(self.head_timeout, self.process_head_inner(head))
            .await
            .map_err(|_| TxmError::Timeout {
                operation: format!("processing head {} on chain {}", head, self.ctx.chain_id),
            })??;

        crate::metrics::record_head_processed(self.ctx.chain_id, head, started.elapsed());
        Ok(())
    }

    async fn process_head_inner(&self, head: u64) -> TxmResult<()> {
        let chain_id = self.ctx.chain_id;

        let stamped = self.ctx.store.set_broadcast_before_block(chain_id, head).await?;
        if stamped > 0 {
            debug!("Chain {}: {} attempts broadcast before block {}", chain_id, stamped, head);
        }

        let enabled = self.accounts();
        let min_block = head.saturating_sub(self.ctx.policy.reorg_window);
        let mut accounts = self.ctx.store.find_active_accounts(chain_id, min_block).await?;
        accounts.extend(enabled.iter().copied());
        accounts.sort_unstable();
        accounts.dedup();

        for address in accounts {
            let can_sign = enabled.contains(&address);
            if let Err(e) = self.process_account(address, head, can_sign).await {
                error!(
                    "Chain {}: failed to process account {:?} at head {}: {}",
                    chain_id, address, head, e
                );
            }
        }

        Ok(())
    }

    async fn process_account(&self, address: Address, head: u64, can_sign: bool) -> TxmResult<()> {
        let _guard = self.ctx.locks.lock(self.ctx.account(address)).await;

        let mined = self.ctx.nonces.resync(address).await?;

        self.check_reorgs(address, head).await?;

        let in_flight = self.ctx.store.find_in_flight(self.ctx.chain_id, address).await?;
        for tx in in_flight.iter().filter(|tx| tx.state == TxState::InProgress) {
            if let Err(e) = self.reconcile(tx, head, mined, can_sign).await {
                warn!(
                    "Chain {}: failed to reconcile {} (nonce {:?}): {}",
                    self.ctx.chain_id, tx.id, tx.nonce, e
                );
            }
        }

        if can_sign {
            self.ctx.process_unstarted_locked(address).await?;
        }
        Ok(())
    }

    /// Demote confirmed transactions whose receipt vanished or moved to
    /// another block, at another height or the same one
    async fn check_reorgs(&self, address: Address, head: u64) -> TxmResult<()> {
        let min_block = head.saturating_sub(self.ctx.policy.reorg_window);
        let confirmed = self
            .ctx
            .store
            .find_recently_confirmed(self.ctx.chain_id, address, min_block)
            .await?;

        for tx in &confirmed {
            let Some(attempt) = tx.confirmed_attempt() else {
                continue;
            };

            let receipt = match self.ctx.client.get_receipt(attempt.hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!("Re-org check for {:?} failed: {}", attempt.hash, e);
                    continue;
                }
            };

            let still_included = receipt.map_or(false, |r| {
                Some(r.block_number) == attempt.included_block
                    && match (r.block_hash, attempt.included_block_hash) {
                        (Some(seen), Some(recorded)) => seen == recorded,
                        _ => true,
                    }
            });
            if !still_included {
                warn!(
                    chain_id = self.ctx.chain_id,
                    tx_id = %tx.id,
                    nonce = ?tx.nonce,
                    hash = ?attempt.hash,
                    "Re-org: confirmed transaction no longer in block {:?}",
                    attempt.included_block
                );
                self.ctx.store.revert_confirmation(tx.id).await?;
                crate::metrics::record_reorg(self.ctx.chain_id);
            }
        }

        Ok(())
    }

    /// Receipt lookup across every attempt that may have reached a node,
    /// newest first; the first hash the chain knows wins.
    async fn find_receipt<'a>(
        &self,
        tx: &'a Transaction,
    ) -> TxmResult<Option<(&'a TxAttempt, ReceiptInfo)>> {
        for attempt in tx.broadcast_attempts() {
            if let Some(receipt) = self.ctx.client.get_receipt(attempt.hash).await? {
                return Ok(Some((attempt, receipt)));
            }
        }
        Ok(None)
    }

    async fn reconcile(
        &self,
        tx: &Transaction,
        head: u64,
        mined: u64,
        can_sign: bool,
    ) -> TxmResult<()> {
        let chain_id = self.ctx.chain_id;
        let policy = &self.ctx.policy;

        if let Some((attempt, receipt)) = self.find_receipt(tx).await? {
            if policy.is_final(receipt.block_number, head) {
                self.confirm(tx, attempt, &receipt, head).await?;
            } else if attempt.included_block != Some(receipt.block_number)
                || attempt.included_block_hash != receipt.block_hash
            {
                debug!(
                    "Chain {}: {:?} included in block {}, waiting for depth",
                    chain_id, attempt.hash, receipt.block_number
                );
                self.ctx
                    .store
                    .set_attempt_inclusion(
                        attempt.id,
                        Some((receipt.block_number, receipt.block_hash)),
                    )
                    .await?;
            }
            return Ok(());
        }

        // No attempt has a receipt; forget inclusions a re-org took away
        for attempt in tx.attempts.iter().filter(|a| a.included_block.is_some()) {
            warn!(
                chain_id,
                tx_id = %tx.id,
                hash = ?attempt.hash,
                "Re-org: receipt from block {:?} vanished",
                attempt.included_block
            );
            self.ctx.store.set_attempt_inclusion(attempt.id, None).await?;
            crate::metrics::record_reorg(chain_id);
        }

        let Some(canonical) = tx.canonical_attempt() else {
            return Ok(());
        };

        if can_sign {
            match canonical.state {
                AttemptState::Pending => return self.ctx.resend(tx, canonical).await,
                AttemptState::Underpriced => return self.ctx.bump_attempt(tx, canonical).await,
                _ => {}
            }
        }

        let Some(broadcast_block) = canonical.broadcast_block else {
            return Ok(());
        };

        if mined > canonical.nonce {
            // The nonce is used but none of our hashes is on chain
            if head.saturating_sub(broadcast_block) >= policy.confirmation_depth {
                if self
                    .ctx
                    .store
                    .mark_errored(tx.id, "nonce consumed by a transaction this node did not broadcast")
                    .await?
                {
                    crate::metrics::record_tx_errored(chain_id);
                    warn!(
                        chain_id,
                        tx_id = %tx.id,
                        nonce = canonical.nonce,
                        "Nonce consumed externally, transaction errored"
                    );
                }
            }
            return Ok(());
        }

        if !can_sign {
            debug!(
                "Chain {}: key for {:?} disabled, {} only awaits its receipt",
                chain_id, tx.from, tx.id
            );
            return Ok(());
        }

        if policy.needs_bump(broadcast_block, head) {
            debug!(
                "Chain {}: {} unconfirmed since block {}, bumping",
                chain_id, tx.id, broadcast_block
            );
            self.ctx.bump_attempt(tx, canonical).await?;
        } else if let Some(last_sent) = canonical.last_sent_at.or(canonical.broadcast_at) {
            if policy.needs_resend(last_sent, Utc::now()) {
                debug!(
                    "Chain {}: {} not seen on chain since {}, resending",
                    chain_id, tx.id, last_sent
                );
                self.ctx.resend(tx, canonical).await?;
            }
        }

        Ok(())
    }

    async fn confirm(
        &self,
        tx: &Transaction,
        attempt: &TxAttempt,
        receipt: &ReceiptInfo,
        head: u64,
    ) -> TxmResult<()> {
        let block = BlockInfo {
            number: receipt.block_number,
            hash: receipt.block_hash,
            reverted: !receipt.success,
        };
        if !self.ctx.store.mark_confirmed(tx.id, attempt.id, &block).await? {
            return Ok(());
        }

        let first_broadcast = tx.attempts.iter().filter_map(|a| a.broadcast_at).min();
        let first_block = tx.attempts.iter().filter_map(|a| a.broadcast_block).min();
        let elapsed = first_broadcast
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or_default();
        let blocks = first_block.map_or(0, |b| head.saturating_sub(b));
        crate::metrics::record_tx_confirmed(self.ctx.chain_id, elapsed, blocks);

        if receipt.success {
            info!(
                "Chain {}: confirmed {} (nonce {}) with {:?} in block {}",
                self.ctx.chain_id, tx.id, attempt.nonce, attempt.hash, receipt.block_number
            );
        } else {
            warn!(
                "Chain {}: {} (nonce {}) confirmed in block {} but execution reverted",
                self.ctx.chain_id, tx.id, attempt.nonce, receipt.block_number
            );
        }
        Ok(())
    }
}
