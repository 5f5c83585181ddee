//! In-memory ledger store for tests and development nodes

use super::models::*;
use super::TxStore;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    transactions: HashMap<TxId, Transaction>,
    /// Creation order
    order: Vec<TxId>,
    attempt_owner: HashMap<AttemptId, TxId>,
}

impl Inner {
    fn tx_mut(&mut self, tx_id: TxId) -> TxmResult<&mut Transaction> {
        self.transactions
            .get_mut(&tx_id)
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })
    }

    fn attempt_mut(&mut self, attempt_id: AttemptId) -> TxmResult<&mut TxAttempt> {
        let tx_id = *self
            .attempt_owner
            .get(&attempt_id)
            .ok_or_else(|| TxmError::Internal(format!("attempt {} not found", attempt_id)))?;
        self.tx_mut(tx_id)?
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or_else(|| TxmError::Internal(format!("attempt {} not found", attempt_id)))
    }

    fn account_txs(&self, chain_id: u64, address: Address) -> impl Iterator<Item = &Transaction> {
        self.order
            .iter()
            .filter_map(move |id| self.transactions.get(id))
            .filter(move |tx| tx.chain_id == chain_id && tx.from == address)
    }

    fn nonce_taken(&self, chain_id: u64, address: Address, nonce: u64) -> bool {
        self.account_txs(chain_id, address)
            .any(|tx| tx.nonce == Some(nonce))
    }
}

/// `TxStore` kept in a `HashMap` behind one write lock
#[derive(Default)]
pub struct InMemoryTxStore {
    inner: RwLock<Inner>,
}

impl InMemoryTxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_terminal(
        inner: &mut Inner,
        tx_id: TxId,
        state: TxState,
        reason: &str,
    ) -> TxmResult<bool> {
        let tx = inner.tx_mut(tx_id)?;
        if tx.state.is_terminal() {
            return Ok(false);
        }
        tx.state = state;
        tx.error = Some(reason.to_string());
        Ok(true)
    }
}

#[async_trait]
impl TxStore for InMemoryTxStore {
    async fn create_transaction(&self, request: &NewTransaction) -> TxmResult<TxId> {
        request.validate()?;

        let tx = Transaction {
            id: Uuid::new_v4(),
            chain_id: request.chain_id,
            from: request.from,
            to: request.to,
            value: request.value,
            data: request.data.clone(),
            gas_limit: request.gas_limit,
            nonce: None,
            state: TxState::Unstarted,
            error: None,
            created_at: Utc::now(),
            attempts: Vec::new(),
        };
        let id = tx.id;

        let mut inner = self.inner.write().await;
        inner.order.push(id);
        inner.transactions.insert(id, tx);
        Ok(id)
    }

    async fn get_transaction(&self, tx_id: TxId) -> TxmResult<Transaction> {
        self.inner
            .read()
            .await
            .transactions
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| TxmError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })
    }

    async fn find_in_flight(&self, chain_id: u64, address: Address) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;

        let mut in_progress: Vec<Transaction> = inner
            .account_txs(chain_id, address)
            .filter(|tx| tx.state == TxState::InProgress)
            .cloned()
            .collect();
        in_progress.sort_by_key(|tx| tx.nonce);

        let unstarted = inner
            .account_txs(chain_id, address)
            .filter(|tx| tx.state == TxState::Unstarted)
            .cloned();

        in_progress.extend(unstarted);
        Ok(in_progress)
    }

    async fn find_in_nonce_range(
        &self,
        chain_id: u64,
        address: Address,
        begin: u64,
        end: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<Transaction> = inner
            .account_txs(chain_id, address)
            .filter(|tx| matches!(tx.nonce, Some(n) if n >= begin && n <= end))
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.nonce);
        Ok(txs)
    }

    async fn find_recently_confirmed(
        &self,
        chain_id: u64,
        address: Address,
        min_block: u64,
    ) -> TxmResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut txs: Vec<Transaction> = inner
            .account_txs(chain_id, address)
            .filter(|tx| tx.state == TxState::Confirmed)
            .filter(|tx| {
                tx.confirmed_attempt()
                    .and_then(|a| a.included_block)
                    .map_or(false, |block| block >= min_block)
            })
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.nonce);
        Ok(txs)
    }

    async fn find_active_accounts(&self, chain_id: u64, min_block: u64) -> TxmResult<Vec<Address>> {
        let inner = self.inner.read().await;
        let accounts: BTreeSet<Address> = inner
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id)
            .filter(|tx| match tx.state {
                TxState::InProgress => true,
                TxState::Confirmed => tx
                    .confirmed_attempt()
                    .and_then(|a| a.included_block)
                    .map_or(false, |block| block >= min_block),
                _ => false,
            })
            .map(|tx| tx.from)
            .collect();
        Ok(accounts.into_iter().collect())
    }

    async fn latest_nonce(&self, chain_id: u64, address: Address) -> TxmResult<Option<u64>> {
        let inner = self.inner.read().await;
        Ok(inner
            .account_txs(chain_id, address)
            .filter_map(|tx| tx.nonce)
            .max())
    }

    async fn count_by_state(
        &self,
        chain_id: u64,
        address: Address,
        state: TxState,
    ) -> TxmResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .account_txs(chain_id, address)
            .filter(|tx| tx.state == state)
            .count() as u64)
    }

    async fn start_transaction(&self, tx_id: TxId, attempt: &TxAttempt) -> TxmResult<()> {
        let mut inner = self.inner.write().await;

        let (chain_id, from, state) = {
            let tx = inner.tx_mut(tx_id)?;
            (tx.chain_id, tx.from, tx.state)
        };
        if state != TxState::Unstarted {
            return Err(TxmError::InvalidStateTransition {
                from: state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }
        if attempt.tx_id != tx_id {
            return Err(TxmError::Internal(format!(
                "attempt {} belongs to {}, not {}",
                attempt.id, attempt.tx_id, tx_id
            )));
        }
        if inner.nonce_taken(chain_id, from, attempt.nonce) {
            return Err(TxmError::Nonce {
                chain_id,
                message: format!("nonce {} already assigned for {:?}", attempt.nonce, from),
            });
        }

        let tx = inner.tx_mut(tx_id)?;
        tx.state = TxState::InProgress;
        tx.nonce = Some(attempt.nonce);
        tx.attempts.insert(0, attempt.clone());
        inner.attempt_owner.insert(attempt.id, tx_id);
        Ok(())
    }

    async fn record_attempt(&self, attempt: &TxAttempt) -> TxmResult<()> {
        let mut inner = self.inner.write().await;

        let tx = inner.tx_mut(attempt.tx_id)?;
        if tx.state != TxState::InProgress {
            return Err(TxmError::InvalidStateTransition {
                from: tx.state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }
        if tx.nonce != Some(attempt.nonce) {
            return Err(TxmError::Nonce {
                chain_id: tx.chain_id,
                message: format!(
                    "attempt nonce {} does not match transaction nonce {:?}",
                    attempt.nonce, tx.nonce
                ),
            });
        }

        for prior in tx.attempts.iter_mut() {
            if prior.state != AttemptState::Confirmed {
                prior.state = AttemptState::Superseded;
            }
        }
        tx.attempts.insert(0, attempt.clone());
        inner.attempt_owner.insert(attempt.id, attempt.tx_id);
        Ok(())
    }

    async fn reuse_attempt(&self, attempt_id: AttemptId) -> TxmResult<TxAttempt> {
        let mut inner = self.inner.write().await;
        let tx_id = inner.attempt_mut(attempt_id)?.tx_id;
        let tx = inner.tx_mut(tx_id)?;
        if tx.state != TxState::InProgress {
            return Err(TxmError::InvalidStateTransition {
                from: tx.state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }

        for attempt in tx.attempts.iter_mut() {
            if attempt.id == attempt_id {
                if attempt.state == AttemptState::Superseded {
                    attempt.state = if attempt.broadcast_at.is_some() {
                        AttemptState::Broadcast
                    } else {
                        AttemptState::Pending
                    };
                }
            } else if attempt.state != AttemptState::Confirmed {
                attempt.state = AttemptState::Superseded;
            }
        }

        tx.attempts
            .iter()
            .find(|a| a.id == attempt_id)
            .cloned()
            .ok_or_else(|| TxmError::Internal(format!("attempt {} not found", attempt_id)))
    }

    async fn mark_attempt_broadcast(
        &self,
        attempt_id: AttemptId,
        at: DateTime<Utc>,
    ) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let attempt = inner.attempt_mut(attempt_id)?;
        if attempt.broadcast_at.is_none() {
            attempt.broadcast_at = Some(at);
        }
        attempt.last_sent_at = Some(at);
        if matches!(attempt.state, AttemptState::Pending | AttemptState::Underpriced) {
            attempt.state = AttemptState::Broadcast;
        }
        Ok(())
    }

    async fn mark_attempt_underpriced(&self, attempt_id: AttemptId) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let attempt = inner.attempt_mut(attempt_id)?;
        if matches!(attempt.state, AttemptState::Pending | AttemptState::Broadcast) {
            attempt.state = AttemptState::Underpriced;
        }
        Ok(())
    }

    async fn set_broadcast_before_block(&self, chain_id: u64, head: u64) -> TxmResult<u64> {
        let mut inner = self.inner.write().await;
        let mut stamped = 0;

        for tx in inner.transactions.values_mut() {
            if tx.chain_id != chain_id || tx.state != TxState::InProgress {
                continue;
            }
            for attempt in tx.attempts.iter_mut() {
                if attempt.broadcast_at.is_some() && attempt.broadcast_block.is_none() {
                    attempt.broadcast_block = Some(head);
                    stamped += 1;
                }
            }
        }

        Ok(stamped)
    }

    async fn set_attempt_inclusion(
        &self,
        attempt_id: AttemptId,
        block: Option<(u64, Option<H256>)>,
    ) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let attempt = inner.attempt_mut(attempt_id)?;
        attempt.included_block = block.map(|(number, _)| number);
        attempt.included_block_hash = block.and_then(|(_, hash)| hash);
        Ok(())
    }

    async fn mark_confirmed(
        &self,
        tx_id: TxId,
        attempt_id: AttemptId,
        block: &BlockInfo,
    ) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        let tx = inner.tx_mut(tx_id)?;
        if tx.state.is_terminal() {
            return Ok(false);
        }
        if !tx.attempts.iter().any(|a| a.id == attempt_id) {
            return Err(TxmError::Internal(format!(
                "attempt {} does not belong to transaction {}",
                attempt_id, tx_id
            )));
        }

        for attempt in tx.attempts.iter_mut() {
            if attempt.id == attempt_id {
                attempt.state = AttemptState::Confirmed;
                attempt.included_block = Some(block.number);
                attempt.included_block_hash = block.hash;
            } else {
                attempt.state = AttemptState::Superseded;
            }
        }
        tx.state = TxState::Confirmed;
        tx.error = block.reverted.then(|| "execution reverted".to_string());
        Ok(true)
    }

    async fn revert_confirmation(&self, tx_id: TxId) -> TxmResult<()> {
        let mut inner = self.inner.write().await;
        let tx = inner.tx_mut(tx_id)?;
        if tx.state != TxState::Confirmed {
            return Err(TxmError::InvalidStateTransition {
                from: tx.state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }

        for attempt in tx.attempts.iter_mut() {
            if attempt.state == AttemptState::Confirmed {
                attempt.state = AttemptState::Broadcast;
                attempt.included_block = None;
                attempt.included_block_hash = None;
                attempt.broadcast_block = None;
            }
        }
        tx.state = TxState::InProgress;
        tx.error = None;
        Ok(())
    }

    async fn mark_errored(&self, tx_id: TxId, reason: &str) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        Self::mark_terminal(&mut inner, tx_id, TxState::Errored, reason)
    }

    async fn mark_fatal(&self, tx_id: TxId, reason: &str) -> TxmResult<bool> {
        let mut inner = self.inner.write().await;
        Self::mark_terminal(&mut inner, tx_id, TxState::Fatal, reason)
    }

    async fn requeue(&self, tx_id: TxId) -> TxmResult<TxState> {
        let mut inner = self.inner.write().await;
        let tx = inner.tx_mut(tx_id)?;

        if !matches!(tx.state, TxState::Errored | TxState::Fatal) {
            return Err(TxmError::InvalidStateTransition {
                from: tx.state.to_string(),
                to: TxState::InProgress.to_string(),
            });
        }

        tx.state = if tx.nonce.is_some() {
            TxState::InProgress
        } else {
            TxState::Unstarted
        };
        tx.error = None;
        for attempt in tx.attempts.iter_mut() {
            attempt.broadcast_block = None;
        }
        Ok(tx.state)
    }

    async fn reap_before(
        &self,
        chain_id: u64,
        min_block_to_keep: u64,
        created_before: DateTime<Utc>,
    ) -> TxmResult<u64> {
        let mut inner = self.inner.write().await;

        let doomed: HashSet<TxId> = inner
            .transactions
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.created_at < created_before)
            .filter(|tx| match tx.state {
                TxState::Fatal => true,
                TxState::Confirmed => tx
                    .confirmed_attempt()
                    .and_then(|a| a.included_block)
                    .map_or(false, |block| block < min_block_to_keep),
                _ => false,
            })
            .map(|tx| tx.id)
            .collect();

        for id in &doomed {
            if let Some(tx) = inner.transactions.remove(id) {
                for attempt in &tx.attempts {
                    inner.attempt_owner.remove(&attempt.id);
                }
            }
        }
        inner.order.retain(|id| !doomed.contains(id));

        Ok(doomed.len() as u64)
    }

    async fn stats(&self) -> TxmResult<TransactionStats> {
        let inner = self.inner.read().await;
        let mut stats = TransactionStats::default();
        for tx in inner.transactions.values() {
            stats.add(tx.state, 1);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> TxmResult<()> {
        Ok(())
    }
}
