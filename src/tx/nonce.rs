//! Nonce sequencing per (chain, account)
//!
//! Handles:
//! - Handing out contiguous nonces from a local cursor
//! - Reconciling the cursor with the ledger and the chain (drift detection)
//! - Rolling back a nonce that was never used

use super::backoff::RetryPolicy;
use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::store::TxStore;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-account cursor state
struct AccountNonce {
    /// Next nonce to hand out
    next: u64,
    /// Whether a resync has ever succeeded
    synced: bool,
}

/// Source of truth for the next nonce of every account on one chain
pub struct NonceSequencer {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn TxStore>,
    retry: RetryPolicy,
    accounts: DashMap<Address, Arc<Mutex<AccountNonce>>>,
}

impl NonceSequencer {
    pub fn new(client: Arc<dyn ChainClient>, store: Arc<dyn TxStore>, retry: RetryPolicy) -> Self {
        Self {
            chain_id: client.chain_id(),
            client,
            store,
            retry,
            accounts: DashMap::new(),
        }
    }

    fn account(&self, address: Address) -> Arc<Mutex<AccountNonce>> {
        self.accounts
            .entry(address)
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountNonce {
                    next: 0,
                    synced: false,
                }))
            })
            .clone()
    }

    /// Hand out the next nonce, syncing first if the account was never synced
    pub async fn next_nonce(&self, address: Address) -> TxmResult<u64> {
        let account = self.account(address);
        let mut state = account.lock().await;

        if !state.synced {
            self.resync_locked(address, &mut state).await?;
        }

        let nonce = state.next;
        state.next += 1;

        debug!(
            "Allocated nonce {} for {:?} on chain {}",
            nonce, address, self.chain_id
        );
        Ok(nonce)
    }

    /// Reconcile the cursor with the ledger and the chain.
    ///
    /// Returns the chain-reported transaction count. The cursor only ever
    /// moves forward.
    pub async fn resync(&self, address: Address) -> TxmResult<u64> {
        let account = self.account(address);
        let mut state = account.lock().await;
        self.resync_locked(address, &mut state).await
    }

    async fn resync_locked(&self, address: Address, state: &mut AccountNonce) -> TxmResult<u64> {
        let on_chain = self.fetch_count(address).await?;
        let from_store = self
            .store
            .latest_nonce(self.chain_id, address)
            .await?
            .map_or(0, |n| n + 1);

        let local = state.next.max(from_store);
        if on_chain > local {
            warn!(
                chain_id = self.chain_id,
                address = ?address,
                local,
                on_chain,
                "Nonce drift: account used outside this node"
            );
            crate::metrics::record_nonce_drift(self.chain_id);
        }

        state.next = local.max(on_chain);
        state.synced = true;
        Ok(on_chain)
    }

    /// Query the mined transaction count, retrying transient failures
    async fn fetch_count(&self, address: Address) -> TxmResult<u64> {
        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(
                self.retry.call_timeout,
                self.client.get_transaction_count(address),
            )
            .await
            .unwrap_or_else(|_| {
                Err(TxmError::Timeout {
                    operation: "get transaction count".to_string(),
                })
            });

            match result {
                Ok(count) => return Ok(count),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Nonce sync for {:?} on chain {} failed ({}), retry {} in {:?}",
                        address, self.chain_id, e, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(TxmError::Nonce {
                        chain_id: self.chain_id,
                        message: format!("resync for {:?} failed: {}", address, e),
                    })
                }
            }
        }
    }

    /// Give back a nonce that was handed out but never stored.
    ///
    /// Only the most recently allocated nonce can be returned.
    pub async fn release_nonce(&self, address: Address, nonce: u64) {
        let account = self.account(address);
        let mut state = account.lock().await;

        if state.next == nonce + 1 {
            state.next = nonce;
            debug!(
                "Released nonce {} for {:?} on chain {}",
                nonce, address, self.chain_id
            );
        }
    }

    /// Current cursor, if the account has been synced
    pub async fn cursor(&self, address: Address) -> Option<u64> {
        let account = self.accounts.get(&address).map(|a| a.clone())?;
        let state = account.lock().await;
        state.synced.then_some(state.next)
    }
}
