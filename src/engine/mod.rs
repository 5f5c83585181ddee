//! Transaction lifecycle engine
//!
//! One `ChainContext` per chain carries the sequencer, builder, broadcaster
//! and gas policy. The `Confirmer` drives it from chain heads; the
//! `Rebroadcaster` is the operator's out-of-band path. `TxManager` routes
//! requests to the right chain.

mod confirmer;
mod context;
mod rebroadcaster;

pub use confirmer::{Confirmer, ReaperPolicy};
pub use context::{ChainContext, QueueLimits};
pub use rebroadcaster::{RebroadcastReport, Rebroadcaster};

use crate::error::{TxmError, TxmResult};
use crate::locks::AccountLeases;
use crate::store::{NewTransaction, Transaction, TransactionStats, TxId, TxState, TxStore};
use crate::tx::FeeParams;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tracing::info;

/// Entry point for callers of the engine
pub struct TxManager {
    chains: DashMap<u64, Arc<ChainContext>>,
    store: Arc<dyn TxStore>,
    leases: Arc<dyn AccountLeases>,
}

impl TxManager {
    pub fn new(store: Arc<dyn TxStore>, leases: Arc<dyn AccountLeases>) -> Self {
        Self {
            chains: DashMap::new(),
            store,
            leases,
        }
    }

    pub fn add_chain(&self, ctx: Arc<ChainContext>) {
        info!("Registered chain {} with the transaction manager", ctx.chain_id);
        self.chains.insert(ctx.chain_id, ctx);
    }

    pub fn chain(&self, chain_id: u64) -> TxmResult<Arc<ChainContext>> {
        self.chains
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(TxmError::ChainNotFound { chain_id })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub async fn create_transaction(&self, request: &NewTransaction) -> TxmResult<TxId> {
        self.chain(request.chain_id)?
            .create_transaction(request)
            .await
    }

    pub async fn get_transaction(&self, tx_id: TxId) -> TxmResult<Transaction> {
        self.store.get_transaction(tx_id).await
    }

    /// See [`Rebroadcaster::force_rebroadcast`]
    pub async fn force_rebroadcast(
        &self,
        chain_id: u64,
        address: Address,
        begin: u64,
        end: u64,
        fee: FeeParams,
        gas_limit_override: Option<u64>,
    ) -> TxmResult<RebroadcastReport> {
        let rebroadcaster = Rebroadcaster::new(self.chain(chain_id)?, self.leases.clone());
        rebroadcaster
            .force_rebroadcast(address, begin, end, fee, gas_limit_override)
            .await
    }

    /// Put an Errored or Fatal transaction back in flight.
    ///
    /// It is picked up by the confirmer on the next head.
    pub async fn requeue(&self, tx_id: TxId) -> TxmResult<TxState> {
        let tx = self.store.get_transaction(tx_id).await?;
        let ctx = self.chain(tx.chain_id)?;
        let _guard = ctx.locks.lock(ctx.account(tx.from)).await;

        let state = self.store.requeue(tx_id).await?;
        info!("Requeued transaction {} as {}", tx_id, state);
        Ok(state)
    }

    pub async fn stats(&self) -> TxmResult<TransactionStats> {
        self.store.stats().await
    }

    pub async fn health_check(&self) -> TxmResult<()> {
        self.store.health_check().await
    }
}
