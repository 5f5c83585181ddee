//! Operator-driven rebroadcast of a nonce range at a forced fee

use super::context::ChainContext;
use crate::error::{TxmError, TxmResult};
use crate::locks::AccountLeases;
use crate::store::{Transaction, TxState};
use crate::tx::{FeeParams, SubmitOutcome};

use chrono::Utc;
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Nonces handled by a completed rebroadcast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebroadcastReport {
    pub rebroadcast: Vec<u64>,
    pub skipped: Vec<u64>,
}

/// Emergency tool that bypasses the confirmer's gas policy.
///
/// Must own the account lease for the whole call; a live confirmer on the
/// same account makes it fail with `ResourceBusy`.
pub struct Rebroadcaster {
    ctx: Arc<ChainContext>,
    leases: Arc<dyn AccountLeases>,
}

impl Rebroadcaster {
    pub fn new(ctx: Arc<ChainContext>, leases: Arc<dyn AccountLeases>) -> Self {
        Self { ctx, leases }
    }

    /// Build and broadcast an attempt at `fee` for every nonce in
    /// `begin..=end` that has a ledger record.
    ///
    /// Confirmed nonces are skipped, as are nonces the chain reports as
    /// already used. Errored and Fatal transactions are put back in flight
    /// first. An attempt identical to a stored one reuses that record. The
    /// ceiling in the gas policy does not apply.
    pub async fn force_rebroadcast(
        &self,
        address: Address,
        begin: u64,
        end: u64,
        fee: FeeParams,
        gas_limit_override: Option<u64>,
    ) -> TxmResult<RebroadcastReport> {
        let chain_id = self.ctx.chain_id;

        if begin > end {
            return Err(TxmError::Validation(format!(
                "nonce range {}..={} is empty",
                begin, end
            )));
        }
        fee.validate()?;
        if gas_limit_override == Some(0) {
            return Err(TxmError::Validation("gas limit must be positive".to_string()));
        }

        let _lease = self.leases.try_acquire(self.ctx.account(address)).await?;
        let _guard = self.ctx.locks.lock(self.ctx.account(address)).await;

        info!(
            chain_id,
            address = ?address,
            begin,
            end,
            fee = %fee,
            "Forcing rebroadcast"
        );

        let txs = self
            .ctx
            .store
            .find_in_nonce_range(chain_id, address, begin, end)
            .await?;
        let mut report = RebroadcastReport::default();

        for nonce in begin..=end {
            let Some(tx) = txs.iter().find(|tx| tx.nonce == Some(nonce)) else {
                warn!(
                    "Chain {}: no transaction with nonce {} for {:?}, nothing to rebroadcast",
                    chain_id, nonce, address
                );
                report.skipped.push(nonce);
                continue;
            };

            if tx.state == TxState::Confirmed {
                info!("Chain {}: nonce {} already confirmed, skipping", chain_id, nonce);
                report.skipped.push(nonce);
                continue;
            }

            match self.rebroadcast_one(tx, nonce, fee, gas_limit_override).await {
                Ok(true) => report.rebroadcast.push(nonce),
                Ok(false) => report.skipped.push(nonce),
                Err(source) => {
                    warn!(
                        "Chain {}: rebroadcast aborted at nonce {} after {:?}: {}",
                        chain_id, nonce, report.rebroadcast, source
                    );
                    return Err(TxmError::RebroadcastAborted {
                        nonce,
                        succeeded: report.rebroadcast,
                        source: Box::new(source),
                    });
                }
            }
        }

        info!(
            "Chain {}: rebroadcast {:?}, skipped {:?}",
            chain_id, report.rebroadcast, report.skipped
        );
        Ok(report)
    }

    /// Returns false when the chain already counts the nonce
    async fn rebroadcast_one(
        &self,
        tx: &Transaction,
        nonce: u64,
        fee: FeeParams,
        gas_limit_override: Option<u64>,
    ) -> TxmResult<bool> {
        let store = &self.ctx.store;

        if tx.state.is_terminal() {
            let state = store.requeue(tx.id).await?;
            info!("Requeued {} (nonce {}) as {}", tx.id, nonce, state);
        }

        let gas_limit = gas_limit_override.or_else(|| tx.canonical_attempt().map(|a| a.gas_limit));
        let built = self.ctx.builder.build(tx, nonce, fee, gas_limit).await?;
        let attempt = self.ctx.record_or_reuse(tx, built).await?;
        crate::metrics::record_rebroadcast(self.ctx.chain_id);

        match self.ctx.broadcaster.submit(&attempt).await? {
            SubmitOutcome::Accepted | SubmitOutcome::AlreadyKnown => {
                store.mark_attempt_broadcast(attempt.id, Utc::now()).await?;
                Ok(true)
            }
            SubmitOutcome::NonceTooLow(message) => {
                warn!(
                    "Chain {}: nonce {} already used, leaving {} to the confirmer: {}",
                    self.ctx.chain_id, nonce, tx.id, message
                );
                store.mark_attempt_broadcast(attempt.id, Utc::now()).await?;
                Ok(false)
            }
            SubmitOutcome::Underpriced(message) => {
                store.mark_attempt_underpriced(attempt.id).await?;
                Err(TxmError::Underpriced {
                    chain_id: self.ctx.chain_id,
                    message,
                })
            }
            SubmitOutcome::Rejected(reason) => {
                store
                    .mark_fatal(tx.id, &format!("rejected by chain: {}", reason))
                    .await?;
                Err(TxmError::Rejected {
                    chain_id: self.ctx.chain_id,
                    reason,
                })
            }
            SubmitOutcome::NetworkError(message) => Err(TxmError::Network {
                chain_id: self.ctx.chain_id,
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SendOutcome;
    use crate::engine::context::QueueLimits;
    use crate::locks::{AccountLocks, LocalLeases};
    use crate::store::{AttemptState, InMemoryTxStore, NewTransaction, TxId};
    use crate::testing::{gwei, keystore_with_key, FakeChain};
    use crate::tx::{FeeModel, GasPolicy, RetryPolicy};
    use ethers::types::{Bytes, U256};
    use std::time::Duration;
    use tokio_test::assert_ok;

    struct Harness {
        ctx: Arc<ChainContext>,
        chain: Arc<FakeChain>,
        leases: Arc<LocalLeases>,
        rebroadcaster: Rebroadcaster,
        from: Address,
    }

    impl Harness {
        fn new() -> Self {
            let chain = Arc::new(FakeChain::new(1));
            let (keystore, from) = keystore_with_key(1);
            let ctx = Arc::new(ChainContext::new(
                chain.clone(),
                Arc::new(InMemoryTxStore::new()),
                keystore,
                GasPolicy::new(FeeModel::Legacy, 3, 1.2, 15, 2).unwrap(),
                RetryPolicy::new(
                    0,
                    Duration::from_millis(1),
                    Duration::from_millis(1),
                    Duration::from_secs(1),
                ),
                Arc::new(AccountLocks::new()),
                QueueLimits::default(),
            ));
            let leases = Arc::new(LocalLeases::new());
            Self {
                rebroadcaster: Rebroadcaster::new(ctx.clone(), leases.clone()),
                ctx,
                chain,
                leases,
                from,
            }
        }

        /// Create `n` transactions; they take nonces 0..n
        async fn create(&self, n: usize) -> Vec<TxId> {
            let mut ids = Vec::new();
            for _ in 0..n {
                let id = self
                    .ctx
                    .create_transaction(&NewTransaction {
                        chain_id: 1,
                        from: self.from,
                        to: Address::repeat_byte(0x33),
                        value: U256::zero(),
                        data: Bytes::from(vec![0x01]),
                        gas_limit: 40_000,
                    })
                    .await
                    .unwrap();
                ids.push(id);
            }
            ids
        }

        async fn tx(&self, id: TxId) -> Transaction {
            self.ctx.store.get_transaction(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_range_gets_one_attempt_per_nonce_at_override_fee() {
        let h = Harness::new();
        let ids = h.create(11).await;
        let sent_before = h.chain.sent_count();
        let fee = FeeParams::Legacy { gas_price: gwei(100) };

        let report = assert_ok!(
            h.rebroadcaster
                .force_rebroadcast(h.from, 7, 10, fee, None)
                .await
        );
        assert_eq!(report.rebroadcast, vec![7, 8, 9, 10]);
        assert!(report.skipped.is_empty());
        assert_eq!(h.chain.sent_count() - sent_before, 4);

        for id in &ids[7..=10] {
            let tx = h.tx(*id).await;
            assert_eq!(tx.attempts.len(), 2);
            assert_eq!(tx.attempts[0].fee, fee);
            assert_eq!(tx.attempts[0].gas_limit, 40_000);
            assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
            assert_eq!(tx.attempts[1].state, AttemptState::Superseded);
        }
        assert_eq!(h.tx(ids[6]).await.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_rebroadcast_at_current_fee_reuses_the_attempt() {
        let h = Harness::new();
        let ids = h.create(1).await;
        let before = h.tx(ids[0]).await.attempts[0].clone();

        let report = h
            .rebroadcaster
            .force_rebroadcast(h.from, 0, 0, before.fee, None)
            .await
            .unwrap();
        assert_eq!(report.rebroadcast, vec![0]);

        let tx = h.tx(ids[0]).await;
        assert_eq!(tx.attempts.len(), 1);
        assert_eq!(tx.attempts[0].id, before.id);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
        assert_eq!(h.chain.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_used_nonce_is_skipped_not_aborted() {
        let h = Harness::new();
        let ids = h.create(2).await;
        h.chain
            .script_send(Ok(SendOutcome::NonceTooLow("nonce too low".to_string())));

        let report = h
            .rebroadcaster
            .force_rebroadcast(h.from, 0, 1, FeeParams::Legacy { gas_price: gwei(20) }, None)
            .await
            .unwrap();
        assert_eq!(report.rebroadcast, vec![1]);
        assert_eq!(report.skipped, vec![0]);

        let tx = h.tx(ids[0]).await;
        assert_eq!(tx.state, TxState::InProgress);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
    }

    #[tokio::test]
    async fn test_fails_fast_when_account_is_leased() {
        let h = Harness::new();
        h.create(1).await;
        let _held = h.leases.try_acquire(h.ctx.account(h.from)).await.unwrap();

        let err = h
            .rebroadcaster
            .force_rebroadcast(h.from, 0, 0, FeeParams::Legacy { gas_price: gwei(20) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::ResourceBusy { .. }));
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn test_missing_and_confirmed_nonces_are_skipped() {
        let h = Harness::new();
        let ids = h.create(2).await;
        let first = h.tx(ids[0]).await;
        h.ctx
            .store
            .mark_confirmed(
                first.id,
                first.attempts[0].id,
                &crate::store::BlockInfo {
                    number: 5,
                    hash: None,
                    reverted: false,
                },
            )
            .await
            .unwrap();

        let report = h
            .rebroadcaster
            .force_rebroadcast(h.from, 0, 3, FeeParams::Legacy { gas_price: gwei(20) }, Some(90_000))
            .await
            .unwrap();
        assert_eq!(report.rebroadcast, vec![1]);
        assert_eq!(report.skipped, vec![0, 2, 3]);
        assert_eq!(h.tx(ids[1]).await.attempts[0].gas_limit, 90_000);
    }

    #[tokio::test]
    async fn test_invalid_input_changes_nothing() {
        let h = Harness::new();
        let ids = h.create(1).await;

        let err = h
            .rebroadcaster
            .force_rebroadcast(h.from, 0, 0, FeeParams::Legacy { gas_price: U256::zero() }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::Validation(_)));

        let err = h
            .rebroadcaster
            .force_rebroadcast(h.from, 3, 1, FeeParams::Legacy { gas_price: gwei(1) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::Validation(_)));
        assert_eq!(h.tx(ids[0]).await.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_errored_transaction_is_requeued() {
        let h = Harness::new();
        let ids = h.create(1).await;
        h.ctx.store.mark_errored(ids[0], "superseded").await.unwrap();

        h.rebroadcaster
            .force_rebroadcast(h.from, 0, 0, FeeParams::Legacy { gas_price: gwei(20) }, None)
            .await
            .unwrap();
        let tx = h.tx(ids[0]).await;
        assert_eq!(tx.state, TxState::InProgress);
        assert_eq!(tx.error, None);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
    }

    #[tokio::test]
    async fn test_abort_reports_succeeded_nonces() {
        let h = Harness::new();
        let ids = h.create(3).await;
        h.chain.script_send(Ok(SendOutcome::Accepted));
        h.chain
            .script_send(Ok(SendOutcome::Rejected("insufficient funds".to_string())));

        let err = h
            .rebroadcaster
            .force_rebroadcast(h.from, 0, 2, FeeParams::Legacy { gas_price: gwei(30) }, None)
            .await
            .unwrap_err();
        match err {
            TxmError::RebroadcastAborted {
                nonce, succeeded, ..
            } => {
                assert_eq!(nonce, 1);
                assert_eq!(succeeded, vec![0]);
            }
            other => panic!("expected RebroadcastAborted, got {:?}", other),
        }
        assert_eq!(h.tx(ids[1]).await.state, TxState::Fatal);
        assert_eq!(h.tx(ids[2]).await.attempts.len(), 1);

        // lease is released after the failure
        assert!(h.leases.try_acquire(h.ctx.account(h.from)).await.is_ok());
    }
}
