//! Per-chain engine context shared by the send path, confirmer and rebroadcaster

use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};
use crate::keystore::Keystore;
use crate::locks::{AccountKey, AccountLocks};
use crate::store::{NewTransaction, Transaction, TxAttempt, TxId, TxState, TxStore};
use crate::tx::{
    AttemptBuilder, Broadcaster, GasEstimator, GasPolicy, NonceSequencer, RetryPolicy,
    SubmitOutcome,
};

use chrono::Utc;
use ethers::types::Address;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-account queue bounds; 0 means unlimited
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueLimits {
    pub max_queued: u64,
    pub max_in_flight: u64,
}

/// Everything the engine needs to drive transactions on one chain
pub struct ChainContext {
    pub chain_id: u64,
    pub client: Arc<dyn ChainClient>,
    pub store: Arc<dyn TxStore>,
    pub keystore: Arc<dyn Keystore>,
    pub policy: GasPolicy,
    pub nonces: NonceSequencer,
    pub builder: AttemptBuilder,
    pub broadcaster: Broadcaster,
    pub locks: Arc<AccountLocks>,
    estimator: GasEstimator,
    limits: QueueLimits,
}

impl ChainContext {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn TxStore>,
        keystore: Arc<dyn Keystore>,
        policy: GasPolicy,
        retry: RetryPolicy,
        locks: Arc<AccountLocks>,
        limits: QueueLimits,
    ) -> Self {
        Self {
            chain_id: client.chain_id(),
            nonces: NonceSequencer::new(client.clone(), store.clone(), retry),
            builder: AttemptBuilder::new(keystore.clone()),
            broadcaster: Broadcaster::new(client.clone(), retry),
            client,
            store,
            keystore,
            policy,
            locks,
            estimator: GasEstimator::new(),
            limits,
        }
    }

    pub fn account(&self, address: Address) -> AccountKey {
        AccountKey::new(self.chain_id, address)
    }

    /// Queue a transaction and start it right away if the account allows.
    ///
    /// Only validation, capacity and database failures reach the caller;
    /// anything that goes wrong while starting is retried on the next head.
    pub async fn create_transaction(&self, request: &NewTransaction) -> TxmResult<TxId> {
        if request.chain_id != self.chain_id {
            return Err(TxmError::Validation(format!(
                "transaction for chain {} sent to chain {}",
                request.chain_id, self.chain_id
            )));
        }
        request.validate()?;

        let _guard = self.locks.lock(self.account(request.from)).await;

        if self.limits.max_queued > 0 {
            let queued = self
                .store
                .count_by_state(self.chain_id, request.from, TxState::Unstarted)
                .await?;
            if queued >= self.limits.max_queued {
                return Err(TxmError::QueueFull {
                    chain_id: self.chain_id,
                    address: request.from,
                    queued,
                });
            }
        }

        let tx_id = self.store.create_transaction(request).await?;
        crate::metrics::record_tx_created(self.chain_id);
        info!(
            "Created transaction {} from {:?} on chain {}",
            tx_id, request.from, self.chain_id
        );

        if let Err(e) = self.process_unstarted_locked(request.from).await {
            warn!(
                "Could not start queued transactions for {:?} on chain {}: {}",
                request.from, self.chain_id, e
            );
        }

        Ok(tx_id)
    }

    /// Start Unstarted transactions in creation order.
    ///
    /// Caller must hold the account lock. Stops at the first transaction that
    /// cannot be signed so nothing overtakes it. Returns how many started.
    pub(crate) async fn process_unstarted_locked(&self, address: Address) -> TxmResult<usize> {
        let in_flight = self.store.find_in_flight(self.chain_id, address).await?;
        let mut active = in_flight
            .iter()
            .filter(|tx| tx.state == TxState::InProgress)
            .count() as u64;
        let mut started = 0;

        for tx in in_flight.iter().filter(|tx| tx.state == TxState::Unstarted) {
            if self.limits.max_in_flight > 0 && active >= self.limits.max_in_flight {
                break;
            }

            let nonce = self.nonces.next_nonce(address).await?;
            let attempt = match self.first_attempt(tx, nonce).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    self.nonces.release_nonce(address, nonce).await;
                    if let TxmError::KeyUnavailable { .. } = e {
                        warn!(
                            "Signing unavailable for {:?} on chain {}, {} stays queued",
                            address, self.chain_id, tx.id
                        );
                        return Ok(started);
                    }
                    return Err(e);
                }
            };

            if let Err(e) = self.store.start_transaction(tx.id, &attempt).await {
                self.nonces.release_nonce(address, nonce).await;
                return Err(e);
            }

            let mut started_tx = tx.clone();
            started_tx.state = TxState::InProgress;
            started_tx.nonce = Some(nonce);
            self.send_attempt(&started_tx, attempt).await?;

            active += 1;
            started += 1;
        }

        Ok(started)
    }

    async fn first_attempt(&self, tx: &Transaction, nonce: u64) -> TxmResult<TxAttempt> {
        let fee = self.estimator.estimate(self.client.as_ref(), &self.policy).await?;
        self.builder.build(tx, nonce, fee, None).await
    }

    /// Record a built attempt, or reinstate the stored one with the same hash.
    ///
    /// Signing is deterministic, so rebuilding at an earlier fee reproduces an
    /// earlier attempt byte for byte; the ledger keeps one record per hash.
    pub(crate) async fn record_or_reuse(
        &self,
        tx: &Transaction,
        built: TxAttempt,
    ) -> TxmResult<TxAttempt> {
        match tx.attempts.iter().find(|a| a.hash == built.hash) {
            Some(existing) => {
                debug!(
                    "Reusing attempt {} ({:?}) for {} on chain {}",
                    existing.id, existing.hash, tx.id, self.chain_id
                );
                self.store.reuse_attempt(existing.id).await
            }
            None => {
                self.store.record_attempt(&built).await?;
                Ok(built)
            }
        }
    }

    /// Submit a recorded attempt and act on the outcome.
    ///
    /// Underpriced attempts are bumped and resubmitted until accepted or the
    /// fee ceiling is hit. Network failures leave the attempt Pending for the
    /// next head. A nonce the chain already counts is left to receipts and
    /// the external-nonce rule.
    pub(crate) async fn send_attempt(&self, tx: &Transaction, attempt: TxAttempt) -> TxmResult<()> {
        let mut attempt = attempt;

        loop {
            match self.broadcaster.submit(&attempt).await? {
                SubmitOutcome::Accepted | SubmitOutcome::AlreadyKnown => {
                    self.store
                        .mark_attempt_broadcast(attempt.id, Utc::now())
                        .await?;
                    return Ok(());
                }
                SubmitOutcome::NonceTooLow(message) => {
                    warn!(
                        "Nonce {} of {} already used on chain {}: {}",
                        attempt.nonce, tx.id, self.chain_id, message
                    );
                    self.store
                        .mark_attempt_broadcast(attempt.id, Utc::now())
                        .await?;
                    return Ok(());
                }
                SubmitOutcome::NetworkError(message) => {
                    warn!(
                        "Attempt {:?} for {} left pending on chain {}: {}",
                        attempt.hash, tx.id, self.chain_id, message
                    );
                    return Ok(());
                }
                SubmitOutcome::Rejected(reason) => {
                    self.fail_fatal(tx, &format!("rejected by chain: {}", reason))
                        .await?;
                    return Ok(());
                }
                SubmitOutcome::Underpriced(_) => {
                    self.store.mark_attempt_underpriced(attempt.id).await?;
                    match self.next_bump(tx, &attempt).await? {
                        Some(next) => attempt = next,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Build and record a higher-priced attempt at the same nonce.
    ///
    /// Returns None after marking the transaction Fatal at the fee ceiling.
    async fn next_bump(&self, tx: &Transaction, current: &TxAttempt) -> TxmResult<Option<TxAttempt>> {
        let fee = match self.policy.bump(&current.fee) {
            Ok(fee) => fee,
            Err(e @ TxmError::FeeCeilingExceeded { .. }) => {
                warn!(
                    "Bump for {} (nonce {}) on chain {}: {}",
                    tx.id, current.nonce, self.chain_id, e
                );
                crate::metrics::record_bump_exceeds_limit(self.chain_id);
                self.fail_fatal(tx, "gas price ceiling exceeded").await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let built = self
            .builder
            .build(tx, current.nonce, fee, Some(current.gas_limit))
            .await?;
        let next = self.record_or_reuse(tx, built).await?;

        crate::metrics::record_gas_bump(self.chain_id);
        info!(
            chain_id = self.chain_id,
            tx_id = %tx.id,
            nonce = current.nonce,
            from = %current.fee,
            to = %next.fee,
            "Bumped gas"
        );
        Ok(Some(next))
    }

    /// Escalate a stuck attempt and broadcast the replacement
    pub(crate) async fn bump_attempt(&self, tx: &Transaction, current: &TxAttempt) -> TxmResult<()> {
        match self.next_bump(tx, current).await? {
            Some(next) => self.send_attempt(tx, next).await,
            None => Ok(()),
        }
    }

    /// Send the canonical attempt again at the same fee.
    ///
    /// The rebuilt payload has the same hash, so the stored record is reused
    /// and no new attempt appears in the ledger.
    pub(crate) async fn resend(&self, tx: &Transaction, current: &TxAttempt) -> TxmResult<()> {
        let built = self
            .builder
            .build(tx, current.nonce, current.fee, Some(current.gas_limit))
            .await?;
        let attempt = self.record_or_reuse(tx, built).await?;
        crate::metrics::record_resend(self.chain_id);
        self.send_attempt(tx, attempt).await
    }

    async fn fail_fatal(&self, tx: &Transaction, reason: &str) -> TxmResult<()> {
        if self.store.mark_fatal(tx.id, reason).await? {
            crate::metrics::record_tx_fatal(self.chain_id);
            error!(
                chain_id = self.chain_id,
                tx_id = %tx.id,
                from = ?tx.from,
                nonce = ?tx.nonce,
                "Transaction fatal: {}",
                reason
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SendOutcome;
    use crate::store::{AttemptState, InMemoryTxStore};
    use crate::testing::{gwei, keystore_with_key, FakeChain};
    use crate::tx::{FeeModel, FeeParams};
    use ethers::types::{Bytes, U256};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_secs(1),
        )
    }

    fn setup(limits: QueueLimits) -> (Arc<ChainContext>, Arc<FakeChain>, Address) {
        let chain = Arc::new(FakeChain::new(1));
        let (keystore, address) = keystore_with_key(1);
        let policy = GasPolicy::new(FeeModel::Legacy, 3, 1.2, 50, 2).unwrap();
        let ctx = ChainContext::new(
            chain.clone(),
            Arc::new(InMemoryTxStore::new()),
            keystore,
            policy,
            fast_retry(),
            Arc::new(AccountLocks::new()),
            limits,
        );
        (Arc::new(ctx), chain, address)
    }

    fn request(from: Address) -> NewTransaction {
        NewTransaction {
            chain_id: 1,
            from,
            to: Address::repeat_byte(0x22),
            value: U256::from(5),
            data: Bytes::default(),
            gas_limit: 21_000,
        }
    }

    #[tokio::test]
    async fn test_create_starts_and_broadcasts() {
        let (ctx, chain, from) = setup(QueueLimits::default());

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();

        assert_eq!(tx.state, TxState::InProgress);
        assert_eq!(tx.nonce, Some(0));
        assert_eq!(tx.attempts.len(), 1);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
        // 10 gwei suggested + 10% buffer
        assert_eq!(
            tx.attempts[0].fee,
            FeeParams::Legacy { gas_price: gwei(11) }
        );
        assert_eq!(chain.sent_hashes(), vec![tx.attempts[0].hash]);
    }

    #[tokio::test]
    async fn test_initial_fee_is_clamped_to_ceiling() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.set_fee(FeeParams::Legacy { gas_price: gwei(60) });

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.attempts[0].fee, FeeParams::Legacy { gas_price: gwei(50) });
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_contiguous_nonces() {
        let (ctx, _chain, from) = setup(QueueLimits::default());

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.create_transaction(&request(from)).await })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            nonces.push(ctx.store.get_transaction(id).await.unwrap().nonce.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_queue_and_in_flight_limits() {
        let (ctx, _chain, from) = setup(QueueLimits {
            max_queued: 2,
            max_in_flight: 1,
        });

        let first = ctx.create_transaction(&request(from)).await.unwrap();
        ctx.create_transaction(&request(from)).await.unwrap();
        ctx.create_transaction(&request(from)).await.unwrap();

        let err = ctx.create_transaction(&request(from)).await.unwrap_err();
        assert!(matches!(err, TxmError::QueueFull { queued: 2, .. }));

        assert_eq!(
            ctx.store.get_transaction(first).await.unwrap().state,
            TxState::InProgress
        );
        assert_eq!(
            ctx.store
                .count_by_state(1, from, TxState::Unstarted)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_unknown_key_keeps_queue_order() {
        let (ctx, chain, _) = setup(QueueLimits::default());
        let stranger = Address::repeat_byte(0x99);

        let first = ctx.create_transaction(&request(stranger)).await.unwrap();
        let second = ctx.create_transaction(&request(stranger)).await.unwrap();

        for id in [first, second] {
            let tx = ctx.store.get_transaction(id).await.unwrap();
            assert_eq!(tx.state, TxState::Unstarted);
            assert_eq!(tx.nonce, None);
        }
        assert_eq!(chain.sent_count(), 0);
        assert_eq!(ctx.nonces.cursor(stranger).await, Some(0));
    }

    #[tokio::test]
    async fn test_underpriced_bumps_until_accepted() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.script_send(Ok(SendOutcome::Underpriced("replacement transaction underpriced".into())));

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();

        assert_eq!(tx.attempts.len(), 2);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
        assert_eq!(tx.attempts[1].state, AttemptState::Superseded);
        assert_eq!(
            tx.attempts[0].fee,
            FeeParams::Legacy {
                gas_price: U256::from(13_200_000_000u64)
            }
        );
        assert_eq!(chain.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_send_is_fatal() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.script_send(Ok(SendOutcome::Rejected("insufficient funds".into())));

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.state, TxState::Fatal);
        assert!(tx.error.unwrap().contains("insufficient funds"));
    }

    #[tokio::test]
    async fn test_resend_reuses_the_stored_attempt() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.script_send(Err("connection reset".into()));
        chain.script_send(Err("connection reset".into()));

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();
        let pending = tx.attempts[0].clone();
        assert_eq!(pending.state, AttemptState::Pending);

        ctx.resend(&tx, &pending).await.unwrap();
        ctx.resend(&ctx.store.get_transaction(id).await.unwrap(), &pending)
            .await
            .unwrap();

        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.attempts.len(), 1);
        assert_eq!(tx.attempts[0].id, pending.id);
        assert_eq!(tx.attempts[0].hash, pending.hash);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
        // two failed sends, one accepted, one already known
        assert_eq!(chain.sent_count(), 4);
    }

    #[tokio::test]
    async fn test_rebuilding_an_earlier_fee_reinstates_its_record() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.script_send(Ok(SendOutcome::Underpriced("replacement transaction underpriced".into())));

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.attempts.len(), 2);
        let first = tx.attempts[1].clone();

        let built = ctx
            .builder
            .build(&tx, first.nonce, first.fee, Some(first.gas_limit))
            .await
            .unwrap();
        let reused = ctx.record_or_reuse(&tx, built).await.unwrap();
        assert_eq!(reused.id, first.id);

        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.attempts.len(), 2);
        assert_eq!(tx.canonical_attempt().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_nonce_too_low_is_left_to_the_confirmer() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.script_send(Ok(SendOutcome::NonceTooLow("nonce too low".into())));

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.state, TxState::InProgress);
        assert_eq!(tx.attempts.len(), 1);
        assert_eq!(tx.attempts[0].state, AttemptState::Broadcast);
        assert!(tx.attempts[0].broadcast_at.is_some());
        assert_eq!(chain.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_leaves_attempt_pending() {
        let (ctx, chain, from) = setup(QueueLimits::default());
        chain.script_send(Err("connection reset".into()));
        chain.script_send(Err("connection reset".into()));

        let id = ctx.create_transaction(&request(from)).await.unwrap();
        let tx = ctx.store.get_transaction(id).await.unwrap();
        assert_eq!(tx.state, TxState::InProgress);
        assert_eq!(tx.attempts[0].state, AttemptState::Pending);
        assert!(tx.attempts[0].broadcast_at.is_none());
    }
}
