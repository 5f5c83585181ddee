//! Attempt construction and signing

use super::gas::FeeParams;
use crate::error::{TxmError, TxmResult};
use crate::keystore::Keystore;
use crate::store::{AttemptState, Transaction, TxAttempt};

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Turns (transaction, nonce, fee) into a signed attempt.
///
/// Never touches the ledger; the caller records the result.
pub struct AttemptBuilder {
    keystore: Arc<dyn Keystore>,
}

impl AttemptBuilder {
    pub fn new(keystore: Arc<dyn Keystore>) -> Self {
        Self { keystore }
    }

    /// The unsigned payload for an attempt. Same inputs, same payload.
    pub fn unsigned_payload(
        tx: &Transaction,
        nonce: u64,
        fee: &FeeParams,
        gas_limit: u64,
    ) -> TypedTransaction {
        match fee {
            FeeParams::Legacy { gas_price } => TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .value(tx.value)
                .data(tx.data.clone())
                .nonce(nonce)
                .gas(gas_limit)
                .gas_price(*gas_price)
                .chain_id(tx.chain_id)
                .into(),
            FeeParams::DynamicFee { tip, fee_cap } => Eip1559TransactionRequest::new()
                .from(tx.from)
                .to(tx.to)
                .value(tx.value)
                .data(tx.data.clone())
                .nonce(nonce)
                .gas(gas_limit)
                .max_priority_fee_per_gas(*tip)
                .max_fee_per_gas(*fee_cap)
                .chain_id(tx.chain_id)
                .into(),
        }
    }

    /// Build and sign a new attempt.
    ///
    /// `KeyUnavailable` is returned unchanged so the caller can retry later.
    pub async fn build(
        &self,
        tx: &Transaction,
        nonce: u64,
        fee: FeeParams,
        gas_limit_override: Option<u64>,
    ) -> TxmResult<TxAttempt> {
        fee.validate()?;
        let gas_limit = gas_limit_override.unwrap_or(tx.gas_limit);
        if gas_limit == 0 {
            return Err(TxmError::Validation("gas limit must be positive".to_string()));
        }

        let payload = Self::unsigned_payload(tx, nonce, &fee, gas_limit);
        let signed_raw = self.keystore.sign(tx.from, tx.chain_id, &payload).await?;
        let hash = H256::from(keccak256(&signed_raw));

        debug!(
            "Built attempt {:?} for tx {} (nonce {}, {})",
            hash, tx.id, nonce, fee
        );

        Ok(TxAttempt {
            id: Uuid::new_v4(),
            tx_id: tx.id,
            nonce,
            fee,
            gas_limit,
            signed_raw,
            hash,
            state: AttemptState::Pending,
            broadcast_at: None,
            broadcast_block: None,
            included_block: None,
            included_block_hash: None,
            last_sent_at: None,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MockKeystore;
    use crate::store::TxState;
    use crate::testing::{gwei, keystore_with_key};
    use ethers::types::{Address, Bytes, U256};

    fn transaction(from: Address) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            chain_id: 1,
            from,
            to: Address::repeat_byte(0x22),
            value: U256::from(1_000),
            data: Bytes::from(vec![0xde, 0xad]),
            gas_limit: 50_000,
            nonce: None,
            state: TxState::Unstarted,
            error: None,
            created_at: Utc::now(),
            attempts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_build_is_deterministic_for_same_inputs() {
        let (keystore, address) = keystore_with_key(1);
        let builder = AttemptBuilder::new(keystore);
        let tx = transaction(address);
        let fee = FeeParams::Legacy { gas_price: gwei(10) };

        let a = builder.build(&tx, 3, fee, None).await.unwrap();
        let b = builder.build(&tx, 3, fee, None).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.signed_raw, b.signed_raw);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash, H256::from(keccak256(&a.signed_raw)));
        assert_eq!(a.state, AttemptState::Pending);
        assert_eq!(a.gas_limit, 50_000);

        let bumped = builder
            .build(&tx, 3, FeeParams::Legacy { gas_price: gwei(12) }, None)
            .await
            .unwrap();
        assert_ne!(bumped.hash, a.hash);
    }

    #[tokio::test]
    async fn test_dynamic_fee_payload() {
        let tx = transaction(Address::repeat_byte(0x11));
        let payload = AttemptBuilder::unsigned_payload(
            &tx,
            9,
            &FeeParams::DynamicFee {
                tip: gwei(2),
                fee_cap: gwei(40),
            },
            60_000,
        );

        match payload {
            TypedTransaction::Eip1559(req) => {
                assert_eq!(req.max_fee_per_gas, Some(gwei(40)));
                assert_eq!(req.max_priority_fee_per_gas, Some(gwei(2)));
                assert_eq!(req.nonce, Some(U256::from(9)));
                assert_eq!(req.gas, Some(U256::from(60_000)));
            }
            other => panic!("expected EIP-1559 payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signs_with_sender_and_chain() {
        let from = Address::repeat_byte(0x11);
        let mut keystore = MockKeystore::new();
        keystore
            .expect_sign()
            .withf(move |address, chain_id, _| *address == from && *chain_id == 1)
            .times(1)
            .returning(|_, _, _| Ok(Bytes::from(vec![1, 2, 3])));

        let builder = AttemptBuilder::new(Arc::new(keystore));
        let attempt = builder
            .build(
                &transaction(from),
                0,
                FeeParams::Legacy { gas_price: gwei(1) },
                Some(80_000),
            )
            .await
            .unwrap();

        assert_eq!(attempt.signed_raw, Bytes::from(vec![1, 2, 3]));
        assert_eq!(attempt.gas_limit, 80_000);
    }

    #[tokio::test]
    async fn test_key_unavailable_and_bad_fee() {
        let from = Address::repeat_byte(0x11);
        let mut keystore = MockKeystore::new();
        keystore
            .expect_sign()
            .returning(move |address, chain_id, _| {
                Err(TxmError::KeyUnavailable { address, chain_id })
            });
        let builder = AttemptBuilder::new(Arc::new(keystore));
        let tx = transaction(from);

        let err = builder
            .build(&tx, 0, FeeParams::Legacy { gas_price: gwei(1) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::KeyUnavailable { .. }));

        let err = builder
            .build(&tx, 0, FeeParams::Legacy { gas_price: U256::zero() }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TxmError::Validation(_)));
    }
}
