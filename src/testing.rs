//! Scripted chain client and fixtures for engine tests

use crate::chain::{poll_new_heads, ChainClient, ReceiptInfo, SendOutcome};
use crate::error::{TxmError, TxmResult};
use crate::keystore::LocalKeystore;
use crate::tx::{FeeModel, FeeParams};

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GWEI: u64 = 1_000_000_000;

/// In-memory chain: mined counts and receipts are set by the test,
/// send results are scripted or default to mempool semantics.
pub struct FakeChain {
    chain_id: u64,
    head: AtomicU64,
    tx_counts: Mutex<HashMap<Address, u64>>,
    count_failures: AtomicU64,
    receipts: Mutex<HashMap<H256, ReceiptInfo>>,
    script: Mutex<VecDeque<Result<SendOutcome, String>>>,
    mempool: Mutex<HashSet<Bytes>>,
    sent: Mutex<Vec<Bytes>>,
    fee: Mutex<FeeParams>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(0),
            tx_counts: Mutex::new(HashMap::new()),
            count_failures: AtomicU64::new(0),
            receipts: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            mempool: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            fee: Mutex::new(FeeParams::Legacy {
                gas_price: U256::from(10 * GWEI),
            }),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_tx_count(&self, address: Address, count: u64) {
        self.tx_counts.lock().unwrap().insert(address, count);
    }

    /// Fail the next `n` transaction-count queries
    pub fn fail_tx_count(&self, n: u64) {
        self.count_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fee(&self, fee: FeeParams) {
        *self.fee.lock().unwrap() = fee;
    }

    /// Queue the result of the next send; `Err` is a transport failure
    pub fn script_send(&self, outcome: Result<SendOutcome, String>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn mine(&self, hash: H256, block: u64) {
        self.insert_receipt(hash, block, true);
    }

    pub fn mine_reverted(&self, hash: H256, block: u64) {
        self.insert_receipt(hash, block, false);
    }

    /// Mine at `block` on a different fork than `mine` uses
    pub fn mine_in(&self, hash: H256, block: u64, block_hash: H256) {
        self.receipts.lock().unwrap().insert(
            hash,
            ReceiptInfo {
                tx_hash: hash,
                block_number: block,
                block_hash: Some(block_hash),
                success: true,
            },
        );
    }

    pub fn unmine(&self, hash: H256) {
        self.receipts.lock().unwrap().remove(&hash);
    }

    /// Forget every pending transaction, as a restarted node would
    pub fn drop_mempool(&self) {
        self.mempool.lock().unwrap().clear();
    }

    fn insert_receipt(&self, hash: H256, block: u64, success: bool) {
        self.receipts.lock().unwrap().insert(
            hash,
            ReceiptInfo {
                tx_hash: hash,
                block_number: block,
                block_hash: Some(H256::from_low_u64_be(block)),
                success,
            },
        );
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_hashes(&self) -> Vec<H256> {
        self.sent()
            .iter()
            .map(|raw| H256::from(keccak256(raw)))
            .collect()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> TxmResult<SendOutcome> {
        self.sent.lock().unwrap().push(raw.clone());

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted.map_err(|message| TxmError::Network {
                chain_id: self.chain_id,
                message,
            });
        }

        if self.mempool.lock().unwrap().insert(raw.clone()) {
            Ok(SendOutcome::Accepted)
        } else {
            Ok(SendOutcome::AlreadyKnown)
        }
    }

    async fn get_transaction_count(&self, address: Address) -> TxmResult<u64> {
        let failures = self.count_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.count_failures.store(failures - 1, Ordering::SeqCst);
            return Err(TxmError::Network {
                chain_id: self.chain_id,
                message: "connection refused".to_string(),
            });
        }
        Ok(*self.tx_counts.lock().unwrap().get(&address).unwrap_or(&0))
    }

    async fn get_receipt(&self, hash: H256) -> TxmResult<Option<ReceiptInfo>> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn block_number(&self) -> TxmResult<u64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn suggest_fee(&self, model: FeeModel) -> TxmResult<FeeParams> {
        let fee = *self.fee.lock().unwrap();
        Ok(match (model, fee) {
            (FeeModel::Eip1559, FeeParams::Legacy { gas_price }) => FeeParams::DynamicFee {
                tip: gas_price / 10,
                fee_cap: gas_price,
            },
            (_, fee) => fee,
        })
    }

    fn subscribe_new_heads(self: Arc<Self>, poll_interval: Duration) -> BoxStream<'static, u64> {
        poll_new_heads(self, poll_interval)
    }
}

/// Keystore with one fresh random key enabled for `chain_id`
pub fn keystore_with_key(chain_id: u64) -> (Arc<LocalKeystore>, Address) {
    let keystore = LocalKeystore::new();
    let address = keystore.add_wallet(LocalWallet::new(&mut rand::thread_rng()), vec![chain_id]);
    (Arc::new(keystore), address)
}

pub fn gwei(v: u64) -> U256 {
    U256::from(v) * U256::from(GWEI)
}
