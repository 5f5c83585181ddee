//! Chain module - the chain client seam and multi-chain connection management
//!
//! This module provides:
//! - The `ChainClient` capability consumed by the engine
//! - Multi-RPC provider management with automatic failover
//! - New-head subscription by block polling

pub mod heads;
pub mod provider;

pub use heads::poll_new_heads;
pub use provider::{classify_send_error, EthersChainClient};

use crate::config::Settings;
use crate::error::{TxmError, TxmResult};
use crate::tx::{FeeModel, FeeParams};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256};
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of handing a raw transaction to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// The node already has these exact bytes
    AlreadyKnown,
    /// The account's nonce moved past this one; some transaction used it
    NonceTooLow(String),
    /// A transaction with this nonce is pending at an equal or higher price
    Underpriced(String),
    /// Permanent rejection (insufficient funds, invalid transaction, ...)
    Rejected(String),
}

/// Receipt fields the engine cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptInfo {
    pub tx_hash: H256,
    pub block_number: u64,
    pub block_hash: Option<H256>,
    /// false when execution reverted; the nonce is consumed either way
    pub success: bool,
}

/// Black-box access to one chain.
///
/// Transient transport failures surface as `TxmError::Network`; everything
/// the node actually answered about a send is a `SendOutcome`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn send_raw_transaction(&self, raw: &Bytes) -> TxmResult<SendOutcome>;

    /// Number of transactions mined from `address` (the next unused nonce)
    async fn get_transaction_count(&self, address: Address) -> TxmResult<u64>;

    async fn get_receipt(&self, hash: H256) -> TxmResult<Option<ReceiptInfo>>;

    async fn block_number(&self) -> TxmResult<u64>;

    async fn suggest_fee(&self, model: FeeModel) -> TxmResult<FeeParams>;

    /// Stream of new head block numbers
    fn subscribe_new_heads(self: Arc<Self>, poll_interval: Duration) -> BoxStream<'static, u64>;
}

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain clients indexed by chain ID
    clients: DashMap<u64, Arc<dyn ChainClient>>,
}

impl ChainManager {
    /// Create a chain manager with a client for every enabled chain
    pub async fn new(settings: &Settings) -> TxmResult<Self> {
        let manager = Self::empty();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let client =
                EthersChainClient::new(chain_config.chain_id, &chain_config.rpc_urls).await?;
            manager.insert(Arc::new(client));

            info!("Chain {} initialized successfully", name);
        }

        Ok(manager)
    }

    pub fn empty() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn insert(&self, client: Arc<dyn ChainClient>) {
        self.clients.insert(client.chain_id(), client);
    }

    /// Get client for a specific chain
    pub fn get_client(&self, chain_id: u64) -> TxmResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(TxmError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let clients: Vec<_> = self
            .clients
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(clients.len());
        for (chain_id, client) in clients {
            let healthy = match client.block_number().await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Health check failed for chain {}: {}", chain_id, e);
                    false
                }
            };
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.clients.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }
}
