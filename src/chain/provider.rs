//! Ethers-backed chain client with multi-RPC support and automatic failover

use super::{poll_new_heads, ChainClient, ReceiptInfo, SendOutcome};
use crate::error::{TxmError, TxmResult};
use crate::tx::{FeeModel, FeeParams};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default priority fee when the node offers no better estimate (2 gwei)
const DEFAULT_PRIORITY_FEE: u64 = 2_000_000_000;

/// Multi-provider wrapper with automatic failover
pub struct EthersChainClient {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthersChainClient {
    /// Create a new chain client
    pub async fn new(chain_id: u64, rpc_urls: &[String]) -> TxmResult<Self> {
        let mut http_providers = Vec::new();

        for url in rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxmError::Network {
                chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    fn network_error(&self, message: impl Into<String>) -> TxmError {
        TxmError::Network {
            chain_id: self.chain_id,
            message: message.into(),
        }
    }

    /// Estimate EIP-1559 fees from the latest base fee
    async fn estimate_eip1559_fees(&self) -> TxmResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| TxmError::GasEstimation(e.to_string()))?
            .ok_or_else(|| TxmError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| TxmError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(DEFAULT_PRIORITY_FEE);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok((max_fee, priority_fee))
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> TxmResult<SendOutcome> {
        match self.http().send_raw_transaction(raw.clone()).await {
            Ok(pending) => {
                debug!(
                    "Chain {} accepted transaction {:?}",
                    self.chain_id,
                    pending.tx_hash()
                );
                Ok(SendOutcome::Accepted)
            }
            Err(e) => {
                let outcome = classify_send_error(self.chain_id, &e.to_string());
                if outcome.is_err() {
                    self.failover();
                }
                outcome
            }
        }
    }

    async fn get_transaction_count(&self, address: Address) -> TxmResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_count(address, None).await {
                Ok(count) => return Ok(count.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get transaction count from chain {}: {}",
                        self.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.network_error("All providers failed to get transaction count"))
    }

    async fn get_receipt(&self, hash: H256) -> TxmResult<Option<ReceiptInfo>> {
        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.network_error(e.to_string()))?;

        Ok(receipt.and_then(|r| {
            // Receipts without a block number are still pending
            r.block_number.map(|block| ReceiptInfo {
                tx_hash: r.transaction_hash,
                block_number: block.as_u64(),
                block_hash: r.block_hash,
                success: r.status == Some(1u64.into()),
            })
        }))
    }

    async fn block_number(&self) -> TxmResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.network_error("All providers failed"))
    }

    async fn suggest_fee(&self, model: FeeModel) -> TxmResult<FeeParams> {
        match model {
            FeeModel::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| TxmError::GasEstimation(e.to_string()))?;
                Ok(FeeParams::Legacy { gas_price: price })
            }
            FeeModel::Eip1559 => {
                let (fee_cap, tip) = self.estimate_eip1559_fees().await?;
                Ok(FeeParams::DynamicFee { tip, fee_cap })
            }
        }
    }

    fn subscribe_new_heads(self: Arc<Self>, poll_interval: Duration) -> BoxStream<'static, u64> {
        poll_new_heads(self, poll_interval)
    }
}

/// Map a node's error message for `eth_sendRawTransaction` to an outcome.
///
/// Unrecognised messages are treated as transient network errors so the
/// attempt is retried rather than abandoned.
pub fn classify_send_error(chain_id: u64, message: &str) -> TxmResult<SendOutcome> {
    let lower = message.to_lowercase();

    const ALREADY_KNOWN: &[&str] = &["already known", "known transaction", "alreadyknown"];
    const NONCE_TOO_LOW: &[&str] = &["nonce too low", "nonce has already been used"];
    const UNDERPRICED: &[&str] = &[
        "replacement transaction underpriced",
        "transaction underpriced",
        "fee too low",
        "max fee per gas less than block base fee",
    ];
    const REJECTED: &[&str] = &[
        "insufficient funds",
        "exceeds block gas limit",
        "intrinsic gas too low",
        "invalid sender",
        "tx fee exceeds the configured cap",
        "oversized data",
    ];

    if ALREADY_KNOWN.iter().any(|p| lower.contains(p)) {
        Ok(SendOutcome::AlreadyKnown)
    } else if NONCE_TOO_LOW.iter().any(|p| lower.contains(p)) {
        Ok(SendOutcome::NonceTooLow(message.to_string()))
    } else if UNDERPRICED.iter().any(|p| lower.contains(p)) {
        Ok(SendOutcome::Underpriced(message.to_string()))
    } else if REJECTED.iter().any(|p| lower.contains(p)) {
        Ok(SendOutcome::Rejected(message.to_string()))
    } else {
        Err(TxmError::Network {
            chain_id,
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_errors() {
        assert_eq!(
            classify_send_error(1, "(code: -32000, message: already known, data: None)").unwrap(),
            SendOutcome::AlreadyKnown
        );
        assert_eq!(
            classify_send_error(1, "nonce too low: next nonce 8, tx nonce 7").unwrap(),
            SendOutcome::NonceTooLow("nonce too low: next nonce 8, tx nonce 7".to_string())
        );
        assert!(matches!(
            classify_send_error(1, "Nonce has already been used").unwrap(),
            SendOutcome::NonceTooLow(_)
        ));
        assert!(matches!(
            classify_send_error(1, "replacement transaction underpriced").unwrap(),
            SendOutcome::Underpriced(_)
        ));
        assert!(matches!(
            classify_send_error(1, "insufficient funds for gas * price + value").unwrap(),
            SendOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_unknown_errors_are_transient() {
        let err = classify_send_error(7, "connection reset by peer").unwrap_err();
        assert!(matches!(err, TxmError::Network { chain_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_new_rejects_empty_url_list() {
        let result = EthersChainClient::new(1, &[]).await;
        assert!(matches!(result, Err(TxmError::Network { .. })));
    }
}
