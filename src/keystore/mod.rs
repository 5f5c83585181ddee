//! Signing capability backed by local wallets
//!
//! Keys are loaded from environment variables named in the configuration,
//! never from the config file itself.

use crate::config::KeyConfig;
use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use tracing::{info, warn};

/// Signs transactions for locally-held accounts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Sign `tx` as `address` on `chain_id` and return the raw signed bytes.
    ///
    /// Fails with `KeyUnavailable` when the key is unknown, disabled or not
    /// enabled for the chain.
    async fn sign(&self, address: Address, chain_id: u64, tx: &TypedTransaction)
        -> TxmResult<Bytes>;

    /// Addresses allowed to send on `chain_id`, sorted
    fn enabled_addresses(&self, chain_id: u64) -> Vec<Address>;
}

struct KeyEntry {
    wallet: LocalWallet,
    chain_ids: Vec<u64>,
    enabled: bool,
}

/// In-process keystore of `LocalWallet`s
pub struct LocalKeystore {
    keys: DashMap<Address, KeyEntry>,
}

impl LocalKeystore {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Load keys from the environment variables listed in the config
    pub fn from_config(keys: &[KeyConfig]) -> TxmResult<Self> {
        let keystore = Self::new();

        for key in keys {
            let secret = std::env::var(&key.private_key_env).map_err(|_| {
                TxmError::Wallet(format!(
                    "Environment variable {} is not set",
                    key.private_key_env
                ))
            })?;
            let wallet = secret
                .trim()
                .parse::<LocalWallet>()
                .map_err(|e| TxmError::Wallet(format!("Invalid private key: {}", e)))?;

            let address = keystore.add_wallet(wallet, key.chain_ids.clone());
            if !key.enabled {
                keystore.set_enabled(address, false)?;
            }
            info!(
                "Loaded key {:?} for chains {:?} (enabled: {})",
                address, key.chain_ids, key.enabled
            );
        }

        Ok(keystore)
    }

    /// Register a wallet for the given chains, enabled
    pub fn add_wallet(&self, wallet: LocalWallet, chain_ids: Vec<u64>) -> Address {
        let address = wallet.address();
        self.keys.insert(
            address,
            KeyEntry {
                wallet,
                chain_ids,
                enabled: true,
            },
        );
        address
    }

    pub fn set_enabled(&self, address: Address, enabled: bool) -> TxmResult<()> {
        let mut entry = self
            .keys
            .get_mut(&address)
            .ok_or_else(|| TxmError::Wallet(format!("Unknown key {:?}", address)))?;
        if entry.enabled != enabled {
            warn!("Key {:?} enabled flag set to {}", address, enabled);
        }
        entry.enabled = enabled;
        Ok(())
    }
}

impl Default for LocalKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Keystore for LocalKeystore {
    async fn sign(
        &self,
        address: Address,
        chain_id: u64,
        tx: &TypedTransaction,
    ) -> TxmResult<Bytes> {
        let wallet = {
            let entry = self
                .keys
                .get(&address)
                .filter(|e| e.enabled && e.chain_ids.contains(&chain_id))
                .ok_or(TxmError::KeyUnavailable { address, chain_id })?;
            entry.wallet.clone().with_chain_id(chain_id)
        };

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| TxmError::Wallet(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }

    fn enabled_addresses(&self, chain_id: u64) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .keys
            .iter()
            .filter(|e| e.enabled && e.chain_ids.contains(&chain_id))
            .map(|e| *e.key())
            .collect();
        addresses.sort();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    fn sample_tx(chain_id: u64) -> TypedTransaction {
        TransactionRequest::new()
            .to(Address::repeat_byte(0x22))
            .value(1u64)
            .nonce(0u64)
            .gas(21_000u64)
            .gas_price(1_000_000_000u64)
            .chain_id(chain_id)
            .into()
    }

    #[tokio::test]
    async fn test_sign_is_deterministic() {
        let keystore = LocalKeystore::new();
        let address = keystore.add_wallet(LocalWallet::new(&mut rand::thread_rng()), vec![1]);

        let tx = sample_tx(1);
        let a = keystore.sign(address, 1, &tx).await.unwrap();
        let b = keystore.sign(address, 1, &tx).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_disabled_or_foreign_chain_key_is_unavailable() {
        let keystore = LocalKeystore::new();
        let address = keystore.add_wallet(LocalWallet::new(&mut rand::thread_rng()), vec![1]);

        let err = keystore.sign(address, 5, &sample_tx(5)).await.unwrap_err();
        assert!(matches!(err, TxmError::KeyUnavailable { chain_id: 5, .. }));

        keystore.set_enabled(address, false).unwrap();
        let err = keystore.sign(address, 1, &sample_tx(1)).await.unwrap_err();
        assert!(matches!(err, TxmError::KeyUnavailable { .. }));
        assert!(keystore.enabled_addresses(1).is_empty());
    }

    #[test]
    fn test_from_config_requires_env_var() {
        let keys = vec![KeyConfig {
            private_key_env: "TXM_TEST_KEY_THAT_IS_NOT_SET".to_string(),
            chain_ids: vec![1],
            enabled: true,
        }];
        assert!(matches!(
            LocalKeystore::from_config(&keys),
            Err(TxmError::Wallet(_))
        ));
    }
}
