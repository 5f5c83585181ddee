//! Per-account serialization domain
//!
//! Two layers:
//! - `AccountLocks`: keyed async mutex held around every nonce-affecting
//!   path inside this process
//! - `AccountLeases`: fail-fast exclusive ownership of an account across
//!   processes (confirmer vs. operator rebroadcast)

use crate::error::{TxmError, TxmResult};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use sha3::{Digest, Keccak256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// A signing account on one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub chain_id: u64,
    pub address: Address,
}

impl AccountKey {
    pub fn new(chain_id: u64, address: Address) -> Self {
        Self { chain_id, address }
    }

    /// 64-bit advisory lock id: first 8 bytes of keccak256(chain_id ‖ address)
    pub fn lock_id(&self) -> i64 {
        let mut hasher = Keccak256::new();
        hasher.update(self.chain_id.to_be_bytes());
        hasher.update(self.address.as_bytes());
        let digest = hasher.finalize();

        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(id)
    }

    fn busy(&self) -> TxmError {
        TxmError::ResourceBusy {
            chain_id: self.chain_id,
            address: self.address,
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.address, self.chain_id)
    }
}

/// Keyed async mutex over accounts
#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<AccountKey, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the account
    pub async fn lock(&self, key: AccountKey) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

/// Held ownership of an account; released on drop
pub struct AccountLease {
    key: AccountKey,
    _holder: Box<dyn Send>,
}

impl AccountLease {
    fn new(key: AccountKey, holder: Box<dyn Send>) -> Self {
        Self {
            key,
            _holder: holder,
        }
    }

    pub fn key(&self) -> AccountKey {
        self.key
    }
}

impl fmt::Debug for AccountLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountLease").field("key", &self.key).finish()
    }
}

/// Exclusive account ownership that never blocks
#[async_trait]
pub trait AccountLeases: Send + Sync {
    /// Take the lease or fail immediately with `ResourceBusy`
    async fn try_acquire(&self, key: AccountKey) -> TxmResult<AccountLease>;
}

/// Leases shared by components of a single process
#[derive(Default, Clone)]
pub struct LocalLeases {
    held: Arc<DashMap<AccountKey, ()>>,
}

impl LocalLeases {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalLeaseGuard {
    held: Arc<DashMap<AccountKey, ()>>,
    key: AccountKey,
}

impl Drop for LocalLeaseGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[async_trait]
impl AccountLeases for LocalLeases {
    async fn try_acquire(&self, key: AccountKey) -> TxmResult<AccountLease> {
        match self.held.entry(key) {
            Entry::Occupied(_) => Err(key.busy()),
            Entry::Vacant(slot) => {
                slot.insert(());
                let guard = LocalLeaseGuard {
                    held: self.held.clone(),
                    key,
                };
                Ok(AccountLease::new(key, Box::new(guard)))
            }
        }
    }
}

/// Leases backed by Postgres session advisory locks.
///
/// Each lease pins its own detached connection; closing it releases the lock,
/// so a crashed process never leaves an account locked.
pub struct PgAdvisoryLeases {
    pool: PgPool,
}

impl PgAdvisoryLeases {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountLeases for PgAdvisoryLeases {
    async fn try_acquire(&self, key: AccountKey) -> TxmResult<AccountLease> {
        let mut conn = self.pool.acquire().await?.detach();

        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(key.lock_id())
            .fetch_one(&mut conn)
            .await?;

        if !row.try_get::<bool, _>("locked")? {
            return Err(key.busy());
        }

        debug!("Acquired advisory lease for {}", key);
        Ok(AccountLease::new(key, Box::new(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> AccountKey {
        AccountKey::new(1, Address::repeat_byte(0x11))
    }

    #[tokio::test]
    async fn test_local_lease_is_exclusive_until_dropped() {
        let leases = LocalLeases::new();

        let lease = leases.try_acquire(key()).await.unwrap();
        let err = leases.try_acquire(key()).await.unwrap_err();
        assert!(matches!(err, TxmError::ResourceBusy { chain_id: 1, .. }));
        assert!(err.to_string().contains("already in use"));

        // other accounts are independent
        assert!(leases
            .try_acquire(AccountKey::new(2, Address::repeat_byte(0x11)))
            .await
            .is_ok());

        drop(lease);
        assert!(leases.try_acquire(key()).await.is_ok());
    }

    #[tokio::test]
    async fn test_account_lock_serializes_holders() {
        let locks = Arc::new(AccountLocks::new());
        let guard = locks.lock(key()).await;

        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move {
                let _guard = locks.lock(key()).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_lock_id_is_stable_per_account() {
        assert_eq!(key().lock_id(), key().lock_id());
        assert_ne!(
            key().lock_id(),
            AccountKey::new(2, Address::repeat_byte(0x11)).lock_id()
        );
    }
}
