//! Oracle transaction manager - per-account transaction lifecycle engine
//!
//! Assigns nonces, signs and broadcasts attempts, tracks them to finality
//! with gas escalation, and exposes an operator rebroadcast path.

pub mod api;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod locks;
pub mod metrics;
pub mod store;
pub mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{ChainContext, Confirmer, RebroadcastReport, Rebroadcaster, TxManager};
pub use error::{TxmError, TxmResult};
pub use store::{NewTransaction, Transaction, TxId, TxState, TxStore};
pub use tx::{FeeModel, FeeParams, GasPolicy};
