//! Transaction construction and submission: nonces, fees, signing, broadcast

mod backoff;
mod broadcaster;
mod builder;
mod gas;
mod nonce;

pub use backoff::{calculate_backoff, RetryPolicy};
pub use broadcaster::{Broadcaster, SubmitOutcome};
pub use builder::AttemptBuilder;
pub use gas::{FeeModel, FeeParams, GasEstimator, GasPolicy};
pub use nonce::NonceSequencer;
