//! Fee parameters, gas policy and initial fee estimation

use crate::chain::ChainClient;
use crate::error::{TxmError, TxmResult};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const GWEI: u64 = 1_000_000_000;

/// Fee fields of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeParams {
    Legacy { gas_price: U256 },
    DynamicFee { tip: U256, fee_cap: U256 },
}

impl FeeParams {
    /// The value compared against the fee ceiling (gas price or fee cap)
    pub fn ceiling_value(&self) -> U256 {
        match self {
            FeeParams::Legacy { gas_price } => *gas_price,
            FeeParams::DynamicFee { fee_cap, .. } => *fee_cap,
        }
    }

    /// Reject zero fees and tips above the cap
    pub fn validate(&self) -> TxmResult<()> {
        match self {
            FeeParams::Legacy { gas_price } => {
                if gas_price.is_zero() {
                    return Err(TxmError::Validation("gas price must be positive".to_string()));
                }
            }
            FeeParams::DynamicFee { tip, fee_cap } => {
                if tip.is_zero() || fee_cap.is_zero() {
                    return Err(TxmError::Validation(
                        "tip and fee cap must be positive".to_string(),
                    ));
                }
                if tip > fee_cap {
                    return Err(TxmError::Validation(format!(
                        "tip {} exceeds fee cap {}",
                        tip, fee_cap
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeeParams::Legacy { .. } => "legacy",
            FeeParams::DynamicFee { .. } => "dynamic",
        }
    }
}

impl std::fmt::Display for FeeParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeParams::Legacy { gas_price } => write!(f, "gas_price={}", gas_price),
            FeeParams::DynamicFee { tip, fee_cap } => write!(f, "tip={} fee_cap={}", tip, fee_cap),
        }
    }
}

/// Which fee model a chain uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeModel {
    Legacy,
    Eip1559,
}

/// Escalation and finality rules for one chain.
///
/// Passed explicitly to the confirmer and rebroadcaster; there is no global
/// fee configuration.
#[derive(Debug, Clone)]
pub struct GasPolicy {
    pub fee_model: FeeModel,
    /// Blocks without confirmation before escalating. 0 disables bumping.
    pub bump_threshold: u64,
    /// Bump multiplier in thousandths (1200 = x1.2)
    pub bump_permille: u64,
    /// Fee ceiling in wei
    pub max_fee: U256,
    pub confirmation_depth: u64,
    /// How far back confirmed transactions are re-checked for re-orgs
    pub reorg_window: u64,
    pub poll_interval: Duration,
    /// Resend an unconfirmed attempt unchanged after this long. Zero disables.
    pub resend_after: Duration,
}

impl GasPolicy {
    pub fn new(
        fee_model: FeeModel,
        bump_threshold: u64,
        bump_multiplier: f64,
        max_fee_gwei: u64,
        confirmation_depth: u64,
    ) -> TxmResult<Self> {
        if !(bump_multiplier > 1.0) || !bump_multiplier.is_finite() {
            return Err(TxmError::Config(format!(
                "bump multiplier must be greater than 1.0, got {}",
                bump_multiplier
            )));
        }
        if max_fee_gwei == 0 {
            return Err(TxmError::Config("max fee must be positive".to_string()));
        }

        Ok(Self {
            fee_model,
            bump_threshold,
            bump_permille: (bump_multiplier * 1000.0).round() as u64,
            max_fee: U256::from(max_fee_gwei) * U256::from(GWEI),
            confirmation_depth,
            reorg_window: confirmation_depth.saturating_mul(2),
            poll_interval: Duration::from_secs(2),
            resend_after: Duration::ZERO,
        })
    }

    pub fn with_reorg_window(mut self, reorg_window: u64) -> Self {
        self.reorg_window = reorg_window;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_resend_after(mut self, resend_after: Duration) -> Self {
        self.resend_after = resend_after;
        self
    }

    /// Whether an attempt last sent at `last_sent` should go out again
    pub fn needs_resend(&self, last_sent: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.resend_after.is_zero() {
            return false;
        }
        match now.signed_duration_since(last_sent).to_std() {
            Ok(elapsed) => elapsed >= self.resend_after,
            Err(_) => false,
        }
    }

    /// Whether an attempt broadcast before `broadcast_block` is due for a bump
    pub fn needs_bump(&self, broadcast_block: u64, head: u64) -> bool {
        self.bump_threshold > 0 && head.saturating_sub(broadcast_block) >= self.bump_threshold
    }

    /// Whether a receipt in `receipt_block` is buried deep enough at `head`
    pub fn is_final(&self, receipt_block: u64, head: u64) -> bool {
        receipt_block.saturating_add(self.confirmation_depth) <= head
    }

    /// Compute the next fee for a stuck attempt.
    ///
    /// The result is strictly higher than `current`. An overshoot is clamped
    /// to the ceiling once; bumping a fee already at the ceiling fails with
    /// `FeeCeilingExceeded`.
    pub fn bump(&self, current: &FeeParams) -> TxmResult<FeeParams> {
        match current {
            FeeParams::Legacy { gas_price } => {
                let bumped = self.clamp_bump(*gas_price, self.scale(*gas_price))?;
                Ok(FeeParams::Legacy { gas_price: bumped })
            }
            FeeParams::DynamicFee { tip, fee_cap } => {
                let bumped_cap = self.clamp_bump(*fee_cap, self.scale(*fee_cap))?;
                let bumped_tip = std::cmp::min(self.scale(*tip), bumped_cap);
                Ok(FeeParams::DynamicFee {
                    tip: bumped_tip,
                    fee_cap: bumped_cap,
                })
            }
        }
    }

    /// Clamp a freshly estimated fee to the ceiling
    pub fn clamp_initial(&self, fee: FeeParams) -> FeeParams {
        match fee {
            FeeParams::Legacy { gas_price } => FeeParams::Legacy {
                gas_price: std::cmp::min(gas_price, self.max_fee),
            },
            FeeParams::DynamicFee { tip, fee_cap } => {
                let fee_cap = std::cmp::min(fee_cap, self.max_fee);
                FeeParams::DynamicFee {
                    tip: std::cmp::min(tip, fee_cap),
                    fee_cap,
                }
            }
        }
    }

    fn scale(&self, value: U256) -> U256 {
        let scaled = value.saturating_mul(U256::from(self.bump_permille)) / 1000;
        if scaled <= value {
            value + 1
        } else {
            scaled
        }
    }

    fn clamp_bump(&self, previous: U256, bumped: U256) -> TxmResult<U256> {
        if bumped <= self.max_fee {
            Ok(bumped)
        } else if previous < self.max_fee {
            Ok(self.max_fee)
        } else {
            Err(TxmError::FeeCeilingExceeded {
                fee: bumped.to_string(),
                limit: self.max_fee.to_string(),
            })
        }
    }
}

/// Fetches a starting fee for new transactions
pub struct GasEstimator {
    /// Buffer percentage for gas price (e.g., 10 = 10% buffer)
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new() -> Self {
        Self {
            gas_price_buffer_percent: 10,
        }
    }

    /// Get a buffered fee from the chain, clamped to the policy ceiling
    pub async fn estimate(
        &self,
        client: &dyn ChainClient,
        policy: &GasPolicy,
    ) -> TxmResult<FeeParams> {
        let suggested = client.suggest_fee(policy.fee_model).await?;

        let buffered = match suggested {
            FeeParams::Legacy { gas_price } => {
                let buffer = gas_price * self.gas_price_buffer_percent / 100;
                FeeParams::Legacy {
                    gas_price: gas_price + buffer,
                }
            }
            FeeParams::DynamicFee { tip, fee_cap } => {
                let cap_buffer = fee_cap * self.gas_price_buffer_percent / 100;
                let tip_buffer = tip * self.gas_price_buffer_percent / 100;
                FeeParams::DynamicFee {
                    tip: tip + tip_buffer,
                    fee_cap: fee_cap + cap_buffer,
                }
            }
        };

        let fee = policy.clamp_initial(buffered);
        debug!("Initial fee for chain {}: {}", client.chain_id(), fee);
        Ok(fee)
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(v: u64) -> U256 {
        U256::from(v) * U256::from(GWEI)
    }

    fn policy() -> GasPolicy {
        GasPolicy::new(FeeModel::Legacy, 3, 1.2, 500, 12).unwrap()
    }

    #[test]
    fn test_legacy_bump_uses_multiplier() {
        let bumped = policy()
            .bump(&FeeParams::Legacy { gas_price: gwei(100) })
            .unwrap();
        assert_eq!(bumped, FeeParams::Legacy { gas_price: gwei(120) });
    }

    #[test]
    fn test_dynamic_bump_raises_tip_and_cap() {
        let bumped = policy()
            .bump(&FeeParams::DynamicFee {
                tip: gwei(2),
                fee_cap: gwei(50),
            })
            .unwrap();
        assert_eq!(
            bumped,
            FeeParams::DynamicFee {
                tip: U256::from(2_400_000_000u64),
                fee_cap: gwei(60),
            }
        );
    }

    #[test]
    fn test_bump_is_strictly_higher_for_tiny_fees() {
        let bumped = policy()
            .bump(&FeeParams::Legacy { gas_price: U256::from(1) })
            .unwrap();
        assert_eq!(bumped, FeeParams::Legacy { gas_price: U256::from(2) });
    }

    #[test]
    fn test_bump_clamps_once_then_fails_at_ceiling() {
        let policy = policy();
        let clamped = policy
            .bump(&FeeParams::Legacy { gas_price: gwei(450) })
            .unwrap();
        assert_eq!(clamped, FeeParams::Legacy { gas_price: gwei(500) });

        let err = policy.bump(&clamped).unwrap_err();
        assert!(matches!(err, TxmError::FeeCeilingExceeded { .. }));
    }

    #[test]
    fn test_bump_threshold_and_finality() {
        let policy = policy();
        assert!(!policy.needs_bump(100, 102));
        assert!(policy.needs_bump(100, 103));
        assert!(!policy.is_final(100, 111));
        assert!(policy.is_final(100, 112));
    }

    #[test]
    fn test_zero_threshold_disables_bumping() {
        let policy = GasPolicy::new(FeeModel::Legacy, 0, 1.2, 500, 12).unwrap();
        assert!(!policy.needs_bump(0, 10_000));
    }

    #[test]
    fn test_resend_after_elapsed_time() {
        let now = Utc::now();
        let sent = now - chrono::Duration::seconds(90);
        assert!(!policy().needs_resend(sent, now));

        let policy = policy().with_resend_after(Duration::from_secs(60));
        assert!(policy.needs_resend(sent, now));
        assert!(!policy.needs_resend(now - chrono::Duration::seconds(30), now));
        // clock skew: sent in the future
        assert!(!policy.needs_resend(now + chrono::Duration::seconds(5), now));
    }

    #[test]
    fn test_multiplier_must_exceed_one() {
        assert!(GasPolicy::new(FeeModel::Legacy, 3, 1.0, 500, 12).is_err());
        assert!(GasPolicy::new(FeeModel::Legacy, 3, f64::NAN, 500, 12).is_err());
    }

    #[test]
    fn test_fee_validation() {
        assert!(FeeParams::Legacy { gas_price: U256::zero() }.validate().is_err());
        assert!(FeeParams::DynamicFee {
            tip: gwei(5),
            fee_cap: gwei(1)
        }
        .validate()
        .is_err());
        assert!(FeeParams::DynamicFee {
            tip: gwei(1),
            fee_cap: gwei(5)
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_clamp_initial() {
        let fee = policy().clamp_initial(FeeParams::DynamicFee {
            tip: gwei(900),
            fee_cap: gwei(1000),
        });
        assert_eq!(
            fee,
            FeeParams::DynamicFee {
                tip: gwei(500),
                fee_cap: gwei(500)
            }
        );
    }
}
