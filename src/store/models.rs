//! Transactions, attempts and their states

use crate::error::{TxmError, TxmResult};
use crate::tx::FeeParams;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type TxId = Uuid;
pub type AttemptId = Uuid;

/// Lifecycle state of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Unstarted,
    InProgress,
    Confirmed,
    /// Recoverable; an operator may requeue it
    Errored,
    /// Needs human intervention
    Fatal,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Confirmed | TxState::Errored | TxState::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Unstarted => "unstarted",
            TxState::InProgress => "in_progress",
            TxState::Confirmed => "confirmed",
            TxState::Errored => "errored",
            TxState::Fatal => "fatal",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxState {
    type Err = TxmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unstarted" => Ok(TxState::Unstarted),
            "in_progress" => Ok(TxState::InProgress),
            "confirmed" => Ok(TxState::Confirmed),
            "errored" => Ok(TxState::Errored),
            "fatal" => Ok(TxState::Fatal),
            other => Err(TxmError::Internal(format!("unknown transaction state {}", other))),
        }
    }
}

/// State of one signed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Recorded, not yet accepted by a node
    Pending,
    Broadcast,
    Confirmed,
    Underpriced,
    /// Replaced by a later attempt or lost the tie-break to the mined one
    Superseded,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Broadcast => "broadcast",
            AttemptState::Confirmed => "confirmed",
            AttemptState::Underpriced => "underpriced",
            AttemptState::Superseded => "superseded",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = TxmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptState::Pending),
            "broadcast" => Ok(AttemptState::Broadcast),
            "confirmed" => Ok(AttemptState::Confirmed),
            "underpriced" => Ok(AttemptState::Underpriced),
            "superseded" => Ok(AttemptState::Superseded),
            other => Err(TxmError::Internal(format!("unknown attempt state {}", other))),
        }
    }
}

/// A transfer or contract call requested by a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
}

impl NewTransaction {
    /// Parse a request from its textual API form
    pub fn parse(
        chain_id: u64,
        from: &str,
        to: &str,
        value: &str,
        data: &str,
        gas_limit: u64,
    ) -> TxmResult<Self> {
        let from = parse_address("from", from)?;
        let to = parse_address("to", to)?;
        let value = U256::from_dec_str(value.trim())
            .map_err(|e| TxmError::Validation(format!("invalid value {:?}: {}", value, e)))?;
        let data = hex::decode(data.trim().trim_start_matches("0x"))
            .map_err(|e| TxmError::Validation(format!("invalid data: {}", e)))?;

        let tx = Self {
            chain_id,
            from,
            to,
            value,
            data: Bytes::from(data),
            gas_limit,
        };
        tx.validate()?;
        Ok(tx)
    }

    pub fn validate(&self) -> TxmResult<()> {
        if self.from.is_zero() {
            return Err(TxmError::Validation("from address must not be zero".to_string()));
        }
        if self.to.is_zero() {
            return Err(TxmError::Validation("to address must not be zero".to_string()));
        }
        if self.gas_limit == 0 {
            return Err(TxmError::Validation("gas limit must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_address(field: &str, value: &str) -> TxmResult<Address> {
    let trimmed = value.trim();
    if !trimmed.starts_with("0x") || trimmed.len() != 42 {
        return Err(TxmError::Validation(format!(
            "{} address {:?} is malformed",
            field, value
        )));
    }
    trimmed
        .parse::<Address>()
        .map_err(|e| TxmError::Validation(format!("{} address {:?}: {}", field, value, e)))
}

/// Block a receipt was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: Option<H256>,
    /// Execution reverted; the nonce is consumed all the same
    pub reverted: bool,
}

/// One concrete signed, priced submission of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAttempt {
    pub id: AttemptId,
    pub tx_id: TxId,
    pub nonce: u64,
    pub fee: FeeParams,
    pub gas_limit: u64,
    pub signed_raw: Bytes,
    pub hash: H256,
    pub state: AttemptState,
    pub broadcast_at: Option<DateTime<Utc>>,
    /// First head observed after the broadcast; bump age is counted from here
    pub broadcast_block: Option<u64>,
    /// Block of the last receipt seen for this hash
    pub included_block: Option<u64>,
    pub included_block_hash: Option<H256>,
    /// Last time a node accepted these bytes
    pub last_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Logical transaction with its attempt history (newest attempt first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: u64,
    pub nonce: Option<u64>,
    pub state: TxState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<TxAttempt>,
}

impl Transaction {
    /// The attempt the confirmer tracks: newest one not superseded
    pub fn canonical_attempt(&self) -> Option<&TxAttempt> {
        self.attempts
            .iter()
            .find(|a| a.state != AttemptState::Superseded)
    }

    /// The attempt that won confirmation, if any
    pub fn confirmed_attempt(&self) -> Option<&TxAttempt> {
        self.attempts
            .iter()
            .find(|a| a.state == AttemptState::Confirmed)
    }

    /// Attempts that may have reached a node, newest first
    pub fn broadcast_attempts(&self) -> impl Iterator<Item = &TxAttempt> {
        self.attempts.iter().filter(|a| a.broadcast_at.is_some())
    }
}

/// Transaction counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub unstarted: u64,
    pub in_progress: u64,
    pub confirmed: u64,
    pub errored: u64,
    pub fatal: u64,
}

impl TransactionStats {
    pub fn add(&mut self, state: TxState, count: u64) {
        match state {
            TxState::Unstarted => self.unstarted += count,
            TxState::InProgress => self.in_progress += count,
            TxState::Confirmed => self.confirmed += count,
            TxState::Errored => self.errored += count,
            TxState::Fatal => self.fatal += count,
        }
    }
}
