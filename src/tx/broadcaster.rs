//! Attempt submission with bounded retry and timeout handling

use super::backoff::RetryPolicy;
use crate::chain::{ChainClient, SendOutcome};
use crate::error::{TxmError, TxmResult};
use crate::store::{AttemptId, AttemptState, TxAttempt};

use dashmap::DashSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What happened to a submitted attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The node already has these bytes; counts as success
    AlreadyKnown,
    /// Same nonce pending at an equal or higher price; bump and retry
    Underpriced(String),
    /// The nonce is already used on chain, by this or another transaction
    NonceTooLow(String),
    /// Retries exhausted; the attempt stays Pending
    NetworkError(String),
    /// Permanent rejection
    Rejected(String),
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted | SubmitOutcome::AlreadyKnown)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmitOutcome::Accepted => "accepted",
            SubmitOutcome::AlreadyKnown => "already_known",
            SubmitOutcome::Underpriced(_) => "underpriced",
            SubmitOutcome::NonceTooLow(_) => "nonce_too_low",
            SubmitOutcome::NetworkError(_) => "network_error",
            SubmitOutcome::Rejected(_) => "rejected",
        }
    }
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitOutcome::Underpriced(m)
            | SubmitOutcome::NonceTooLow(m)
            | SubmitOutcome::NetworkError(m)
            | SubmitOutcome::Rejected(m) => write!(f, "{}: {}", self.label(), m),
            _ => f.write_str(self.label()),
        }
    }
}

/// Removes an attempt from the in-flight set when its submit returns
struct InFlight<'a> {
    set: &'a DashSet<AttemptId>,
    id: AttemptId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Submits attempts to the chain, one call per attempt at a time
pub struct Broadcaster {
    client: Arc<dyn ChainClient>,
    retry: RetryPolicy,
    in_flight: DashSet<AttemptId>,
}

impl Broadcaster {
    pub fn new(client: Arc<dyn ChainClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            in_flight: DashSet::new(),
        }
    }

    /// Submit a recorded attempt.
    ///
    /// Transport failures are retried with exponential backoff; only the
    /// final classification is returned. Submitting an attempt that is
    /// Confirmed or Superseded, or that is being submitted right now, is an
    /// error.
    pub async fn submit(&self, attempt: &TxAttempt) -> TxmResult<SubmitOutcome> {
        let chain_id = self.client.chain_id();

        if matches!(attempt.state, AttemptState::Confirmed | AttemptState::Superseded) {
            return Err(TxmError::InvalidStateTransition {
                from: attempt.state.to_string(),
                to: AttemptState::Broadcast.to_string(),
            });
        }
        if !self.in_flight.insert(attempt.id) {
            return Err(TxmError::Internal(format!(
                "attempt {} is already being submitted",
                attempt.id
            )));
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            id: attempt.id,
        };

        let mut tries = 0;
        let outcome = loop {
            let result = timeout(
                self.retry.call_timeout,
                self.client.send_raw_transaction(&attempt.signed_raw),
            )
            .await;

            let message = match result {
                Ok(Ok(SendOutcome::Accepted)) => break SubmitOutcome::Accepted,
                Ok(Ok(SendOutcome::AlreadyKnown)) => break SubmitOutcome::AlreadyKnown,
                Ok(Ok(SendOutcome::Underpriced(m))) => break SubmitOutcome::Underpriced(m),
                Ok(Ok(SendOutcome::NonceTooLow(m))) => break SubmitOutcome::NonceTooLow(m),
                Ok(Ok(SendOutcome::Rejected(m))) => break SubmitOutcome::Rejected(m),
                Ok(Err(e)) if e.is_retryable() => e.to_string(),
                Ok(Err(e)) => return Err(e),
                Err(_) => format!("send timed out after {:?}", self.retry.call_timeout),
            };

            if tries >= self.retry.max_retries {
                break SubmitOutcome::NetworkError(message);
            }
            tries += 1;
            let delay = self.retry.delay(tries);
            warn!(
                "Send of {:?} on chain {} failed ({}), retry {}/{} in {:?}",
                attempt.hash, chain_id, message, tries, self.retry.max_retries, delay
            );
            tokio::time::sleep(delay).await;
        };

        match &outcome {
            SubmitOutcome::Accepted => info!(
                "Broadcast {:?} (nonce {}) on chain {}",
                attempt.hash, attempt.nonce, chain_id
            ),
            SubmitOutcome::AlreadyKnown => debug!(
                "Chain {} already knows {:?} (nonce {})",
                chain_id, attempt.hash, attempt.nonce
            ),
            other => warn!(
                "Submit of {:?} (nonce {}) on chain {}: {}",
                attempt.hash, attempt.nonce, chain_id, other
            ),
        }
        crate::metrics::record_attempt_submitted(chain_id, outcome.label());

        Ok(outcome)
    }

    /// Attempts with a submit call running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
