//! Payment provider seam.
//!
//! The provider is idempotent by key: re-issuing a call with the same
//! idempotency key returns the original result with `duplicate = true`
//! instead of moving money twice. Every call is deadline-bounded by the
//! caller; a timeout is a retryable condition, never a committed state.

use async_trait::async_trait;
use hustlexp_types::IdempotencyKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The call did not complete within its deadline; the provider-side
    /// outcome is unknown until reconciled.
    #[error("provider call timed out")]
    Timeout,

    /// Transient provider failure (5xx); safe to retry with the same key.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Terminal rejection; never retried, reconciled out of band.
    #[error("provider rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderIntent {
    pub intent_id: String,
    pub amount_cents: i64,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCharge {
    pub charge_id: String,
    pub amount_cents: i64,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTransfer {
    pub transfer_id: String,
    pub destination: String,
    pub amount_cents: i64,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRefund {
    pub refund_id: String,
    pub amount_cents: i64,
    pub duplicate: bool,
}

/// Server-to-server payment provider operations.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_intent(
        &self,
        key: &IdempotencyKey,
        amount_cents: i64,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn capture(
        &self,
        key: &IdempotencyKey,
        intent_id: &str,
    ) -> Result<ProviderCharge, ProviderError>;

    async fn transfer(
        &self,
        key: &IdempotencyKey,
        destination: &str,
        amount_cents: i64,
    ) -> Result<ProviderTransfer, ProviderError>;

    async fn refund(
        &self,
        key: &IdempotencyKey,
        charge_id: &str,
        amount_cents: i64,
    ) -> Result<ProviderRefund, ProviderError>;

    /// Reconciliation lookup: did a transfer with this key land?
    async fn lookup_transfer(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ProviderTransfer>, ProviderError>;

    /// Reconciliation lookup for refunds.
    async fn lookup_refund(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ProviderRefund>, ProviderError>;
}

/// A failure the mock provider will inject on its next matching call.
#[derive(Debug, Clone)]
pub enum PlannedFailure {
    /// Hang past the caller's deadline, but land the operation provider-side
    /// (the classic lost-response timeout).
    TimeoutButLands,
    /// Fail outright with a transient error.
    Transient(String),
    /// Terminal rejection.
    Rejected { code: String, message: String },
}

#[derive(Default)]
struct MockState {
    intents: HashMap<String, ProviderIntent>,
    charges: HashMap<String, ProviderCharge>,
    transfers: HashMap<String, ProviderTransfer>,
    refunds: HashMap<String, ProviderRefund>,
    planned_transfer_failures: VecDeque<PlannedFailure>,
    planned_refund_failures: VecDeque<PlannedFailure>,
    call_counts: HashMap<&'static str, u64>,
}

/// Deterministic in-memory provider for tests: idempotent by key, with
/// scripted failure injection.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan_transfer_failure(&self, failure: PlannedFailure) {
        self.state
            .lock()
            .expect("mock provider lock")
            .planned_transfer_failures
            .push_back(failure);
    }

    pub fn plan_refund_failure(&self, failure: PlannedFailure) {
        self.state
            .lock()
            .expect("mock provider lock")
            .planned_refund_failures
            .push_back(failure);
    }

    pub fn call_count(&self, op: &'static str) -> u64 {
        *self
            .state
            .lock()
            .expect("mock provider lock")
            .call_counts
            .get(op)
            .unwrap_or(&0)
    }

    /// Number of distinct transfers that actually landed provider-side.
    pub fn transfer_count(&self) -> usize {
        self.state.lock().expect("mock provider lock").transfers.len()
    }

    fn bump(state: &mut MockState, op: &'static str) {
        *state.call_counts.entry(op).or_insert(0) += 1;
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn create_intent(
        &self,
        key: &IdempotencyKey,
        amount_cents: i64,
    ) -> Result<ProviderIntent, ProviderError> {
        let mut state = self.state.lock().expect("mock provider lock");
        Self::bump(&mut state, "create_intent");
        if let Some(existing) = state.intents.get(key.as_str()) {
            let mut hit = existing.clone();
            hit.duplicate = true;
            return Ok(hit);
        }
        let intent = ProviderIntent {
            intent_id: format!("pi_{}", Uuid::new_v4().simple()),
            amount_cents,
            duplicate: false,
        };
        state.intents.insert(key.as_str().to_string(), intent.clone());
        Ok(intent)
    }

    async fn capture(
        &self,
        key: &IdempotencyKey,
        _intent_id: &str,
    ) -> Result<ProviderCharge, ProviderError> {
        let mut state = self.state.lock().expect("mock provider lock");
        Self::bump(&mut state, "capture");
        if let Some(existing) = state.charges.get(key.as_str()) {
            let mut hit = existing.clone();
            hit.duplicate = true;
            return Ok(hit);
        }
        let charge = ProviderCharge {
            charge_id: format!("ch_{}", Uuid::new_v4().simple()),
            amount_cents: 0,
            duplicate: false,
        };
        state.charges.insert(key.as_str().to_string(), charge.clone());
        Ok(charge)
    }

    async fn transfer(
        &self,
        key: &IdempotencyKey,
        destination: &str,
        amount_cents: i64,
    ) -> Result<ProviderTransfer, ProviderError> {
        let planned = {
            let mut state = self.state.lock().expect("mock provider lock");
            Self::bump(&mut state, "transfer");
            if let Some(existing) = state.transfers.get(key.as_str()) {
                let mut hit = existing.clone();
                hit.duplicate = true;
                return Ok(hit);
            }
            state.planned_transfer_failures.pop_front()
        };

        match planned {
            Some(PlannedFailure::TimeoutButLands) => {
                // The transfer lands even though the caller saw a timeout.
                let transfer = ProviderTransfer {
                    transfer_id: format!("tr_{}", Uuid::new_v4().simple()),
                    destination: destination.to_string(),
                    amount_cents,
                    duplicate: false,
                };
                self.state
                    .lock()
                    .expect("mock provider lock")
                    .transfers
                    .insert(key.as_str().to_string(), transfer);
                Err(ProviderError::Timeout)
            }
            Some(PlannedFailure::Transient(message)) => Err(ProviderError::Unavailable(message)),
            Some(PlannedFailure::Rejected { code, message }) => {
                Err(ProviderError::Rejected { code, message })
            }
            None => {
                let transfer = ProviderTransfer {
                    transfer_id: format!("tr_{}", Uuid::new_v4().simple()),
                    destination: destination.to_string(),
                    amount_cents,
                    duplicate: false,
                };
                self.state
                    .lock()
                    .expect("mock provider lock")
                    .transfers
                    .insert(key.as_str().to_string(), transfer.clone());
                Ok(transfer)
            }
        }
    }

    async fn refund(
        &self,
        key: &IdempotencyKey,
        _charge_id: &str,
        amount_cents: i64,
    ) -> Result<ProviderRefund, ProviderError> {
        let planned = {
            let mut state = self.state.lock().expect("mock provider lock");
            Self::bump(&mut state, "refund");
            if let Some(existing) = state.refunds.get(key.as_str()) {
                let mut hit = existing.clone();
                hit.duplicate = true;
                return Ok(hit);
            }
            state.planned_refund_failures.pop_front()
        };

        match planned {
            Some(PlannedFailure::TimeoutButLands) => {
                let refund = ProviderRefund {
                    refund_id: format!("re_{}", Uuid::new_v4().simple()),
                    amount_cents,
                    duplicate: false,
                };
                self.state
                    .lock()
                    .expect("mock provider lock")
                    .refunds
                    .insert(key.as_str().to_string(), refund);
                Err(ProviderError::Timeout)
            }
            Some(PlannedFailure::Transient(message)) => Err(ProviderError::Unavailable(message)),
            Some(PlannedFailure::Rejected { code, message }) => {
                Err(ProviderError::Rejected { code, message })
            }
            None => {
                let refund = ProviderRefund {
                    refund_id: format!("re_{}", Uuid::new_v4().simple()),
                    amount_cents,
                    duplicate: false,
                };
                self.state
                    .lock()
                    .expect("mock provider lock")
                    .refunds
                    .insert(key.as_str().to_string(), refund.clone());
                Ok(refund)
            }
        }
    }

    async fn lookup_transfer(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ProviderTransfer>, ProviderError> {
        let state = self.state.lock().expect("mock provider lock");
        Ok(state.transfers.get(key.as_str()).cloned())
    }

    async fn lookup_refund(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ProviderRefund>, ProviderError> {
        let state = self.state.lock().expect("mock provider lock");
        Ok(state.refunds.get(key.as_str()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hustlexp_types::{MoneyOp, TaskId};

    #[tokio::test]
    async fn transfer_is_idempotent_by_key() {
        let provider = MockProvider::new();
        let key = IdempotencyKey::for_op(MoneyOp::Transfer, TaskId::generate(), 1);
        let first = provider.transfer(&key, "acct_1", 5_000).await.unwrap();
        let second = provider.transfer(&key, "acct_1", 5_000).await.unwrap();
        assert_eq!(first.transfer_id, second.transfer_id);
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(provider.transfer_count(), 1);
    }

    #[tokio::test]
    async fn timeout_but_lands_leaves_a_findable_transfer() {
        let provider = MockProvider::new();
        provider.plan_transfer_failure(PlannedFailure::TimeoutButLands);
        let key = IdempotencyKey::for_op(MoneyOp::Transfer, TaskId::generate(), 1);
        let err = provider.transfer(&key, "acct_1", 5_000).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
        let found = provider.lookup_transfer(&key).await.unwrap();
        assert!(found.is_some());
    }
}
