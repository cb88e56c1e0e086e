//! Money lifecycle states and the idempotency-key scheme.
//!
//! Money values are integer cents (`i64`) end to end; no floating point ever
//! touches an amount.

use crate::id::TaskId;
use serde::{Deserialize, Serialize};

/// Escrow / money-state-lock lifecycle.
///
/// `Released`, `Refunded` and `RefundPartial` are terminal and frozen by
/// trigger (HX002).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoneyState {
    Open,
    Held,
    Released,
    Refunded,
    RefundPartial,
    LockedDispute,
}

impl MoneyState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MoneyState::Released | MoneyState::Refunded | MoneyState::RefundPartial
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MoneyState::Open => "OPEN",
            MoneyState::Held => "HELD",
            MoneyState::Released => "RELEASED",
            MoneyState::Refunded => "REFUNDED",
            MoneyState::RefundPartial => "REFUND_PARTIAL",
            MoneyState::LockedDispute => "LOCKED_DISPUTE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OPEN" => Some(MoneyState::Open),
            "HELD" => Some(MoneyState::Held),
            "RELEASED" => Some(MoneyState::Released),
            "REFUNDED" => Some(MoneyState::Refunded),
            "REFUND_PARTIAL" => Some(MoneyState::RefundPartial),
            "LOCKED_DISPUTE" => Some(MoneyState::LockedDispute),
            _ => None,
        }
    }
}

impl std::fmt::Display for MoneyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A provider-side money operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoneyOp {
    CreateIntent,
    Capture,
    Transfer,
    Refund,
}

impl MoneyOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoneyOp::CreateIntent => "intent_create",
            MoneyOp::Capture => "capture",
            MoneyOp::Transfer => "transfer",
            MoneyOp::Refund => "refund",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "intent_create" => Some(MoneyOp::CreateIntent),
            "capture" => Some(MoneyOp::Capture),
            "transfer" => Some(MoneyOp::Transfer),
            "refund" => Some(MoneyOp::Refund),
            _ => None,
        }
    }
}

impl std::fmt::Display for MoneyOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase of a provider interaction in the money-event audit.
///
/// The audit is append-only: `Initiated` is written before the provider call
/// and a matching `Confirmed` or `Failed` row is appended afterwards.
/// Reconciliation finds `Initiated` rows with no successor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoneyEventPhase {
    Initiated,
    Confirmed,
    Failed,
}

impl MoneyEventPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoneyEventPhase::Initiated => "initiated",
            MoneyEventPhase::Confirmed => "confirmed",
            MoneyEventPhase::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "initiated" => Some(MoneyEventPhase::Initiated),
            "confirmed" => Some(MoneyEventPhase::Confirmed),
            "failed" => Some(MoneyEventPhase::Failed),
            _ => None,
        }
    }
}

/// Stable idempotency key shared between the provider call and the local
/// audit row: `<op>:<task_id>:<version>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_op(op: MoneyOp, task_id: TaskId, version: u32) -> Self {
        Self(format!("{}:{}:{}", op, task_id, version))
    }

    /// Key for a deduplicated provider webhook event.
    pub fn for_webhook(provider_event_id: &str) -> Self {
        Self(format!("webhook:{}", provider_event_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_money_states() {
        assert!(MoneyState::Released.is_terminal());
        assert!(MoneyState::Refunded.is_terminal());
        assert!(MoneyState::RefundPartial.is_terminal());
        assert!(!MoneyState::Held.is_terminal());
        assert!(!MoneyState::LockedDispute.is_terminal());
    }

    #[test]
    fn idempotency_key_is_stable_per_version() {
        let task = TaskId::generate();
        let first = IdempotencyKey::for_op(MoneyOp::Transfer, task, 1);
        let again = IdempotencyKey::for_op(MoneyOp::Transfer, task, 1);
        let bumped = IdempotencyKey::for_op(MoneyOp::Transfer, task, 2);
        assert_eq!(first, again);
        assert_ne!(first, bumped);
        assert!(first.as_str().starts_with("transfer:"));
    }
}
