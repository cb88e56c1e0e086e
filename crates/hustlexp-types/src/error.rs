//! Error taxonomy shared by every layer.
//!
//! Invariant codes are raised by the storage layer (database triggers or the
//! in-memory reference adapter) and travel unchanged to the command surface.
//! `ErrorKind` is the closed classification the outbox/worker layer and the
//! RPC surface dispatch on.

use serde::{Deserialize, Serialize};

/// Stable machine-readable codes for constitutional invariant violations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvariantCode {
    /// Terminal task rows are frozen.
    HX001,
    /// Terminal money states are frozen.
    HX002,
    /// `amount_cents` is set exactly once at HELD.
    HX004,
    /// XP may only reference a RELEASED money state.
    HX101,
    /// XP ledger deletes are forbidden.
    HX102,
    /// Escrow release requires a COMPLETED task.
    HX201,
    /// Task completion requires an ACCEPTED proof.
    HX301,
    /// Badge ledger deletes are forbidden.
    HX401,
    /// Trust ledger deletes are forbidden.
    HX701,
    /// Admin audit deletes are forbidden.
    HX801,
    /// Money-event audit deletes are forbidden.
    HX901,
    /// Task price is frozen once escrow is HELD.
    HX902,
}

impl InvariantCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvariantCode::HX001 => "HX001",
            InvariantCode::HX002 => "HX002",
            InvariantCode::HX004 => "HX004",
            InvariantCode::HX101 => "HX101",
            InvariantCode::HX102 => "HX102",
            InvariantCode::HX201 => "HX201",
            InvariantCode::HX301 => "HX301",
            InvariantCode::HX401 => "HX401",
            InvariantCode::HX701 => "HX701",
            InvariantCode::HX801 => "HX801",
            InvariantCode::HX901 => "HX901",
            InvariantCode::HX902 => "HX902",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HX001" => Some(InvariantCode::HX001),
            "HX002" => Some(InvariantCode::HX002),
            "HX004" => Some(InvariantCode::HX004),
            "HX101" => Some(InvariantCode::HX101),
            "HX102" => Some(InvariantCode::HX102),
            "HX201" => Some(InvariantCode::HX201),
            "HX301" => Some(InvariantCode::HX301),
            "HX401" => Some(InvariantCode::HX401),
            "HX701" => Some(InvariantCode::HX701),
            "HX801" => Some(InvariantCode::HX801),
            "HX901" => Some(InvariantCode::HX901),
            "HX902" => Some(InvariantCode::HX902),
            _ => None,
        }
    }

    /// Extract the leading `HXnnn` token from a raised error message.
    ///
    /// Triggers raise `HX002: terminal money state is immutable`; the mapper
    /// only trusts the prefix before the first `:`.
    pub fn from_message(message: &str) -> Option<Self> {
        let token = message.split(':').next()?.trim();
        Self::parse(token)
    }
}

impl std::fmt::Display for InvariantCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Closed error classification for the command surface and worker layer.
///
/// The worker layer reschedules `Retryable` and dead-letters everything else
/// after bounded attempts; invariant conflicts are never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    /// A database trigger vetoed the write; the stable code is attached.
    ConflictInvariant(InvariantCode),
    /// A precondition on current state failed (e.g. wrong task state).
    ConflictState,
    RateLimited,
    /// Serialization failure, deadlock, provider 5xx or timeout.
    Retryable,
    /// The provider rejected with a terminal code; reconcile, do not retry.
    FatalProvider,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// The small user-visible failure surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorSurface {
    pub kind: ErrorKind,
    /// Friendly, non-technical message.
    pub message: String,
    /// Stable machine code (`HXnnn`, `STATE_CONFLICT`, …).
    pub machine_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_required: Option<String>,
}

impl ErrorSurface {
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let machine_code = match kind {
            ErrorKind::Validation => "VALIDATION".to_string(),
            ErrorKind::Authentication => "AUTHENTICATION".to_string(),
            ErrorKind::Authorization => "AUTHORIZATION".to_string(),
            ErrorKind::NotFound => "NOT_FOUND".to_string(),
            ErrorKind::ConflictInvariant(code) => code.as_str().to_string(),
            ErrorKind::ConflictState => "STATE_CONFLICT".to_string(),
            ErrorKind::RateLimited => "RATE_LIMITED".to_string(),
            ErrorKind::Retryable => "RETRY_LATER".to_string(),
            ErrorKind::FatalProvider => "PAYMENT_FAILED".to_string(),
            ErrorKind::Internal => "INTERNAL".to_string(),
        };
        Self {
            kind,
            message: message.into(),
            machine_code,
            estimated_wait_secs: None,
            action_required: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [
            InvariantCode::HX001,
            InvariantCode::HX002,
            InvariantCode::HX004,
            InvariantCode::HX101,
            InvariantCode::HX102,
            InvariantCode::HX201,
            InvariantCode::HX301,
            InvariantCode::HX401,
            InvariantCode::HX701,
            InvariantCode::HX801,
            InvariantCode::HX901,
            InvariantCode::HX902,
        ] {
            assert_eq!(InvariantCode::parse(code.as_str()), Some(code));
        }
    }

    #[test]
    fn from_message_extracts_leading_token() {
        assert_eq!(
            InvariantCode::from_message("HX201: escrow release requires COMPLETED task"),
            Some(InvariantCode::HX201)
        );
        assert_eq!(InvariantCode::from_message("duplicate key value"), None);
    }

    #[test]
    fn surface_attaches_invariant_code() {
        let surface = ErrorSurface::from_kind(
            ErrorKind::ConflictInvariant(InvariantCode::HX002),
            "this payment can no longer be changed",
        );
        assert_eq!(surface.machine_code, "HX002");
    }
}
