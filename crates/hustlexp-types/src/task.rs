//! Task lifecycle states and transitions.

use serde::{Deserialize, Serialize};

/// Task lifecycle state.
///
/// `Completed`, `Cancelled` and `Expired` are terminal: once a task enters
/// one of them the row is frozen (HX001) except through an audited admin
/// override.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Open,
    Accepted,
    ProofSubmitted,
    Completed,
    Disputed,
    Cancelled,
    Expired,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Open => "OPEN",
            TaskState::Accepted => "ACCEPTED",
            TaskState::ProofSubmitted => "PROOF_SUBMITTED",
            TaskState::Completed => "COMPLETED",
            TaskState::Disputed => "DISPUTED",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OPEN" => Some(TaskState::Open),
            "ACCEPTED" => Some(TaskState::Accepted),
            "PROOF_SUBMITTED" => Some(TaskState::ProofSubmitted),
            "COMPLETED" => Some(TaskState::Completed),
            "DISPUTED" => Some(TaskState::Disputed),
            "CANCELLED" => Some(TaskState::Cancelled),
            "EXPIRED" => Some(TaskState::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The named trigger recorded in the task state log alongside each
/// transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTransition {
    Create,
    Claim,
    ProofSubmit,
    ProofAccept,
    ProofReject,
    Dispute,
    ResolveComplete,
    ResolveCancel,
    Cancel,
    Expire,
    AdminOverride,
}

impl TaskTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskTransition::Create => "create",
            TaskTransition::Claim => "claim",
            TaskTransition::ProofSubmit => "proof_submit",
            TaskTransition::ProofAccept => "proof_accept",
            TaskTransition::ProofReject => "proof_reject",
            TaskTransition::Dispute => "dispute",
            TaskTransition::ResolveComplete => "resolve_complete",
            TaskTransition::ResolveCancel => "resolve_cancel",
            TaskTransition::Cancel => "cancel",
            TaskTransition::Expire => "expire",
            TaskTransition::AdminOverride => "admin_override",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(TaskTransition::Create),
            "claim" => Some(TaskTransition::Claim),
            "proof_submit" => Some(TaskTransition::ProofSubmit),
            "proof_accept" => Some(TaskTransition::ProofAccept),
            "proof_reject" => Some(TaskTransition::ProofReject),
            "dispute" => Some(TaskTransition::Dispute),
            "resolve_complete" => Some(TaskTransition::ResolveComplete),
            "resolve_cancel" => Some(TaskTransition::ResolveCancel),
            "cancel" => Some(TaskTransition::Cancel),
            "expire" => Some(TaskTransition::Expire),
            "admin_override" => Some(TaskTransition::AdminOverride),
            _ => None,
        }
    }

    /// The legal (from, to) pair for this trigger, admin override excepted.
    pub fn edge(&self) -> Option<(TaskState, TaskState)> {
        match self {
            TaskTransition::Claim => Some((TaskState::Open, TaskState::Accepted)),
            TaskTransition::ProofSubmit => Some((TaskState::Accepted, TaskState::ProofSubmitted)),
            TaskTransition::ProofAccept => {
                Some((TaskState::ProofSubmitted, TaskState::Completed))
            }
            TaskTransition::ProofReject => Some((TaskState::ProofSubmitted, TaskState::Accepted)),
            TaskTransition::ResolveComplete => Some((TaskState::Disputed, TaskState::Completed)),
            TaskTransition::ResolveCancel => Some((TaskState::Disputed, TaskState::Cancelled)),
            TaskTransition::Cancel => Some((TaskState::Accepted, TaskState::Cancelled)),
            TaskTransition::Expire => Some((TaskState::Open, TaskState::Expired)),
            // Creation has no source state; disputes open from ACCEPTED or
            // PROOF_SUBMITTED; overrides are free-form.
            TaskTransition::Create
            | TaskTransition::Dispute
            | TaskTransition::AdminOverride => None,
        }
    }
}

impl std::fmt::Display for TaskTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_match_lifecycle() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Expired.is_terminal());
        assert!(!TaskState::Open.is_terminal());
        assert!(!TaskState::Disputed.is_terminal());
    }

    #[test]
    fn states_round_trip_through_text() {
        for state in [
            TaskState::Open,
            TaskState::Accepted,
            TaskState::ProofSubmitted,
            TaskState::Completed,
            TaskState::Disputed,
            TaskState::Cancelled,
            TaskState::Expired,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn claim_edge_is_open_to_accepted() {
        assert_eq!(
            TaskTransition::Claim.edge(),
            Some((TaskState::Open, TaskState::Accepted))
        );
    }
}
