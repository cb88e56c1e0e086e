//! Proof sub-state machine.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofState {
    Submitted,
    Accepted,
    Rejected,
}

impl ProofState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProofState::Submitted => "SUBMITTED",
            ProofState::Accepted => "ACCEPTED",
            ProofState::Rejected => "REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SUBMITTED" => Some(ProofState::Submitted),
            "ACCEPTED" => Some(ProofState::Accepted),
            "REJECTED" => Some(ProofState::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProofState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
