//! Advisory correction vocabulary.
//!
//! Corrections are bounded, reversible, non-financial policy nudges. The
//! kernel tables are constitutionally out of reach: `FORBIDDEN_TARGETS` is a
//! closed set enforced in code, by the audit sweep, and by the test suite.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Substrings (case-insensitive) that no correction target may contain.
pub const FORBIDDEN_TARGETS: &[&str] = &[
    "ledger",
    "payout",
    "dispute",
    "escrow",
    "killswitch",
    "stripe",
    "block_task",
    "block_accept",
    "money_state_lock",
];

/// Case-insensitive substring screen over the forbidden set.
pub fn is_forbidden_target(target_entity: &str) -> bool {
    let lowered = target_entity.to_ascii_lowercase();
    FORBIDDEN_TARGETS
        .iter()
        .any(|forbidden| lowered.contains(forbidden))
}

/// Enumerated correction types with their magnitude bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrectionType {
    /// Proof deadline adjustment, bounded to [4h, 48h] expressed in hours.
    ProofTiming,
    /// Task visibility boost, magnitude in [0, 1].
    TaskRouting,
    /// Pricing guidance multiplier in [0.5, 1.5].
    PricingGuidance,
    /// UX friction level 0..=3.
    UxFriction,
    /// Trust friction level 0..=3.
    TrustFriction,
}

impl CorrectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionType::ProofTiming => "proof_timing",
            CorrectionType::TaskRouting => "task_routing",
            CorrectionType::PricingGuidance => "pricing_guidance",
            CorrectionType::UxFriction => "ux_friction",
            CorrectionType::TrustFriction => "trust_friction",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "proof_timing" => Some(CorrectionType::ProofTiming),
            "task_routing" => Some(CorrectionType::TaskRouting),
            "pricing_guidance" => Some(CorrectionType::PricingGuidance),
            "ux_friction" => Some(CorrectionType::UxFriction),
            "trust_friction" => Some(CorrectionType::TrustFriction),
            _ => None,
        }
    }

    /// Inclusive magnitude bounds for this correction type.
    pub fn magnitude_bounds(&self) -> (Decimal, Decimal) {
        match self {
            CorrectionType::ProofTiming => (dec!(4), dec!(48)),
            CorrectionType::TaskRouting => (dec!(0), dec!(1)),
            CorrectionType::PricingGuidance => (dec!(0.5), dec!(1.5)),
            CorrectionType::UxFriction | CorrectionType::TrustFriction => (dec!(0), dec!(3)),
        }
    }

    pub fn magnitude_in_bounds(&self, magnitude: Decimal) -> bool {
        let (lo, hi) = self.magnitude_bounds();
        magnitude >= lo && magnitude <= hi
    }
}

impl std::fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Budget scope for active corrections.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    City(String),
    Category(String),
    Zone(String),
}

impl Scope {
    /// Maximum simultaneously active corrections in this scope.
    pub fn budget(&self) -> usize {
        match self {
            Scope::Global => 100,
            Scope::City(_) => 30,
            Scope::Category(_) => 15,
            Scope::Zone(_) => 10,
        }
    }

    pub fn key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::City(name) => format!("city:{name}"),
            Scope::Category(name) => format!("category:{name}"),
            Scope::Zone(name) => format!("zone:{name}"),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionStatus {
    Applied,
    Rejected,
    Reversed,
    Expired,
}

impl CorrectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionStatus::Applied => "applied",
            CorrectionStatus::Rejected => "rejected",
            CorrectionStatus::Reversed => "reversed",
            CorrectionStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "applied" => Some(CorrectionStatus::Applied),
            "rejected" => Some(CorrectionStatus::Rejected),
            "reversed" => Some(CorrectionStatus::Reversed),
            "expired" => Some(CorrectionStatus::Expired),
            _ => None,
        }
    }
}

/// Causal verdict over a measured correction outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Causal,
    Inconclusive,
    NonCausal,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Causal => "causal",
            Verdict::Inconclusive => "inconclusive",
            Verdict::NonCausal => "non_causal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "causal" => Some(Verdict::Causal),
            "inconclusive" => Some(Verdict::Inconclusive),
            "non_causal" => Some(Verdict::NonCausal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
