//! Append-only ledger engines: XP computation and award, trust evaluation,
//! badge grants.
//!
//! Writers in this crate never update or delete ledger rows; the storage
//! layer rejects both by trigger and by construction.

#![deny(unsafe_code)]

mod award;
mod error;
mod trust;
mod xp;

pub use award::{XpAwardResult, XpAwarder};
pub use error::LedgerError;
pub use trust::{tier_for, trust_score, TrustEvaluation, TrustEvaluator};
pub use xp::{
    base_xp, compute_xp, decay_factor, next_streak_days, streak_day, streak_multiplier,
    XpBreakdown,
};
