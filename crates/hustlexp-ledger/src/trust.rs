//! Trust tier evaluation.
//!
//! The trust ledger is the source of truth; the user row caches the tier.
//! Tiers derive from a completion/dispute score so the evaluation is
//! deterministic and re-runnable.

use crate::error::LedgerError;
use hustlexp_storage::{
    CompletionStats, HustleStore, LedgerStore, NewTrustDelta, TaskStore, UserStore, WriteOutcome,
};
use hustlexp_types::{TrustTier, UserId};
use std::sync::Arc;
use tracing::info;

/// Score thresholds for tiers 0..=5.
const TIER_THRESHOLDS: [i64; 6] = [0, 3, 10, 25, 50, 100];

/// score = completions − 2·disputes-lost, clamped at zero.
pub fn trust_score(stats: &CompletionStats) -> i64 {
    (stats.completed as i64 - 2 * stats.disputes_lost as i64).max(0)
}

pub fn tier_for(stats: &CompletionStats) -> TrustTier {
    let score = trust_score(stats);
    let mut tier = 0u8;
    for (index, threshold) in TIER_THRESHOLDS.iter().enumerate() {
        if score >= *threshold {
            tier = index as u8;
        }
    }
    TrustTier::new(tier)
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustEvaluation {
    Unchanged(TrustTier),
    Changed { from: TrustTier, to: TrustTier },
    /// A concurrent delivery already wrote this delta.
    Duplicate,
}

/// Recomputes a user's tier after completions and disputes.
pub struct TrustEvaluator {
    store: Arc<dyn HustleStore>,
}

impl TrustEvaluator {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self { store }
    }

    /// Re-evaluate after the event identified by `event_key`; the key makes
    /// re-deliveries idempotent.
    pub async fn evaluate(
        &self,
        user_id: UserId,
        event_key: &str,
    ) -> Result<TrustEvaluation, LedgerError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(LedgerError::NotFound(format!("user {user_id}")))?;
        let stats = self.store.completion_stats(user_id).await?;
        let target = tier_for(&stats);

        if target == user.trust_tier {
            return Ok(TrustEvaluation::Unchanged(target));
        }

        let delta = target.value() as i32 - user.trust_tier.value() as i32;
        let outcome = self
            .store
            .append_trust(NewTrustDelta {
                user_id,
                delta,
                tier_before: user.trust_tier,
                tier_after: target,
                reason: format!(
                    "re-evaluation: {} completions, {} disputes lost",
                    stats.completed, stats.disputes_lost
                ),
                idempotency_key: format!("trust:{user_id}:{event_key}"),
            })
            .await?;

        match outcome {
            WriteOutcome::Duplicate(_) => Ok(TrustEvaluation::Duplicate),
            WriteOutcome::Inserted(_) => {
                info!(
                    user_id = %user_id,
                    from = %user.trust_tier,
                    to = %target,
                    "trust tier changed"
                );
                Ok(TrustEvaluation::Changed {
                    from: user.trust_tier,
                    to: target,
                })
            }
        }
    }
}
