//! XP award path: the single writer of task-completion XP.
//!
//! Consumes `escrow.released` deliveries. Re-reads the money state (no-op
//! unless RELEASED), computes the breakdown, and inserts the ledger row with
//! `money_state_lock_task_id` as the idempotency key. Re-delivery is
//! absorbed by the unique constraint and reported as a duplicate.

use crate::error::LedgerError;
use crate::xp::{compute_xp, next_streak_days};
use chrono::Utc;
use hustlexp_storage::{
    EscrowStore, HustleStore, LedgerStore, NewXpAward, TaskStore, UserStore, WriteOutcome,
    XpLedgerRecord,
};
use hustlexp_types::{Badge, MoneyState, TaskId, UserId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of processing one release delivery.
#[derive(Debug, Clone)]
pub enum XpAwardResult {
    Awarded(XpLedgerRecord),
    /// The unique key already existed; no new state.
    Duplicate(XpLedgerRecord),
    /// The money state was not RELEASED; nothing happened.
    NotReleased,
}

/// Awards XP for released escrows and grants milestone badges.
pub struct XpAwarder {
    store: Arc<dyn HustleStore>,
    category_bonuses: HashMap<String, Decimal>,
}

impl XpAwarder {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self {
            store,
            category_bonuses: HashMap::new(),
        }
    }

    pub fn with_category_bonus(mut self, category: impl Into<String>, bonus: Decimal) -> Self {
        self.category_bonuses.insert(category.into(), bonus);
        self
    }

    pub async fn award_for_release(&self, task_id: TaskId) -> Result<XpAwardResult, LedgerError> {
        let escrow = self
            .store
            .get_escrow(task_id)
            .await?
            .ok_or(LedgerError::NotFound(format!("escrow {task_id}")))?;
        if escrow.state != MoneyState::Released {
            debug!(task_id = %task_id, state = %escrow.state, "xp no-op, money not released");
            return Ok(XpAwardResult::NotReleased);
        }

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(LedgerError::NotFound(format!("task {task_id}")))?;
        let hustler_id = task
            .hustler_id
            .ok_or_else(|| LedgerError::Inconsistent(format!("released task {task_id} has no hustler")))?;
        let user = self
            .store
            .get_user(hustler_id)
            .await?
            .ok_or(LedgerError::NotFound(format!("user {hustler_id}")))?;

        let now = Utc::now();
        let streak_days_after = next_streak_days(user.streak_days, user.last_active_at, now);
        let breakdown = compute_xp(
            task.price_cents,
            user.xp_total,
            streak_days_after,
            self.category_bonuses.get(&task.category).copied(),
        );

        let outcome = self
            .store
            .award_xp(NewXpAward {
                user_id: hustler_id,
                task_id: Some(task_id),
                money_state_lock_task_id: Some(task_id),
                base_xp: breakdown.base_xp,
                decay_factor: breakdown.decay_factor,
                effective_xp: breakdown.effective_xp,
                streak_multiplier: breakdown.streak_multiplier,
                final_xp: breakdown.final_xp,
                reason: "task_completion".to_string(),
                activity_at: now,
                streak_days_after,
            })
            .await?;

        match outcome {
            WriteOutcome::Duplicate(existing) => {
                debug!(task_id = %task_id, "duplicate xp delivery absorbed");
                Ok(XpAwardResult::Duplicate(existing))
            }
            WriteOutcome::Inserted(record) => {
                info!(
                    task_id = %task_id,
                    user_id = %hustler_id,
                    final_xp = record.final_xp,
                    "xp awarded"
                );
                self.grant_milestones(hustler_id, streak_days_after).await?;
                Ok(XpAwardResult::Awarded(record))
            }
        }
    }

    /// Milestone badges are idempotent ledger inserts; re-granting is a
    /// non-event.
    async fn grant_milestones(
        &self,
        user_id: UserId,
        streak_days: u32,
    ) -> Result<(), LedgerError> {
        let stats = self.store.completion_stats(user_id).await?;
        if stats.completed >= 1 {
            self.store.grant_badge(user_id, Badge::FirstCompletion).await?;
        }
        if stats.completed >= 10 {
            self.store.grant_badge(user_id, Badge::TenCompletions).await?;
        }
        if streak_days >= 7 {
            self.store.grant_badge(user_id, Badge::StreakWeek).await?;
        }
        Ok(())
    }
}
