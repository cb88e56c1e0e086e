//! Append-only ledger implementations: XP, trust, badges, money events,
//! admin audit.
//!
//! Writers use `INSERT … ON CONFLICT DO NOTHING RETURNING` and re-read on
//! conflict, so duplicate deliveries are non-events. Deletes and updates are
//! rejected by the `hx_append_only` triggers.

use super::rows;
use super::tasks::append_admin_audit_tx;
use super::{map_sqlx_err, PostgresHustleStore};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    AdminAuditAppend, AdminAuditRecord, BadgeLedgerRecord, MoneyEventRecord, NewMoneyEvent,
    NewTrustDelta, NewXpAward, QueryWindow, TrustLedgerRecord, WriteOutcome, XpLedgerRecord,
};
use crate::traits::LedgerStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hustlexp_types::{level_for_xp, Badge, TaskId, UserId};
use sqlx::Row;
use uuid::Uuid;

const XP_COLUMNS: &str = "entry_id, user_id, task_id, money_state_lock_task_id, base_xp, \
     decay_factor, effective_xp, streak_multiplier, final_xp, reason, created_at";

const MONEY_EVENT_COLUMNS: &str =
    "event_id, task_id, op, phase, idempotency_key, provider_ref, detail, created_at";

#[async_trait]
impl LedgerStore for PostgresHustleStore {
    async fn award_xp(&self, award: NewXpAward) -> StoreResult<WriteOutcome<XpLedgerRecord>> {
        self.with_retry("award_xp", || {
            let award = award.clone();
            async move {
                let mut tx = self.begin_serializable().await?;

                let inserted = sqlx::query(&format!(
                    "INSERT INTO xp_ledger ({XP_COLUMNS}) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                     ON CONFLICT (money_state_lock_task_id) DO NOTHING \
                     RETURNING {XP_COLUMNS}"
                ))
                .bind(format!("xp-{}", Uuid::new_v4()))
                .bind(award.user_id.to_string())
                .bind(award.task_id.map(|id| id.to_string()))
                .bind(award.money_state_lock_task_id.map(|id| id.to_string()))
                .bind(award.base_xp)
                .bind(award.decay_factor)
                .bind(award.effective_xp)
                .bind(award.streak_multiplier)
                .bind(award.final_xp)
                .bind(&award.reason)
                .bind(Utc::now())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                let Some(row) = inserted else {
                    // Conflict on the unique escrow key: re-read and report a
                    // duplicate so re-deliveries are non-events.
                    drop(tx);
                    let existing = self
                        .xp_for_release(award.money_state_lock_task_id.ok_or_else(|| {
                            StoreError::Conflict("xp insert conflicted without a key".to_string())
                        })?)
                        .await?
                        .ok_or_else(|| {
                            StoreError::Retryable("xp row vanished between writes".to_string())
                        })?;
                    return Ok(WriteOutcome::Duplicate(existing));
                };

                let total_row = sqlx::query(
                    "UPDATE users \
                        SET xp_total = xp_total + $1, streak_days = $2, \
                            last_active_at = $3, updated_at = NOW() \
                      WHERE id = $4 \
                      RETURNING xp_total",
                )
                .bind(award.final_xp)
                .bind(award.streak_days_after as i32)
                .bind(award.activity_at)
                .bind(award.user_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?
                .ok_or_else(|| {
                    StoreError::NotFound(format!("user {} not found", award.user_id))
                })?;

                let xp_total: i64 = total_row.try_get("xp_total").map_err(map_sqlx_err)?;
                sqlx::query("UPDATE users SET level = $1 WHERE id = $2")
                    .bind(level_for_xp(xp_total) as i32)
                    .bind(award.user_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;

                tx.commit().await.map_err(map_sqlx_err)?;
                Ok(WriteOutcome::Inserted(rows::xp_row(row)?))
            }
        })
        .await
    }

    async fn xp_for_release(&self, task_id: TaskId) -> StoreResult<Option<XpLedgerRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {XP_COLUMNS} FROM xp_ledger WHERE money_state_lock_task_id = $1"
        ))
        .bind(task_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::xp_row).transpose()
    }

    async fn xp_for_user(&self, user_id: UserId) -> StoreResult<Vec<XpLedgerRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {XP_COLUMNS} FROM xp_ledger WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::xp_row).collect()
    }

    async fn append_trust(
        &self,
        delta: NewTrustDelta,
    ) -> StoreResult<WriteOutcome<TrustLedgerRecord>> {
        self.with_retry("append_trust", || {
            let delta = delta.clone();
            async move {
                let mut tx = self.begin_serializable().await?;
                let inserted = sqlx::query(
                    "INSERT INTO trust_ledger \
                        (entry_id, user_id, delta, tier_before, tier_after, reason, \
                         idempotency_key, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                     ON CONFLICT (idempotency_key) DO NOTHING \
                     RETURNING entry_id, user_id, delta, tier_before, tier_after, reason, \
                               idempotency_key, created_at",
                )
                .bind(format!("trust-{}", Uuid::new_v4()))
                .bind(delta.user_id.to_string())
                .bind(delta.delta)
                .bind(delta.tier_before.value() as i16)
                .bind(delta.tier_after.value() as i16)
                .bind(&delta.reason)
                .bind(&delta.idempotency_key)
                .bind(Utc::now())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                let Some(row) = inserted else {
                    drop(tx);
                    let existing = sqlx::query(
                        "SELECT entry_id, user_id, delta, tier_before, tier_after, reason, \
                                idempotency_key, created_at \
                           FROM trust_ledger WHERE idempotency_key = $1",
                    )
                    .bind(&delta.idempotency_key)
                    .fetch_one(self.pool())
                    .await
                    .map_err(map_sqlx_err)?;
                    return Ok(WriteOutcome::Duplicate(rows::trust_row(existing)?));
                };

                sqlx::query("UPDATE users SET trust_tier = $1, updated_at = NOW() WHERE id = $2")
                    .bind(delta.tier_after.value() as i16)
                    .bind(delta.user_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_err)?;

                tx.commit().await.map_err(map_sqlx_err)?;
                Ok(WriteOutcome::Inserted(rows::trust_row(row)?))
            }
        })
        .await
    }

    async fn trust_for_user(&self, user_id: UserId) -> StoreResult<Vec<TrustLedgerRecord>> {
        let rows = sqlx::query(
            "SELECT entry_id, user_id, delta, tier_before, tier_after, reason, \
                    idempotency_key, created_at \
               FROM trust_ledger WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::trust_row).collect()
    }

    async fn grant_badge(
        &self,
        user_id: UserId,
        badge: Badge,
    ) -> StoreResult<WriteOutcome<BadgeLedgerRecord>> {
        let inserted = sqlx::query(
            "INSERT INTO badge_ledger (entry_id, user_id, badge, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, badge) DO NOTHING \
             RETURNING entry_id, user_id, badge, created_at",
        )
        .bind(format!("badge-{}", Uuid::new_v4()))
        .bind(user_id.to_string())
        .bind(badge.as_str())
        .bind(Utc::now())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        match inserted {
            Some(row) => Ok(WriteOutcome::Inserted(rows::badge_row(row)?)),
            None => {
                let existing = sqlx::query(
                    "SELECT entry_id, user_id, badge, created_at \
                       FROM badge_ledger WHERE user_id = $1 AND badge = $2",
                )
                .bind(user_id.to_string())
                .bind(badge.as_str())
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_err)?;
                Ok(WriteOutcome::Duplicate(rows::badge_row(existing)?))
            }
        }
    }

    async fn badges_for_user(&self, user_id: UserId) -> StoreResult<Vec<BadgeLedgerRecord>> {
        let rows = sqlx::query(
            "SELECT entry_id, user_id, badge, created_at \
               FROM badge_ledger WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::badge_row).collect()
    }

    async fn append_money_event(
        &self,
        event: NewMoneyEvent,
    ) -> StoreResult<WriteOutcome<MoneyEventRecord>> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO money_events_audit ({MONEY_EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (idempotency_key, phase) DO NOTHING \
             RETURNING {MONEY_EVENT_COLUMNS}"
        ))
        .bind(format!("mev-{}", Uuid::new_v4()))
        .bind(event.task_id.to_string())
        .bind(event.op.as_str())
        .bind(event.phase.as_str())
        .bind(&event.idempotency_key)
        .bind(&event.provider_ref)
        .bind(&event.detail)
        .bind(Utc::now())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        match inserted {
            Some(row) => Ok(WriteOutcome::Inserted(rows::money_event_row(row)?)),
            None => {
                let existing = sqlx::query(&format!(
                    "SELECT {MONEY_EVENT_COLUMNS} FROM money_events_audit \
                      WHERE idempotency_key = $1 AND phase = $2"
                ))
                .bind(&event.idempotency_key)
                .bind(event.phase.as_str())
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_err)?;
                Ok(WriteOutcome::Duplicate(rows::money_event_row(existing)?))
            }
        }
    }

    async fn money_events_for_task(&self, task_id: TaskId) -> StoreResult<Vec<MoneyEventRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MONEY_EVENT_COLUMNS} FROM money_events_audit \
              WHERE task_id = $1 ORDER BY created_at"
        ))
        .bind(task_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::money_event_row).collect()
    }

    async fn money_event_by_key(
        &self,
        idempotency_key: &str,
    ) -> StoreResult<Vec<MoneyEventRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MONEY_EVENT_COLUMNS} FROM money_events_audit \
              WHERE idempotency_key = $1 ORDER BY created_at"
        ))
        .bind(idempotency_key)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::money_event_row).collect()
    }

    async fn initiated_without_outcome(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<MoneyEventRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MONEY_EVENT_COLUMNS} FROM money_events_audit m \
              WHERE m.phase = 'initiated' AND m.created_at <= $1 \
                AND NOT EXISTS ( \
                    SELECT 1 FROM money_events_audit o \
                     WHERE o.idempotency_key = m.idempotency_key \
                       AND o.phase <> 'initiated' \
                )"
        ))
        .bind(older_than)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::money_event_row).collect()
    }

    async fn append_admin_audit(&self, entry: AdminAuditAppend) -> StoreResult<AdminAuditRecord> {
        self.with_retry("append_admin_audit", || {
            let entry = entry.clone();
            async move {
                let mut tx = self.begin_serializable().await?;
                append_admin_audit_tx(&mut tx, &entry).await?;
                let row = sqlx::query(
                    "SELECT event_id, sequence, actor_id, action, target_kind, target_id, \
                            before, after, reason, previous_hash, hash, created_at \
                       FROM admin_action_audit ORDER BY sequence DESC LIMIT 1",
                )
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                tx.commit().await.map_err(map_sqlx_err)?;
                rows::admin_audit_row(row)
            }
        })
        .await
    }

    async fn admin_audit(&self, window: QueryWindow) -> StoreResult<Vec<AdminAuditRecord>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(
            "SELECT event_id, sequence, actor_id, action, target_kind, target_id, \
                    before, after, reason, previous_hash, hash, created_at \
               FROM admin_action_audit \
              ORDER BY sequence DESC \
              LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(window.offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::admin_audit_row).collect()
    }
}
