//! Correction log, causal outcomes, and system flags.

use super::rows;
use super::{map_sqlx_err, PostgresHustleStore};
use crate::error::{StoreError, StoreResult};
use crate::model::{CausalOutcomeRecord, CorrectionRecord, SystemFlagRecord};
use crate::traits::{CorrectionStore, FlagStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hustlexp_types::CorrectionId;
use sqlx::Row;

const CORRECTION_COLUMNS: &str = "id, correction_type, target_entity, target_id, scope_key, \
     adjustment, magnitude, reason_code, status, expires_at, applied_by, reversed_at, created_at";

async fn insert_correction_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &CorrectionRecord,
) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO correction_log ({CORRECTION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    ))
    .bind(record.id.to_string())
    .bind(record.correction_type.as_str())
    .bind(&record.target_entity)
    .bind(&record.target_id)
    .bind(&record.scope_key)
    .bind(&record.adjustment)
    .bind(record.magnitude)
    .bind(&record.reason_code)
    .bind(record.status.as_str())
    .bind(record.expires_at)
    .bind(&record.applied_by)
    .bind(record.reversed_at)
    .bind(record.created_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

#[async_trait]
impl CorrectionStore for PostgresHustleStore {
    async fn apply_correction(
        &self,
        record: CorrectionRecord,
        scope_budget: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CorrectionRecord>> {
        self.with_retry("apply_correction", || {
            let record = record.clone();
            async move {
                let mut tx = self.begin_serializable().await?;
                let row = sqlx::query(
                    "SELECT COUNT(*) AS active FROM correction_log \
                      WHERE scope_key = $1 AND status = 'applied' AND expires_at > $2",
                )
                .bind(&record.scope_key)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                let active: i64 = row.try_get("active").map_err(map_sqlx_err)?;
                if active >= scope_budget as i64 {
                    return Ok(None);
                }
                insert_correction_tx(&mut tx, &record).await?;
                tx.commit().await.map_err(map_sqlx_err)?;
                Ok(Some(record))
            }
        })
        .await
    }

    async fn record_rejected(&self, record: CorrectionRecord) -> StoreResult<()> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;
        insert_correction_tx(&mut tx, &record).await?;
        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn get_correction(&self, id: CorrectionId) -> StoreResult<Option<CorrectionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CORRECTION_COLUMNS} FROM correction_log WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::correction_row).transpose()
    }

    async fn reverse_correction(
        &self,
        id: CorrectionId,
        at: DateTime<Utc>,
    ) -> StoreResult<CorrectionRecord> {
        let row = sqlx::query(&format!(
            "UPDATE correction_log \
                SET status = 'reversed', reversed_at = $1 \
              WHERE id = $2 AND status = 'applied' \
              RETURNING {CORRECTION_COLUMNS}"
        ))
        .bind(at)
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        match row {
            Some(row) => rows::correction_row(row),
            None => match self.get_correction(id).await? {
                None => Err(StoreError::NotFound(format!("correction {id} not found"))),
                Some(existing) => Err(StoreError::StateConflict(format!(
                    "correction {id} is {:?}, only applied corrections reverse",
                    existing.status
                ))),
            },
        }
    }

    async fn expire_due_corrections(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CorrectionRecord>> {
        let rows = sqlx::query(&format!(
            "UPDATE correction_log \
                SET status = 'expired' \
              WHERE status = 'applied' AND expires_at <= $1 \
              RETURNING {CORRECTION_COLUMNS}"
        ))
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::correction_row).collect()
    }

    async fn active_in_scope(&self, scope_key: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS active FROM correction_log \
              WHERE scope_key = $1 AND status = 'applied' AND expires_at > $2",
        )
        .bind(scope_key)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        let active: i64 = row.try_get("active").map_err(map_sqlx_err)?;
        Ok(active.max(0) as u64)
    }

    async fn applied_corrections(&self, now: DateTime<Utc>) -> StoreResult<Vec<CorrectionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {CORRECTION_COLUMNS} FROM correction_log \
              WHERE status = 'applied' AND expires_at > $1"
        ))
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::correction_row).collect()
    }

    async fn record_outcome(&self, outcome: CausalOutcomeRecord) -> StoreResult<()> {
        let metric = |set: &crate::model::MetricSet| -> StoreResult<serde_json::Value> {
            serde_json::to_value(set).map_err(|e| StoreError::Serialization(e.to_string()))
        };
        sqlx::query(
            "INSERT INTO causal_outcomes \
                (correction_id, treated_baseline, treated_post, control_baseline, \
                 control_post, net_lift, verdict, confidence, measured_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(outcome.correction_id.to_string())
        .bind(metric(&outcome.treated_baseline)?)
        .bind(metric(&outcome.treated_post)?)
        .bind(metric(&outcome.control_baseline)?)
        .bind(metric(&outcome.control_post)?)
        .bind(metric(&outcome.net_lift)?)
        .bind(outcome.verdict.as_str())
        .bind(outcome.confidence)
        .bind(outcome.measured_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CausalOutcomeRecord>> {
        let rows = sqlx::query(
            "SELECT correction_id, treated_baseline, treated_post, control_baseline, \
                    control_post, net_lift, verdict, confidence, measured_at \
               FROM causal_outcomes \
              WHERE measured_at >= $1 \
              ORDER BY measured_at",
        )
        .bind(since)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::outcome_row).collect()
    }
}

#[async_trait]
impl FlagStore for PostgresHustleStore {
    async fn set_flag(&self, name: &str, enabled: bool, note: Option<String>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO system_flags (name, enabled, note, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (name) DO UPDATE \
                SET enabled = EXCLUDED.enabled, note = EXCLUDED.note, \
                    updated_at = EXCLUDED.updated_at",
        )
        .bind(name)
        .bind(enabled)
        .bind(note)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_flag(&self, name: &str) -> StoreResult<Option<SystemFlagRecord>> {
        let row = sqlx::query(
            "SELECT name, enabled, note, updated_at FROM system_flags WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::flag_row).transpose()
    }
}
