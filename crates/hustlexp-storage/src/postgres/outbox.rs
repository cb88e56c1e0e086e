//! Outbox and lock store implementations.
//!
//! The claim is one `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)` so
//! horizontally scaled workers never double-claim a row.

use super::rows;
use super::tasks::insert_outbox_tx;
use super::{map_sqlx_err, PostgresHustleStore};
use crate::error::{StoreError, StoreResult};
use crate::model::{Lease, NewOutboxEvent, OutboxCounts, OutboxRecord, OutboxStatus, QueryWindow};
use crate::traits::{LockStore, OutboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hustlexp_types::{EventId, Queue};
use sqlx::Row;
use uuid::Uuid;

const OUTBOX_COLUMNS: &str = "id, event_type, aggregate_type, aggregate_id, event_version, \
     idempotency_key, payload, queue_name, status, attempts, next_attempt_at, last_error, \
     lease_expires_at, created_at, updated_at";

#[async_trait]
impl OutboxStore for PostgresHustleStore {
    async fn enqueue(&self, events: Vec<NewOutboxEvent>) -> StoreResult<Vec<OutboxRecord>> {
        let keys: Vec<String> = events
            .iter()
            .map(|event| event.idempotency_key.clone())
            .collect();

        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;
        insert_outbox_tx(&mut tx, &events, Utc::now()).await?;
        tx.commit().await.map_err(map_sqlx_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events \
              WHERE idempotency_key = ANY($1) ORDER BY created_at"
        ))
        .bind(&keys)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::outbox_row).collect()
    }

    async fn claim_batch(
        &self,
        queue: Queue,
        now: DateTime<Utc>,
        limit: usize,
        lease_ttl: Duration,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(&format!(
            "UPDATE outbox_events \
                SET status = 'in_flight', lease_expires_at = $1, updated_at = $2 \
              WHERE id IN ( \
                    SELECT id FROM outbox_events \
                     WHERE queue_name = $3 AND status = 'pending' AND next_attempt_at <= $2 \
                     ORDER BY next_attempt_at \
                     LIMIT $4 \
                     FOR UPDATE SKIP LOCKED \
              ) \
              RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(now + lease_ttl)
        .bind(now)
        .bind(queue.as_str())
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::outbox_row).collect()
    }

    async fn mark_completed(&self, event_id: EventId) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE outbox_events \
                SET status = 'completed', lease_expires_at = NULL, updated_at = NOW() \
              WHERE id = $1",
        )
        .bind(event_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "outbox event {event_id} not found"
            )));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreResult<OutboxStatus> {
        let (status, next) = match next_attempt_at {
            Some(at) => (OutboxStatus::Pending, Some(at)),
            None => (OutboxStatus::Dead, None),
        };
        let result = sqlx::query(
            "UPDATE outbox_events \
                SET status = $1, attempts = attempts + 1, last_error = $2, \
                    next_attempt_at = COALESCE($3, next_attempt_at), \
                    lease_expires_at = NULL, updated_at = NOW() \
              WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(next)
        .bind(event_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "outbox event {event_id} not found"
            )));
        }
        Ok(status)
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE outbox_events \
                SET status = 'pending', lease_expires_at = NULL, updated_at = $1 \
              WHERE status = 'in_flight' AND lease_expires_at <= $1",
        )
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, window: QueryWindow) -> StoreResult<Vec<OutboxRecord>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events \
              WHERE status = 'dead' \
              ORDER BY updated_at \
              LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(window.offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::outbox_row).collect()
    }

    async fn replay_dead_letter(&self, event_id: EventId) -> StoreResult<OutboxRecord> {
        let row = sqlx::query(&format!(
            "UPDATE outbox_events \
                SET status = 'pending', attempts = 0, last_error = NULL, \
                    next_attempt_at = NOW(), updated_at = NOW() \
              WHERE id = $1 AND status = 'dead' \
              RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(event_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        match row {
            Some(row) => rows::outbox_row(row),
            None => Err(StoreError::StateConflict(format!(
                "outbox event {event_id} is not dead or does not exist"
            ))),
        }
    }

    async fn counts(&self) -> StoreResult<OutboxCounts> {
        let row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                COUNT(*) FILTER (WHERE status = 'in_flight') AS in_flight, \
                COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                COUNT(*) FILTER (WHERE status = 'dead') AS dead \
               FROM outbox_events",
        )
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        let get = |name: &str| -> StoreResult<u64> {
            let value: i64 = row.try_get(name).map_err(map_sqlx_err)?;
            Ok(value.max(0) as u64)
        };
        Ok(OutboxCounts {
            pending: get("pending")?,
            in_flight: get("in_flight")?,
            completed: get("completed")?,
            dead: get("dead")?,
        })
    }
}

#[async_trait]
impl LockStore for PostgresHustleStore {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Lease>> {
        // Insert, or steal the row only when the previous lease expired.
        let row = sqlx::query(
            "INSERT INTO locks (key, lease_id, owner, expires_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (key) DO UPDATE \
                SET lease_id = EXCLUDED.lease_id, owner = EXCLUDED.owner, \
                    expires_at = EXCLUDED.expires_at \
              WHERE locks.expires_at <= $5 \
             RETURNING key, lease_id, owner, expires_at",
        )
        .bind(key)
        .bind(Uuid::new_v4().to_string())
        .bind(owner)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::lease_row).transpose()
    }

    async fn release(&self, key: &str, lease_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE key = $1 AND lease_id = $2")
            .bind(key)
            .bind(lease_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }
}
