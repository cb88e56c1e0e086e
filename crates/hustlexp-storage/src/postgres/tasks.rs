//! User and task store implementations.

use super::rows;
use super::{map_sqlx_err, PostgresHustleStore};
use crate::error::{StoreError, StoreResult};
use crate::memory::admin_audit_hash;
use crate::model::{
    AdminAuditAppend, CompletionStats, NewOutboxEvent, ProofRecord, TaskRecord,
    TaskStateLogRecord, TaskTransitionRequest, UserRecord,
};
use crate::traits::{TaskStore, UserStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hustlexp_types::{ProofId, ProofState, TaskId, TaskState, TrustTier, UserId};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

pub(crate) async fn insert_outbox_tx(
    tx: &mut Transaction<'_, Postgres>,
    events: &[NewOutboxEvent],
    now: DateTime<Utc>,
) -> StoreResult<()> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, event_type, aggregate_type, aggregate_id, event_version,
                 idempotency_key, payload, queue_name, status, attempts,
                 next_attempt_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $9, $9, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(hustlexp_types::EventId::generate().to_string())
        .bind(&event.event_type)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(event.event_version as i32)
        .bind(&event.idempotency_key)
        .bind(&event.payload)
        .bind(event.queue.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
    }
    Ok(())
}

async fn insert_state_log_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: TaskId,
    from_state: Option<TaskState>,
    to_state: TaskState,
    transition: &str,
    actor_id: Option<UserId>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO task_state_log
            (task_id, from_state, to_state, transition, actor_id, reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(task_id.to_string())
    .bind(from_state.map(|s| s.as_str()))
    .bind(to_state.as_str())
    .bind(transition)
    .bind(actor_id.map(|id| id.to_string()))
    .bind(reason)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

pub(crate) async fn append_admin_audit_tx(
    tx: &mut Transaction<'_, Postgres>,
    entry: &AdminAuditAppend,
) -> StoreResult<()> {
    sqlx::query("LOCK TABLE admin_action_audit IN EXCLUSIVE MODE")
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;

    let last =
        sqlx::query("SELECT sequence, hash FROM admin_action_audit ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx_err)?;

    let (sequence, previous_hash) = match last {
        Some(row) => {
            let seq: i64 = row.try_get("sequence").map_err(map_sqlx_err)?;
            let hash: String = row.try_get("hash").map_err(map_sqlx_err)?;
            (seq + 1, Some(hash))
        }
        None => (1_i64, None),
    };

    let hash = admin_audit_hash(entry, previous_hash.as_deref(), sequence as u64)?;
    sqlx::query(
        r#"
        INSERT INTO admin_action_audit
            (event_id, sequence, actor_id, action, target_kind, target_id,
             before, after, reason, previous_hash, hash, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(format!("audit-{}", Uuid::new_v4()))
    .bind(sequence)
    .bind(entry.actor_id.to_string())
    .bind(&entry.action)
    .bind(&entry.target_kind)
    .bind(&entry.target_id)
    .bind(&entry.before)
    .bind(&entry.after)
    .bind(&entry.reason)
    .bind(previous_hash)
    .bind(hash)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

impl PostgresHustleStore {
    async fn transition_once(
        &self,
        request: &TaskTransitionRequest,
        admin_audit: Option<&AdminAuditAppend>,
    ) -> StoreResult<TaskRecord> {
        let now = Utc::now();
        let mut tx = self.begin_serializable().await?;

        if let Some(audit) = admin_audit {
            append_admin_audit_tx(&mut tx, audit).await?;
            // Unfreeze terminal rows for this transaction only; the audit row
            // above is already committed with it or not at all.
            sqlx::query("SELECT set_config('hustlexp.admin_override', 'on', true)")
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        }

        let current = sqlx::query("SELECT state FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(request.task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .ok_or_else(|| StoreError::NotFound(format!("task {} not found", request.task_id)))?;

        let state_raw: String = current.try_get("state").map_err(map_sqlx_err)?;
        let from_state = TaskState::parse(&state_raw)
            .ok_or_else(|| StoreError::Serialization(format!("unknown task state `{state_raw}`")))?;

        if !request.expected_from.is_empty() && !request.expected_from.contains(&from_state) {
            return Err(StoreError::StateConflict(format!(
                "task {} is {}, expected one of {:?}",
                request.task_id, from_state, request.expected_from
            )));
        }

        let row = sqlx::query(
            r#"
            UPDATE tasks
               SET state = $1,
                   hustler_id = COALESCE($2, hustler_id),
                   updated_at = $3
             WHERE id = $4
            RETURNING id, poster_id, hustler_id, category, price_cents, state,
                      expires_at, created_at, updated_at
            "#,
        )
        .bind(request.to.as_str())
        .bind(request.set_hustler.map(|id| id.to_string()))
        .bind(now)
        .bind(request.task_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        insert_state_log_tx(
            &mut tx,
            request.task_id,
            Some(from_state),
            request.to,
            request.transition.as_str(),
            request.actor_id,
            request.reason.as_deref(),
            now,
        )
        .await?;
        insert_outbox_tx(&mut tx, &request.outbox, now).await?;

        tx.commit().await.map_err(map_sqlx_err)?;
        rows::task_row(row)
    }
}

#[async_trait]
impl UserStore for PostgresHustleStore {
    async fn create_user(&self, user: UserRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users
                (id, role, trust_tier, xp_total, level, streak_days,
                 last_active_at, archived, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.id.to_string())
        .bind(user.role.as_str())
        .bind(user.trust_tier.value() as i16)
        .bind(user.xp_total)
        .bind(user.level as i32)
        .bind(user.streak_days as i32)
        .bind(user.last_active_at)
        .bind(user.archived)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<UserRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, role, trust_tier, xp_total, level, streak_days,
                   last_active_at, archived, created_at, updated_at
              FROM users
             WHERE id = $1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::user_row).transpose()
    }

    async fn archive_user(&self, user_id: UserId) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET archived = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(user_id.to_string())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id} not found")));
        }
        Ok(())
    }

    async fn touch_activity(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE users SET last_active_at = $1, updated_at = NOW() WHERE id = $2")
                .bind(at)
                .bind(user_id.to_string())
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id} not found")));
        }
        Ok(())
    }

    async fn set_trust_tier(&self, user_id: UserId, tier: TrustTier) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE users SET trust_tier = $1, updated_at = NOW() WHERE id = $2")
                .bind(tier.value() as i16)
                .bind(user_id.to_string())
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("user {user_id} not found")));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresHustleStore {
    async fn create_task(&self, task: TaskRecord) -> StoreResult<()> {
        self.with_retry("create_task", || {
            let task = task.clone();
            async move {
                let now = Utc::now();
                let mut tx = self.begin_serializable().await?;

                sqlx::query(
                    r#"
                    INSERT INTO tasks
                        (id, poster_id, hustler_id, category, price_cents, state,
                         expires_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(task.id.to_string())
                .bind(task.poster_id.to_string())
                .bind(task.hustler_id.map(|id| id.to_string()))
                .bind(&task.category)
                .bind(task.price_cents)
                .bind(task.state.as_str())
                .bind(task.expires_at)
                .bind(task.created_at)
                .bind(task.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                sqlx::query(
                    r#"
                    INSERT INTO money_state_lock (task_id, state, version, created_at, updated_at)
                    VALUES ($1, 'OPEN', 1, $2, $2)
                    "#,
                )
                .bind(task.id.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                insert_state_log_tx(
                    &mut tx,
                    task.id,
                    None,
                    TaskState::Open,
                    hustlexp_types::TaskTransition::Create.as_str(),
                    Some(task.poster_id),
                    None,
                    now,
                )
                .await?;

                tx.commit().await.map_err(map_sqlx_err)
            }
        })
        .await
    }

    async fn get_task(&self, task_id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, poster_id, hustler_id, category, price_cents, state,
                   expires_at, created_at, updated_at
              FROM tasks
             WHERE id = $1
            "#,
        )
        .bind(task_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::task_row).transpose()
    }

    async fn transition_task(&self, request: TaskTransitionRequest) -> StoreResult<TaskRecord> {
        self.with_retry("transition_task", || {
            let request = request.clone();
            async move { self.transition_once(&request, None).await }
        })
        .await
    }

    async fn admin_override_task(
        &self,
        request: TaskTransitionRequest,
        audit: AdminAuditAppend,
    ) -> StoreResult<TaskRecord> {
        self.with_retry("admin_override_task", || {
            let request = request.clone();
            let audit = audit.clone();
            async move { self.transition_once(&request, Some(&audit)).await }
        })
        .await
    }

    async fn create_proof(
        &self,
        proof: ProofRecord,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<()> {
        self.with_retry("create_proof", || {
            let proof = proof.clone();
            let outbox = outbox.clone();
            async move {
                let now = Utc::now();
                let mut tx = self.begin_serializable().await?;
                let artifacts = serde_json::to_value(&proof.artifact_keys)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

                sqlx::query(
                    r#"
                    INSERT INTO proofs
                        (id, task_id, submitter_id, artifact_keys, state,
                         deadline_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(proof.id.to_string())
                .bind(proof.task_id.to_string())
                .bind(proof.submitter_id.to_string())
                .bind(artifacts)
                .bind(proof.state.as_str())
                .bind(proof.deadline_at)
                .bind(proof.created_at)
                .bind(proof.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                insert_outbox_tx(&mut tx, &outbox, now).await?;
                tx.commit().await.map_err(map_sqlx_err)
            }
        })
        .await
    }

    async fn get_proof(&self, proof_id: ProofId) -> StoreResult<Option<ProofRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, submitter_id, artifact_keys, state,
                   deadline_at, created_at, updated_at
              FROM proofs
             WHERE id = $1
            "#,
        )
        .bind(proof_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::proof_row).transpose()
    }

    async fn latest_proof_for_task(&self, task_id: TaskId) -> StoreResult<Option<ProofRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, submitter_id, artifact_keys, state,
                   deadline_at, created_at, updated_at
              FROM proofs
             WHERE task_id = $1
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(task_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::proof_row).transpose()
    }

    async fn set_proof_state(&self, proof_id: ProofId, state: ProofState) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE proofs SET state = $1, updated_at = NOW() WHERE id = $2")
                .bind(state.as_str())
                .bind(proof_id.to_string())
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("proof {proof_id} not found")));
        }
        Ok(())
    }

    async fn proofs_past_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProofRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, submitter_id, artifact_keys, state,
                   deadline_at, created_at, updated_at
              FROM proofs
             WHERE state = 'SUBMITTED' AND deadline_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::proof_row).collect()
    }

    async fn open_tasks_expired_before(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, poster_id, hustler_id, category, price_cents, state,
                   expires_at, created_at, updated_at
              FROM tasks
             WHERE state = 'OPEN' AND expires_at IS NOT NULL AND expires_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::task_row).collect()
    }

    async fn state_log_for_task(&self, task_id: TaskId) -> StoreResult<Vec<TaskStateLogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, task_id, from_state, to_state, transition,
                   actor_id, reason, created_at
              FROM task_state_log
             WHERE task_id = $1
             ORDER BY sequence
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::state_log_row).collect()
    }

    async fn completion_stats(&self, user_id: UserId) -> StoreResult<CompletionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE t.state = 'COMPLETED') AS completed,
                COUNT(*) FILTER (
                    WHERE t.state = 'CANCELLED'
                      AND EXISTS (
                          SELECT 1 FROM task_state_log l
                           WHERE l.task_id = t.id AND l.to_state = 'DISPUTED'
                      )
                ) AS disputes_lost
              FROM tasks t
             WHERE t.hustler_id = $1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        let completed: i64 = row.try_get("completed").map_err(map_sqlx_err)?;
        let disputes_lost: i64 = row.try_get("disputes_lost").map_err(map_sqlx_err)?;
        Ok(CompletionStats {
            completed: completed.max(0) as u64,
            disputes_lost: disputes_lost.max(0) as u64,
        })
    }
}
