//! Escrow (money_state_lock) store implementation.
//!
//! State changes are compare-and-set UPDATEs inside serializable
//! transactions; the `hx_money_guard` trigger backs every Rust-side check
//! with HX002/HX004/HX201 at commit time.

use super::rows;
use super::tasks::insert_outbox_tx;
use super::{map_sqlx_err, PostgresHustleStore};
use crate::error::{StoreError, StoreResult};
use crate::model::{EscrowRecord, NewOutboxEvent, QueryWindow};
use crate::traits::EscrowStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hustlexp_types::{MoneyState, TaskId};

const ESCROW_COLUMNS: &str = "task_id, state, amount_cents, refunded_cents, version, \
     payment_intent_id, charge_id, transfer_id, refund_id, created_at, updated_at";

impl PostgresHustleStore {
    /// Compare-and-set the escrow state; `rows_affected == 0` is dispatched
    /// to NotFound or StateConflict by re-reading.
    async fn escrow_cas(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        apply: &str,
        binds: Vec<String>,
        outbox: &[NewOutboxEvent],
    ) -> StoreResult<EscrowRecord> {
        let now = Utc::now();
        let mut tx = self.begin_serializable().await?;

        let sql = format!(
            "UPDATE money_state_lock SET {apply}, updated_at = $1 \
             WHERE task_id = $2 AND state = $3 RETURNING {ESCROW_COLUMNS}"
        );
        let mut query = sqlx::query(&sql)
            .bind(now)
            .bind(task_id.to_string())
            .bind(expected_from.as_str());
        for bind in &binds {
            query = query.bind(bind);
        }

        let row = query.fetch_optional(&mut *tx).await.map_err(map_sqlx_err)?;
        let Some(row) = row else {
            drop(tx);
            return match self.get_escrow(task_id).await? {
                None => Err(StoreError::NotFound(format!("escrow {task_id} not found"))),
                Some(existing) if existing.state.is_terminal() => Err(StoreError::invariant(
                    hustlexp_types::InvariantCode::HX002,
                    format!("money state for {task_id} is terminal ({})", existing.state),
                )),
                Some(existing) => Err(StoreError::StateConflict(format!(
                    "escrow {task_id} is {}, expected {expected_from}",
                    existing.state
                ))),
            };
        };

        insert_outbox_tx(&mut tx, outbox, now).await?;
        tx.commit().await.map_err(map_sqlx_err)?;
        rows::escrow_row(row)
    }
}

#[async_trait]
impl EscrowStore for PostgresHustleStore {
    async fn get_escrow(&self, task_id: TaskId) -> StoreResult<Option<EscrowRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM money_state_lock WHERE task_id = $1"
        ))
        .bind(task_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        row.map(rows::escrow_row).transpose()
    }

    async fn hold_escrow(
        &self,
        task_id: TaskId,
        amount_cents: i64,
        payment_intent_id: String,
        charge_id: String,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord> {
        if amount_cents <= 0 {
            return Err(StoreError::InvalidInput(
                "amount_cents must be positive".to_string(),
            ));
        }
        self.with_retry("hold_escrow", || {
            let payment_intent_id = payment_intent_id.clone();
            let charge_id = charge_id.clone();
            let outbox = outbox.clone();
            async move {
                let now = Utc::now();
                let mut tx = self.begin_serializable().await?;
                let row = sqlx::query(&format!(
                    "UPDATE money_state_lock \
                        SET state = 'HELD', amount_cents = $1, payment_intent_id = $2, \
                            charge_id = $3, updated_at = $4 \
                      WHERE task_id = $5 AND state = 'OPEN' AND amount_cents IS NULL \
                      RETURNING {ESCROW_COLUMNS}"
                ))
                .bind(amount_cents)
                .bind(&payment_intent_id)
                .bind(&charge_id)
                .bind(now)
                .bind(task_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                let Some(row) = row else {
                    drop(tx);
                    return match self.get_escrow(task_id).await? {
                        None => {
                            Err(StoreError::NotFound(format!("escrow {task_id} not found")))
                        }
                        Some(existing) => Err(StoreError::StateConflict(format!(
                            "escrow {task_id} is {}, expected OPEN",
                            existing.state
                        ))),
                    };
                };

                insert_outbox_tx(&mut tx, &outbox, now).await?;
                tx.commit().await.map_err(map_sqlx_err)?;
                rows::escrow_row(row)
            }
        })
        .await
    }

    async fn release_escrow(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        transfer_id: String,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord> {
        self.with_retry("release_escrow", || {
            let transfer_id = transfer_id.clone();
            let outbox = outbox.clone();
            async move {
                self.escrow_cas(
                    task_id,
                    expected_from,
                    "state = 'RELEASED', transfer_id = $4",
                    vec![transfer_id],
                    &outbox,
                )
                .await
            }
        })
        .await
    }

    async fn refund_escrow(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        refund_id: String,
        refunded_cents: i64,
        full: bool,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord> {
        if refunded_cents <= 0 {
            return Err(StoreError::InvalidInput(
                "refunded_cents must be positive".to_string(),
            ));
        }
        let target = if full {
            MoneyState::Refunded
        } else {
            MoneyState::RefundPartial
        };
        self.with_retry("refund_escrow", || {
            let refund_id = refund_id.clone();
            let outbox = outbox.clone();
            async move {
                let now = Utc::now();
                let mut tx = self.begin_serializable().await?;
                let row = sqlx::query(&format!(
                    "UPDATE money_state_lock \
                        SET state = $1, refund_id = $2, refunded_cents = $3, updated_at = $4 \
                      WHERE task_id = $5 AND state = $6 \
                        AND amount_cents IS NOT NULL AND $3 <= amount_cents \
                      RETURNING {ESCROW_COLUMNS}"
                ))
                .bind(target.as_str())
                .bind(&refund_id)
                .bind(refunded_cents)
                .bind(now)
                .bind(task_id.to_string())
                .bind(expected_from.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                let Some(row) = row else {
                    drop(tx);
                    return match self.get_escrow(task_id).await? {
                        None => {
                            Err(StoreError::NotFound(format!("escrow {task_id} not found")))
                        }
                        Some(existing) if existing.state.is_terminal() => {
                            Err(StoreError::invariant(
                                hustlexp_types::InvariantCode::HX002,
                                format!(
                                    "money state for {task_id} is terminal ({})",
                                    existing.state
                                ),
                            ))
                        }
                        Some(existing) if existing.state != expected_from => {
                            Err(StoreError::StateConflict(format!(
                                "escrow {task_id} is {}, expected {expected_from}",
                                existing.state
                            )))
                        }
                        Some(existing) => Err(StoreError::InvalidInput(format!(
                            "refund of {refunded_cents} cents out of range for held {:?}",
                            existing.amount_cents
                        ))),
                    };
                };

                insert_outbox_tx(&mut tx, &outbox, now).await?;
                tx.commit().await.map_err(map_sqlx_err)?;
                rows::escrow_row(row)
            }
        })
        .await
    }

    async fn lock_escrow_for_dispute(&self, task_id: TaskId) -> StoreResult<EscrowRecord> {
        self.with_retry("lock_escrow_for_dispute", || async move {
            self.escrow_cas(
                task_id,
                MoneyState::Held,
                "state = 'LOCKED_DISPUTE'",
                vec![],
                &[],
            )
            .await
        })
        .await
    }

    async fn escrows_in_state_older_than(
        &self,
        state: MoneyState,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<EscrowRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM money_state_lock \
              WHERE state = $1 AND updated_at <= $2"
        ))
        .bind(state.as_str())
        .bind(older_than)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::escrow_row).collect()
    }

    async fn released_escrows(&self, window: QueryWindow) -> StoreResult<Vec<EscrowRecord>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(&format!(
            "SELECT {ESCROW_COLUMNS} FROM money_state_lock \
              WHERE state = 'RELEASED' \
              ORDER BY updated_at \
              LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(window.offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        rows.into_iter().map(rows::escrow_row).collect()
    }
}
