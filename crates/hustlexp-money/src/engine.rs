//! The money state machine.
//!
//! ```text
//! OPEN ──fund──▶ HELD ──release──▶ RELEASED   (terminal)
//!               │          └─────▶ REFUNDED   (terminal, full)
//!               │          └─────▶ REFUND_PARTIAL (terminal)
//!               └──lock_dispute──▶ LOCKED_DISPUTE ──resolve──▶ RELEASED|REFUNDED
//! ```
//!
//! Single-writer rule: every state-changing operation holds `money:<task_id>`
//! for the duration of exactly one provider call plus the local commit. The
//! provider call and the commit share one idempotency key recorded in the
//! money-event audit before the call is issued; a timeout leaves the
//! `initiated` row dangling for the reaper to reconcile and commits nothing.

use crate::provider::{PaymentProvider, ProviderError, ProviderTransfer};
use chrono::{DateTime, Duration, Utc};
use hustlexp_storage::{
    AdminAuditAppend, EscrowRecord, EscrowStore, HustleStore, LedgerStore, LockStore,
    NewMoneyEvent, NewOutboxEvent, StoreError, TaskRecord, TaskStore, UserStore,
};
use hustlexp_types::{
    ErrorKind, EventPayload, IdempotencyKey, InvariantCode, MoneyEventPhase, MoneyOp, MoneyState,
    Role, TaskId, TaskState, UserId, EVENT_VERSION,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("money lock busy for task {0}")]
    LockBusy(TaskId),

    #[error("invalid money state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The provider call exceeded its deadline; local state is unchanged and
    /// the reaper reconciles by idempotency key.
    #[error("provider call timed out; reconciliation pending")]
    ProviderTimeout,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MoneyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MoneyError::NotFound(_) => ErrorKind::NotFound,
            MoneyError::LockBusy(_) => ErrorKind::Retryable,
            MoneyError::InvalidState(_) => ErrorKind::ConflictState,
            MoneyError::Validation(_) => ErrorKind::Validation,
            MoneyError::NotAuthorized(_) => ErrorKind::Authorization,
            MoneyError::ProviderTimeout => ErrorKind::Retryable,
            MoneyError::Provider(err) if err.is_retryable() => ErrorKind::Retryable,
            MoneyError::Provider(_) => ErrorKind::FatalProvider,
            MoneyError::Store(err) => err.kind(),
        }
    }
}

/// Outcome of a release command; duplicates are first-class so re-issued
/// commands are visible non-events.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Released(EscrowRecord),
    /// The escrow was already RELEASED; the idempotency-key hit is recorded.
    AlreadyReleased(EscrowRecord),
}

#[derive(Debug, Clone)]
pub enum RefundOutcome {
    Refunded(EscrowRecord),
    AlreadyRefunded(EscrowRecord),
}

/// The sole authority for provider-side money movement.
pub struct MoneyEngine {
    store: Arc<dyn HustleStore>,
    provider: Arc<dyn PaymentProvider>,
    lock_ttl: Duration,
    call_deadline: std::time::Duration,
    owner: String,
}

impl MoneyEngine {
    pub fn new(store: Arc<dyn HustleStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            store,
            provider,
            lock_ttl: Duration::seconds(30),
            call_deadline: std::time::Duration::from_secs(10),
            owner: format!("money-engine-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    async fn with_money_lock<T, F, Fut>(
        &self,
        task_id: TaskId,
        operation: F,
    ) -> Result<T, MoneyError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, MoneyError>>,
    {
        let key = format!("money:{task_id}");
        let lease = self
            .store
            .acquire(&key, &self.owner, self.lock_ttl, Utc::now())
            .await?
            .ok_or(MoneyError::LockBusy(task_id))?;

        let result = operation().await;

        // Best-effort; the TTL reclaims the lease if this release is lost.
        if let Err(err) = self.store.release(&key, &lease.lease_id).await {
            warn!(task_id = %task_id, error = %err, "money lock release failed");
        }
        result
    }

    async fn deadline_call<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, MoneyError> {
        match tokio::time::timeout(self.call_deadline, call).await {
            Err(_) => Err(MoneyError::ProviderTimeout),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ProviderError::Timeout)) => Err(MoneyError::ProviderTimeout),
            Ok(Err(err)) => Err(MoneyError::Provider(err)),
        }
    }

    async fn require_task(&self, task_id: TaskId) -> Result<TaskRecord, MoneyError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(MoneyError::NotFound(task_id))
    }

    async fn require_escrow(&self, task_id: TaskId) -> Result<EscrowRecord, MoneyError> {
        self.store
            .get_escrow(task_id)
            .await?
            .ok_or(MoneyError::NotFound(task_id))
    }

    async fn audit(
        &self,
        task_id: TaskId,
        op: MoneyOp,
        phase: MoneyEventPhase,
        key: &IdempotencyKey,
        provider_ref: Option<String>,
        detail: serde_json::Value,
    ) -> Result<bool, MoneyError> {
        let outcome = self
            .store
            .append_money_event(NewMoneyEvent {
                task_id,
                op,
                phase,
                idempotency_key: key.as_str().to_string(),
                provider_ref,
                detail,
            })
            .await?;
        Ok(!outcome.is_duplicate())
    }

    /// OPEN → HELD: create + capture the payment intent, then commit the
    /// hold with the `escrow.held` outbox row.
    pub async fn fund(&self, task_id: TaskId) -> Result<EscrowRecord, MoneyError> {
        self.with_money_lock(task_id, || async move {
            let task = self.require_task(task_id).await?;
            if task.state.is_terminal() {
                return Err(MoneyError::InvalidState(format!(
                    "task {task_id} is terminal"
                )));
            }
            let escrow = self.require_escrow(task_id).await?;
            if escrow.state != MoneyState::Open {
                return Err(MoneyError::InvalidState(format!(
                    "escrow {task_id} is {}, expected OPEN",
                    escrow.state
                )));
            }

            let intent_key = IdempotencyKey::for_op(MoneyOp::CreateIntent, task_id, escrow.version);
            self.audit(
                task_id,
                MoneyOp::CreateIntent,
                MoneyEventPhase::Initiated,
                &intent_key,
                None,
                serde_json::json!({ "amount_cents": task.price_cents }),
            )
            .await?;
            let intent = self
                .deadline_call(self.provider.create_intent(&intent_key, task.price_cents))
                .await?;
            self.audit(
                task_id,
                MoneyOp::CreateIntent,
                MoneyEventPhase::Confirmed,
                &intent_key,
                Some(intent.intent_id.clone()),
                serde_json::json!({ "duplicate": intent.duplicate }),
            )
            .await?;

            let capture_key = IdempotencyKey::for_op(MoneyOp::Capture, task_id, escrow.version);
            self.audit(
                task_id,
                MoneyOp::Capture,
                MoneyEventPhase::Initiated,
                &capture_key,
                None,
                serde_json::json!({}),
            )
            .await?;
            let charge = self
                .deadline_call(self.provider.capture(&capture_key, &intent.intent_id))
                .await?;
            self.audit(
                task_id,
                MoneyOp::Capture,
                MoneyEventPhase::Confirmed,
                &capture_key,
                Some(charge.charge_id.clone()),
                serde_json::json!({ "duplicate": charge.duplicate }),
            )
            .await?;

            let outbox = NewOutboxEvent::fan_out(&EventPayload::EscrowHeld {
                version: EVENT_VERSION,
                task_id,
                poster_id: task.poster_id,
                amount_cents: task.price_cents,
            });
            let held = self
                .store
                .hold_escrow(
                    task_id,
                    task.price_cents,
                    intent.intent_id,
                    charge.charge_id,
                    outbox,
                )
                .await?;
            info!(task_id = %task_id, amount_cents = task.price_cents, "escrow held");
            Ok(held)
        })
        .await
    }

    /// HELD → RELEASED. Re-issuing against a RELEASED escrow is a recorded
    /// non-event.
    pub async fn release(&self, task_id: TaskId) -> Result<ReleaseOutcome, MoneyError> {
        self.release_from(task_id, MoneyState::Held).await
    }

    /// LOCKED_DISPUTE → RELEASED (dispute resolved in the hustler's favor).
    pub async fn resolve_dispute_release(
        &self,
        task_id: TaskId,
    ) -> Result<ReleaseOutcome, MoneyError> {
        self.release_from(task_id, MoneyState::LockedDispute).await
    }

    async fn release_from(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
    ) -> Result<ReleaseOutcome, MoneyError> {
        self.with_money_lock(task_id, || async move {
            let task = self.require_task(task_id).await?;
            let escrow = self.require_escrow(task_id).await?;
            let transfer_key = IdempotencyKey::for_op(MoneyOp::Transfer, task_id, escrow.version);

            if escrow.state == MoneyState::Released {
                // Duplicate command: record the key hit, change nothing.
                self.audit(
                    task_id,
                    MoneyOp::Transfer,
                    MoneyEventPhase::Initiated,
                    &transfer_key,
                    None,
                    serde_json::json!({ "replay": true }),
                )
                .await?;
                info!(task_id = %task_id, "duplicate release absorbed");
                return Ok(ReleaseOutcome::AlreadyReleased(escrow));
            }
            if escrow.state != expected_from {
                return Err(MoneyError::InvalidState(format!(
                    "escrow {task_id} is {}, expected {expected_from}",
                    escrow.state
                )));
            }
            // Ordering contract: nothing moves provider-side unless the local
            // commit can follow. The trigger re-asserts this at commit.
            if task.state != TaskState::Completed {
                return Err(MoneyError::Store(StoreError::invariant(
                    InvariantCode::HX201,
                    format!("task {task_id} is {}, release requires COMPLETED", task.state),
                )));
            }
            let hustler_id = task.hustler_id.ok_or_else(|| {
                MoneyError::InvalidState(format!("task {task_id} has no hustler"))
            })?;
            let amount = escrow.amount_cents.ok_or_else(|| {
                MoneyError::InvalidState(format!("escrow {task_id} was never funded"))
            })?;

            self.audit(
                task_id,
                MoneyOp::Transfer,
                MoneyEventPhase::Initiated,
                &transfer_key,
                None,
                serde_json::json!({ "amount_cents": amount, "destination": hustler_id }),
            )
            .await?;

            let transfer = match self
                .deadline_call(self.provider.transfer(
                    &transfer_key,
                    &hustler_id.to_string(),
                    amount,
                ))
                .await
            {
                Ok(transfer) => transfer,
                Err(MoneyError::ProviderTimeout) => {
                    // The initiated row dangles; the reaper looks the key up
                    // and finishes the job either way.
                    warn!(task_id = %task_id, "transfer timed out, deferring to reconciliation");
                    return Err(MoneyError::ProviderTimeout);
                }
                Err(err) => {
                    if let MoneyError::Provider(ProviderError::Rejected { code, message }) = &err {
                        self.audit(
                            task_id,
                            MoneyOp::Transfer,
                            MoneyEventPhase::Failed,
                            &transfer_key,
                            None,
                            serde_json::json!({ "code": code, "message": message }),
                        )
                        .await?;
                    }
                    return Err(err);
                }
            };

            let released = self
                .commit_release(task_id, &task, &escrow, &transfer_key, transfer)
                .await?;
            Ok(ReleaseOutcome::Released(released))
        })
        .await
    }

    /// Commit RELEASED locally after a definitive provider success. Also the
    /// reaper's entry point once reconciliation finds the transfer landed.
    pub async fn commit_release(
        &self,
        task_id: TaskId,
        task: &TaskRecord,
        escrow: &EscrowRecord,
        transfer_key: &IdempotencyKey,
        transfer: ProviderTransfer,
    ) -> Result<EscrowRecord, MoneyError> {
        self.audit(
            task_id,
            MoneyOp::Transfer,
            MoneyEventPhase::Confirmed,
            transfer_key,
            Some(transfer.transfer_id.clone()),
            serde_json::json!({ "duplicate": transfer.duplicate }),
        )
        .await?;

        let hustler_id = task.hustler_id.ok_or_else(|| {
            MoneyError::InvalidState(format!("task {task_id} has no hustler"))
        })?;
        let amount = escrow.amount_cents.ok_or_else(|| {
            MoneyError::InvalidState(format!("escrow {task_id} was never funded"))
        })?;
        let outbox = NewOutboxEvent::fan_out(&EventPayload::EscrowReleased {
            version: EVENT_VERSION,
            task_id,
            poster_id: task.poster_id,
            hustler_id,
            amount_cents: amount,
        });

        let released = self
            .store
            .release_escrow(task_id, escrow.state, transfer.transfer_id, outbox)
            .await?;
        info!(task_id = %task_id, amount_cents = amount, "escrow released");
        Ok(released)
    }

    /// HELD → REFUNDED / REFUND_PARTIAL.
    pub async fn refund(
        &self,
        task_id: TaskId,
        amount_cents: Option<i64>,
    ) -> Result<RefundOutcome, MoneyError> {
        self.refund_from(task_id, MoneyState::Held, amount_cents).await
    }

    /// LOCKED_DISPUTE → REFUNDED / REFUND_PARTIAL.
    pub async fn resolve_dispute_refund(
        &self,
        task_id: TaskId,
        amount_cents: Option<i64>,
    ) -> Result<RefundOutcome, MoneyError> {
        self.refund_from(task_id, MoneyState::LockedDispute, amount_cents)
            .await
    }

    async fn refund_from(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        amount_cents: Option<i64>,
    ) -> Result<RefundOutcome, MoneyError> {
        self.with_money_lock(task_id, || async move {
            let escrow = self.require_escrow(task_id).await?;
            let refund_key = IdempotencyKey::for_op(MoneyOp::Refund, task_id, escrow.version);

            if matches!(
                escrow.state,
                MoneyState::Refunded | MoneyState::RefundPartial
            ) {
                self.audit(
                    task_id,
                    MoneyOp::Refund,
                    MoneyEventPhase::Initiated,
                    &refund_key,
                    None,
                    serde_json::json!({ "replay": true }),
                )
                .await?;
                return Ok(RefundOutcome::AlreadyRefunded(escrow));
            }
            if escrow.state != expected_from {
                return Err(MoneyError::InvalidState(format!(
                    "escrow {task_id} is {}, expected {expected_from}",
                    escrow.state
                )));
            }
            let held = escrow.amount_cents.ok_or_else(|| {
                MoneyError::InvalidState(format!("escrow {task_id} was never funded"))
            })?;
            let refund_amount = amount_cents.unwrap_or(held);
            if refund_amount <= 0 || refund_amount > held {
                return Err(MoneyError::Validation(format!(
                    "refund of {refund_amount} cents out of range for held {held}"
                )));
            }
            let full = refund_amount == held;
            let charge_id = escrow.charge_id.clone().ok_or_else(|| {
                MoneyError::InvalidState(format!("escrow {task_id} has no charge"))
            })?;

            self.audit(
                task_id,
                MoneyOp::Refund,
                MoneyEventPhase::Initiated,
                &refund_key,
                None,
                serde_json::json!({ "amount_cents": refund_amount, "full": full }),
            )
            .await?;

            let refund = match self
                .deadline_call(self.provider.refund(&refund_key, &charge_id, refund_amount))
                .await
            {
                Ok(refund) => refund,
                Err(MoneyError::ProviderTimeout) => {
                    warn!(task_id = %task_id, "refund timed out, deferring to reconciliation");
                    return Err(MoneyError::ProviderTimeout);
                }
                Err(err) => {
                    if let MoneyError::Provider(ProviderError::Rejected { code, message }) = &err {
                        self.audit(
                            task_id,
                            MoneyOp::Refund,
                            MoneyEventPhase::Failed,
                            &refund_key,
                            None,
                            serde_json::json!({ "code": code, "message": message }),
                        )
                        .await?;
                    }
                    return Err(err);
                }
            };

            self.audit(
                task_id,
                MoneyOp::Refund,
                MoneyEventPhase::Confirmed,
                &refund_key,
                Some(refund.refund_id.clone()),
                serde_json::json!({ "duplicate": refund.duplicate }),
            )
            .await?;

            let task = self.require_task(task_id).await?;
            let outbox = NewOutboxEvent::fan_out(&EventPayload::EscrowRefunded {
                version: EVENT_VERSION,
                task_id,
                poster_id: task.poster_id,
                amount_cents: refund_amount,
                partial: !full,
            });
            let refunded = self
                .store
                .refund_escrow(
                    task_id,
                    expected_from,
                    refund.refund_id,
                    refund_amount,
                    full,
                    outbox,
                )
                .await?;
            info!(task_id = %task_id, amount_cents = refund_amount, full, "escrow refunded");
            Ok(RefundOutcome::Refunded(refunded))
        })
        .await
    }

    /// HELD → LOCKED_DISPUTE; no provider interaction.
    pub async fn lock_dispute(&self, task_id: TaskId) -> Result<EscrowRecord, MoneyError> {
        self.with_money_lock(task_id, || async move {
            Ok(self.store.lock_escrow_for_dispute(task_id).await?)
        })
        .await
    }

    /// Audited admin force-release: allowed from HELD or LOCKED_DISPUTE,
    /// never bypassing the money lock or the completion gate.
    pub async fn force_release(
        &self,
        task_id: TaskId,
        admin_id: UserId,
        reason: String,
    ) -> Result<ReleaseOutcome, MoneyError> {
        let admin = self
            .store
            .get_user(admin_id)
            .await?
            .ok_or_else(|| MoneyError::NotAuthorized(format!("unknown user {admin_id}")))?;
        if admin.role != Role::Admin {
            return Err(MoneyError::NotAuthorized("admin only".to_string()));
        }

        let escrow = self.require_escrow(task_id).await?;
        let from = match escrow.state {
            MoneyState::Held | MoneyState::LockedDispute => escrow.state,
            MoneyState::Released => {
                return self.release_from(task_id, MoneyState::Held).await;
            }
            other => {
                return Err(MoneyError::InvalidState(format!(
                    "force release from {other} is forbidden"
                )));
            }
        };

        self.store
            .append_admin_audit(AdminAuditAppend {
                actor_id: admin_id,
                action: "force_release".to_string(),
                target_kind: "money_state_lock".to_string(),
                target_id: task_id.to_string(),
                before: serde_json::json!({ "state": from.as_str() }),
                after: serde_json::json!({ "state": MoneyState::Released.as_str() }),
                reason,
            })
            .await?;

        self.release_from(task_id, from).await
    }
}
