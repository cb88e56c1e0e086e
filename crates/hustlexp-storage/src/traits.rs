//! Storage trait surface.
//!
//! Every method is an atomic unit of work: the PostgreSQL adapter wraps each
//! in a serializable transaction with retry; the in-memory adapter holds one
//! write guard for the duration. Engines hold an `Arc<dyn HustleStore>` and
//! never compose partial writes across calls.

use crate::error::StoreResult;
use crate::model::{
    AdminAuditAppend, AdminAuditRecord, BadgeLedgerRecord, CausalOutcomeRecord, CompletionStats,
    CorrectionRecord, EscrowRecord, Lease, MoneyEventRecord, NewMoneyEvent, NewOutboxEvent,
    NewTrustDelta, NewXpAward, OutboxCounts, OutboxRecord, ProofRecord, QueryWindow,
    SystemFlagRecord, TaskRecord, TaskStateLogRecord, TaskTransitionRequest, TrustLedgerRecord,
    UserRecord, WriteOutcome, XpLedgerRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hustlexp_types::{
    Badge, CorrectionId, EventId, MoneyState, ProofId, ProofState, Queue, TaskId, UserId,
};

/// Users and their derived columns.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: UserRecord) -> StoreResult<()>;

    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<UserRecord>>;

    /// Soft archive; users are never hard-deleted.
    async fn archive_user(&self, user_id: UserId) -> StoreResult<()>;

    /// Record activity for streak maintenance.
    async fn touch_activity(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Update the cached trust tier (the trust ledger remains authoritative).
    async fn set_trust_tier(
        &self,
        user_id: UserId,
        tier: hustlexp_types::TrustTier,
    ) -> StoreResult<()>;
}

/// Tasks, proofs, and the task state log.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the task (OPEN) and its escrow row (OPEN) together.
    async fn create_task(&self, task: TaskRecord) -> StoreResult<()>;

    async fn get_task(&self, task_id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Compare-and-set transition with an atomic state-log append, optional
    /// field updates, and outbox emission.
    async fn transition_task(&self, request: TaskTransitionRequest) -> StoreResult<TaskRecord>;

    /// Admin override of a (possibly terminal) task. The audit row is written
    /// in the same transaction; without it the write is rejected (HX001).
    async fn admin_override_task(
        &self,
        request: TaskTransitionRequest,
        audit: AdminAuditAppend,
    ) -> StoreResult<TaskRecord>;

    async fn create_proof(&self, proof: ProofRecord, outbox: Vec<NewOutboxEvent>)
        -> StoreResult<()>;

    async fn get_proof(&self, proof_id: ProofId) -> StoreResult<Option<ProofRecord>>;

    /// Latest proof for a task, if any.
    async fn latest_proof_for_task(&self, task_id: TaskId) -> StoreResult<Option<ProofRecord>>;

    async fn set_proof_state(&self, proof_id: ProofId, state: ProofState) -> StoreResult<()>;

    /// Proofs past their deadline and still SUBMITTED.
    async fn proofs_past_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProofRecord>>;

    /// OPEN tasks whose expiry has passed.
    async fn open_tasks_expired_before(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>>;

    async fn state_log_for_task(&self, task_id: TaskId) -> StoreResult<Vec<TaskStateLogRecord>>;

    /// Completion/dispute tallies for trust evaluation.
    async fn completion_stats(&self, user_id: UserId) -> StoreResult<CompletionStats>;
}

/// The money-state-lock row.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn get_escrow(&self, task_id: TaskId) -> StoreResult<Option<EscrowRecord>>;

    /// OPEN → HELD; sets `amount_cents` exactly once (HX004).
    async fn hold_escrow(
        &self,
        task_id: TaskId,
        amount_cents: i64,
        payment_intent_id: String,
        charge_id: String,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord>;

    /// `expected_from` → RELEASED. The task must already be COMPLETED
    /// (HX201); the release outbox rows commit in the same transaction.
    async fn release_escrow(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        transfer_id: String,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord>;

    /// `expected_from` → REFUNDED / REFUND_PARTIAL.
    async fn refund_escrow(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        refund_id: String,
        refunded_cents: i64,
        full: bool,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord>;

    /// HELD → LOCKED_DISPUTE.
    async fn lock_escrow_for_dispute(&self, task_id: TaskId) -> StoreResult<EscrowRecord>;

    /// Escrows in the given state older than the horizon (reaper input).
    async fn escrows_in_state_older_than(
        &self,
        state: MoneyState,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<EscrowRecord>>;

    /// All RELEASED escrows (parity walk).
    async fn released_escrows(&self, window: QueryWindow) -> StoreResult<Vec<EscrowRecord>>;
}

/// Append-only ledgers: XP, trust, badges, money events, admin audit.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert an XP row keyed by `money_state_lock_task_id` and update the
    /// user's derived totals, all in one transaction. The referenced money
    /// state must be RELEASED (HX101); a duplicate key is a non-event.
    async fn award_xp(&self, award: NewXpAward) -> StoreResult<WriteOutcome<XpLedgerRecord>>;

    async fn xp_for_release(&self, task_id: TaskId) -> StoreResult<Option<XpLedgerRecord>>;

    async fn xp_for_user(&self, user_id: UserId) -> StoreResult<Vec<XpLedgerRecord>>;

    /// Append a trust delta and update the cached tier; idempotent by key.
    async fn append_trust(
        &self,
        delta: NewTrustDelta,
    ) -> StoreResult<WriteOutcome<TrustLedgerRecord>>;

    async fn trust_for_user(&self, user_id: UserId) -> StoreResult<Vec<TrustLedgerRecord>>;

    /// Grant a badge; idempotent per (user, badge).
    async fn grant_badge(
        &self,
        user_id: UserId,
        badge: Badge,
    ) -> StoreResult<WriteOutcome<BadgeLedgerRecord>>;

    async fn badges_for_user(&self, user_id: UserId) -> StoreResult<Vec<BadgeLedgerRecord>>;

    /// Append a money event; idempotent by (idempotency key, phase).
    async fn append_money_event(
        &self,
        event: NewMoneyEvent,
    ) -> StoreResult<WriteOutcome<MoneyEventRecord>>;

    async fn money_events_for_task(&self, task_id: TaskId) -> StoreResult<Vec<MoneyEventRecord>>;

    async fn money_event_by_key(
        &self,
        idempotency_key: &str,
    ) -> StoreResult<Vec<MoneyEventRecord>>;

    /// `initiated` events with no `confirmed`/`failed` successor, older than
    /// the horizon: the reaper's work queue.
    async fn initiated_without_outcome(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<MoneyEventRecord>>;

    /// Append to the hash-chained admin audit.
    async fn append_admin_audit(&self, entry: AdminAuditAppend) -> StoreResult<AdminAuditRecord>;

    async fn admin_audit(&self, window: QueryWindow) -> StoreResult<Vec<AdminAuditRecord>>;
}

/// Transactional outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Standalone emission for producers without a surrounding domain write.
    /// Duplicate idempotency keys short-circuit to the existing row.
    async fn enqueue(&self, events: Vec<NewOutboxEvent>) -> StoreResult<Vec<OutboxRecord>>;

    /// Atomically claim up to `limit` due pending rows for a queue, marking
    /// them in-flight under a lease.
    async fn claim_batch(
        &self,
        queue: Queue,
        now: DateTime<Utc>,
        limit: usize,
        lease_ttl: Duration,
    ) -> StoreResult<Vec<OutboxRecord>>;

    async fn mark_completed(&self, event_id: EventId) -> StoreResult<()>;

    /// Record a failure: reschedule with backoff, or move to `dead` once
    /// attempts exceed the bound. Returns the resulting status.
    async fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreResult<crate::model::OutboxStatus>;

    /// Return expired in-flight leases to pending (crash recovery).
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn dead_letters(&self, window: QueryWindow) -> StoreResult<Vec<OutboxRecord>>;

    /// Supervised replay of a dead letter: back to pending, attempts reset.
    async fn replay_dead_letter(&self, event_id: EventId) -> StoreResult<OutboxRecord>;

    async fn counts(&self) -> StoreResult<OutboxCounts>;
}

/// Cluster-wide lease-based advisory locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Acquire or steal-if-expired. `None` means the key is held.
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Lease>>;

    /// Idempotent, ownership-checked release. Returns whether the lease was
    /// actually released by this call.
    async fn release(&self, key: &str, lease_id: &str) -> StoreResult<bool>;
}

/// Correction log and causal outcomes.
#[async_trait]
pub trait CorrectionStore: Send + Sync {
    /// Insert an applied correction iff the scope has budget headroom; the
    /// count-and-insert is atomic. Returns `None` when over budget.
    async fn apply_correction(
        &self,
        record: CorrectionRecord,
        scope_budget: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CorrectionRecord>>;

    /// Record a rejected proposal (audit trail for BLOCKED verdicts).
    async fn record_rejected(&self, record: CorrectionRecord) -> StoreResult<()>;

    async fn get_correction(&self, id: CorrectionId) -> StoreResult<Option<CorrectionRecord>>;

    async fn reverse_correction(
        &self,
        id: CorrectionId,
        at: DateTime<Utc>,
    ) -> StoreResult<CorrectionRecord>;

    /// Expire applied corrections past their `expires_at`.
    async fn expire_due_corrections(&self, now: DateTime<Utc>) -> StoreResult<Vec<CorrectionRecord>>;

    async fn active_in_scope(&self, scope_key: &str, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Currently applied corrections (audit sweep input).
    async fn applied_corrections(&self, now: DateTime<Utc>) -> StoreResult<Vec<CorrectionRecord>>;

    async fn record_outcome(&self, outcome: CausalOutcomeRecord) -> StoreResult<()>;

    /// Outcomes measured at or after `since` (rolling SafeMode window).
    async fn outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CausalOutcomeRecord>>;
}

/// Operator flags persisted across restarts (SafeMode, kill switch).
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn set_flag(&self, name: &str, enabled: bool, note: Option<String>) -> StoreResult<()>;

    async fn get_flag(&self, name: &str) -> StoreResult<Option<SystemFlagRecord>>;
}

/// The unified storage bundle the kernel wires once.
pub trait HustleStore:
    UserStore
    + TaskStore
    + EscrowStore
    + LedgerStore
    + OutboxStore
    + LockStore
    + CorrectionStore
    + FlagStore
    + Send
    + Sync
{
}

impl<T> HustleStore for T where
    T: UserStore
        + TaskStore
        + EscrowStore
        + LedgerStore
        + OutboxStore
        + LockStore
        + CorrectionStore
        + FlagStore
        + Send
        + Sync
{
}
