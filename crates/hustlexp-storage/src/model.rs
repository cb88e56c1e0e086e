//! Persistent row models.
//!
//! These are the shapes stored by both adapters. Domain enums come from
//! `hustlexp-types`; everything here serializes cleanly so the Postgres
//! adapter can keep payload-ish columns as JSONB.

use chrono::{DateTime, Utc};
use hustlexp_types::{
    Badge, CorrectionId, CorrectionStatus, CorrectionType, EventId, EventPayload, MoneyEventPhase,
    MoneyOp, MoneyState, ProofId, ProofState, Queue, Role, TaskId, TaskState, TaskTransition,
    TrustTier, UserId, Verdict,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A user row with derived columns. The ledgers are the source of truth for
/// XP and trust; the row caches them for reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub role: Role,
    pub trust_tier: TrustTier,
    pub xp_total: i64,
    pub level: u32,
    pub streak_days: u32,
    pub last_active_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub poster_id: UserId,
    pub hustler_id: Option<UserId>,
    pub category: String,
    pub price_cents: i64,
    pub state: TaskState,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The escrow / money-state-lock row. One per task; holds every
/// provider-side identifier the system knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub task_id: TaskId,
    pub state: MoneyState,
    /// Set exactly once at HELD (HX004).
    pub amount_cents: Option<i64>,
    pub refunded_cents: Option<i64>,
    /// Version folded into provider idempotency keys.
    pub version: u32,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofRecord {
    pub id: ProofId,
    pub task_id: TaskId,
    pub submitter_id: UserId,
    /// Object-storage keys only; artifacts never stream through the core.
    pub artifact_keys: Vec<String>,
    pub state: ProofState,
    pub deadline_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row per committed task-state change (property: no silent loss).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateLogRecord {
    pub sequence: u64,
    pub task_id: TaskId,
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub transition: TaskTransition,
    pub actor_id: Option<UserId>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An atomic task transition request: compare-and-set on the current state,
/// state-log append, optional field updates and outbox emission, all in one
/// transaction.
#[derive(Debug, Clone)]
pub struct TaskTransitionRequest {
    pub task_id: TaskId,
    /// Legal source states; empty means any non-terminal state.
    pub expected_from: Vec<TaskState>,
    pub to: TaskState,
    pub transition: TaskTransition,
    pub actor_id: Option<UserId>,
    pub reason: Option<String>,
    /// Set the hustler on claim.
    pub set_hustler: Option<UserId>,
    pub outbox: Vec<NewOutboxEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpLedgerRecord {
    pub entry_id: String,
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    /// UNIQUE when present: at most one XP award per released escrow.
    pub money_state_lock_task_id: Option<TaskId>,
    pub base_xp: i64,
    pub decay_factor: Decimal,
    pub effective_xp: i64,
    pub streak_multiplier: Decimal,
    pub final_xp: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for an XP award; the store assigns the entry id and
/// updates the user's derived columns in the same transaction.
#[derive(Debug, Clone)]
pub struct NewXpAward {
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub money_state_lock_task_id: Option<TaskId>,
    pub base_xp: i64,
    pub decay_factor: Decimal,
    pub effective_xp: i64,
    pub streak_multiplier: Decimal,
    pub final_xp: i64,
    pub reason: String,
    /// Activity timestamp driving streak maintenance.
    pub activity_at: DateTime<Utc>,
    pub streak_days_after: u32,
}

/// Idempotent-write outcome shared by the ledger writers.
#[derive(Debug, Clone)]
pub enum WriteOutcome<T> {
    Inserted(T),
    /// The idempotency key already existed; the prior row is returned.
    Duplicate(T),
}

impl<T> WriteOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            WriteOutcome::Inserted(value) | WriteOutcome::Duplicate(value) => value,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, WriteOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustLedgerRecord {
    pub entry_id: String,
    pub user_id: UserId,
    pub delta: i32,
    pub tier_before: TrustTier,
    pub tier_after: TrustTier,
    pub reason: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrustDelta {
    pub user_id: UserId,
    pub delta: i32,
    pub tier_before: TrustTier,
    pub tier_after: TrustTier,
    pub reason: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeLedgerRecord {
    pub entry_id: String,
    pub user_id: UserId,
    pub badge: Badge,
    pub created_at: DateTime<Utc>,
}

/// One row per provider interaction, keyed by the shared idempotency key.
/// Append-only: reconciliation appends `confirmed`/`failed` rows, never
/// updates the `initiated` one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneyEventRecord {
    pub event_id: String,
    pub task_id: TaskId,
    pub op: MoneyOp,
    pub phase: MoneyEventPhase,
    pub idempotency_key: String,
    pub provider_ref: Option<String>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMoneyEvent {
    pub task_id: TaskId,
    pub op: MoneyOp,
    pub phase: MoneyEventPhase,
    pub idempotency_key: String,
    pub provider_ref: Option<String>,
    pub detail: Value,
}

/// Admin audit append payload. Sequencing and hash-chaining are assigned by
/// the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAuditAppend {
    pub actor_id: UserId,
    pub action: String,
    pub target_kind: String,
    pub target_id: String,
    pub before: Value,
    pub after: Value,
    pub reason: String,
}

/// Tamper-evident admin audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminAuditRecord {
    pub event_id: String,
    pub sequence: u64,
    pub actor_id: UserId,
    pub action: String,
    pub target_kind: String,
    pub target_id: String,
    pub before: Value,
    pub after: Value,
    pub reason: String,
    pub previous_hash: Option<String>,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Completed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OutboxStatus::Pending),
            "in_flight" => Some(OutboxStatus::InFlight),
            "completed" => Some(OutboxStatus::Completed),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_version: u16,
    pub idempotency_key: String,
    pub payload: Value,
    pub queue: Queue,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Decode the payload back into the typed event.
    pub fn decode(&self) -> Result<EventPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A new outbox row, created inside the domain transaction that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_version: u16,
    pub idempotency_key: String,
    pub payload: Value,
    pub queue: Queue,
}

impl NewOutboxEvent {
    /// Fan a typed payload out into one row per destination queue.
    pub fn fan_out(payload: &EventPayload) -> Vec<Self> {
        let aggregate_type = if payload.event_type().starts_with("escrow.") {
            "escrow"
        } else if payload.event_type().starts_with("proof.") {
            "proof"
        } else {
            "task"
        };
        let value = serde_json::to_value(payload)
            .expect("event payloads are closed shapes and always serialize");
        payload
            .queues()
            .iter()
            .map(|queue| Self {
                event_type: payload.event_type().to_string(),
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: payload.task_id().to_string(),
                event_version: payload.version(),
                idempotency_key: payload.idempotency_key(*queue),
                payload: value.clone(),
                queue: *queue,
            })
            .collect()
    }
}

/// Outbox queue depth summary used by the unpause safety check.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub dead: u64,
}

/// A held advisory-lock lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub lease_id: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub id: CorrectionId,
    pub correction_type: CorrectionType,
    pub target_entity: String,
    pub target_id: String,
    pub scope_key: String,
    pub adjustment: String,
    pub magnitude: Decimal,
    pub reason_code: String,
    pub status: CorrectionStatus,
    pub expires_at: DateTime<Utc>,
    pub applied_by: String,
    pub reversed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Named metric values used by outcome measurement.
pub type MetricSet = BTreeMap<String, Decimal>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalOutcomeRecord {
    pub correction_id: CorrectionId,
    pub treated_baseline: MetricSet,
    pub treated_post: MetricSet,
    pub control_baseline: MetricSet,
    pub control_post: MetricSet,
    pub net_lift: MetricSet,
    pub verdict: Verdict,
    pub confidence: Decimal,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemFlagRecord {
    pub name: String,
    pub enabled: bool,
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Completion/dispute tallies used by trust evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompletionStats {
    pub completed: u64,
    pub disputes_lost: u64,
}

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}
