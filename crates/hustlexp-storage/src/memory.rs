//! In-memory reference adapter.
//!
//! Deterministic and test-friendly. One `RwLock` guards the whole state, so
//! every trait method is a single-writer atomic unit — the same observable
//! semantics the PostgreSQL adapter gets from serializable transactions.
//!
//! The constitutional invariants are enforced here in code with the same
//! stable `HXnnn` codes the database triggers raise. Ledger deletes are not
//! merely rejected: the trait surface cannot express them.

use crate::error::{StoreError, StoreResult};
use crate::model::{
    AdminAuditAppend, AdminAuditRecord, BadgeLedgerRecord, CausalOutcomeRecord, CompletionStats,
    CorrectionRecord, EscrowRecord, Lease, MoneyEventRecord, NewMoneyEvent, NewOutboxEvent,
    NewTrustDelta, NewXpAward, OutboxCounts, OutboxRecord, OutboxStatus, ProofRecord, QueryWindow,
    SystemFlagRecord, TaskRecord, TaskStateLogRecord, TaskTransitionRequest, TrustLedgerRecord,
    UserRecord, WriteOutcome, XpLedgerRecord,
};
use crate::traits::{
    CorrectionStore, EscrowStore, FlagStore, LedgerStore, LockStore, OutboxStore, TaskStore,
    UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hustlexp_types::{
    level_for_xp, Badge, CorrectionId, CorrectionStatus, EventId, InvariantCode, MoneyEventPhase,
    MoneyState, ProofId, ProofState, Queue, TaskId, TaskState, TaskTransition, TrustTier, UserId,
};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, UserRecord>,
    tasks: HashMap<TaskId, TaskRecord>,
    escrows: HashMap<TaskId, EscrowRecord>,
    proofs: HashMap<ProofId, ProofRecord>,
    task_state_log: Vec<TaskStateLogRecord>,
    xp_ledger: Vec<XpLedgerRecord>,
    trust_ledger: Vec<TrustLedgerRecord>,
    badge_ledger: Vec<BadgeLedgerRecord>,
    money_events: Vec<MoneyEventRecord>,
    admin_audit: Vec<AdminAuditRecord>,
    outbox: Vec<OutboxRecord>,
    leases: HashMap<String, Lease>,
    corrections: HashMap<CorrectionId, CorrectionRecord>,
    outcomes: Vec<CausalOutcomeRecord>,
    flags: HashMap<String, SystemFlagRecord>,
}

/// In-memory HustleXP storage adapter.
#[derive(Default)]
pub struct InMemoryHustleStore {
    state: RwLock<MemoryState>,
}

impl InMemoryHustleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn write_guard(
    state: &RwLock<MemoryState>,
) -> StoreResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
    state
        .write()
        .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
}

fn read_guard(
    state: &RwLock<MemoryState>,
) -> StoreResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
    state
        .read()
        .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

/// Shared with the state-log append inside transitions.
fn push_state_log(
    state: &mut MemoryState,
    task_id: TaskId,
    from_state: Option<TaskState>,
    to_state: TaskState,
    transition: TaskTransition,
    actor_id: Option<UserId>,
    reason: Option<String>,
    at: DateTime<Utc>,
) {
    let sequence = state.task_state_log.len() as u64 + 1;
    state.task_state_log.push(TaskStateLogRecord {
        sequence,
        task_id,
        from_state,
        to_state,
        transition,
        actor_id,
        reason,
        created_at: at,
    });
}

/// Insert outbox rows, short-circuiting on existing idempotency keys.
fn insert_outbox(state: &mut MemoryState, events: Vec<NewOutboxEvent>, now: DateTime<Utc>) {
    for event in events {
        let exists = state
            .outbox
            .iter()
            .any(|row| row.idempotency_key == event.idempotency_key);
        if exists {
            continue;
        }
        state.outbox.push(OutboxRecord {
            id: EventId::generate(),
            event_type: event.event_type,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_version: event.event_version,
            idempotency_key: event.idempotency_key,
            payload: event.payload,
            queue: event.queue,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        });
    }
}

fn accepted_proof_exists(state: &MemoryState, task_id: TaskId) -> bool {
    state
        .proofs
        .values()
        .any(|proof| proof.task_id == task_id && proof.state == ProofState::Accepted)
}

fn apply_transition(
    state: &mut MemoryState,
    request: TaskTransitionRequest,
    admin_path: bool,
) -> StoreResult<TaskRecord> {
    let now = Utc::now();
    let current = state
        .tasks
        .get(&request.task_id)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("task {} not found", request.task_id)))?;

    if current.state.is_terminal() && !admin_path {
        return Err(StoreError::invariant(
            InvariantCode::HX001,
            format!("task {} is terminal ({})", request.task_id, current.state),
        ));
    }

    if !request.expected_from.is_empty() && !request.expected_from.contains(&current.state) {
        return Err(StoreError::StateConflict(format!(
            "task {} is {}, expected one of {:?}",
            request.task_id, current.state, request.expected_from
        )));
    }

    if request.to == TaskState::Completed && !accepted_proof_exists(state, request.task_id) {
        return Err(StoreError::invariant(
            InvariantCode::HX301,
            format!("task {} has no accepted proof", request.task_id),
        ));
    }

    let task = state
        .tasks
        .get_mut(&request.task_id)
        .expect("task existence checked above");
    let from_state = task.state;
    task.state = request.to;
    if let Some(hustler) = request.set_hustler {
        task.hustler_id = Some(hustler);
    }
    task.updated_at = now;
    let updated = task.clone();

    push_state_log(
        state,
        request.task_id,
        Some(from_state),
        request.to,
        request.transition,
        request.actor_id,
        request.reason,
        now,
    );
    insert_outbox(state, request.outbox, now);
    Ok(updated)
}

fn append_admin_audit_row(
    state: &mut MemoryState,
    entry: AdminAuditAppend,
) -> StoreResult<AdminAuditRecord> {
    let previous_hash = state.admin_audit.last().map(|row| row.hash.clone());
    let sequence = state.admin_audit.len() as u64 + 1;
    let created_at = Utc::now();
    let hash = admin_audit_hash(&entry, previous_hash.as_deref(), sequence)?;
    let record = AdminAuditRecord {
        event_id: format!("audit-{}", Uuid::new_v4()),
        sequence,
        actor_id: entry.actor_id,
        action: entry.action,
        target_kind: entry.target_kind,
        target_id: entry.target_id,
        before: entry.before,
        after: entry.after,
        reason: entry.reason,
        previous_hash,
        hash,
        created_at,
    };
    state.admin_audit.push(record.clone());
    Ok(record)
}

pub(crate) fn admin_audit_hash(
    entry: &AdminAuditAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StoreResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "actor_id": entry.actor_id,
        "action": entry.action,
        "target_kind": entry.target_kind,
        "target_id": entry.target_id,
        "before": entry.before,
        "after": entry.after,
        "reason": entry.reason,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

#[async_trait]
impl UserStore for InMemoryHustleStore {
    async fn create_user(&self, user: UserRecord) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        if state.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!(
                "user {} already exists",
                user.id
            )));
        }
        state.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> StoreResult<Option<UserRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state.users.get(&user_id).cloned())
    }

    async fn archive_user(&self, user_id: UserId) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {} not found", user_id)))?;
        user.archived = true;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_activity(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {} not found", user_id)))?;
        user.last_active_at = Some(at);
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_trust_tier(&self, user_id: UserId, tier: TrustTier) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {} not found", user_id)))?;
        user.trust_tier = tier;
        user.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryHustleStore {
    async fn create_task(&self, task: TaskRecord) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        let now = Utc::now();
        state.escrows.insert(
            task.id,
            EscrowRecord {
                task_id: task.id,
                state: MoneyState::Open,
                amount_cents: None,
                refunded_cents: None,
                version: 1,
                payment_intent_id: None,
                charge_id: None,
                transfer_id: None,
                refund_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        push_state_log(
            &mut state,
            task.id,
            None,
            TaskState::Open,
            TaskTransition::Create,
            Some(task.poster_id),
            None,
            now,
        );
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn transition_task(&self, request: TaskTransitionRequest) -> StoreResult<TaskRecord> {
        let mut state = write_guard(&self.state)?;
        apply_transition(&mut state, request, false)
    }

    async fn admin_override_task(
        &self,
        request: TaskTransitionRequest,
        audit: AdminAuditAppend,
    ) -> StoreResult<TaskRecord> {
        let mut state = write_guard(&self.state)?;
        let task = apply_transition(&mut state, request, true)?;
        append_admin_audit_row(&mut state, audit)?;
        Ok(task)
    }

    async fn create_proof(
        &self,
        proof: ProofRecord,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        if state.proofs.contains_key(&proof.id) {
            return Err(StoreError::Conflict(format!(
                "proof {} already exists",
                proof.id
            )));
        }
        if !state.tasks.contains_key(&proof.task_id) {
            return Err(StoreError::NotFound(format!(
                "task {} not found",
                proof.task_id
            )));
        }
        let now = Utc::now();
        state.proofs.insert(proof.id, proof);
        insert_outbox(&mut state, outbox, now);
        Ok(())
    }

    async fn get_proof(&self, proof_id: ProofId) -> StoreResult<Option<ProofRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state.proofs.get(&proof_id).cloned())
    }

    async fn latest_proof_for_task(&self, task_id: TaskId) -> StoreResult<Option<ProofRecord>> {
        let state = read_guard(&self.state)?;
        let mut proofs: Vec<_> = state
            .proofs
            .values()
            .filter(|proof| proof.task_id == task_id)
            .cloned()
            .collect();
        proofs.sort_by_key(|proof| proof.created_at);
        Ok(proofs.pop())
    }

    async fn set_proof_state(&self, proof_id: ProofId, new_state: ProofState) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        let proof = state
            .proofs
            .get_mut(&proof_id)
            .ok_or_else(|| StoreError::NotFound(format!("proof {} not found", proof_id)))?;
        proof.state = new_state;
        proof.updated_at = Utc::now();
        Ok(())
    }

    async fn proofs_past_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<ProofRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .proofs
            .values()
            .filter(|proof| proof.state == ProofState::Submitted && proof.deadline_at <= now)
            .cloned()
            .collect())
    }

    async fn open_tasks_expired_before(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .tasks
            .values()
            .filter(|task| {
                task.state == TaskState::Open
                    && task.expires_at.is_some_and(|expires| expires <= now)
            })
            .cloned()
            .collect())
    }

    async fn state_log_for_task(&self, task_id: TaskId) -> StoreResult<Vec<TaskStateLogRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .task_state_log
            .iter()
            .filter(|row| row.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn completion_stats(&self, user_id: UserId) -> StoreResult<CompletionStats> {
        let state = read_guard(&self.state)?;
        let mut stats = CompletionStats::default();
        for task in state.tasks.values() {
            if task.hustler_id != Some(user_id) {
                continue;
            }
            match task.state {
                TaskState::Completed => stats.completed += 1,
                TaskState::Cancelled => {
                    // A cancellation after a dispute counts against the
                    // hustler; plain cancels do not.
                    let disputed = state.task_state_log.iter().any(|row| {
                        row.task_id == task.id && row.to_state == TaskState::Disputed
                    });
                    if disputed {
                        stats.disputes_lost += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl EscrowStore for InMemoryHustleStore {
    async fn get_escrow(&self, task_id: TaskId) -> StoreResult<Option<EscrowRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state.escrows.get(&task_id).cloned())
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
        let mut state = write_guard(&self.state)?;
        let escrow = state
            .escrows
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("escrow {} not found", task_id)))?;

        if escrow.state.is_terminal() {
            return Err(StoreError::invariant(
                InvariantCode::HX002,
                format!("money state for {} is terminal ({})", task_id, escrow.state),
            ));
        }
        if escrow.state != MoneyState::Open {
            return Err(StoreError::StateConflict(format!(
                "escrow {} is {}, expected OPEN",
                task_id, escrow.state
            )));
        }
        if escrow.amount_cents.is_some() {
            return Err(StoreError::invariant(
                InvariantCode::HX004,
                format!("amount for {} is already set", task_id),
            ));
        }

        escrow.state = MoneyState::Held;
        escrow.amount_cents = Some(amount_cents);
        escrow.payment_intent_id = Some(payment_intent_id);
        escrow.charge_id = Some(charge_id);
        escrow.updated_at = Utc::now();
        let updated = escrow.clone();
        let now = updated.updated_at;
        insert_outbox(&mut state, outbox, now);
        Ok(updated)
    }

    async fn release_escrow(
        &self,
        task_id: TaskId,
        expected_from: MoneyState,
        transfer_id: String,
        outbox: Vec<NewOutboxEvent>,
    ) -> StoreResult<EscrowRecord> {
        let mut state = write_guard(&self.state)?;

        let task_state = state
            .tasks
            .get(&task_id)
            .map(|task| task.state)
            .ok_or_else(|| StoreError::NotFound(format!("task {} not found", task_id)))?;

        let escrow = state
            .escrows
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("escrow {} not found", task_id)))?;

        if escrow.state.is_terminal() {
            return Err(StoreError::invariant(
                InvariantCode::HX002,
                format!("money state for {} is terminal ({})", task_id, escrow.state),
            ));
        }
        if escrow.state != expected_from {
            return Err(StoreError::StateConflict(format!(
                "escrow {} is {}, expected {}",
                task_id, escrow.state, expected_from
            )));
        }
        if task_state != TaskState::Completed {
            return Err(StoreError::invariant(
                InvariantCode::HX201,
                format!("task {} is {}, release requires COMPLETED", task_id, task_state),
            ));
        }

        escrow.state = MoneyState::Released;
        escrow.transfer_id = Some(transfer_id);
        escrow.updated_at = Utc::now();
        let updated = escrow.clone();
        let now = updated.updated_at;
        insert_outbox(&mut state, outbox, now);
        Ok(updated)
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
        let mut state = write_guard(&self.state)?;
        let escrow = state
            .escrows
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("escrow {} not found", task_id)))?;

        if escrow.state.is_terminal() {
            return Err(StoreError::invariant(
                InvariantCode::HX002,
                format!("money state for {} is terminal ({})", task_id, escrow.state),
            ));
        }
        if escrow.state != expected_from {
            return Err(StoreError::StateConflict(format!(
                "escrow {} is {}, expected {}",
                task_id, escrow.state, expected_from
            )));
        }
        let held = escrow.amount_cents.ok_or_else(|| {
            StoreError::StateConflict(format!("escrow {} was never funded", task_id))
        })?;
        if refunded_cents <= 0 || refunded_cents > held {
            return Err(StoreError::InvalidInput(format!(
                "refund of {} cents out of range for held {}",
                refunded_cents, held
            )));
        }

        escrow.state = if full {
            MoneyState::Refunded
        } else {
            MoneyState::RefundPartial
        };
        escrow.refund_id = Some(refund_id);
        escrow.refunded_cents = Some(refunded_cents);
        escrow.updated_at = Utc::now();
        let updated = escrow.clone();
        let now = updated.updated_at;
        insert_outbox(&mut state, outbox, now);
        Ok(updated)
    }

    async fn lock_escrow_for_dispute(&self, task_id: TaskId) -> StoreResult<EscrowRecord> {
        let mut state = write_guard(&self.state)?;
        let escrow = state
            .escrows
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("escrow {} not found", task_id)))?;

        if escrow.state.is_terminal() {
            return Err(StoreError::invariant(
                InvariantCode::HX002,
                format!("money state for {} is terminal ({})", task_id, escrow.state),
            ));
        }
        if escrow.state != MoneyState::Held {
            return Err(StoreError::StateConflict(format!(
                "escrow {} is {}, expected HELD",
                task_id, escrow.state
            )));
        }
        escrow.state = MoneyState::LockedDispute;
        escrow.updated_at = Utc::now();
        Ok(escrow.clone())
    }

    async fn escrows_in_state_older_than(
        &self,
        money_state: MoneyState,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<EscrowRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .escrows
            .values()
            .filter(|escrow| escrow.state == money_state && escrow.updated_at <= older_than)
            .cloned()
            .collect())
    }

    async fn released_escrows(&self, window: QueryWindow) -> StoreResult<Vec<EscrowRecord>> {
        let state = read_guard(&self.state)?;
        let mut rows: Vec<_> = state
            .escrows
            .values()
            .filter(|escrow| escrow.state == MoneyState::Released)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.updated_at);
        Ok(apply_window(rows, window))
    }
}

#[async_trait]
impl LedgerStore for InMemoryHustleStore {
    async fn award_xp(&self, award: NewXpAward) -> StoreResult<WriteOutcome<XpLedgerRecord>> {
        let mut state = write_guard(&self.state)?;

        if let Some(lock_task) = award.money_state_lock_task_id {
            let escrow = state.escrows.get(&lock_task).ok_or_else(|| {
                StoreError::NotFound(format!("escrow {} not found", lock_task))
            })?;
            if escrow.state != MoneyState::Released {
                return Err(StoreError::invariant(
                    InvariantCode::HX101,
                    format!(
                        "xp for {} requires RELEASED money state, found {}",
                        lock_task, escrow.state
                    ),
                ));
            }
            if let Some(existing) = state
                .xp_ledger
                .iter()
                .find(|row| row.money_state_lock_task_id == Some(lock_task))
            {
                return Ok(WriteOutcome::Duplicate(existing.clone()));
            }
        }

        let record = XpLedgerRecord {
            entry_id: format!("xp-{}", Uuid::new_v4()),
            user_id: award.user_id,
            task_id: award.task_id,
            money_state_lock_task_id: award.money_state_lock_task_id,
            base_xp: award.base_xp,
            decay_factor: award.decay_factor,
            effective_xp: award.effective_xp,
            streak_multiplier: award.streak_multiplier,
            final_xp: award.final_xp,
            reason: award.reason,
            created_at: Utc::now(),
        };
        state.xp_ledger.push(record.clone());

        let user = state
            .users
            .get_mut(&award.user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {} not found", award.user_id)))?;
        user.xp_total += award.final_xp;
        user.level = level_for_xp(user.xp_total);
        user.streak_days = award.streak_days_after;
        user.last_active_at = Some(award.activity_at);
        user.updated_at = Utc::now();

        Ok(WriteOutcome::Inserted(record))
    }

    async fn xp_for_release(&self, task_id: TaskId) -> StoreResult<Option<XpLedgerRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .xp_ledger
            .iter()
            .find(|row| row.money_state_lock_task_id == Some(task_id))
            .cloned())
    }

    async fn xp_for_user(&self, user_id: UserId) -> StoreResult<Vec<XpLedgerRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .xp_ledger
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn append_trust(
        &self,
        delta: NewTrustDelta,
    ) -> StoreResult<WriteOutcome<TrustLedgerRecord>> {
        let mut state = write_guard(&self.state)?;
        if let Some(existing) = state
            .trust_ledger
            .iter()
            .find(|row| row.idempotency_key == delta.idempotency_key)
        {
            return Ok(WriteOutcome::Duplicate(existing.clone()));
        }
        let record = TrustLedgerRecord {
            entry_id: format!("trust-{}", Uuid::new_v4()),
            user_id: delta.user_id,
            delta: delta.delta,
            tier_before: delta.tier_before,
            tier_after: delta.tier_after,
            reason: delta.reason,
            idempotency_key: delta.idempotency_key,
            created_at: Utc::now(),
        };
        state.trust_ledger.push(record.clone());

        let user = state
            .users
            .get_mut(&delta.user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {} not found", delta.user_id)))?;
        user.trust_tier = delta.tier_after;
        user.updated_at = Utc::now();

        Ok(WriteOutcome::Inserted(record))
    }

    async fn trust_for_user(&self, user_id: UserId) -> StoreResult<Vec<TrustLedgerRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .trust_ledger
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn grant_badge(
        &self,
        user_id: UserId,
        badge: Badge,
    ) -> StoreResult<WriteOutcome<BadgeLedgerRecord>> {
        let mut state = write_guard(&self.state)?;
        if let Some(existing) = state
            .badge_ledger
            .iter()
            .find(|row| row.user_id == user_id && row.badge == badge)
        {
            return Ok(WriteOutcome::Duplicate(existing.clone()));
        }
        let record = BadgeLedgerRecord {
            entry_id: format!("badge-{}", Uuid::new_v4()),
            user_id,
            badge,
            created_at: Utc::now(),
        };
        state.badge_ledger.push(record.clone());
        Ok(WriteOutcome::Inserted(record))
    }

    async fn badges_for_user(&self, user_id: UserId) -> StoreResult<Vec<BadgeLedgerRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .badge_ledger
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn append_money_event(
        &self,
        event: NewMoneyEvent,
    ) -> StoreResult<WriteOutcome<MoneyEventRecord>> {
        let mut state = write_guard(&self.state)?;
        if let Some(existing) = state
            .money_events
            .iter()
            .find(|row| row.idempotency_key == event.idempotency_key && row.phase == event.phase)
        {
            return Ok(WriteOutcome::Duplicate(existing.clone()));
        }
        let record = MoneyEventRecord {
            event_id: format!("mev-{}", Uuid::new_v4()),
            task_id: event.task_id,
            op: event.op,
            phase: event.phase,
            idempotency_key: event.idempotency_key,
            provider_ref: event.provider_ref,
            detail: event.detail,
            created_at: Utc::now(),
        };
        state.money_events.push(record.clone());
        Ok(WriteOutcome::Inserted(record))
    }

    async fn money_events_for_task(&self, task_id: TaskId) -> StoreResult<Vec<MoneyEventRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .money_events
            .iter()
            .filter(|row| row.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn money_event_by_key(
        &self,
        idempotency_key: &str,
    ) -> StoreResult<Vec<MoneyEventRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .money_events
            .iter()
            .filter(|row| row.idempotency_key == idempotency_key)
            .cloned()
            .collect())
    }

    async fn initiated_without_outcome(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<MoneyEventRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .money_events
            .iter()
            .filter(|row| {
                row.phase == MoneyEventPhase::Initiated
                    && row.created_at <= older_than
                    && !state.money_events.iter().any(|other| {
                        other.idempotency_key == row.idempotency_key
                            && other.phase != MoneyEventPhase::Initiated
                    })
            })
            .cloned()
            .collect())
    }

    async fn append_admin_audit(&self, entry: AdminAuditAppend) -> StoreResult<AdminAuditRecord> {
        let mut state = write_guard(&self.state)?;
        append_admin_audit_row(&mut state, entry)
    }

    async fn admin_audit(&self, window: QueryWindow) -> StoreResult<Vec<AdminAuditRecord>> {
        let state = read_guard(&self.state)?;
        let mut rows = state.admin_audit.clone();
        rows.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(apply_window(rows, window))
    }
}

#[async_trait]
impl OutboxStore for InMemoryHustleStore {
    async fn enqueue(&self, events: Vec<NewOutboxEvent>) -> StoreResult<Vec<OutboxRecord>> {
        let mut state = write_guard(&self.state)?;
        let now = Utc::now();
        let keys: Vec<String> = events.iter().map(|e| e.idempotency_key.clone()).collect();
        insert_outbox(&mut state, events, now);
        Ok(state
            .outbox
            .iter()
            .filter(|row| keys.contains(&row.idempotency_key))
            .cloned()
            .collect())
    }

    async fn claim_batch(
        &self,
        queue: Queue,
        now: DateTime<Utc>,
        limit: usize,
        lease_ttl: Duration,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let mut state = write_guard(&self.state)?;
        let mut due: Vec<usize> = state
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.queue == queue
                    && row.status == OutboxStatus::Pending
                    && row.next_attempt_at <= now
            })
            .map(|(index, _)| index)
            .collect();
        due.sort_by_key(|&index| state.outbox[index].next_attempt_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for index in due {
            let row = &mut state.outbox[index];
            row.status = OutboxStatus::InFlight;
            row.lease_expires_at = Some(now + lease_ttl);
            row.updated_at = now;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, event_id: EventId) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        let row = state
            .outbox
            .iter_mut()
            .find(|row| row.id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {} not found", event_id)))?;
        row.status = OutboxStatus::Completed;
        row.lease_expires_at = None;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: EventId,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> StoreResult<OutboxStatus> {
        let mut state = write_guard(&self.state)?;
        let row = state
            .outbox
            .iter_mut()
            .find(|row| row.id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {} not found", event_id)))?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        row.lease_expires_at = None;
        row.updated_at = Utc::now();
        match next_attempt_at {
            Some(at) => {
                row.status = OutboxStatus::Pending;
                row.next_attempt_at = at;
            }
            None => {
                row.status = OutboxStatus::Dead;
            }
        }
        Ok(row.status)
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = write_guard(&self.state)?;
        let mut reclaimed = 0;
        for row in state.outbox.iter_mut() {
            if row.status == OutboxStatus::InFlight
                && row.lease_expires_at.is_some_and(|lease| lease <= now)
            {
                row.status = OutboxStatus::Pending;
                row.lease_expires_at = None;
                row.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn dead_letters(&self, window: QueryWindow) -> StoreResult<Vec<OutboxRecord>> {
        let state = read_guard(&self.state)?;
        let mut rows: Vec<_> = state
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Dead)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.updated_at);
        Ok(apply_window(rows, window))
    }

    async fn replay_dead_letter(&self, event_id: EventId) -> StoreResult<OutboxRecord> {
        let mut state = write_guard(&self.state)?;
        let now = Utc::now();
        let row = state
            .outbox
            .iter_mut()
            .find(|row| row.id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {} not found", event_id)))?;
        if row.status != OutboxStatus::Dead {
            return Err(StoreError::StateConflict(format!(
                "outbox event {} is not dead",
                event_id
            )));
        }
        row.status = OutboxStatus::Pending;
        row.attempts = 0;
        row.next_attempt_at = now;
        row.last_error = None;
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn counts(&self) -> StoreResult<OutboxCounts> {
        let state = read_guard(&self.state)?;
        let mut counts = OutboxCounts::default();
        for row in state.outbox.iter() {
            match row.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::InFlight => counts.in_flight += 1,
                OutboxStatus::Completed => counts.completed += 1,
                OutboxStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl LockStore for InMemoryHustleStore {
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Lease>> {
        let mut state = write_guard(&self.state)?;
        if let Some(existing) = state.leases.get(key) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let lease = Lease {
            key: key.to_string(),
            lease_id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        state.leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, key: &str, lease_id: &str) -> StoreResult<bool> {
        let mut state = write_guard(&self.state)?;
        match state.leases.get(key) {
            Some(lease) if lease.lease_id == lease_id => {
                state.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CorrectionStore for InMemoryHustleStore {
    async fn apply_correction(
        &self,
        record: CorrectionRecord,
        scope_budget: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<CorrectionRecord>> {
        let mut state = write_guard(&self.state)?;
        let active = state
            .corrections
            .values()
            .filter(|row| {
                row.scope_key == record.scope_key
                    && row.status == CorrectionStatus::Applied
                    && row.expires_at > now
            })
            .count();
        if active >= scope_budget {
            return Ok(None);
        }
        state.corrections.insert(record.id, record.clone());
        Ok(Some(record))
    }

    async fn record_rejected(&self, record: CorrectionRecord) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        state.corrections.insert(record.id, record);
        Ok(())
    }

    async fn get_correction(&self, id: CorrectionId) -> StoreResult<Option<CorrectionRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state.corrections.get(&id).cloned())
    }

    async fn reverse_correction(
        &self,
        id: CorrectionId,
        at: DateTime<Utc>,
    ) -> StoreResult<CorrectionRecord> {
        let mut state = write_guard(&self.state)?;
        let record = state
            .corrections
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("correction {} not found", id)))?;
        if record.status != CorrectionStatus::Applied {
            return Err(StoreError::StateConflict(format!(
                "correction {} is {:?}, only applied corrections reverse",
                id, record.status
            )));
        }
        record.status = CorrectionStatus::Reversed;
        record.reversed_at = Some(at);
        Ok(record.clone())
    }

    async fn expire_due_corrections(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CorrectionRecord>> {
        let mut state = write_guard(&self.state)?;
        let mut expired = Vec::new();
        for record in state.corrections.values_mut() {
            if record.status == CorrectionStatus::Applied && record.expires_at <= now {
                record.status = CorrectionStatus::Expired;
                expired.push(record.clone());
            }
        }
        Ok(expired)
    }

    async fn active_in_scope(&self, scope_key: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let state = read_guard(&self.state)?;
        Ok(state
            .corrections
            .values()
            .filter(|row| {
                row.scope_key == scope_key
                    && row.status == CorrectionStatus::Applied
                    && row.expires_at > now
            })
            .count() as u64)
    }

    async fn applied_corrections(&self, now: DateTime<Utc>) -> StoreResult<Vec<CorrectionRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .corrections
            .values()
            .filter(|row| row.status == CorrectionStatus::Applied && row.expires_at > now)
            .cloned()
            .collect())
    }

    async fn record_outcome(&self, outcome: CausalOutcomeRecord) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        state.outcomes.push(outcome);
        Ok(())
    }

    async fn outcomes_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<CausalOutcomeRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state
            .outcomes
            .iter()
            .filter(|row| row.measured_at >= since)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FlagStore for InMemoryHustleStore {
    async fn set_flag(&self, name: &str, enabled: bool, note: Option<String>) -> StoreResult<()> {
        let mut state = write_guard(&self.state)?;
        state.flags.insert(
            name.to_string(),
            SystemFlagRecord {
                name: name.to_string(),
                enabled,
                note,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_flag(&self, name: &str) -> StoreResult<Option<SystemFlagRecord>> {
        let state = read_guard(&self.state)?;
        Ok(state.flags.get(name).cloned())
    }
}
