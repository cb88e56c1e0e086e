//! Row-to-record converters.

use crate::error::{StoreError, StoreResult};
use crate::model::{
    AdminAuditRecord, BadgeLedgerRecord, CausalOutcomeRecord, CorrectionRecord, EscrowRecord,
    Lease, MetricSet, MoneyEventRecord, OutboxRecord, OutboxStatus, ProofRecord,
    SystemFlagRecord, TaskRecord, TaskStateLogRecord, TrustLedgerRecord, UserRecord,
    XpLedgerRecord,
};
use hustlexp_types::{
    Badge, CorrectionId, CorrectionStatus, CorrectionType, EventId, MoneyEventPhase, MoneyOp,
    MoneyState, ProofId, ProofState, Queue, Role, TaskId, TaskState, TaskTransition, TrustTier,
    UserId, Verdict,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::Row;

pub(crate) fn col<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Backend(format!("column {name}: {e}")))
}

fn parse_with<T>(raw: &str, parse: impl Fn(&str) -> Option<T>, what: &str) -> StoreResult<T> {
    parse(raw).ok_or_else(|| StoreError::Serialization(format!("unknown {what} `{raw}`")))
}

pub(crate) fn task_id(raw: &str) -> StoreResult<TaskId> {
    TaskId::parse(raw).ok_or_else(|| StoreError::Serialization(format!("bad task id `{raw}`")))
}

pub(crate) fn user_id(raw: &str) -> StoreResult<UserId> {
    UserId::parse(raw).ok_or_else(|| StoreError::Serialization(format!("bad user id `{raw}`")))
}

pub(crate) fn user_row(row: PgRow) -> StoreResult<UserRecord> {
    let role: String = col(&row, "role")?;
    let tier: i16 = col(&row, "trust_tier")?;
    Ok(UserRecord {
        id: user_id(&col::<String>(&row, "id")?)?,
        role: parse_with(&role, Role::parse, "role")?,
        trust_tier: TrustTier::new(tier.max(0) as u8),
        xp_total: col(&row, "xp_total")?,
        level: col::<i32>(&row, "level")? as u32,
        streak_days: col::<i32>(&row, "streak_days")? as u32,
        last_active_at: col(&row, "last_active_at")?,
        archived: col(&row, "archived")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

pub(crate) fn task_row(row: PgRow) -> StoreResult<TaskRecord> {
    let state: String = col(&row, "state")?;
    let hustler: Option<String> = col(&row, "hustler_id")?;
    Ok(TaskRecord {
        id: task_id(&col::<String>(&row, "id")?)?,
        poster_id: user_id(&col::<String>(&row, "poster_id")?)?,
        hustler_id: hustler.as_deref().map(user_id).transpose()?,
        category: col(&row, "category")?,
        price_cents: col(&row, "price_cents")?,
        state: parse_with(&state, TaskState::parse, "task state")?,
        expires_at: col(&row, "expires_at")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

pub(crate) fn escrow_row(row: PgRow) -> StoreResult<EscrowRecord> {
    let state: String = col(&row, "state")?;
    Ok(EscrowRecord {
        task_id: task_id(&col::<String>(&row, "task_id")?)?,
        state: parse_with(&state, MoneyState::parse, "money state")?,
        amount_cents: col(&row, "amount_cents")?,
        refunded_cents: col(&row, "refunded_cents")?,
        version: col::<i32>(&row, "version")? as u32,
        payment_intent_id: col(&row, "payment_intent_id")?,
        charge_id: col(&row, "charge_id")?,
        transfer_id: col(&row, "transfer_id")?,
        refund_id: col(&row, "refund_id")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

pub(crate) fn proof_row(row: PgRow) -> StoreResult<ProofRecord> {
    let state: String = col(&row, "state")?;
    let artifacts: serde_json::Value = col(&row, "artifact_keys")?;
    Ok(ProofRecord {
        id: ProofId::parse(&col::<String>(&row, "id")?)
            .ok_or_else(|| StoreError::Serialization("bad proof id".to_string()))?,
        task_id: task_id(&col::<String>(&row, "task_id")?)?,
        submitter_id: user_id(&col::<String>(&row, "submitter_id")?)?,
        artifact_keys: serde_json::from_value(artifacts)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        state: parse_with(&state, ProofState::parse, "proof state")?,
        deadline_at: col(&row, "deadline_at")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

pub(crate) fn state_log_row(row: PgRow) -> StoreResult<TaskStateLogRecord> {
    let from_state: Option<String> = col(&row, "from_state")?;
    let to_state: String = col(&row, "to_state")?;
    let transition: String = col(&row, "transition")?;
    let actor: Option<String> = col(&row, "actor_id")?;
    Ok(TaskStateLogRecord {
        sequence: col::<i64>(&row, "sequence")? as u64,
        task_id: task_id(&col::<String>(&row, "task_id")?)?,
        from_state: from_state
            .as_deref()
            .map(|raw| parse_with(raw, TaskState::parse, "task state"))
            .transpose()?,
        to_state: parse_with(&to_state, TaskState::parse, "task state")?,
        transition: parse_with(&transition, TaskTransition::parse, "transition")?,
        actor_id: actor.as_deref().map(user_id).transpose()?,
        reason: col(&row, "reason")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn xp_row(row: PgRow) -> StoreResult<XpLedgerRecord> {
    let task: Option<String> = col(&row, "task_id")?;
    let lock_task: Option<String> = col(&row, "money_state_lock_task_id")?;
    Ok(XpLedgerRecord {
        entry_id: col(&row, "entry_id")?,
        user_id: user_id(&col::<String>(&row, "user_id")?)?,
        task_id: task.as_deref().map(task_id).transpose()?,
        money_state_lock_task_id: lock_task.as_deref().map(task_id).transpose()?,
        base_xp: col(&row, "base_xp")?,
        decay_factor: col::<Decimal>(&row, "decay_factor")?,
        effective_xp: col(&row, "effective_xp")?,
        streak_multiplier: col::<Decimal>(&row, "streak_multiplier")?,
        final_xp: col(&row, "final_xp")?,
        reason: col(&row, "reason")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn trust_row(row: PgRow) -> StoreResult<TrustLedgerRecord> {
    Ok(TrustLedgerRecord {
        entry_id: col(&row, "entry_id")?,
        user_id: user_id(&col::<String>(&row, "user_id")?)?,
        delta: col(&row, "delta")?,
        tier_before: TrustTier::new(col::<i16>(&row, "tier_before")?.max(0) as u8),
        tier_after: TrustTier::new(col::<i16>(&row, "tier_after")?.max(0) as u8),
        reason: col(&row, "reason")?,
        idempotency_key: col(&row, "idempotency_key")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn badge_row(row: PgRow) -> StoreResult<BadgeLedgerRecord> {
    let badge: String = col(&row, "badge")?;
    Ok(BadgeLedgerRecord {
        entry_id: col(&row, "entry_id")?,
        user_id: user_id(&col::<String>(&row, "user_id")?)?,
        badge: parse_with(&badge, Badge::parse, "badge")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn money_event_row(row: PgRow) -> StoreResult<MoneyEventRecord> {
    let op: String = col(&row, "op")?;
    let phase: String = col(&row, "phase")?;
    Ok(MoneyEventRecord {
        event_id: col(&row, "event_id")?,
        task_id: task_id(&col::<String>(&row, "task_id")?)?,
        op: parse_with(&op, MoneyOp::parse, "money op")?,
        phase: parse_with(&phase, MoneyEventPhase::parse, "money phase")?,
        idempotency_key: col(&row, "idempotency_key")?,
        provider_ref: col(&row, "provider_ref")?,
        detail: col(&row, "detail")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn admin_audit_row(row: PgRow) -> StoreResult<AdminAuditRecord> {
    Ok(AdminAuditRecord {
        event_id: col(&row, "event_id")?,
        sequence: col::<i64>(&row, "sequence")? as u64,
        actor_id: user_id(&col::<String>(&row, "actor_id")?)?,
        action: col(&row, "action")?,
        target_kind: col(&row, "target_kind")?,
        target_id: col(&row, "target_id")?,
        before: col(&row, "before")?,
        after: col(&row, "after")?,
        reason: col(&row, "reason")?,
        previous_hash: col(&row, "previous_hash")?,
        hash: col(&row, "hash")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn outbox_row(row: PgRow) -> StoreResult<OutboxRecord> {
    let status: String = col(&row, "status")?;
    let queue: String = col(&row, "queue_name")?;
    Ok(OutboxRecord {
        id: EventId::parse(&col::<String>(&row, "id")?)
            .ok_or_else(|| StoreError::Serialization("bad outbox event id".to_string()))?,
        event_type: col(&row, "event_type")?,
        aggregate_type: col(&row, "aggregate_type")?,
        aggregate_id: col(&row, "aggregate_id")?,
        event_version: col::<i32>(&row, "event_version")? as u16,
        idempotency_key: col(&row, "idempotency_key")?,
        payload: col(&row, "payload")?,
        queue: parse_with(&queue, Queue::parse, "queue")?,
        status: parse_with(&status, OutboxStatus::parse, "outbox status")?,
        attempts: col::<i32>(&row, "attempts")? as u32,
        next_attempt_at: col(&row, "next_attempt_at")?,
        last_error: col(&row, "last_error")?,
        lease_expires_at: col(&row, "lease_expires_at")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

pub(crate) fn lease_row(row: PgRow) -> StoreResult<Lease> {
    Ok(Lease {
        key: col(&row, "key")?,
        lease_id: col(&row, "lease_id")?,
        owner: col(&row, "owner")?,
        expires_at: col(&row, "expires_at")?,
    })
}

pub(crate) fn correction_row(row: PgRow) -> StoreResult<CorrectionRecord> {
    let correction_type: String = col(&row, "correction_type")?;
    let status: String = col(&row, "status")?;
    Ok(CorrectionRecord {
        id: CorrectionId::parse(&col::<String>(&row, "id")?)
            .ok_or_else(|| StoreError::Serialization("bad correction id".to_string()))?,
        correction_type: parse_with(&correction_type, CorrectionType::parse, "correction type")?,
        target_entity: col(&row, "target_entity")?,
        target_id: col(&row, "target_id")?,
        scope_key: col(&row, "scope_key")?,
        adjustment: col(&row, "adjustment")?,
        magnitude: col::<Decimal>(&row, "magnitude")?,
        reason_code: col(&row, "reason_code")?,
        status: parse_with(&status, CorrectionStatus::parse, "correction status")?,
        expires_at: col(&row, "expires_at")?,
        applied_by: col(&row, "applied_by")?,
        reversed_at: col(&row, "reversed_at")?,
        created_at: col(&row, "created_at")?,
    })
}

pub(crate) fn outcome_row(row: PgRow) -> StoreResult<CausalOutcomeRecord> {
    let verdict: String = col(&row, "verdict")?;
    let metric = |value: serde_json::Value| -> StoreResult<MetricSet> {
        serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
    };
    Ok(CausalOutcomeRecord {
        correction_id: CorrectionId::parse(&col::<String>(&row, "correction_id")?)
            .ok_or_else(|| StoreError::Serialization("bad correction id".to_string()))?,
        treated_baseline: metric(col(&row, "treated_baseline")?)?,
        treated_post: metric(col(&row, "treated_post")?)?,
        control_baseline: metric(col(&row, "control_baseline")?)?,
        control_post: metric(col(&row, "control_post")?)?,
        net_lift: metric(col(&row, "net_lift")?)?,
        verdict: parse_with(&verdict, Verdict::parse, "verdict")?,
        confidence: col::<Decimal>(&row, "confidence")?,
        measured_at: col(&row, "measured_at")?,
    })
}

pub(crate) fn flag_row(row: PgRow) -> StoreResult<SystemFlagRecord> {
    Ok(SystemFlagRecord {
        name: col(&row, "name")?,
        enabled: col(&row, "enabled")?,
        note: col(&row, "note")?,
        updated_at: col(&row, "updated_at")?,
    })
}
