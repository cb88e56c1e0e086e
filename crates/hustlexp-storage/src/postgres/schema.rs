//! Schema DDL and invariant triggers.
//!
//! Statements run in order and are idempotent, so cold starts against an
//! initialized database are no-ops. All triggers live in schema `public` and
//! raise errors whose message starts with the stable invariant code; the
//! error mapper in `mod.rs` extracts that prefix.

pub(crate) const DDL: &[&str] = &[
    // ---- users ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        role TEXT NOT NULL CHECK (role IN ('poster', 'hustler', 'admin')),
        trust_tier SMALLINT NOT NULL DEFAULT 0 CHECK (trust_tier BETWEEN 0 AND 5),
        xp_total BIGINT NOT NULL DEFAULT 0 CHECK (xp_total >= 0),
        level INTEGER NOT NULL DEFAULT 1 CHECK (level >= 1),
        streak_days INTEGER NOT NULL DEFAULT 0 CHECK (streak_days >= 0),
        last_active_at TIMESTAMPTZ,
        archived BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ---- tasks ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        poster_id TEXT NOT NULL REFERENCES users(id),
        hustler_id TEXT REFERENCES users(id),
        category TEXT NOT NULL,
        price_cents BIGINT NOT NULL CHECK (price_cents > 0),
        state TEXT NOT NULL CHECK (state IN
            ('OPEN', 'ACCEPTED', 'PROOF_SUBMITTED', 'COMPLETED', 'DISPUTED', 'CANCELLED', 'EXPIRED')),
        expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasks_state_expires
    ON tasks(state, expires_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasks_hustler
    ON tasks(hustler_id)
    WHERE hustler_id IS NOT NULL
    "#,
    // ---- money_state_lock (escrow) ------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS money_state_lock (
        task_id TEXT PRIMARY KEY REFERENCES tasks(id),
        state TEXT NOT NULL CHECK (state IN
            ('OPEN', 'HELD', 'RELEASED', 'REFUNDED', 'REFUND_PARTIAL', 'LOCKED_DISPUTE')),
        amount_cents BIGINT CHECK (amount_cents > 0),
        refunded_cents BIGINT CHECK (refunded_cents > 0),
        version INTEGER NOT NULL DEFAULT 1,
        payment_intent_id TEXT,
        charge_id TEXT,
        transfer_id TEXT,
        refund_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_money_state_updated
    ON money_state_lock(state, updated_at)
    "#,
    // ---- proofs --------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS proofs (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id),
        submitter_id TEXT NOT NULL REFERENCES users(id),
        artifact_keys JSONB NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('SUBMITTED', 'ACCEPTED', 'REJECTED')),
        deadline_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_proofs_task_created
    ON proofs(task_id, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_proofs_deadline_submitted
    ON proofs(deadline_at)
    WHERE state = 'SUBMITTED'
    "#,
    // ---- task_state_log ------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS task_state_log (
        sequence BIGSERIAL PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES tasks(id),
        from_state TEXT,
        to_state TEXT NOT NULL,
        transition TEXT NOT NULL,
        actor_id TEXT,
        reason TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_task_state_log_task
    ON task_state_log(task_id, sequence)
    "#,
    // ---- xp_ledger -----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS xp_ledger (
        entry_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        task_id TEXT,
        money_state_lock_task_id TEXT UNIQUE,
        base_xp BIGINT NOT NULL,
        decay_factor NUMERIC(8, 4) NOT NULL,
        effective_xp BIGINT NOT NULL,
        streak_multiplier NUMERIC(6, 2) NOT NULL,
        final_xp BIGINT NOT NULL CHECK (final_xp >= 0),
        reason TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_xp_ledger_user
    ON xp_ledger(user_id, created_at)
    "#,
    // ---- trust_ledger --------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS trust_ledger (
        entry_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        delta INTEGER NOT NULL,
        tier_before SMALLINT NOT NULL,
        tier_after SMALLINT NOT NULL,
        reason TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ---- badge_ledger --------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS badge_ledger (
        entry_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        badge TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (user_id, badge)
    )
    "#,
    // ---- money_events_audit -------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS money_events_audit (
        event_id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        op TEXT NOT NULL CHECK (op IN ('intent_create', 'capture', 'transfer', 'refund')),
        phase TEXT NOT NULL CHECK (phase IN ('initiated', 'confirmed', 'failed')),
        idempotency_key TEXT NOT NULL,
        provider_ref TEXT,
        detail JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (idempotency_key, phase)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_money_events_task
    ON money_events_audit(task_id, created_at)
    "#,
    // ---- admin_action_audit -------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS admin_action_audit (
        event_id TEXT PRIMARY KEY,
        sequence BIGINT NOT NULL UNIQUE,
        actor_id TEXT NOT NULL,
        action TEXT NOT NULL,
        target_kind TEXT NOT NULL,
        target_id TEXT NOT NULL,
        before JSONB NOT NULL,
        after JSONB NOT NULL,
        reason TEXT NOT NULL,
        previous_hash TEXT,
        hash TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ---- outbox_events -------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        event_version INTEGER NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        payload JSONB NOT NULL,
        queue_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'in_flight', 'completed', 'dead')),
        attempts INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_error TEXT,
        lease_expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_claim
    ON outbox_events(queue_name, next_attempt_at)
    WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_leases
    ON outbox_events(lease_expires_at)
    WHERE status = 'in_flight'
    "#,
    // ---- locks ---------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        key TEXT PRIMARY KEY,
        lease_id TEXT NOT NULL,
        owner TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // ---- correction_log / causal_outcomes -----------------------------
    r#"
    CREATE TABLE IF NOT EXISTS correction_log (
        id TEXT PRIMARY KEY,
        correction_type TEXT NOT NULL,
        target_entity TEXT NOT NULL,
        target_id TEXT NOT NULL,
        scope_key TEXT NOT NULL,
        adjustment TEXT NOT NULL,
        magnitude NUMERIC(10, 4) NOT NULL,
        reason_code TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('applied', 'rejected', 'reversed', 'expired')),
        expires_at TIMESTAMPTZ NOT NULL,
        applied_by TEXT NOT NULL,
        reversed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_correction_scope_active
    ON correction_log(scope_key, expires_at)
    WHERE status = 'applied'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS causal_outcomes (
        correction_id TEXT NOT NULL REFERENCES correction_log(id),
        treated_baseline JSONB NOT NULL,
        treated_post JSONB NOT NULL,
        control_baseline JSONB NOT NULL,
        control_post JSONB NOT NULL,
        net_lift JSONB NOT NULL,
        verdict TEXT NOT NULL CHECK (verdict IN ('causal', 'inconclusive', 'non_causal')),
        confidence NUMERIC(5, 4) NOT NULL,
        measured_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_causal_outcomes_measured
    ON causal_outcomes(measured_at)
    "#,
    // ---- system_flags --------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS system_flags (
        name TEXT PRIMARY KEY,
        enabled BOOLEAN NOT NULL,
        note TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    // ---- invariant triggers -------------------------------------------
    // Append-only guard, parameterized by invariant code.
    r#"
    CREATE OR REPLACE FUNCTION hx_append_only() RETURNS trigger AS $fn$
    BEGIN
        RAISE EXCEPTION '%: % is append-only', TG_ARGV[0], TG_TABLE_NAME;
    END
    $fn$ LANGUAGE plpgsql
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_xp_ledger_append_only ON xp_ledger;
    CREATE TRIGGER trg_xp_ledger_append_only
        BEFORE UPDATE OR DELETE ON xp_ledger
        FOR EACH ROW EXECUTE FUNCTION hx_append_only('HX102')
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_badge_ledger_append_only ON badge_ledger;
    CREATE TRIGGER trg_badge_ledger_append_only
        BEFORE UPDATE OR DELETE ON badge_ledger
        FOR EACH ROW EXECUTE FUNCTION hx_append_only('HX401')
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_trust_ledger_append_only ON trust_ledger;
    CREATE TRIGGER trg_trust_ledger_append_only
        BEFORE UPDATE OR DELETE ON trust_ledger
        FOR EACH ROW EXECUTE FUNCTION hx_append_only('HX701')
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_admin_audit_append_only ON admin_action_audit;
    CREATE TRIGGER trg_admin_audit_append_only
        BEFORE UPDATE OR DELETE ON admin_action_audit
        FOR EACH ROW EXECUTE FUNCTION hx_append_only('HX801')
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_money_events_append_only ON money_events_audit;
    CREATE TRIGGER trg_money_events_append_only
        BEFORE UPDATE OR DELETE ON money_events_audit
        FOR EACH ROW EXECUTE FUNCTION hx_append_only('HX901')
    "#,
    // Task guards: terminal freeze (HX001), completion gate (HX301), price
    // freeze after HELD (HX902). Admin overrides set the transaction-local
    // flag after inserting their audit row in the same transaction.
    r#"
    CREATE OR REPLACE FUNCTION hx_task_guard() RETURNS trigger AS $fn$
    BEGIN
        IF OLD.state IN ('COMPLETED', 'CANCELLED', 'EXPIRED')
           AND current_setting('hustlexp.admin_override', true) IS DISTINCT FROM 'on' THEN
            RAISE EXCEPTION 'HX001: task % is terminal and frozen', OLD.id;
        END IF;
        IF NEW.state = 'COMPLETED' AND OLD.state IS DISTINCT FROM 'COMPLETED'
           AND NOT EXISTS (
               SELECT 1 FROM proofs WHERE task_id = NEW.id AND state = 'ACCEPTED'
           ) THEN
            RAISE EXCEPTION 'HX301: task % has no accepted proof', NEW.id;
        END IF;
        IF NEW.price_cents IS DISTINCT FROM OLD.price_cents
           AND EXISTS (
               SELECT 1 FROM money_state_lock
               WHERE task_id = OLD.id AND amount_cents IS NOT NULL
           ) THEN
            RAISE EXCEPTION 'HX902: price for task % is frozen after HELD', OLD.id;
        END IF;
        RETURN NEW;
    END
    $fn$ LANGUAGE plpgsql
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_task_guard ON tasks;
    CREATE TRIGGER trg_task_guard
        BEFORE UPDATE ON tasks
        FOR EACH ROW EXECUTE FUNCTION hx_task_guard()
    "#,
    r#"
    CREATE OR REPLACE FUNCTION hx_task_delete_guard() RETURNS trigger AS $fn$
    BEGIN
        IF OLD.state IN ('COMPLETED', 'CANCELLED', 'EXPIRED') THEN
            RAISE EXCEPTION 'HX001: task % is terminal and frozen', OLD.id;
        END IF;
        RETURN OLD;
    END
    $fn$ LANGUAGE plpgsql
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_task_delete_guard ON tasks;
    CREATE TRIGGER trg_task_delete_guard
        BEFORE DELETE ON tasks
        FOR EACH ROW EXECUTE FUNCTION hx_task_delete_guard()
    "#,
    // Money guards: terminal freeze (HX002), single amount write (HX004),
    // release gated on COMPLETED task (HX201).
    r#"
    CREATE OR REPLACE FUNCTION hx_money_guard() RETURNS trigger AS $fn$
    BEGIN
        IF OLD.state IN ('RELEASED', 'REFUNDED', 'REFUND_PARTIAL') THEN
            RAISE EXCEPTION 'HX002: money state for task % is terminal', OLD.task_id;
        END IF;
        IF OLD.amount_cents IS NOT NULL
           AND NEW.amount_cents IS DISTINCT FROM OLD.amount_cents THEN
            RAISE EXCEPTION 'HX004: amount for task % is immutable', OLD.task_id;
        END IF;
        IF NEW.state = 'RELEASED' AND OLD.state IS DISTINCT FROM 'RELEASED'
           AND NOT EXISTS (
               SELECT 1 FROM tasks WHERE id = NEW.task_id AND state = 'COMPLETED'
           ) THEN
            RAISE EXCEPTION 'HX201: release for task % requires a COMPLETED task', NEW.task_id;
        END IF;
        RETURN NEW;
    END
    $fn$ LANGUAGE plpgsql
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_money_guard ON money_state_lock;
    CREATE TRIGGER trg_money_guard
        BEFORE UPDATE ON money_state_lock
        FOR EACH ROW EXECUTE FUNCTION hx_money_guard()
    "#,
    // XP gate: an XP row may only reference a RELEASED money state (HX101).
    r#"
    CREATE OR REPLACE FUNCTION hx_xp_gate() RETURNS trigger AS $fn$
    BEGIN
        IF NEW.money_state_lock_task_id IS NOT NULL
           AND NOT EXISTS (
               SELECT 1 FROM money_state_lock
               WHERE task_id = NEW.money_state_lock_task_id AND state = 'RELEASED'
           ) THEN
            RAISE EXCEPTION 'HX101: xp for task % requires a RELEASED money state',
                NEW.money_state_lock_task_id;
        END IF;
        RETURN NEW;
    END
    $fn$ LANGUAGE plpgsql
    "#,
    r#"
    DROP TRIGGER IF EXISTS trg_xp_gate ON xp_ledger;
    CREATE TRIGGER trg_xp_gate
        BEFORE INSERT ON xp_ledger
        FOR EACH ROW EXECUTE FUNCTION hx_xp_gate()
    "#,
];
