//! Recovery and reconciliation.
//!
//! Runs continuously beside the worker fleet:
//! - the pending-money reaper resolves provider calls that timed out by
//!   looking the idempotency key up and committing whichever outcome the
//!   provider actually reached,
//! - the DLQ processor turns dead letters into structured incidents and
//!   offers supervised replay,
//! - the parity checker verifies every RELEASED escrow against a
//!   provider-side transfer,
//! - the unpause safety check gates operator resume on all of the above.

#![deny(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use hustlexp_money::{MoneyEngine, MoneyError, PaymentProvider, ProviderError};
use hustlexp_storage::{
    EscrowStore, FlagStore, HustleStore, LedgerStore, NewMoneyEvent, OutboxRecord, OutboxStore,
    QueryWindow, StoreError, TaskStore, FLAG_KILL_SWITCH,
};
use hustlexp_types::{
    EventId, IdempotencyKey, MoneyEventPhase, MoneyOp, MoneyState, TaskId, TaskState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Reaper tuning.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// How long an `initiated` money event may dangle before reconciliation.
    pub pending_horizon: Duration,
    /// After this long with no provider-side record, the attempt is written
    /// off as never-landed.
    pub abandon_horizon: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            pending_horizon: Duration::seconds(120),
            abandon_horizon: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Provider side had landed; local state committed to match.
    pub reconciled: usize,
    /// Provider side never landed; attempt recorded as failed.
    pub abandoned: usize,
    /// Still ambiguous; left for the next pass.
    pub deferred: usize,
}

/// Reconciles money-state rows stuck in transitional states.
pub struct Reaper {
    store: Arc<dyn HustleStore>,
    provider: Arc<dyn PaymentProvider>,
    engine: Arc<MoneyEngine>,
    config: RecoveryConfig,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn HustleStore>,
        provider: Arc<dyn PaymentProvider>,
        engine: Arc<MoneyEngine>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            provider,
            engine,
            config,
        }
    }

    pub async fn reap_pending_money(&self, now: DateTime<Utc>) -> Result<ReapReport, RecoveryError> {
        let mut report = ReapReport::default();
        let dangling = self
            .store
            .initiated_without_outcome(now - self.config.pending_horizon)
            .await?;

        for event in dangling {
            let key = IdempotencyKey::for_op(
                event.op,
                event.task_id,
                escrow_version(&*self.store, event.task_id).await?,
            );
            // Only events carrying the canonical key shape reconcile here;
            // webhook dedup rows have their own lifecycle.
            if key.as_str() != event.idempotency_key {
                report.deferred += 1;
                continue;
            }

            match event.op {
                MoneyOp::Transfer => {
                    match self.provider.lookup_transfer(&key).await? {
                        Some(transfer) => {
                            self.commit_found_transfer(event.task_id, &key, transfer)
                                .await?;
                            report.reconciled += 1;
                        }
                        None if event.created_at <= now - self.config.abandon_horizon => {
                            self.abandon(event.task_id, event.op, &key).await?;
                            report.abandoned += 1;
                        }
                        None => report.deferred += 1,
                    }
                }
                MoneyOp::Refund => match self.provider.lookup_refund(&key).await? {
                    Some(refund) => {
                        self.commit_found_refund(event.task_id, &key, refund.refund_id, refund.amount_cents)
                            .await?;
                        report.reconciled += 1;
                    }
                    None if event.created_at <= now - self.config.abandon_horizon => {
                        self.abandon(event.task_id, event.op, &key).await?;
                        report.abandoned += 1;
                    }
                    None => report.deferred += 1,
                },
                // Funding stalls surface to the client, which retries the
                // whole fund command; past the abandon horizon the attempt is
                // closed out.
                MoneyOp::CreateIntent | MoneyOp::Capture => {
                    if event.created_at <= now - self.config.abandon_horizon {
                        self.abandon(event.task_id, event.op, &key).await?;
                        report.abandoned += 1;
                    } else {
                        report.deferred += 1;
                    }
                }
            }
        }

        if report != ReapReport::default() {
            info!(
                reconciled = report.reconciled,
                abandoned = report.abandoned,
                deferred = report.deferred,
                "pending-money reap"
            );
        }
        Ok(report)
    }

    async fn commit_found_transfer(
        &self,
        task_id: TaskId,
        key: &IdempotencyKey,
        transfer: hustlexp_money::ProviderTransfer,
    ) -> Result<(), RecoveryError> {
        let escrow = self
            .store
            .get_escrow(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("escrow {task_id}")))?;
        if escrow.state == MoneyState::Released {
            // Local commit already happened; just close the dangling row.
            self.store
                .append_money_event(NewMoneyEvent {
                    task_id,
                    op: MoneyOp::Transfer,
                    phase: MoneyEventPhase::Confirmed,
                    idempotency_key: key.as_str().to_string(),
                    provider_ref: Some(transfer.transfer_id),
                    detail: serde_json::json!({ "reconciled": true }),
                })
                .await?;
            return Ok(());
        }
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        if task.state != TaskState::Completed {
            warn!(task_id = %task_id, "transfer landed for a non-completed task; flagged for parity");
            return Ok(());
        }
        self.engine
            .commit_release(task_id, &task, &escrow, key, transfer)
            .await?;
        info!(task_id = %task_id, "timed-out release reconciled as committed");
        Ok(())
    }

    async fn commit_found_refund(
        &self,
        task_id: TaskId,
        key: &IdempotencyKey,
        refund_id: String,
        amount_cents: i64,
    ) -> Result<(), RecoveryError> {
        let escrow = self
            .store
            .get_escrow(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("escrow {task_id}")))?;
        self.store
            .append_money_event(NewMoneyEvent {
                task_id,
                op: MoneyOp::Refund,
                phase: MoneyEventPhase::Confirmed,
                idempotency_key: key.as_str().to_string(),
                provider_ref: Some(refund_id.clone()),
                detail: serde_json::json!({ "reconciled": true }),
            })
            .await?;
        if escrow.state.is_terminal() {
            return Ok(());
        }
        let held = escrow.amount_cents.unwrap_or(0);
        let full = amount_cents >= held;
        self.store
            .refund_escrow(task_id, escrow.state, refund_id, amount_cents, full, vec![])
            .await?;
        info!(task_id = %task_id, "timed-out refund reconciled as committed");
        Ok(())
    }

    async fn abandon(
        &self,
        task_id: TaskId,
        op: MoneyOp,
        key: &IdempotencyKey,
    ) -> Result<(), RecoveryError> {
        self.store
            .append_money_event(NewMoneyEvent {
                task_id,
                op,
                phase: MoneyEventPhase::Failed,
                idempotency_key: key.as_str().to_string(),
                provider_ref: None,
                detail: serde_json::json!({ "abandoned": true }),
            })
            .await?;
        warn!(task_id = %task_id, op = %op, "abandoned provider attempt never landed");
        Ok(())
    }
}

async fn escrow_version(store: &dyn HustleStore, task_id: TaskId) -> Result<u32, StoreError> {
    Ok(store
        .get_escrow(task_id)
        .await?
        .map(|escrow| escrow.version)
        .unwrap_or(1))
}

/// A structured incident derived from one dead letter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqIncident {
    pub event_id: EventId,
    pub event_type: String,
    pub queue: String,
    pub aggregate_id: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub first_seen: DateTime<Utc>,
}

/// Walks dead letters; replay is supervised (operator-invoked), never
/// automatic.
pub struct DlqProcessor {
    store: Arc<dyn HustleStore>,
}

impl DlqProcessor {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self { store }
    }

    pub async fn incidents(&self) -> Result<Vec<DlqIncident>, RecoveryError> {
        let dead = self.store.dead_letters(QueryWindow::default()).await?;
        Ok(dead.into_iter().map(incident_from).collect())
    }

    pub async fn replay(&self, event_id: EventId) -> Result<OutboxRecord, RecoveryError> {
        let row = self.store.replay_dead_letter(event_id).await?;
        info!(event_id = %event_id, "dead letter replayed under supervision");
        Ok(row)
    }
}

fn incident_from(row: OutboxRecord) -> DlqIncident {
    DlqIncident {
        event_id: row.id,
        event_type: row.event_type,
        queue: row.queue.as_str().to_string(),
        aggregate_id: row.aggregate_id,
        attempts: row.attempts,
        last_error: row.last_error,
        first_seen: row.created_at,
    }
}

/// One escrow whose provider-side transfer does not line up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParityDrift {
    pub task_id: TaskId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParityReport {
    pub checked: usize,
    pub drift: Vec<ParityDrift>,
}

/// Ledger ↔ provider parity: every RELEASED escrow must have a matching
/// transfer under the expected idempotency key.
pub struct ParityChecker {
    store: Arc<dyn HustleStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl ParityChecker {
    pub fn new(store: Arc<dyn HustleStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn check(&self) -> Result<ParityReport, RecoveryError> {
        let mut report = ParityReport::default();
        let released = self.store.released_escrows(QueryWindow::default()).await?;
        for escrow in released {
            report.checked += 1;
            let key = IdempotencyKey::for_op(MoneyOp::Transfer, escrow.task_id, escrow.version);
            match self.provider.lookup_transfer(&key).await? {
                None => report.drift.push(ParityDrift {
                    task_id: escrow.task_id,
                    reason: "no provider transfer under expected key".to_string(),
                }),
                Some(transfer) => {
                    if Some(transfer.amount_cents) != escrow.amount_cents {
                        report.drift.push(ParityDrift {
                            task_id: escrow.task_id,
                            reason: format!(
                                "amount mismatch: provider {} vs ledger {:?}",
                                transfer.amount_cents, escrow.amount_cents
                            ),
                        });
                    }
                }
            }
        }
        if !report.drift.is_empty() {
            warn!(drift = report.drift.len(), "provider parity drift detected");
        }
        Ok(report)
    }
}

/// The binary "safe to unpause" answer with its inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpauseSafety {
    pub pending_money_events: usize,
    pub outbox_backlog: u64,
    pub dead_letters: u64,
    pub kill_switch_on: bool,
    pub parity_drift: usize,
}

impl UnpauseSafety {
    pub fn is_safe(&self) -> bool {
        self.pending_money_events == 0
            && self.dead_letters == 0
            && !self.kill_switch_on
            && self.parity_drift == 0
    }
}

/// Gather the unpause inputs in one pass.
pub async fn unpause_safety(
    store: &dyn HustleStore,
    parity: &ParityChecker,
    now: DateTime<Utc>,
) -> Result<UnpauseSafety, RecoveryError> {
    let pending = store.initiated_without_outcome(now).await?;
    let counts = store.counts().await?;
    let kill_switch = store
        .get_flag(FLAG_KILL_SWITCH)
        .await?
        .map(|flag| flag.enabled)
        .unwrap_or(false);
    let parity_report = parity.check().await?;

    Ok(UnpauseSafety {
        pending_money_events: pending.len(),
        outbox_backlog: counts.pending + counts.in_flight,
        dead_letters: counts.dead,
        kill_switch_on: kill_switch,
        parity_drift: parity_report.drift.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hustlexp_money::{MockProvider, PlannedFailure};
    use hustlexp_storage::memory::InMemoryHustleStore;
    use hustlexp_storage::{
        NewOutboxEvent, ProofRecord, TaskRecord, TaskTransitionRequest, UserRecord, UserStore,
    };
    use hustlexp_types::{
        EventPayload, ProofId, ProofState, Role, TaskTransition, TrustTier, UserId, EVENT_VERSION,
    };

    fn user(role: Role) -> UserRecord {
        let now = Utc::now();
        UserRecord {
            id: UserId::generate(),
            role,
            trust_tier: TrustTier::new(0),
            xp_total: 0,
            level: 1,
            streak_days: 0,
            last_active_at: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    struct Rig {
        store: Arc<InMemoryHustleStore>,
        provider: Arc<MockProvider>,
        engine: Arc<MoneyEngine>,
        poster: UserId,
        hustler: UserId,
        task: TaskId,
    }

    async fn rig() -> Rig {
        let store = Arc::new(InMemoryHustleStore::new());
        let provider = Arc::new(MockProvider::new());
        let engine = Arc::new(MoneyEngine::new(store.clone(), provider.clone()));
        let poster = user(Role::Poster);
        let hustler = user(Role::Hustler);
        store.create_user(poster.clone()).await.unwrap();
        store.create_user(hustler.clone()).await.unwrap();
        let now = Utc::now();
        let task = TaskRecord {
            id: TaskId::generate(),
            poster_id: poster.id,
            hustler_id: None,
            category: "errands".into(),
            price_cents: 5_000,
            state: TaskState::Open,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        store.create_task(task.clone()).await.unwrap();
        Rig {
            store,
            provider,
            engine,
            poster: poster.id,
            hustler: hustler.id,
            task: task.id,
        }
    }

    async fn to_completed(rig: &Rig) {
        rig.store
            .transition_task(TaskTransitionRequest {
                task_id: rig.task,
                expected_from: vec![TaskState::Open],
                to: TaskState::Accepted,
                transition: TaskTransition::Claim,
                actor_id: Some(rig.hustler),
                reason: None,
                set_hustler: Some(rig.hustler),
                outbox: vec![],
            })
            .await
            .unwrap();
        let now = Utc::now();
        rig.store
            .create_proof(
                ProofRecord {
                    id: ProofId::generate(),
                    task_id: rig.task,
                    submitter_id: rig.hustler,
                    artifact_keys: vec!["k".into()],
                    state: ProofState::Accepted,
                    deadline_at: now,
                    created_at: now,
                    updated_at: now,
                },
                vec![],
            )
            .await
            .unwrap();
        rig.store
            .transition_task(TaskTransitionRequest {
                task_id: rig.task,
                expected_from: vec![TaskState::Accepted],
                to: TaskState::Completed,
                transition: TaskTransition::ProofAccept,
                actor_id: Some(rig.poster),
                reason: None,
                set_hustler: None,
                outbox: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reaper_commits_a_timed_out_release_that_landed() {
        let rig = rig().await;
        rig.engine.fund(rig.task).await.unwrap();
        to_completed(&rig).await;
        rig.provider
            .plan_transfer_failure(PlannedFailure::TimeoutButLands);
        assert!(matches!(
            rig.engine.release(rig.task).await.unwrap_err(),
            MoneyError::ProviderTimeout
        ));

        let reaper = Reaper::new(
            rig.store.clone(),
            rig.provider.clone(),
            rig.engine.clone(),
            RecoveryConfig {
                pending_horizon: Duration::seconds(0),
                ..RecoveryConfig::default()
            },
        );
        let report = reaper.reap_pending_money(Utc::now()).await.unwrap();
        assert_eq!(report.reconciled, 1);

        let escrow = rig.store.get_escrow(rig.task).await.unwrap().unwrap();
        assert_eq!(escrow.state, MoneyState::Released);
        assert_eq!(rig.provider.transfer_count(), 1);

        // Nothing left to reconcile on the next pass.
        let again = reaper.reap_pending_money(Utc::now()).await.unwrap();
        assert_eq!(again, ReapReport::default());
    }

    #[tokio::test]
    async fn reaper_abandons_attempts_that_never_landed() {
        let rig = rig().await;
        rig.engine.fund(rig.task).await.unwrap();
        to_completed(&rig).await;
        // Transient outright failure: nothing landed provider-side, and the
        // initiated row dangles.
        rig.provider
            .plan_transfer_failure(PlannedFailure::Transient("503".into()));
        assert!(rig.engine.release(rig.task).await.is_err());

        let reaper = Reaper::new(
            rig.store.clone(),
            rig.provider.clone(),
            rig.engine.clone(),
            RecoveryConfig {
                pending_horizon: Duration::seconds(0),
                abandon_horizon: Duration::seconds(0),
            },
        );
        let report = reaper.reap_pending_money(Utc::now()).await.unwrap();
        assert_eq!(report.abandoned, 1);

        let escrow = rig.store.get_escrow(rig.task).await.unwrap().unwrap();
        assert_eq!(escrow.state, MoneyState::Held);
    }

    #[tokio::test]
    async fn dlq_incidents_and_replay() {
        let rig = rig().await;
        let rows = rig
            .store
            .enqueue(NewOutboxEvent::fan_out(&EventPayload::EscrowReleased {
                version: EVENT_VERSION,
                task_id: rig.task,
                poster_id: rig.poster,
                hustler_id: rig.hustler,
                amount_cents: 5_000,
            }))
            .await
            .unwrap();
        rig.store
            .mark_failed(rows[0].id, "poison payload", None)
            .await
            .unwrap();

        let dlq = DlqProcessor::new(rig.store.clone());
        let incidents = dlq.incidents().await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].last_error.as_deref(), Some("poison payload"));

        let replayed = dlq.replay(incidents[0].event_id).await.unwrap();
        assert_eq!(replayed.attempts, 0);
        let counts = rig.store.counts().await.unwrap();
        assert_eq!(counts.dead, 0);
    }

    #[tokio::test]
    async fn parity_flags_released_escrow_without_transfer() {
        let rig = rig().await;
        rig.engine.fund(rig.task).await.unwrap();
        to_completed(&rig).await;
        // Commit RELEASED directly, skipping the provider on purpose.
        rig.store
            .release_escrow(rig.task, MoneyState::Held, "tr_phantom".into(), vec![])
            .await
            .unwrap();

        let parity = ParityChecker::new(rig.store.clone(), rig.provider.clone());
        let report = parity.check().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.drift.len(), 1);
    }

    #[tokio::test]
    async fn unpause_safety_is_binary_over_all_inputs() {
        let rig = rig().await;
        let parity = ParityChecker::new(rig.store.clone(), rig.provider.clone());

        let clean = unpause_safety(&*rig.store, &parity, Utc::now())
            .await
            .unwrap();
        assert!(clean.is_safe());

        rig.store
            .set_flag(FLAG_KILL_SWITCH, true, Some("incident".into()))
            .await
            .unwrap();
        let flagged = unpause_safety(&*rig.store, &parity, Utc::now())
            .await
            .unwrap();
        assert!(!flagged.is_safe());
        assert!(flagged.kill_switch_on);
    }

    #[tokio::test]
    async fn reaper_then_xp_is_exactly_once() {
        let rig = rig().await;
        rig.engine.fund(rig.task).await.unwrap();
        to_completed(&rig).await;
        rig.provider
            .plan_transfer_failure(PlannedFailure::TimeoutButLands);
        let _ = rig.engine.release(rig.task).await;

        let reaper = Reaper::new(
            rig.store.clone(),
            rig.provider.clone(),
            rig.engine.clone(),
            RecoveryConfig {
                pending_horizon: Duration::seconds(0),
                ..RecoveryConfig::default()
            },
        );
        reaper.reap_pending_money(Utc::now()).await.unwrap();

        // The reconciled release emitted the outbox rows exactly once.
        let counts = rig.store.counts().await.unwrap();
        let held_fanout = 1; // escrow.held → notifications
        let released_fanout = 4;
        assert_eq!(counts.pending, held_fanout + released_fanout);
    }
}
