//! The dependency container and command surface.
//!
//! One `HustleCore` per process: storage, payment provider, gateways, and
//! engines wired once and injected everywhere (no module-level singletons).
//! The commands here are the complete RPC surface the transport layer
//! forwards to.

use crate::config::KernelConfig;
use crate::error::KernelError;
use chrono::{DateTime, Duration, Utc};
use hustlexp_correction::CorrectionEngine;
use hustlexp_ledger::{TrustEvaluator, XpAwarder};
use hustlexp_money::{
    MoneyEngine, PaymentProvider, RefundOutcome, ReleaseOutcome, SignatureVerifier, WebhookIngress,
};
use hustlexp_outbox::OutboxConsumer;
use hustlexp_recovery::{
    unpause_safety, DlqProcessor, ParityChecker, Reaper, RecoveryConfig, UnpauseSafety,
};
use hustlexp_storage::{
    EscrowRecord, EscrowStore, FlagStore, HustleStore, ProofRecord, TaskRecord, FLAG_SAFE_MODE,
};
use hustlexp_task::{DisputeResolution, TaskLifecycle};
use hustlexp_types::{MoneyState, Queue, TaskId, TaskState, UserId};
use hustlexp_workers::{
    FleetConfig, NotificationWorker, PayoutWorker, ProofExpirySweep, PushGateway,
    RealtimeFanoutWorker, SessionRegistry, TrustWorker, WorkerFleet, XpAwardWorker,
};
use std::sync::Arc;
use tracing::info;

/// Default proof deadline granted on submission; the correction engine's
/// proof-timing knob adjusts it within [4h, 48h].
const DEFAULT_PROOF_DEADLINE_HOURS: i64 = 24;

/// Everything a request handler or worker needs, wired once.
pub struct HustleCore {
    store: Arc<dyn HustleStore>,
    provider: Arc<dyn PaymentProvider>,
    tasks: TaskLifecycle,
    money: Arc<MoneyEngine>,
    corrections: Arc<CorrectionEngine>,
    registry: Arc<SessionRegistry>,
    config: KernelConfig,
}

impl HustleCore {
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn HustleStore>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            tasks: TaskLifecycle::new(store.clone()),
            money: Arc::new(MoneyEngine::new(store.clone(), provider.clone())),
            corrections: Arc::new(CorrectionEngine::new(store.clone())),
            registry: Arc::new(SessionRegistry::new()),
            store,
            provider,
            config,
        }
    }

    /// Cold-start hydration: SafeMode cache, operator override.
    pub async fn hydrate(&self) -> Result<(), KernelError> {
        self.corrections.hydrate().await?;
        if let Some(forced) = self.config.safe_mode_override {
            self.store
                .set_flag(FLAG_SAFE_MODE, forced, Some("operator override".to_string()))
                .await?;
            self.corrections.hydrate().await?;
            info!(forced, "SafeMode forced by operator override");
        }
        Ok(())
    }

    pub fn store(&self) -> Arc<dyn HustleStore> {
        self.store.clone()
    }

    pub fn money(&self) -> Arc<MoneyEngine> {
        self.money.clone()
    }

    pub fn corrections(&self) -> Arc<CorrectionEngine> {
        self.corrections.clone()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn webhook_ingress(&self) -> WebhookIngress {
        WebhookIngress::new(
            SignatureVerifier::new(self.config.payment_provider_key.as_bytes().to_vec()),
            self.store.clone(),
            self.money.clone(),
        )
    }

    // ---- command surface ----------------------------------------------

    pub async fn create_task(
        &self,
        poster_id: UserId,
        category: &str,
        price_cents: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<TaskRecord, KernelError> {
        Ok(self
            .tasks
            .create_task(poster_id, category, price_cents, expires_at)
            .await?)
    }

    pub async fn fund_task(&self, task_id: TaskId) -> Result<EscrowRecord, KernelError> {
        Ok(self.money.fund(task_id).await?)
    }

    /// Claims require a funded escrow: nobody works against unsecured money.
    pub async fn claim_task(
        &self,
        task_id: TaskId,
        hustler_id: UserId,
    ) -> Result<TaskRecord, KernelError> {
        let escrow_state = self.store.get_escrow(task_id).await?.map(|e| e.state);
        if escrow_state != Some(MoneyState::Held) {
            return Err(KernelError::Money(hustlexp_money::MoneyError::InvalidState(
                format!("task {task_id} is not funded"),
            )));
        }
        Ok(self.tasks.claim(task_id, hustler_id).await?)
    }

    pub async fn submit_proof(
        &self,
        task_id: TaskId,
        submitter_id: UserId,
        artifact_keys: Vec<String>,
    ) -> Result<ProofRecord, KernelError> {
        let deadline = Utc::now() + Duration::hours(DEFAULT_PROOF_DEADLINE_HOURS);
        Ok(self
            .tasks
            .submit_proof(task_id, submitter_id, artifact_keys, deadline)
            .await?)
    }

    /// Accept the proof and release the escrow: COMPLETED commits first,
    /// then the release moves money and emits `escrow.released` in the same
    /// transaction as the RELEASED commit.
    pub async fn accept_proof(
        &self,
        task_id: TaskId,
        actor_id: UserId,
    ) -> Result<(TaskRecord, ReleaseOutcome), KernelError> {
        let task = self.tasks.accept_proof(task_id, actor_id).await?;
        let release = self.money.release(task_id).await?;
        Ok((task, release))
    }

    pub async fn reject_proof(
        &self,
        task_id: TaskId,
        actor_id: UserId,
        reason: Option<String>,
    ) -> Result<TaskRecord, KernelError> {
        Ok(self.tasks.reject_proof(task_id, actor_id, reason).await?)
    }

    /// Open a dispute; a funded escrow locks alongside it.
    pub async fn dispute(
        &self,
        task_id: TaskId,
        opened_by: UserId,
        reason: Option<String>,
    ) -> Result<TaskRecord, KernelError> {
        let task = self.tasks.dispute(task_id, opened_by, reason).await?;
        let escrow = self.store.get_escrow(task_id).await?;
        if escrow.map(|e| e.state) == Some(MoneyState::Held) {
            self.money.lock_dispute(task_id).await?;
        }
        Ok(task)
    }

    /// Resolve a dispute: money follows the task verdict.
    pub async fn resolve_dispute(
        &self,
        task_id: TaskId,
        admin_id: UserId,
        resolution: DisputeResolution,
        reason: Option<String>,
    ) -> Result<TaskRecord, KernelError> {
        let task = self
            .tasks
            .resolve_dispute(task_id, admin_id, resolution, reason)
            .await?;

        let escrow_state = self.store.get_escrow(task_id).await?.map(|e| e.state);
        match (resolution, escrow_state) {
            (DisputeResolution::Complete, Some(MoneyState::LockedDispute)) => {
                self.money.resolve_dispute_release(task_id).await?;
            }
            (DisputeResolution::Cancel, Some(MoneyState::LockedDispute)) => {
                self.money.resolve_dispute_refund(task_id, None).await?;
            }
            // Never funded, or already terminal: nothing to move.
            _ => {}
        }
        Ok(task)
    }

    pub async fn cancel_task(
        &self,
        task_id: TaskId,
        actor_id: UserId,
        reason: Option<String>,
    ) -> Result<TaskRecord, KernelError> {
        let task = self.tasks.cancel(task_id, actor_id, reason).await?;
        // A funded, undisputed escrow refunds in full on cancellation.
        let escrow_state = self.store.get_escrow(task_id).await?.map(|e| e.state);
        if escrow_state == Some(MoneyState::Held) {
            match self.money.refund(task_id, None).await {
                Ok(RefundOutcome::Refunded(_)) | Ok(RefundOutcome::AlreadyRefunded(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(task)
    }

    pub async fn admin_override_task(
        &self,
        task_id: TaskId,
        admin_id: UserId,
        to: TaskState,
        reason: String,
    ) -> Result<TaskRecord, KernelError> {
        Ok(self
            .tasks
            .admin_override(task_id, admin_id, to, reason)
            .await?)
    }

    pub async fn force_release(
        &self,
        task_id: TaskId,
        admin_id: UserId,
        reason: String,
    ) -> Result<ReleaseOutcome, KernelError> {
        Ok(self.money.force_release(task_id, admin_id, reason).await?)
    }

    // ---- operations ---------------------------------------------------

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.store.clone(),
            self.provider.clone(),
            self.money.clone(),
            RecoveryConfig::default(),
        )
    }

    pub fn dlq(&self) -> DlqProcessor {
        DlqProcessor::new(self.store.clone())
    }

    pub fn parity(&self) -> ParityChecker {
        ParityChecker::new(self.store.clone(), self.provider.clone())
    }

    pub async fn unpause_safety(&self, now: DateTime<Utc>) -> Result<UnpauseSafety, KernelError> {
        let parity = self.parity();
        Ok(unpause_safety(&*self.store, &parity, now)
            .await
            .map_err(|err| match err {
                hustlexp_recovery::RecoveryError::Store(inner) => KernelError::Store(inner),
                hustlexp_recovery::RecoveryError::Money(inner) => KernelError::Money(inner),
                hustlexp_recovery::RecoveryError::Provider(inner) => {
                    KernelError::Money(inner.into())
                }
            })?)
    }

    /// Spawn the full worker fleet plus the periodic sweeps.
    pub fn start_fleet(&self, gateway: Arc<dyn PushGateway>) -> WorkerFleet {
        let fleet_config = FleetConfig {
            poll_interval: std::time::Duration::from_millis(500),
            workers_per_queue: self.config.outbox_worker_count.max(1),
        };
        let mut fleet = WorkerFleet::new(fleet_config);
        let store = self.store.clone();

        let xp = Arc::new(XpAwardWorker::new(XpAwarder::new(store.clone())));
        fleet.spawn_queue_worker("xp_award", xp, || {
            OutboxConsumer::new(store.clone(), Queue::XpAward)
        });

        let payout = Arc::new(PayoutWorker::new(store.clone(), self.provider.clone()));
        fleet.spawn_queue_worker("payout", payout, || {
            OutboxConsumer::new(store.clone(), Queue::Payout)
        });

        let notify = Arc::new(NotificationWorker::new(store.clone(), gateway));
        fleet.spawn_queue_worker("notifications", notify, || {
            OutboxConsumer::new(store.clone(), Queue::Notifications)
        });

        let trust = Arc::new(TrustWorker::new(
            store.clone(),
            TrustEvaluator::new(store.clone()),
        ));
        fleet.spawn_queue_worker("trust", trust, || {
            OutboxConsumer::new(store.clone(), Queue::Trust)
        });

        let realtime = Arc::new(RealtimeFanoutWorker::new(self.registry.clone()));
        fleet.spawn_queue_worker("realtime", realtime, || {
            OutboxConsumer::new(store.clone(), Queue::Realtime)
        });

        let sweep = Arc::new(ProofExpirySweep::new(store.clone()));
        fleet.spawn_periodic(
            "proof_expiry",
            std::time::Duration::from_secs(60),
            move || {
                let sweep = sweep.clone();
                async move { sweep.run(Utc::now()).await.map(|_| ()) }
            },
        );

        let reaper = Arc::new(self.reaper());
        fleet.spawn_periodic(
            "pending_money_reaper",
            std::time::Duration::from_secs(30),
            move || {
                let reaper = reaper.clone();
                async move {
                    reaper
                        .reap_pending_money(Utc::now())
                        .await
                        .map(|_| ())
                        .map_err(recovery_to_worker)
                }
            },
        );

        let corrections = self.corrections.clone();
        fleet.spawn_periodic(
            "correction_expiry",
            std::time::Duration::from_secs(60),
            move || {
                let corrections = corrections.clone();
                async move {
                    corrections
                        .expire_due(Utc::now())
                        .await
                        .map(|_| ())
                        .map_err(correction_to_worker)?;
                    corrections
                        .audit_sweep(Utc::now())
                        .await
                        .map(|_| ())
                        .map_err(correction_to_worker)
                }
            },
        );

        fleet
    }
}

fn recovery_to_worker(err: hustlexp_recovery::RecoveryError) -> hustlexp_workers::WorkerError {
    match err {
        hustlexp_recovery::RecoveryError::Store(inner) => inner.into(),
        hustlexp_recovery::RecoveryError::Money(inner) => inner.into(),
        hustlexp_recovery::RecoveryError::Provider(inner) => {
            hustlexp_workers::WorkerError::Money(inner.into())
        }
    }
}

fn correction_to_worker(
    err: hustlexp_correction::CorrectionError,
) -> hustlexp_workers::WorkerError {
    match err {
        hustlexp_correction::CorrectionError::Store(inner) => inner.into(),
        other => hustlexp_workers::WorkerError::MalformedPayload(other.to_string()),
    }
}

/// Initialize structured logging for binaries; libraries never call this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
