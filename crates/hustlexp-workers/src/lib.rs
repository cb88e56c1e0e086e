//! Idempotent background worker fleet.
//!
//! One worker type per outbox queue, all sharing the claim/ack discipline,
//! plus the periodic sweeps. Re-delivery of any event produces the same end
//! state as the first delivery; the dedup lives in the ledgers' unique keys,
//! the provider's idempotency keys, and the notification dedup set.

#![deny(unsafe_code)]

mod error;
mod fleet;
mod gateway;
mod notify;
mod payout;
mod proof_expiry;
mod realtime;
mod trust_eval;
mod xp_award;

pub use error::WorkerError;
pub use fleet::{run_once, FleetConfig, QueueWorker, WorkerFleet};
pub use gateway::{
    GatewayError, MockPushGateway, Notification, PushGateway, RealtimeMessage, SessionRegistry,
};
pub use notify::NotificationWorker;
pub use payout::PayoutWorker;
pub use proof_expiry::{ProofExpirySweep, SweepReport};
pub use realtime::RealtimeFanoutWorker;
pub use trust_eval::TrustWorker;
pub use xp_award::XpAwardWorker;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hustlexp_ledger::XpAwarder;
    use hustlexp_money::{MockProvider, MoneyEngine};
    use hustlexp_outbox::OutboxConsumer;
    use hustlexp_storage::memory::InMemoryHustleStore;
    use hustlexp_storage::{
        LedgerStore, OutboxStore, ProofRecord, TaskRecord, TaskStore, TaskTransitionRequest,
        UserRecord, UserStore,
    };
    use hustlexp_types::{
        ProofId, ProofState, Queue, Role, TaskId, TaskState, TaskTransition, TrustTier, UserId,
    };
    use std::sync::Arc;

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
    }

    async fn rig() -> Rig {
        let store = Arc::new(InMemoryHustleStore::new());
        let provider = Arc::new(MockProvider::new());
        let engine = Arc::new(MoneyEngine::new(store.clone(), provider.clone()));
        let poster = user(Role::Poster);
        let hustler = user(Role::Hustler);
        store.create_user(poster.clone()).await.unwrap();
        store.create_user(hustler.clone()).await.unwrap();
        Rig {
            store,
            provider,
            engine,
            poster: poster.id,
            hustler: hustler.id,
        }
    }

    /// Fund → claim → proof → complete → release, producing real outbox rows.
    async fn released_task(rig: &Rig, price_cents: i64) -> TaskId {
        let now = Utc::now();
        let task = TaskRecord {
            id: TaskId::generate(),
            poster_id: rig.poster,
            hustler_id: None,
            category: "errands".into(),
            price_cents,
            state: TaskState::Open,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        rig.store.create_task(task.clone()).await.unwrap();
        rig.engine.fund(task.id).await.unwrap();
        rig.store
            .transition_task(TaskTransitionRequest {
                task_id: task.id,
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
        rig.store
            .create_proof(
                ProofRecord {
                    id: ProofId::generate(),
                    task_id: task.id,
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
                task_id: task.id,
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
        rig.engine.release(task.id).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn xp_worker_consumes_release_events() {
        let rig = rig().await;
        let task_id = released_task(&rig, 5_000).await;

        let worker = XpAwardWorker::new(XpAwarder::new(rig.store.clone()));
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::XpAward);
        let processed = run_once(&worker, &consumer).await.unwrap();
        assert_eq!(processed, 1);

        let xp = rig.store.xp_for_release(task_id).await.unwrap().unwrap();
        assert_eq!(xp.final_xp, 50);
        assert!(consumer.claim(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn xp_redelivery_produces_identical_ledger_state() {
        let rig = rig().await;
        let task_id = released_task(&rig, 5_000).await;

        let worker = XpAwardWorker::new(XpAwarder::new(rig.store.clone()));
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::XpAward);
        let claimed = consumer.claim(Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Deliver the same record three times before acking.
        for _ in 0..3 {
            worker.handle(&claimed[0]).await.unwrap();
        }
        consumer.ack(claimed[0].id).await.unwrap();

        assert_eq!(rig.store.xp_for_user(rig.hustler).await.unwrap().len(), 1);
        let user = rig.store.get_user(rig.hustler).await.unwrap().unwrap();
        assert_eq!(user.xp_total, 50);
        let _ = task_id;
    }

    #[tokio::test]
    async fn payout_worker_verifies_without_a_second_transfer() {
        let rig = rig().await;
        released_task(&rig, 5_000).await;
        assert_eq!(rig.provider.transfer_count(), 1);

        let worker = PayoutWorker::new(rig.store.clone(), rig.provider.clone());
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::Payout);
        let processed = run_once(&worker, &consumer).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(rig.provider.transfer_count(), 1);
    }

    #[tokio::test]
    async fn notification_worker_pushes_once_per_recipient_event() {
        let rig = rig().await;
        released_task(&rig, 5_000).await;

        let gateway = Arc::new(MockPushGateway::new());
        let worker = NotificationWorker::new(rig.store.clone(), gateway.clone());
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::Notifications);

        let claimed = consumer.claim(Utc::now()).await.unwrap();
        // escrow.held + escrow.released both target this queue.
        assert_eq!(claimed.len(), 2);
        for record in &claimed {
            worker.handle(record).await.unwrap();
            // Duplicate delivery: dropped by (recipient, event_id).
            worker.handle(record).await.unwrap();
            consumer.ack(record.id).await.unwrap();
        }
        assert_eq!(gateway.sent().len(), 2);
    }

    #[tokio::test]
    async fn gateway_outage_reschedules_and_eventually_delivers() {
        let rig = rig().await;
        released_task(&rig, 5_000).await;

        let gateway = Arc::new(MockPushGateway::new());
        gateway.fail_next(2);
        let worker = NotificationWorker::new(rig.store.clone(), gateway.clone());
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::Notifications);

        // First pass: both rows fail and reschedule.
        run_once(&worker, &consumer).await.unwrap();
        let counts = rig.store.counts().await.unwrap();
        assert_eq!(counts.dead, 0);

        // Later passes drain them once the gateway recovers.
        for _ in 0..8 {
            let future = Utc::now() + Duration::hours(2);
            let claimed = rig
                .store
                .claim_batch(Queue::Notifications, future, 16, Duration::seconds(60))
                .await
                .unwrap();
            for record in &claimed {
                match worker.handle(record).await {
                    Ok(()) => rig.store.mark_completed(record.id).await.unwrap(),
                    Err(_) => {
                        rig.store
                            .mark_failed(record.id, "gateway", Some(future))
                            .await
                            .unwrap();
                    }
                }
            }
        }
        assert_eq!(gateway.sent().len(), 2);
    }

    #[tokio::test]
    async fn trust_worker_promotes_after_enough_completions() {
        let rig = rig().await;
        for _ in 0..3 {
            released_task(&rig, 2_000).await;
        }

        let worker = TrustWorker::new(
            rig.store.clone(),
            hustlexp_ledger::TrustEvaluator::new(rig.store.clone()),
        );
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::Trust);
        run_once(&worker, &consumer).await.unwrap();

        let updated = rig.store.get_user(rig.hustler).await.unwrap().unwrap();
        assert_eq!(updated.trust_tier.value(), 1);
    }

    #[tokio::test]
    async fn proof_expiry_rejects_and_returns_task_to_accepted() {
        let rig = rig().await;
        let now = Utc::now();
        let task = TaskRecord {
            id: TaskId::generate(),
            poster_id: rig.poster,
            hustler_id: None,
            category: "errands".into(),
            price_cents: 2_000,
            state: TaskState::Open,
            expires_at: None,
            created_at: now,
            updated_at: now,
        };
        rig.store.create_task(task.clone()).await.unwrap();
        rig.store
            .transition_task(TaskTransitionRequest {
                task_id: task.id,
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
        rig.store
            .create_proof(
                ProofRecord {
                    id: ProofId::generate(),
                    task_id: task.id,
                    submitter_id: rig.hustler,
                    artifact_keys: vec!["k".into()],
                    state: ProofState::Submitted,
                    deadline_at: now - Duration::hours(1),
                    created_at: now - Duration::hours(25),
                    updated_at: now - Duration::hours(25),
                },
                vec![],
            )
            .await
            .unwrap();
        rig.store
            .transition_task(TaskTransitionRequest {
                task_id: task.id,
                expected_from: vec![TaskState::Accepted],
                to: TaskState::ProofSubmitted,
                transition: TaskTransition::ProofSubmit,
                actor_id: Some(rig.hustler),
                reason: None,
                set_hustler: None,
                outbox: vec![],
            })
            .await
            .unwrap();

        let sweep = ProofExpirySweep::new(rig.store.clone());
        let report = sweep.run(now).await.unwrap();
        assert_eq!(report.proofs_expired, 1);

        let refreshed = rig.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, TaskState::Accepted);
    }

    #[tokio::test]
    async fn open_listings_past_expiry_are_swept() {
        let rig = rig().await;
        let now = Utc::now();
        let task = TaskRecord {
            id: TaskId::generate(),
            poster_id: rig.poster,
            hustler_id: None,
            category: "errands".into(),
            price_cents: 2_000,
            state: TaskState::Open,
            expires_at: Some(now - Duration::hours(1)),
            created_at: now - Duration::days(3),
            updated_at: now - Duration::days(3),
        };
        rig.store.create_task(task.clone()).await.unwrap();

        let sweep = ProofExpirySweep::new(rig.store.clone());
        let report = sweep.run(now).await.unwrap();
        assert_eq!(report.tasks_expired, 1);
        let refreshed = rig.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, TaskState::Expired);
    }

    #[tokio::test]
    async fn realtime_fanout_respects_membership() {
        let rig = rig().await;
        let registry = Arc::new(SessionRegistry::new());
        let (_, mut poster_rx) = registry.register(rig.poster);
        let stranger = UserId::generate();
        let (_, mut stranger_rx) = registry.register(stranger);

        let task_id = released_task(&rig, 5_000).await;
        rig.store
            .enqueue(hustlexp_storage::NewOutboxEvent::fan_out(
                &hustlexp_types::EventPayload::TaskProgressUpdated {
                    version: hustlexp_types::EVENT_VERSION,
                    task_id,
                    state: TaskState::Completed,
                    poster_id: rig.poster,
                    hustler_id: Some(rig.hustler),
                },
            ))
            .await
            .unwrap();

        let worker = RealtimeFanoutWorker::new(registry.clone());
        let consumer = OutboxConsumer::new(rig.store.clone(), Queue::Realtime);
        let processed = run_once(&worker, &consumer).await.unwrap();
        assert!(processed >= 1);

        assert!(poster_rx.try_recv().is_ok());
        assert!(stranger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fleet_starts_and_shuts_down_cleanly() {
        let rig = rig().await;
        let mut fleet = WorkerFleet::new(FleetConfig {
            poll_interval: std::time::Duration::from_millis(10),
            workers_per_queue: 2,
        });
        let store = rig.store.clone();
        let worker = Arc::new(XpAwardWorker::new(XpAwarder::new(store.clone())));
        fleet.spawn_queue_worker("xp_award", worker, || {
            OutboxConsumer::new(store.clone(), Queue::XpAward)
        });

        released_task(&rig, 5_000).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        fleet.shutdown().await;

        let counts = rig.store.counts().await.unwrap();
        assert!(counts.completed >= 1);
    }
}
