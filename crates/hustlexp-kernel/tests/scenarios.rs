//! End-to-end scenarios over the full container: in-memory store, mock
//! provider, mock push gateway, workers driven by hand for determinism.

use chrono::{Duration, Utc};
use hustlexp_correction::{ApplyOutcome, BlockReason, CorrectionProposal};
use hustlexp_kernel::{HustleCore, KernelConfig, KernelError};
use hustlexp_ledger::XpAwarder;
use hustlexp_money::{
    MockProvider, MoneyError, PlannedFailure, ReleaseOutcome, WebhookOutcome,
};
use hustlexp_outbox::OutboxConsumer;
use hustlexp_recovery::{Reaper, RecoveryConfig};
use hustlexp_storage::memory::InMemoryHustleStore;
use hustlexp_storage::{
    CorrectionStore, EscrowStore, LedgerStore, QueryWindow, StoreError, TaskStore, UserRecord,
    UserStore,
};
use hustlexp_task::DisputeResolution;
use hustlexp_types::{
    CorrectionType, InvariantCode, MoneyState, Queue, Role, Scope, TaskState, TrustTier, UserId,
};
use hustlexp_workers::{
    run_once, MockPushGateway, NotificationWorker, PayoutWorker, XpAwardWorker,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

struct World {
    core: HustleCore,
    store: Arc<InMemoryHustleStore>,
    provider: Arc<MockProvider>,
    gateway: Arc<MockPushGateway>,
    poster: UserId,
    hustler: UserId,
    admin: UserId,
}

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

async fn world() -> World {
    let store = Arc::new(InMemoryHustleStore::new());
    let provider = Arc::new(MockProvider::new());
    let config = KernelConfig {
        payment_provider_key: "whsec_test".to_string(),
        ..KernelConfig::default()
    };
    let core = HustleCore::new(config, store.clone(), provider.clone());
    core.hydrate().await.unwrap();

    let poster = user(Role::Poster);
    let hustler = user(Role::Hustler);
    let admin = user(Role::Admin);
    store.create_user(poster.clone()).await.unwrap();
    store.create_user(hustler.clone()).await.unwrap();
    store.create_user(admin.clone()).await.unwrap();

    World {
        core,
        store,
        provider,
        gateway: Arc::new(MockPushGateway::new()),
        poster: poster.id,
        hustler: hustler.id,
        admin: admin.id,
    }
}

async fn drain_queue(world: &World, queue: Queue) {
    let consumer = OutboxConsumer::new(world.store.clone(), queue);
    match queue {
        Queue::XpAward => {
            let worker = XpAwardWorker::new(XpAwarder::new(world.store.clone()));
            run_once(&worker, &consumer).await.unwrap();
        }
        Queue::Payout => {
            let worker = PayoutWorker::new(world.store.clone(), world.provider.clone());
            run_once(&worker, &consumer).await.unwrap();
        }
        Queue::Notifications => {
            let worker = NotificationWorker::new(world.store.clone(), world.gateway.clone());
            run_once(&worker, &consumer).await.unwrap();
        }
        _ => {}
    }
}

/// Scenario 1: poster funds a $50 task, hustler claims, submits proof with
/// two artifacts, poster accepts. One XP row at exactly base 50, one
/// provider transfer, one payout notification to the hustler.
#[tokio::test]
async fn happy_path() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(
            task.id,
            world.hustler,
            vec!["proofs/receipt.jpg".into(), "proofs/done.jpg".into()],
        )
        .await
        .unwrap();
    let (completed, release) = world
        .core
        .accept_proof(task.id, world.poster)
        .await
        .unwrap();
    assert_eq!(completed.state, TaskState::Completed);
    assert!(matches!(release, ReleaseOutcome::Released(_)));

    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Released);

    drain_queue(&world, Queue::XpAward).await;
    drain_queue(&world, Queue::Payout).await;
    drain_queue(&world, Queue::Notifications).await;

    // Exactly one XP row, with the literal expected breakdown.
    let xp = world.store.xp_for_release(task.id).await.unwrap().unwrap();
    assert_eq!(xp.user_id, world.hustler);
    assert_eq!(xp.base_xp, 50);
    assert_eq!(xp.decay_factor, dec!(1.0000));
    assert_eq!(xp.streak_multiplier, dec!(1.00));
    assert_eq!(xp.final_xp, 50);

    // One provider transfer.
    assert_eq!(world.provider.transfer_count(), 1);

    // One payout notification reached the hustler.
    let paid: Vec<_> = world
        .gateway
        .sent()
        .into_iter()
        .filter(|n| n.recipient == world.hustler)
        .collect();
    assert_eq!(paid.len(), 1);

    // One state-log row per committed task change, genesis included.
    let log = world.store.state_log_for_task(task.id).await.unwrap();
    let states: Vec<_> = log.iter().map(|row| row.to_state).collect();
    assert_eq!(
        states,
        vec![
            TaskState::Open,
            TaskState::Accepted,
            TaskState::ProofSubmitted,
            TaskState::Completed
        ]
    );
}

/// Scenario 2: re-issuing the release command is a recorded non-event: no
/// new XP row, no new transfer.
#[tokio::test]
async fn duplicate_release() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(task.id, world.hustler, vec!["proofs/a.jpg".into()])
        .await
        .unwrap();
    world
        .core
        .accept_proof(task.id, world.poster)
        .await
        .unwrap();
    drain_queue(&world, Queue::XpAward).await;

    let again = world.core.money().release(task.id).await.unwrap();
    assert!(matches!(again, ReleaseOutcome::AlreadyReleased(_)));

    drain_queue(&world, Queue::XpAward).await;
    assert_eq!(
        world.store.xp_for_user(world.hustler).await.unwrap().len(),
        1
    );
    assert_eq!(world.provider.transfer_count(), 1);
}

/// Scenario 3: releasing while the task is still ACCEPTED is vetoed with
/// HX201 and changes nothing.
#[tokio::test]
async fn release_before_acceptance() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();

    let err = world.core.money().release(task.id).await.unwrap_err();
    assert!(matches!(
        err,
        MoneyError::Store(StoreError::InvariantViolation {
            code: InvariantCode::HX201,
            ..
        })
    ));

    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Held);
    assert_eq!(world.provider.transfer_count(), 0);
}

/// Scenario 4: a correction naming a ledger is BLOCKED, audited, logged as
/// rejected, and does not touch SafeMode.
#[tokio::test]
async fn forbidden_correction() {
    let world = world().await;
    let outcome = world
        .core
        .corrections()
        .apply(
            CorrectionProposal {
                correction_type: CorrectionType::TaskRouting,
                target_entity: "LedgerService".to_string(),
                target_id: "any".to_string(),
                scope: Scope::Global,
                adjustment: "boost".to_string(),
                magnitude: dec!(0.2),
                reason_code: "probe".to_string(),
                ttl: Duration::hours(6),
                proposed_by: "advisor".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ApplyOutcome::Blocked(BlockReason::ForbiddenTarget)
    ));

    let audit = world.store.admin_audit(QueryWindow::default()).await.unwrap();
    assert!(audit.iter().any(|row| row.action == "correction_blocked"));
    assert!(!world.core.corrections().safe_mode_active());
    assert!(world
        .store
        .applied_corrections(Utc::now())
        .await
        .unwrap()
        .is_empty());
}

/// Scenario 6: the transfer hangs past its deadline on the first attempt but
/// lands provider-side. Money stays HELD until the reaper reconciles by
/// idempotency key and commits RELEASED; XP lands exactly once.
#[tokio::test]
async fn provider_timeout_mid_release() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(task.id, world.hustler, vec!["proofs/a.jpg".into()])
        .await
        .unwrap();

    world
        .provider
        .plan_transfer_failure(PlannedFailure::TimeoutButLands);
    let err = world
        .core
        .accept_proof(task.id, world.poster)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Money(MoneyError::ProviderTimeout)));

    // Task committed COMPLETED; money still HELD.
    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Held);

    let reaper = Reaper::new(
        world.store.clone(),
        world.provider.clone(),
        world.core.money(),
        RecoveryConfig {
            pending_horizon: Duration::seconds(0),
            ..RecoveryConfig::default()
        },
    );
    let report = reaper.reap_pending_money(Utc::now()).await.unwrap();
    assert_eq!(report.reconciled, 1);

    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Released);
    assert_eq!(world.provider.transfer_count(), 1);

    drain_queue(&world, Queue::XpAward).await;
    drain_queue(&world, Queue::XpAward).await;
    assert_eq!(
        world.store.xp_for_user(world.hustler).await.unwrap().len(),
        1
    );
}

/// Fund → refund round trip leaves no intermediate state behind.
#[tokio::test]
async fn fund_refund_round_trip() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();

    world
        .core
        .cancel_task(task.id, world.poster, Some("plans changed".into()))
        .await
        .unwrap();

    let task_row = world.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.state, TaskState::Cancelled);
    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Refunded);
    assert_eq!(escrow.refunded_cents, Some(5_000));
}

/// Dispute flow: lock on open, refund on resolve-cancel.
#[tokio::test]
async fn dispute_locks_then_refunds() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .dispute(task.id, world.poster, Some("no show".into()))
        .await
        .unwrap();

    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::LockedDispute);

    world
        .core
        .resolve_dispute(
            task.id,
            world.admin,
            DisputeResolution::Cancel,
            Some("verified".into()),
        )
        .await
        .unwrap();

    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Refunded);
    let task_row = world.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_row.state, TaskState::Cancelled);
}

/// Dispute resolved for the hustler releases through the locked state.
#[tokio::test]
async fn dispute_resolved_complete_releases() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(task.id, world.hustler, vec!["proofs/a.jpg".into()])
        .await
        .unwrap();
    world
        .core
        .dispute(task.id, world.poster, Some("quality".into()))
        .await
        .unwrap();

    world
        .core
        .resolve_dispute(
            task.id,
            world.admin,
            DisputeResolution::Complete,
            Some("proof holds up".into()),
        )
        .await
        .unwrap();

    let escrow = world.store.get_escrow(task.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, MoneyState::Released);
    assert_eq!(world.provider.transfer_count(), 1);
}

/// Terminal task rows are frozen; the audited admin override is the only
/// way through, and it leaves an audit row behind.
#[tokio::test]
async fn terminal_immutability_and_admin_override() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(task.id, world.hustler, vec!["proofs/a.jpg".into()])
        .await
        .unwrap();
    world
        .core
        .accept_proof(task.id, world.poster)
        .await
        .unwrap();

    let err = world
        .core
        .cancel_task(task.id, world.poster, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Task(hustlexp_task::TaskError::Store(
            StoreError::InvariantViolation {
                code: InvariantCode::HX001,
                ..
            }
        ))
    ));

    world
        .core
        .admin_override_task(task.id, world.admin, TaskState::Disputed, "fraud review".into())
        .await
        .unwrap();
    let audit = world.store.admin_audit(QueryWindow::default()).await.unwrap();
    assert!(audit.iter().any(|row| row.action == "task_state_override"));
}

/// Provider parity holds after the happy path: the released escrow has a
/// provider transfer under the expected idempotency key.
#[tokio::test]
async fn provider_parity_after_release() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(task.id, world.hustler, vec!["proofs/a.jpg".into()])
        .await
        .unwrap();
    world
        .core
        .accept_proof(task.id, world.poster)
        .await
        .unwrap();

    let report = world.core.parity().check().await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.drift.is_empty());
}

/// Webhook ingress: verified, deduped by provider event id, idempotent.
#[tokio::test]
async fn webhook_dedupes_by_event_id() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();

    let ingress = world.core.webhook_ingress();
    let verifier = hustlexp_money::SignatureVerifier::new(b"whsec_test".to_vec());
    let body = serde_json::json!({
        "id": "evt_123",
        "type": "payment_intent.succeeded",
        "task_id": task.id.to_string(),
    })
    .to_string();
    let now = Utc::now();
    let signature = verifier.sign(body.as_bytes(), now);

    let first = ingress
        .process(body.as_bytes(), &signature, now)
        .await
        .unwrap();
    assert_eq!(first, WebhookOutcome::Recorded);
    let second = ingress
        .process(body.as_bytes(), &signature, now)
        .await
        .unwrap();
    assert_eq!(second, WebhookOutcome::Duplicate);
}

/// The unpause check is clean after a fully drained happy path.
#[tokio::test]
async fn unpause_safety_after_drain() {
    let world = world().await;
    let task = world
        .core
        .create_task(world.poster, "errands", 5_000, None)
        .await
        .unwrap();
    world.core.fund_task(task.id).await.unwrap();
    world.core.claim_task(task.id, world.hustler).await.unwrap();
    world
        .core
        .submit_proof(task.id, world.hustler, vec!["proofs/a.jpg".into()])
        .await
        .unwrap();
    world
        .core
        .accept_proof(task.id, world.poster)
        .await
        .unwrap();

    let safety = world.core.unpause_safety(Utc::now()).await.unwrap();
    assert_eq!(safety.pending_money_events, 0);
    assert_eq!(safety.dead_letters, 0);
    assert!(!safety.kill_switch_on);
    assert_eq!(safety.parity_drift, 0);
    assert!(safety.is_safe());
}
