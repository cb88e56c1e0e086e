//! Money state machine and payment provider seam.
//!
//! This crate owns the escrow lifecycle and is the only component that
//! initiates provider-side money movement. The task lifecycle, the XP
//! ledger, and the workers all observe money state; none of them move it.

#![deny(unsafe_code)]

mod engine;
mod provider;
mod webhook;

pub use engine::{MoneyEngine, MoneyError, RefundOutcome, ReleaseOutcome};
pub use provider::{
    MockProvider, PaymentProvider, PlannedFailure, ProviderCharge, ProviderError, ProviderIntent,
    ProviderRefund, ProviderTransfer,
};
pub use webhook::{
    ProviderEvent, SignatureVerifier, WebhookError, WebhookIngress, WebhookOutcome,
};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hustlexp_storage::memory::InMemoryHustleStore;
    use hustlexp_storage::{
        EscrowStore, LedgerStore, OutboxStore, ProofRecord, StoreError, TaskRecord, TaskStore,
        TaskTransitionRequest, UserRecord, UserStore,
    };
    use hustlexp_types::{
        InvariantCode, MoneyEventPhase, MoneyState, ProofId, ProofState, Role, TaskId, TaskState,
        TaskTransition, TrustTier, UserId,
    };
    use std::sync::Arc;

    struct Fixture {
        store: Arc<InMemoryHustleStore>,
        provider: Arc<MockProvider>,
        engine: Arc<MoneyEngine>,
        poster: UserId,
        hustler: UserId,
        task: TaskId,
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

    async fn fixture() -> Fixture {
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
        Fixture {
            store,
            provider,
            engine,
            poster: poster.id,
            hustler: hustler.id,
            task: task.id,
        }
    }

    async fn drive_to_completed(fx: &Fixture) {
        fx.store
            .transition_task(TaskTransitionRequest {
                task_id: fx.task,
                expected_from: vec![TaskState::Open],
                to: TaskState::Accepted,
                transition: TaskTransition::Claim,
                actor_id: Some(fx.hustler),
                reason: None,
                set_hustler: Some(fx.hustler),
                outbox: vec![],
            })
            .await
            .unwrap();
        let now = Utc::now();
        fx.store
            .create_proof(
                ProofRecord {
                    id: ProofId::generate(),
                    task_id: fx.task,
                    submitter_id: fx.hustler,
                    artifact_keys: vec!["k1".into()],
                    state: ProofState::Accepted,
                    deadline_at: now,
                    created_at: now,
                    updated_at: now,
                },
                vec![],
            )
            .await
            .unwrap();
        fx.store
            .transition_task(TaskTransitionRequest {
                task_id: fx.task,
                expected_from: vec![TaskState::Accepted],
                to: TaskState::Completed,
                transition: TaskTransition::ProofAccept,
                actor_id: Some(fx.poster),
                reason: None,
                set_hustler: None,
                outbox: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fund_transitions_open_to_held_with_audit_trail() {
        let fx = fixture().await;
        let held = fx.engine.fund(fx.task).await.unwrap();
        assert_eq!(held.state, MoneyState::Held);
        assert_eq!(held.amount_cents, Some(5_000));
        assert!(held.payment_intent_id.is_some());

        let events = fx.store.money_events_for_task(fx.task).await.unwrap();
        let confirmed = events
            .iter()
            .filter(|e| e.phase == MoneyEventPhase::Confirmed)
            .count();
        assert_eq!(confirmed, 2); // intent + capture
    }

    #[tokio::test]
    async fn release_moves_money_once_and_emits_the_event() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        drive_to_completed(&fx).await;

        let outcome = fx.engine.release(fx.task).await.unwrap();
        assert!(matches!(outcome, ReleaseOutcome::Released(_)));
        assert_eq!(fx.provider.transfer_count(), 1);

        let counts = fx.store.counts().await.unwrap();
        // escrow.held fans to 1 queue, escrow.released to 4.
        assert_eq!(counts.pending, 5);
    }

    #[tokio::test]
    async fn duplicate_release_is_a_recorded_non_event() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        drive_to_completed(&fx).await;
        fx.engine.release(fx.task).await.unwrap();

        let again = fx.engine.release(fx.task).await.unwrap();
        assert!(matches!(again, ReleaseOutcome::AlreadyReleased(_)));
        assert_eq!(fx.provider.transfer_count(), 1);
    }

    #[tokio::test]
    async fn release_before_completion_is_vetoed_with_no_transfer() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();

        let err = fx.engine.release(fx.task).await.unwrap_err();
        assert!(matches!(
            err,
            MoneyError::Store(StoreError::InvariantViolation {
                code: InvariantCode::HX201,
                ..
            })
        ));
        assert_eq!(fx.provider.transfer_count(), 0);
        let escrow = fx.store.get_escrow(fx.task).await.unwrap().unwrap();
        assert_eq!(escrow.state, MoneyState::Held);
    }

    #[tokio::test]
    async fn timeout_leaves_held_with_a_dangling_initiated_row() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        drive_to_completed(&fx).await;
        fx.provider.plan_transfer_failure(PlannedFailure::TimeoutButLands);

        let err = fx.engine.release(fx.task).await.unwrap_err();
        assert!(matches!(err, MoneyError::ProviderTimeout));

        let escrow = fx.store.get_escrow(fx.task).await.unwrap().unwrap();
        assert_eq!(escrow.state, MoneyState::Held);

        let dangling = fx
            .store
            .initiated_without_outcome(Utc::now())
            .await
            .unwrap();
        assert!(dangling
            .iter()
            .any(|e| e.task_id == fx.task && e.idempotency_key.starts_with("transfer:")));
    }

    #[tokio::test]
    async fn full_refund_reaches_terminal_refunded() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        let outcome = fx.engine.refund(fx.task, None).await.unwrap();
        let RefundOutcome::Refunded(escrow) = outcome else {
            panic!("expected a fresh refund");
        };
        assert_eq!(escrow.state, MoneyState::Refunded);
        assert_eq!(escrow.refunded_cents, Some(5_000));

        // Terminal: a second refund is absorbed.
        let again = fx.engine.refund(fx.task, None).await.unwrap();
        assert!(matches!(again, RefundOutcome::AlreadyRefunded(_)));
    }

    #[tokio::test]
    async fn partial_refund_reaches_refund_partial() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        let outcome = fx.engine.refund(fx.task, Some(2_000)).await.unwrap();
        let RefundOutcome::Refunded(escrow) = outcome else {
            panic!("expected a fresh refund");
        };
        assert_eq!(escrow.state, MoneyState::RefundPartial);
        assert_eq!(escrow.refunded_cents, Some(2_000));
        assert_eq!(escrow.amount_cents, Some(5_000));
    }

    #[tokio::test]
    async fn dispute_lock_then_resolve_refund() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        let locked = fx.engine.lock_dispute(fx.task).await.unwrap();
        assert_eq!(locked.state, MoneyState::LockedDispute);

        // A plain release from dispute lock is refused.
        let err = fx.engine.release(fx.task).await.unwrap_err();
        assert!(matches!(err, MoneyError::InvalidState(_)));

        let outcome = fx
            .engine
            .resolve_dispute_refund(fx.task, None)
            .await
            .unwrap();
        assert!(matches!(outcome, RefundOutcome::Refunded(_)));
    }

    #[tokio::test]
    async fn force_release_requires_admin_and_audits() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        drive_to_completed(&fx).await;

        let err = fx
            .engine
            .force_release(fx.task, fx.poster, "not an admin".into())
            .await
            .unwrap_err();
        assert!(matches!(err, MoneyError::NotAuthorized(_)));

        let admin = user(Role::Admin);
        fx.store.create_user(admin.clone()).await.unwrap();
        let outcome = fx
            .engine
            .force_release(fx.task, admin.id, "support escalation".into())
            .await
            .unwrap();
        assert!(matches!(outcome, ReleaseOutcome::Released(_)));

        let audit = fx
            .store
            .admin_audit(hustlexp_storage::QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "force_release");
    }

    #[tokio::test]
    async fn terminal_rejection_is_audited_as_failed() {
        let fx = fixture().await;
        fx.engine.fund(fx.task).await.unwrap();
        drive_to_completed(&fx).await;
        fx.provider.plan_transfer_failure(PlannedFailure::Rejected {
            code: "account_closed".into(),
            message: "destination closed".into(),
        });

        let err = fx.engine.release(fx.task).await.unwrap_err();
        assert!(matches!(
            err,
            MoneyError::Provider(ProviderError::Rejected { .. })
        ));

        let events = fx.store.money_events_for_task(fx.task).await.unwrap();
        assert!(events.iter().any(|e| e.phase == MoneyEventPhase::Failed));
        let escrow = fx.store.get_escrow(fx.task).await.unwrap().unwrap();
        assert_eq!(escrow.state, MoneyState::Held);
    }
}
