//! Task lifecycle state machine.
//!
//! ```text
//! OPEN ──claim──▶ ACCEPTED ──proof_submit──▶ PROOF_SUBMITTED
//!                      │                         │
//!                      │                         ├─accept─▶ COMPLETED (terminal)
//!                      │                         └─reject─▶ ACCEPTED
//!                      ├─dispute──▶ DISPUTED ──resolve──▶ COMPLETED | CANCELLED
//!                      └─cancel──▶ CANCELLED (terminal)
//! OPEN ──expire──▶ EXPIRED (terminal)
//! ```
//!
//! Every transition is a compare-and-set in the store with an atomic
//! state-log append; concurrent conflicting transitions resolve through the
//! store's serialization retry. Role preconditions live here; the
//! constitutional checks (terminal freeze, completion-requires-proof) live in
//! the storage layer and are never re-checked above it.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use hustlexp_storage::{
    AdminAuditAppend, HustleStore, NewOutboxEvent, ProofRecord, StoreError, TaskRecord,
    TaskStore, TaskTransitionRequest, UserStore,
};
use hustlexp_types::{
    ErrorKind, EventPayload, ProofId, ProofState, Role, TaskId, TaskState, TaskTransition, UserId,
    EVENT_VERSION,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// How an admin resolves a dispute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisputeResolution {
    /// Complete the task in the hustler's favor.
    Complete,
    /// Cancel the task in the poster's favor.
    Cancel,
}

/// Task-lifecycle errors.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NotFound(_) => ErrorKind::NotFound,
            TaskError::NotAuthorized(_) => ErrorKind::Authorization,
            TaskError::Validation(_) => ErrorKind::Validation,
            TaskError::Store(err) => err.kind(),
        }
    }
}

/// The task state machine, acting through the shared store.
pub struct TaskLifecycle {
    store: Arc<dyn HustleStore>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self { store }
    }

    async fn require_task(&self, task_id: TaskId) -> Result<TaskRecord, TaskError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))
    }

    fn progress_event(task: &TaskRecord, to: TaskState) -> Vec<NewOutboxEvent> {
        NewOutboxEvent::fan_out(&EventPayload::TaskProgressUpdated {
            version: EVENT_VERSION,
            task_id: task.id,
            state: to,
            poster_id: task.poster_id,
            hustler_id: task.hustler_id,
        })
    }

    /// Create a task in OPEN together with its escrow row.
    pub async fn create_task(
        &self,
        poster_id: UserId,
        category: &str,
        price_cents: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<TaskRecord, TaskError> {
        if price_cents <= 0 {
            return Err(TaskError::Validation(
                "price_cents must be positive".to_string(),
            ));
        }
        if category.trim().is_empty() {
            return Err(TaskError::Validation("category must not be empty".to_string()));
        }
        let poster = self
            .store
            .get_user(poster_id)
            .await?
            .ok_or_else(|| TaskError::NotAuthorized(format!("unknown user {poster_id}")))?;
        if poster.archived {
            return Err(TaskError::NotAuthorized("archived user".to_string()));
        }
        if poster.role == Role::Hustler {
            return Err(TaskError::NotAuthorized(
                "hustlers cannot post tasks".to_string(),
            ));
        }

        let now = Utc::now();
        let task = TaskRecord {
            id: TaskId::generate(),
            poster_id,
            hustler_id: None,
            category: category.to_string(),
            price_cents,
            state: TaskState::Open,
            expires_at,
            created_at: now,
            updated_at: now,
        };
        self.store.create_task(task.clone()).await?;
        info!(task_id = %task.id, price_cents, "task created");
        Ok(task)
    }

    /// OPEN → ACCEPTED; records the hustler.
    pub async fn claim(&self, task_id: TaskId, hustler_id: UserId) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        let hustler = self
            .store
            .get_user(hustler_id)
            .await?
            .ok_or_else(|| TaskError::NotAuthorized(format!("unknown user {hustler_id}")))?;
        if hustler.archived {
            return Err(TaskError::NotAuthorized("archived user".to_string()));
        }
        if hustler.role != Role::Hustler {
            return Err(TaskError::NotAuthorized(
                "only hustlers claim tasks".to_string(),
            ));
        }
        if task.poster_id == hustler_id {
            return Err(TaskError::NotAuthorized(
                "posters cannot claim their own task".to_string(),
            ));
        }

        let mut outbox_task = task.clone();
        outbox_task.hustler_id = Some(hustler_id);
        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::Open],
                to: TaskState::Accepted,
                transition: TaskTransition::Claim,
                actor_id: Some(hustler_id),
                reason: None,
                set_hustler: Some(hustler_id),
                outbox: Self::progress_event(&outbox_task, TaskState::Accepted),
            })
            .await?;
        info!(task_id = %task_id, hustler_id = %hustler_id, "task claimed");
        Ok(updated)
    }

    /// ACCEPTED → PROOF_SUBMITTED; only the current hustler submits.
    pub async fn submit_proof(
        &self,
        task_id: TaskId,
        submitter_id: UserId,
        artifact_keys: Vec<String>,
        deadline_at: DateTime<Utc>,
    ) -> Result<ProofRecord, TaskError> {
        if artifact_keys.is_empty() {
            return Err(TaskError::Validation(
                "a proof needs at least one artifact".to_string(),
            ));
        }
        let task = self.require_task(task_id).await?;
        if task.hustler_id != Some(submitter_id) {
            return Err(TaskError::NotAuthorized(
                "only the current hustler submits proof".to_string(),
            ));
        }

        let now = Utc::now();
        let proof = ProofRecord {
            id: ProofId::generate(),
            task_id,
            submitter_id,
            artifact_keys,
            state: ProofState::Submitted,
            deadline_at,
            created_at: now,
            updated_at: now,
        };
        let proof_event = NewOutboxEvent::fan_out(&EventPayload::ProofSubmitted {
            version: EVENT_VERSION,
            task_id,
            proof_id: proof.id,
            submitter_id,
        });
        self.store.create_proof(proof.clone(), proof_event).await?;

        self.store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::Accepted],
                to: TaskState::ProofSubmitted,
                transition: TaskTransition::ProofSubmit,
                actor_id: Some(submitter_id),
                reason: None,
                set_hustler: None,
                outbox: Self::progress_event(&task, TaskState::ProofSubmitted),
            })
            .await?;
        info!(task_id = %task_id, proof_id = %proof.id, "proof submitted");
        Ok(proof)
    }

    /// PROOF_SUBMITTED → COMPLETED; the proof flips to ACCEPTED first so the
    /// completion gate holds at commit.
    pub async fn accept_proof(
        &self,
        task_id: TaskId,
        actor_id: UserId,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        self.require_poster_or_admin(&task, actor_id).await?;

        let proof = self
            .store
            .latest_proof_for_task(task_id)
            .await?
            .ok_or_else(|| TaskError::Validation("no proof to accept".to_string()))?;
        if proof.state != ProofState::Submitted {
            return Err(TaskError::Validation(format!(
                "proof is {}, expected SUBMITTED",
                proof.state
            )));
        }
        self.store
            .set_proof_state(proof.id, ProofState::Accepted)
            .await?;

        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::ProofSubmitted],
                to: TaskState::Completed,
                transition: TaskTransition::ProofAccept,
                actor_id: Some(actor_id),
                reason: None,
                set_hustler: None,
                outbox: Self::progress_event(&task, TaskState::Completed),
            })
            .await?;
        info!(task_id = %task_id, "proof accepted, task completed");
        Ok(updated)
    }

    /// PROOF_SUBMITTED → ACCEPTED (back to work).
    pub async fn reject_proof(
        &self,
        task_id: TaskId,
        actor_id: UserId,
        reason: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        self.require_poster_or_admin(&task, actor_id).await?;

        let proof = self
            .store
            .latest_proof_for_task(task_id)
            .await?
            .ok_or_else(|| TaskError::Validation("no proof to reject".to_string()))?;
        if proof.state != ProofState::Submitted {
            return Err(TaskError::Validation(format!(
                "proof is {}, expected SUBMITTED",
                proof.state
            )));
        }
        self.store
            .set_proof_state(proof.id, ProofState::Rejected)
            .await?;

        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::ProofSubmitted],
                to: TaskState::Accepted,
                transition: TaskTransition::ProofReject,
                actor_id: Some(actor_id),
                reason,
                set_hustler: None,
                outbox: Self::progress_event(&task, TaskState::Accepted),
            })
            .await?;
        Ok(updated)
    }

    /// ACCEPTED | PROOF_SUBMITTED → DISPUTED; either party may open.
    pub async fn dispute(
        &self,
        task_id: TaskId,
        opened_by: UserId,
        reason: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        let is_party = task.poster_id == opened_by || task.hustler_id == Some(opened_by);
        if !is_party {
            return Err(TaskError::NotAuthorized(
                "only parties to the task may dispute".to_string(),
            ));
        }

        let mut outbox = NewOutboxEvent::fan_out(&EventPayload::TaskDisputed {
            version: EVENT_VERSION,
            task_id,
            opened_by,
        });
        outbox.extend(Self::progress_event(&task, TaskState::Disputed));

        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::Accepted, TaskState::ProofSubmitted],
                to: TaskState::Disputed,
                transition: TaskTransition::Dispute,
                actor_id: Some(opened_by),
                reason,
                set_hustler: None,
                outbox,
            })
            .await?;
        info!(task_id = %task_id, opened_by = %opened_by, "dispute opened");
        Ok(updated)
    }

    /// DISPUTED → COMPLETED | CANCELLED, admin only. Resolving in the
    /// hustler's favor accepts the pending proof when one exists, so the
    /// completion gate is satisfied.
    pub async fn resolve_dispute(
        &self,
        task_id: TaskId,
        admin_id: UserId,
        resolution: DisputeResolution,
        reason: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        self.require_admin(admin_id).await?;

        let (to, transition) = match resolution {
            DisputeResolution::Complete => (TaskState::Completed, TaskTransition::ResolveComplete),
            DisputeResolution::Cancel => (TaskState::Cancelled, TaskTransition::ResolveCancel),
        };

        if resolution == DisputeResolution::Complete {
            let proof = self
                .store
                .latest_proof_for_task(task_id)
                .await?
                .ok_or_else(|| {
                    TaskError::Validation(
                        "cannot resolve to COMPLETED without a proof".to_string(),
                    )
                })?;
            if proof.state == ProofState::Submitted {
                self.store
                    .set_proof_state(proof.id, ProofState::Accepted)
                    .await?;
            } else if proof.state == ProofState::Rejected {
                return Err(TaskError::Validation(
                    "cannot resolve to COMPLETED over a rejected proof".to_string(),
                ));
            }
        }

        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::Disputed],
                to,
                transition,
                actor_id: Some(admin_id),
                reason,
                set_hustler: None,
                outbox: Self::progress_event(&task, to),
            })
            .await?;
        info!(task_id = %task_id, resolution = ?resolution, "dispute resolved");
        Ok(updated)
    }

    /// ACCEPTED → CANCELLED; poster or admin.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        actor_id: UserId,
        reason: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        self.require_poster_or_admin(&task, actor_id).await?;

        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::Accepted],
                to: TaskState::Cancelled,
                transition: TaskTransition::Cancel,
                actor_id: Some(actor_id),
                reason,
                set_hustler: None,
                outbox: Self::progress_event(&task, TaskState::Cancelled),
            })
            .await?;
        Ok(updated)
    }

    /// OPEN → EXPIRED; driven by the expiry sweep.
    pub async fn expire(&self, task_id: TaskId) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        let updated = self
            .store
            .transition_task(TaskTransitionRequest {
                task_id,
                expected_from: vec![TaskState::Open],
                to: TaskState::Expired,
                transition: TaskTransition::Expire,
                actor_id: None,
                reason: None,
                set_hustler: None,
                outbox: Self::progress_event(&task, TaskState::Expired),
            })
            .await?;
        Ok(updated)
    }

    /// Admin override: any state change, frozen rows included, with the
    /// mandatory audit row in the same transaction.
    pub async fn admin_override(
        &self,
        task_id: TaskId,
        admin_id: UserId,
        to: TaskState,
        reason: String,
    ) -> Result<TaskRecord, TaskError> {
        let task = self.require_task(task_id).await?;
        self.require_admin(admin_id).await?;

        let audit = AdminAuditAppend {
            actor_id: admin_id,
            action: "task_state_override".to_string(),
            target_kind: "task".to_string(),
            target_id: task_id.to_string(),
            before: serde_json::json!({ "state": task.state.as_str() }),
            after: serde_json::json!({ "state": to.as_str() }),
            reason: reason.clone(),
        };
        let updated = self
            .store
            .admin_override_task(
                TaskTransitionRequest {
                    task_id,
                    expected_from: vec![],
                    to,
                    transition: TaskTransition::AdminOverride,
                    actor_id: Some(admin_id),
                    reason: Some(reason),
                    set_hustler: None,
                    outbox: Self::progress_event(&task, to),
                },
                audit,
            )
            .await?;
        info!(task_id = %task_id, admin_id = %admin_id, to = %to, "admin override");
        Ok(updated)
    }

    async fn require_poster_or_admin(
        &self,
        task: &TaskRecord,
        actor_id: UserId,
    ) -> Result<(), TaskError> {
        if task.poster_id == actor_id {
            return Ok(());
        }
        let actor = self
            .store
            .get_user(actor_id)
            .await?
            .ok_or_else(|| TaskError::NotAuthorized(format!("unknown user {actor_id}")))?;
        if actor.role == Role::Admin {
            Ok(())
        } else {
            Err(TaskError::NotAuthorized(
                "only the poster or an admin may do this".to_string(),
            ))
        }
    }

    async fn require_admin(&self, actor_id: UserId) -> Result<(), TaskError> {
        let actor = self
            .store
            .get_user(actor_id)
            .await?
            .ok_or_else(|| TaskError::NotAuthorized(format!("unknown user {actor_id}")))?;
        if actor.role == Role::Admin {
            Ok(())
        } else {
            Err(TaskError::NotAuthorized("admin only".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hustlexp_storage::memory::InMemoryHustleStore;
    use hustlexp_storage::{LedgerStore, UserRecord};
    use hustlexp_types::{InvariantCode, TrustTier};

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

    struct Fixture {
        lifecycle: TaskLifecycle,
        store: Arc<InMemoryHustleStore>,
        poster: UserRecord,
        hustler: UserRecord,
        admin: UserRecord,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryHustleStore::new());
        let poster = user(Role::Poster);
        let hustler = user(Role::Hustler);
        let admin = user(Role::Admin);
        store.create_user(poster.clone()).await.unwrap();
        store.create_user(hustler.clone()).await.unwrap();
        store.create_user(admin.clone()).await.unwrap();
        Fixture {
            lifecycle: TaskLifecycle::new(store.clone()),
            store,
            poster,
            hustler,
            admin,
        }
    }

    async fn task_through_proof(fx: &Fixture) -> TaskRecord {
        let task = fx
            .lifecycle
            .create_task(fx.poster.id, "errands", 5_000, None)
            .await
            .unwrap();
        fx.lifecycle.claim(task.id, fx.hustler.id).await.unwrap();
        fx.lifecycle
            .submit_proof(
                task.id,
                fx.hustler.id,
                vec!["proofs/a.jpg".into(), "proofs/b.jpg".into()],
                Utc::now() + chrono::Duration::hours(24),
            )
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn happy_path_reaches_completed_with_state_log() {
        let fx = fixture().await;
        let task = task_through_proof(&fx).await;
        let updated = fx.lifecycle.accept_proof(task.id, fx.poster.id).await.unwrap();
        assert_eq!(updated.state, TaskState::Completed);

        // One state-log row per committed change, genesis included.
        let log = fx.store.state_log_for_task(task.id).await.unwrap();
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

    #[tokio::test]
    async fn only_the_current_hustler_submits_proof() {
        let fx = fixture().await;
        let task = fx
            .lifecycle
            .create_task(fx.poster.id, "errands", 5_000, None)
            .await
            .unwrap();
        fx.lifecycle.claim(task.id, fx.hustler.id).await.unwrap();

        let stranger = user(Role::Hustler);
        fx.store.create_user(stranger.clone()).await.unwrap();
        let err = fx
            .lifecycle
            .submit_proof(task.id, stranger.id, vec!["k".into()], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn poster_cannot_claim_own_task() {
        let fx = fixture().await;
        // Poster needs a hustler role to even pass the role gate; use a
        // second account with both sides to hit the self-claim check.
        let both = user(Role::Hustler);
        fx.store.create_user(both.clone()).await.unwrap();
        let task = fx
            .lifecycle
            .create_task(fx.poster.id, "errands", 5_000, None)
            .await
            .unwrap();
        let err = fx.lifecycle.claim(task.id, fx.poster.id).await.unwrap_err();
        assert!(matches!(err, TaskError::NotAuthorized(_)));
        assert!(fx.lifecycle.claim(task.id, both.id).await.is_ok());
    }

    #[tokio::test]
    async fn reject_returns_task_to_accepted() {
        let fx = fixture().await;
        let task = task_through_proof(&fx).await;
        let updated = fx
            .lifecycle
            .reject_proof(task.id, fx.poster.id, Some("blurry".into()))
            .await
            .unwrap();
        assert_eq!(updated.state, TaskState::Accepted);

        // A fresh proof can be submitted and accepted afterwards.
        fx.lifecycle
            .submit_proof(
                task.id,
                fx.hustler.id,
                vec!["proofs/c.jpg".into()],
                Utc::now() + chrono::Duration::hours(24),
            )
            .await
            .unwrap();
        let done = fx.lifecycle.accept_proof(task.id, fx.poster.id).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn dispute_from_proof_submitted_resolves_either_way() {
        let fx = fixture().await;
        let task = task_through_proof(&fx).await;
        fx.lifecycle
            .dispute(task.id, fx.poster.id, Some("not done".into()))
            .await
            .unwrap();

        let resolved = fx
            .lifecycle
            .resolve_dispute(
                task.id,
                fx.admin.id,
                DisputeResolution::Complete,
                Some("proof checks out".into()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn dispute_is_party_only() {
        let fx = fixture().await;
        let task = task_through_proof(&fx).await;
        let stranger = user(Role::Hustler);
        fx.store.create_user(stranger.clone()).await.unwrap();
        let err = fx
            .lifecycle
            .dispute(task.id, stranger.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn terminal_tasks_reject_further_transitions() {
        let fx = fixture().await;
        let task = task_through_proof(&fx).await;
        fx.lifecycle.accept_proof(task.id, fx.poster.id).await.unwrap();

        let err = fx
            .lifecycle
            .cancel(task.id, fx.poster.id, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::Store(StoreError::InvariantViolation {
                code: InvariantCode::HX001,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn admin_override_writes_audit_row() {
        let fx = fixture().await;
        let task = task_through_proof(&fx).await;
        fx.lifecycle.accept_proof(task.id, fx.poster.id).await.unwrap();

        fx.lifecycle
            .admin_override(task.id, fx.admin.id, TaskState::Disputed, "fraud review".into())
            .await
            .unwrap();

        let audit = fx
            .store
            .admin_audit(hustlexp_storage::QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "task_state_override");
    }

    #[tokio::test]
    async fn accept_without_proof_fails_validation() {
        let fx = fixture().await;
        let task = fx
            .lifecycle
            .create_task(fx.poster.id, "errands", 5_000, None)
            .await
            .unwrap();
        fx.lifecycle.claim(task.id, fx.hustler.id).await.unwrap();
        let err = fx
            .lifecycle
            .accept_proof(task.id, fx.poster.id)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[tokio::test]
    async fn expire_only_applies_to_open_tasks() {
        let fx = fixture().await;
        let task = fx
            .lifecycle
            .create_task(fx.poster.id, "errands", 5_000, None)
            .await
            .unwrap();
        fx.lifecycle.claim(task.id, fx.hustler.id).await.unwrap();
        let err = fx.lifecycle.expire(task.id).await.unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::StateConflict(_))));
    }
}
