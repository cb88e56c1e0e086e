//! Proof expiry sweep.
//!
//! Periodic, not queue-driven: proofs whose deadline passed while still
//! SUBMITTED are rejected and their tasks returned to ACCEPTED; OPEN tasks
//! past their expiry transition to EXPIRED.

use crate::error::WorkerError;
use chrono::{DateTime, Utc};
use hustlexp_storage::{HustleStore, StoreError, TaskStore, TaskTransitionRequest};
use hustlexp_types::{ProofState, TaskState, TaskTransition};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub proofs_expired: usize,
    pub tasks_expired: usize,
}

pub struct ProofExpirySweep {
    store: Arc<dyn HustleStore>,
}

impl ProofExpirySweep {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self { store }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, WorkerError> {
        let mut report = SweepReport::default();

        for proof in self.store.proofs_past_deadline(now).await? {
            self.store
                .set_proof_state(proof.id, ProofState::Rejected)
                .await?;
            // The task may have moved on (dispute, admin action); a state
            // conflict here is not an error for the sweep.
            let transition = self
                .store
                .transition_task(TaskTransitionRequest {
                    task_id: proof.task_id,
                    expected_from: vec![TaskState::ProofSubmitted],
                    to: TaskState::Accepted,
                    transition: TaskTransition::ProofReject,
                    actor_id: None,
                    reason: Some("proof deadline passed".to_string()),
                    set_hustler: None,
                    outbox: vec![],
                })
                .await;
            match transition {
                Ok(_) => report.proofs_expired += 1,
                Err(StoreError::StateConflict(_)) | Err(StoreError::InvariantViolation { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for task in self.store.open_tasks_expired_before(now).await? {
            let transition = self
                .store
                .transition_task(TaskTransitionRequest {
                    task_id: task.id,
                    expected_from: vec![TaskState::Open],
                    to: TaskState::Expired,
                    transition: TaskTransition::Expire,
                    actor_id: None,
                    reason: Some("listing expired".to_string()),
                    set_hustler: None,
                    outbox: vec![],
                })
                .await;
            match transition {
                Ok(_) => report.tasks_expired += 1,
                Err(StoreError::StateConflict(_)) | Err(StoreError::InvariantViolation { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if report != SweepReport::default() {
            info!(
                proofs_expired = report.proofs_expired,
                tasks_expired = report.tasks_expired,
                "expiry sweep"
            );
        }
        Ok(report)
    }
}
