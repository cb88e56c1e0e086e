//! Trust re-evaluation worker: recomputes tiers after completions and
//! disputes.

use crate::error::WorkerError;
use crate::fleet::QueueWorker;
use hustlexp_ledger::TrustEvaluator;
use hustlexp_storage::{HustleStore, OutboxRecord, TaskStore};
use hustlexp_types::{EventPayload, Queue};
use std::sync::Arc;
use tracing::debug;

pub struct TrustWorker {
    store: Arc<dyn HustleStore>,
    evaluator: TrustEvaluator,
}

impl TrustWorker {
    pub fn new(store: Arc<dyn HustleStore>, evaluator: TrustEvaluator) -> Self {
        Self { store, evaluator }
    }
}

#[async_trait::async_trait]
impl QueueWorker for TrustWorker {
    fn queue(&self) -> Queue {
        Queue::Trust
    }

    async fn handle(&self, record: &OutboxRecord) -> Result<(), WorkerError> {
        let payload = record
            .decode()
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        let subject = match payload {
            EventPayload::EscrowReleased { hustler_id, .. } => Some(hustler_id),
            EventPayload::TaskDisputed { task_id, .. } => self
                .store
                .get_task(task_id)
                .await
                .map_err(WorkerError::Store)?
                .and_then(|task| task.hustler_id),
            other => {
                debug!(event_type = other.event_type(), "trust worker ignoring event");
                None
            }
        };

        if let Some(user_id) = subject {
            self.evaluator
                .evaluate(user_id, &record.idempotency_key)
                .await?;
        }
        Ok(())
    }
}
