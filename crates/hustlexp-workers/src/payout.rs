//! Payout dispatch worker.
//!
//! The release commit already moved the money under the stable transfer key;
//! this worker re-issues the same keyed call as an ensure step. The
//! provider's idempotency guarantee makes the steady-state call a read, and
//! recovery owns anything past the small local bound.

use crate::error::WorkerError;
use crate::fleet::QueueWorker;
use hustlexp_money::PaymentProvider;
use hustlexp_storage::{EscrowStore, HustleStore, OutboxRecord};
use hustlexp_types::{EventPayload, IdempotencyKey, MoneyOp, Queue};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PayoutWorker {
    store: Arc<dyn HustleStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl PayoutWorker {
    pub fn new(store: Arc<dyn HustleStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }
}

#[async_trait::async_trait]
impl QueueWorker for PayoutWorker {
    fn queue(&self) -> Queue {
        Queue::Payout
    }

    async fn handle(&self, record: &OutboxRecord) -> Result<(), WorkerError> {
        let payload = record
            .decode()
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        let EventPayload::EscrowReleased {
            task_id,
            hustler_id,
            amount_cents,
            ..
        } = payload
        else {
            debug!(event_type = record.event_type.as_str(), "payout worker ignoring event");
            return Ok(());
        };

        let escrow = self
            .store
            .get_escrow(task_id)
            .await
            .map_err(WorkerError::Store)?
            .ok_or_else(|| WorkerError::MalformedPayload(format!("escrow {task_id} missing")))?;

        let key = IdempotencyKey::for_op(MoneyOp::Transfer, task_id, escrow.version);
        let transfer = self
            .provider
            .transfer(&key, &hustler_id.to_string(), amount_cents)
            .await
            .map_err(hustlexp_money::MoneyError::from)?;

        if transfer.duplicate {
            debug!(task_id = %task_id, transfer_id = %transfer.transfer_id, "payout already settled");
        } else {
            // The release path should have moved the money; landing it here
            // means the commit raced a crash. Worth a loud line either way.
            warn!(task_id = %task_id, transfer_id = %transfer.transfer_id, "payout ensured by worker");
        }
        info!(task_id = %task_id, "payout verified");
        Ok(())
    }
}
