//! XP award worker: the sole consumer that turns `escrow.released` into an
//! XP ledger row.

use crate::error::WorkerError;
use crate::fleet::QueueWorker;
use hustlexp_ledger::XpAwarder;
use hustlexp_storage::OutboxRecord;
use hustlexp_types::{EventPayload, Queue};
use tracing::debug;

pub struct XpAwardWorker {
    awarder: XpAwarder,
}

impl XpAwardWorker {
    pub fn new(awarder: XpAwarder) -> Self {
        Self { awarder }
    }
}

#[async_trait::async_trait]
impl QueueWorker for XpAwardWorker {
    fn queue(&self) -> Queue {
        Queue::XpAward
    }

    async fn handle(&self, record: &OutboxRecord) -> Result<(), WorkerError> {
        let payload = record
            .decode()
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        match payload {
            EventPayload::EscrowReleased { task_id, .. } => {
                self.awarder.award_for_release(task_id).await?;
                Ok(())
            }
            other => {
                debug!(event_type = other.event_type(), "xp worker ignoring event");
                Ok(())
            }
        }
    }
}
