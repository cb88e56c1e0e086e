//! Realtime fan-out worker.
//!
//! Consumes `task.progress_updated` and delivers to the in-memory session
//! registry. Membership rule: only parties to the task receive the event.

use crate::error::WorkerError;
use crate::fleet::QueueWorker;
use crate::gateway::{RealtimeMessage, SessionRegistry};
use hustlexp_storage::OutboxRecord;
use hustlexp_types::{EventPayload, Queue};
use std::sync::Arc;
use tracing::debug;

pub struct RealtimeFanoutWorker {
    registry: Arc<SessionRegistry>,
}

impl RealtimeFanoutWorker {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl QueueWorker for RealtimeFanoutWorker {
    fn queue(&self) -> Queue {
        Queue::Realtime
    }

    async fn handle(&self, record: &OutboxRecord) -> Result<(), WorkerError> {
        let payload = record
            .decode()
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        let EventPayload::TaskProgressUpdated {
            task_id,
            state,
            poster_id,
            hustler_id,
            ..
        } = payload
        else {
            debug!(event_type = record.event_type.as_str(), "realtime worker ignoring event");
            return Ok(());
        };

        let message = RealtimeMessage {
            event_type: "task.progress_updated".to_string(),
            payload: serde_json::json!({
                "task_id": task_id.to_string(),
                "state": state.as_str(),
            }),
        };

        // Parties only; nobody else has a membership claim on this task.
        let mut delivered = self.registry.publish(poster_id, &message);
        if let Some(hustler) = hustler_id {
            delivered += self.registry.publish(hustler, &message);
        }
        debug!(task_id = %task_id, delivered, "realtime fan-out");
        Ok(())
    }
}
