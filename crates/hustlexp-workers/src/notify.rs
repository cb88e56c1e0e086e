//! Notification worker.
//!
//! Consumes several event types and pushes through the gateway; duplicates
//! are deduplicated by `(recipient, event_id)`.

use crate::error::WorkerError;
use crate::fleet::QueueWorker;
use crate::gateway::{Notification, PushGateway};
use hustlexp_storage::{HustleStore, OutboxRecord, TaskStore};
use hustlexp_types::{EventPayload, Queue, UserId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct NotificationWorker {
    store: Arc<dyn HustleStore>,
    gateway: Arc<dyn PushGateway>,
    seen: Mutex<HashSet<(UserId, String)>>,
}

impl NotificationWorker {
    pub fn new(store: Arc<dyn HustleStore>, gateway: Arc<dyn PushGateway>) -> Self {
        Self {
            store,
            gateway,
            seen: Mutex::new(HashSet::new()),
        }
    }

    async fn build(&self, record: &OutboxRecord) -> Result<Vec<Notification>, WorkerError> {
        let payload = record
            .decode()
            .map_err(|e| WorkerError::MalformedPayload(e.to_string()))?;
        let event_id = record.idempotency_key.clone();

        let notifications = match payload {
            EventPayload::EscrowHeld {
                poster_id,
                amount_cents,
                ..
            } => vec![Notification {
                recipient: poster_id,
                title: "Payment secured".to_string(),
                body: format!("${}.{:02} is held in escrow.", amount_cents / 100, amount_cents % 100),
                event_id,
            }],
            EventPayload::EscrowReleased {
                hustler_id,
                amount_cents,
                ..
            } => vec![Notification {
                recipient: hustler_id,
                title: "You got paid".to_string(),
                body: format!(
                    "${}.{:02} is on its way to your account.",
                    amount_cents / 100,
                    amount_cents % 100
                ),
                event_id,
            }],
            EventPayload::EscrowRefunded {
                poster_id,
                amount_cents,
                partial,
                ..
            } => vec![Notification {
                recipient: poster_id,
                title: if partial {
                    "Partial refund issued".to_string()
                } else {
                    "Refund issued".to_string()
                },
                body: format!("${}.{:02} refunded.", amount_cents / 100, amount_cents % 100),
                event_id,
            }],
            EventPayload::TaskDisputed {
                task_id, opened_by, ..
            } => {
                // Notify the counterparty.
                let task = self
                    .store
                    .get_task(task_id)
                    .await
                    .map_err(WorkerError::Store)?;
                let mut recipients = Vec::new();
                if let Some(task) = task {
                    if task.poster_id != opened_by {
                        recipients.push(task.poster_id);
                    }
                    if let Some(hustler) = task.hustler_id {
                        if hustler != opened_by {
                            recipients.push(hustler);
                        }
                    }
                }
                recipients
                    .into_iter()
                    .map(|recipient| Notification {
                        recipient,
                        title: "Task disputed".to_string(),
                        body: "A dispute was opened on your task.".to_string(),
                        event_id: event_id.clone(),
                    })
                    .collect()
            }
            EventPayload::ProofSubmitted { task_id, .. } => {
                let task = self
                    .store
                    .get_task(task_id)
                    .await
                    .map_err(WorkerError::Store)?;
                match task {
                    Some(task) => vec![Notification {
                        recipient: task.poster_id,
                        title: "Proof submitted".to_string(),
                        body: "Review the submitted proof to release payment.".to_string(),
                        event_id,
                    }],
                    None => vec![],
                }
            }
            other => {
                debug!(event_type = other.event_type(), "notify worker ignoring event");
                vec![]
            }
        };
        Ok(notifications)
    }
}

#[async_trait::async_trait]
impl QueueWorker for NotificationWorker {
    fn queue(&self) -> Queue {
        Queue::Notifications
    }

    async fn handle(&self, record: &OutboxRecord) -> Result<(), WorkerError> {
        for notification in self.build(record).await? {
            let dedupe_key = (notification.recipient, notification.event_id.clone());
            {
                let seen = self.seen.lock().expect("dedupe lock");
                if seen.contains(&dedupe_key) {
                    debug!(recipient = %notification.recipient, "duplicate notification dropped");
                    continue;
                }
            }
            self.gateway.push(&notification).await?;
            self.seen.lock().expect("dedupe lock").insert(dedupe_key);
        }
        Ok(())
    }
}
