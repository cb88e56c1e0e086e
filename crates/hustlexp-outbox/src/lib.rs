//! Transactional outbox discipline.
//!
//! Producers write rows inside the domain transaction that produced them
//! (the storage layer's atomic operations take the rows directly); this
//! crate adds the standalone producer for event-only emissions and the
//! consumer claim/ack/retry protocol every worker shares.
//!
//! Consumer contract: claim marks rows in-flight under a lease; success
//! completes them; failure reschedules with jittered exponential backoff
//! until the attempt bound, after which the row is dead-lettered for
//! operator attention. Nothing is ever silently dropped.

#![deny(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use hustlexp_storage::{
    HustleStore, NewOutboxEvent, OutboxRecord, OutboxStatus, OutboxStore, RetryPolicy, StoreError,
};
use hustlexp_types::{EventId, EventPayload, Queue};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Standalone producer for emissions that have no surrounding domain write.
pub struct OutboxProducer {
    store: Arc<dyn HustleStore>,
}

impl OutboxProducer {
    pub fn new(store: Arc<dyn HustleStore>) -> Self {
        Self { store }
    }

    /// Fan the payload out to its queues; duplicate idempotency keys
    /// short-circuit to the existing rows.
    pub async fn emit(&self, payload: &EventPayload) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = self.store.enqueue(NewOutboxEvent::fan_out(payload)).await?;
        Ok(rows)
    }
}

/// Retry schedule for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    /// Attempts before a row moves to `dead`.
    pub max_attempts: u32,
    backoff: RetryPolicy,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: RetryPolicy::new(
                8,
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(600),
            ),
        }
    }
}

impl DeliveryPolicy {
    /// Where to schedule the next attempt, or `None` when the bound is
    /// exhausted and the row dead-letters.
    pub fn next_attempt(&self, attempts_so_far: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts_so_far + 1 >= self.max_attempts {
            return None;
        }
        let delay = self.backoff.delay_for(attempts_so_far + 1);
        Some(now + Duration::milliseconds(delay.as_millis() as i64))
    }
}

/// Per-queue consumer handle; workers share one claim/ack discipline.
pub struct OutboxConsumer {
    store: Arc<dyn HustleStore>,
    queue: Queue,
    policy: DeliveryPolicy,
    batch_size: usize,
    lease_ttl: Duration,
}

impl OutboxConsumer {
    pub fn new(store: Arc<dyn HustleStore>, queue: Queue) -> Self {
        Self {
            store,
            queue,
            policy: DeliveryPolicy::default(),
            batch_size: 16,
            lease_ttl: Duration::seconds(60),
        }
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Claim due rows for this queue.
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = self
            .store
            .claim_batch(self.queue, now, self.batch_size, self.lease_ttl)
            .await?;
        Ok(rows)
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self, event_id: EventId) -> Result<(), OutboxError> {
        self.store.mark_completed(event_id).await?;
        Ok(())
    }

    /// Record a failure: reschedule or dead-letter per the policy.
    pub async fn nack(
        &self,
        record: &OutboxRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboxStatus, OutboxError> {
        let next = self.policy.next_attempt(record.attempts, now);
        let status = self.store.mark_failed(record.id, error, next).await?;
        match status {
            OutboxStatus::Dead => {
                warn!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    attempts = record.attempts + 1,
                    error,
                    "outbox event dead-lettered"
                );
            }
            _ => {
                info!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    attempts = record.attempts + 1,
                    "outbox event rescheduled"
                );
            }
        }
        Ok(status)
    }

    /// Dead-letter a row immediately: non-retryable failures (invariant
    /// conflicts, malformed payloads) skip the backoff ladder.
    pub async fn fail_fatal(
        &self,
        record: &OutboxRecord,
        error: &str,
    ) -> Result<OutboxStatus, OutboxError> {
        let status = self.store.mark_failed(record.id, error, None).await?;
        warn!(
            event_id = %record.id,
            event_type = %record.event_type,
            error,
            "outbox event dead-lettered without retry"
        );
        Ok(status)
    }

    /// Return expired in-flight leases to pending (crashed-consumer
    /// recovery). Safe to run from any worker.
    pub async fn reclaim_leases(&self, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let reclaimed = self.store.reclaim_expired_leases(now).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed expired outbox leases");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hustlexp_storage::memory::InMemoryHustleStore;
    use hustlexp_types::{TaskId, UserId, EVENT_VERSION};

    fn released_payload() -> EventPayload {
        EventPayload::EscrowReleased {
            version: EVENT_VERSION,
            task_id: TaskId::generate(),
            poster_id: UserId::generate(),
            hustler_id: UserId::generate(),
            amount_cents: 5_000,
        }
    }

    #[tokio::test]
    async fn emit_claim_ack_lifecycle() {
        let store = Arc::new(InMemoryHustleStore::new());
        let producer = OutboxProducer::new(store.clone());
        let consumer = OutboxConsumer::new(store.clone(), Queue::XpAward);

        producer.emit(&released_payload()).await.unwrap();
        let now = Utc::now();
        let claimed = consumer.claim(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].queue, Queue::XpAward);

        consumer.ack(claimed[0].id).await.unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
    }

    #[tokio::test]
    async fn emit_is_idempotent() {
        let store = Arc::new(InMemoryHustleStore::new());
        let producer = OutboxProducer::new(store.clone());
        let payload = released_payload();
        producer.emit(&payload).await.unwrap();
        producer.emit(&payload).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending as usize, payload.queues().len());
    }

    #[tokio::test]
    async fn nack_reschedules_with_backoff_then_dead_letters() {
        let store = Arc::new(InMemoryHustleStore::new());
        let producer = OutboxProducer::new(store.clone());
        let policy = DeliveryPolicy {
            max_attempts: 2,
            ..DeliveryPolicy::default()
        };
        let consumer = OutboxConsumer::new(store.clone(), Queue::XpAward).with_policy(policy);

        producer.emit(&released_payload()).await.unwrap();
        let mut now = Utc::now();

        // Attempt 1 and 2 reschedule.
        for expected_attempts in 1..=2u32 {
            let claimed = consumer.claim(now + Duration::hours(24)).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {expected_attempts}");
            let status = consumer
                .nack(&claimed[0], "downstream unavailable", now)
                .await
                .unwrap();
            if expected_attempts < 2 {
                assert_eq!(status, OutboxStatus::Pending);
            } else {
                assert_eq!(status, OutboxStatus::Dead);
            }
            now = now + Duration::hours(24);
        }

        let dead = store
            .dead_letters(hustlexp_storage::QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert!(dead[0].last_error.is_some());
    }

    #[tokio::test]
    async fn backoff_schedule_grows() {
        let policy = DeliveryPolicy::default();
        let now = Utc::now();
        let first = policy.next_attempt(0, now).unwrap();
        let fifth = policy.next_attempt(4, now).unwrap();
        assert!(first > now);
        // The fifth ceiling dwarfs the first even with jitter.
        assert!(fifth - now >= (first - now));
        assert!(policy.next_attempt(7, now).is_none());
    }

    #[tokio::test]
    async fn claimed_rows_are_invisible_until_lease_expiry() {
        let store = Arc::new(InMemoryHustleStore::new());
        let producer = OutboxProducer::new(store.clone());
        let consumer = OutboxConsumer::new(store.clone(), Queue::XpAward);

        producer.emit(&released_payload()).await.unwrap();
        let now = Utc::now();
        assert_eq!(consumer.claim(now).await.unwrap().len(), 1);
        assert!(consumer.claim(now).await.unwrap().is_empty());

        // Crash simulation: lease expires, row returns to pending.
        let later = now + Duration::seconds(120);
        consumer.reclaim_leases(later).await.unwrap();
        assert_eq!(consumer.claim(later).await.unwrap().len(), 1);
    }
}
