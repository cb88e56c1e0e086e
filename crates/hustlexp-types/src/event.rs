//! Versioned domain event payloads and queue routing.
//!
//! The producer owns these shapes. Consumers match on the serde tag and must
//! tolerate unknown future versions of other event types, which is why the
//! version rides inside the payload rather than in the type name.

use crate::id::{ProofId, TaskId, UserId};
use crate::task::TaskState;
use serde::{Deserialize, Serialize};

/// Current schema version stamped on every emitted payload.
pub const EVENT_VERSION: u16 = 1;

/// Outbox queue names; one worker type consumes each queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Queue {
    XpAward,
    Payout,
    Notifications,
    Trust,
    Realtime,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::XpAward => "xp_award",
            Queue::Payout => "payout",
            Queue::Notifications => "notifications",
            Queue::Trust => "trust",
            Queue::Realtime => "realtime",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "xp_award" => Some(Queue::XpAward),
            "payout" => Some(Queue::Payout),
            "notifications" => Some(Queue::Notifications),
            "trust" => Some(Queue::Trust),
            "realtime" => Some(Queue::Realtime),
            _ => None,
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tagged event payloads written to the outbox inside domain transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "escrow.held")]
    EscrowHeld {
        version: u16,
        task_id: TaskId,
        poster_id: UserId,
        amount_cents: i64,
    },
    #[serde(rename = "escrow.released")]
    EscrowReleased {
        version: u16,
        task_id: TaskId,
        poster_id: UserId,
        hustler_id: UserId,
        amount_cents: i64,
    },
    #[serde(rename = "escrow.refunded")]
    EscrowRefunded {
        version: u16,
        task_id: TaskId,
        poster_id: UserId,
        amount_cents: i64,
        partial: bool,
    },
    #[serde(rename = "task.progress_updated")]
    TaskProgressUpdated {
        version: u16,
        task_id: TaskId,
        state: TaskState,
        poster_id: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        hustler_id: Option<UserId>,
    },
    #[serde(rename = "task.disputed")]
    TaskDisputed {
        version: u16,
        task_id: TaskId,
        opened_by: UserId,
    },
    #[serde(rename = "proof.submitted")]
    ProofSubmitted {
        version: u16,
        task_id: TaskId,
        proof_id: ProofId,
        submitter_id: UserId,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::EscrowHeld { .. } => "escrow.held",
            EventPayload::EscrowReleased { .. } => "escrow.released",
            EventPayload::EscrowRefunded { .. } => "escrow.refunded",
            EventPayload::TaskProgressUpdated { .. } => "task.progress_updated",
            EventPayload::TaskDisputed { .. } => "task.disputed",
            EventPayload::ProofSubmitted { .. } => "proof.submitted",
        }
    }

    pub fn version(&self) -> u16 {
        match self {
            EventPayload::EscrowHeld { version, .. }
            | EventPayload::EscrowReleased { version, .. }
            | EventPayload::EscrowRefunded { version, .. }
            | EventPayload::TaskProgressUpdated { version, .. }
            | EventPayload::TaskDisputed { version, .. }
            | EventPayload::ProofSubmitted { version, .. } => *version,
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            EventPayload::EscrowHeld { task_id, .. }
            | EventPayload::EscrowReleased { task_id, .. }
            | EventPayload::EscrowRefunded { task_id, .. }
            | EventPayload::TaskProgressUpdated { task_id, .. }
            | EventPayload::TaskDisputed { task_id, .. }
            | EventPayload::ProofSubmitted { task_id, .. } => *task_id,
        }
    }

    /// The queues this event fans out to; the producer writes one outbox row
    /// per queue.
    pub fn queues(&self) -> &'static [Queue] {
        match self {
            EventPayload::EscrowHeld { .. } => &[Queue::Notifications],
            EventPayload::EscrowReleased { .. } => {
                &[Queue::XpAward, Queue::Payout, Queue::Notifications, Queue::Trust]
            }
            EventPayload::EscrowRefunded { .. } => &[Queue::Notifications],
            EventPayload::TaskProgressUpdated { .. } => &[Queue::Realtime],
            EventPayload::TaskDisputed { .. } => &[Queue::Notifications, Queue::Trust],
            EventPayload::ProofSubmitted { .. } => &[Queue::Notifications],
        }
    }

    /// Durable dedup key for one (event, queue) outbox row.
    pub fn idempotency_key(&self, queue: Queue) -> String {
        format!(
            "{}:{}:{}:{}",
            self.event_type(),
            self.task_id(),
            self.version(),
            queue
        )
    }
}
