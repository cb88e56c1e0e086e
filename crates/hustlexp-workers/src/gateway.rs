//! Push gateway seam and the in-memory realtime session registry.

use async_trait::async_trait;
use hustlexp_types::UserId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("push gateway unavailable: {0}")]
    Unavailable(String),

    #[error("recipient has no registered device")]
    NoDevice,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: UserId,
    pub title: String,
    pub body: String,
    /// Source event id; gateways may dedupe on (recipient, event_id) too.
    pub event_id: String,
}

/// Push notification gateway.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn push(&self, notification: &Notification) -> Result<(), GatewayError>;
}

/// Test gateway: records pushes, optionally fails the next N calls.
#[derive(Default)]
pub struct MockPushGateway {
    sent: Mutex<Vec<Notification>>,
    failures_remaining: Mutex<u32>,
}

impl MockPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures_remaining.lock().expect("gateway lock") = count;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("gateway lock").clone()
    }
}

#[async_trait]
impl PushGateway for MockPushGateway {
    async fn push(&self, notification: &Notification) -> Result<(), GatewayError> {
        {
            let mut failures = self.failures_remaining.lock().expect("gateway lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(GatewayError::Unavailable("injected".to_string()));
            }
        }
        self.sent
            .lock()
            .expect("gateway lock")
            .push(notification.clone());
        Ok(())
    }
}

/// A realtime message pushed to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
}

struct Session {
    session_id: String,
    sender: mpsc::Sender<RealtimeMessage>,
}

/// Per-process session registry keyed by user. Not durable: a dropped
/// session is closed and the client reconnects.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, Vec<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; the receiver is the client's stream.
    pub fn register(&self, user_id: UserId) -> (String, mpsc::Receiver<RealtimeMessage>) {
        let (sender, receiver) = mpsc::channel(64);
        let session_id = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .expect("registry lock")
            .entry(user_id)
            .or_default()
            .push(Session {
                session_id: session_id.clone(),
                sender,
            });
        (session_id, receiver)
    }

    pub fn close(&self, user_id: UserId, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("registry lock");
        if let Some(list) = sessions.get_mut(&user_id) {
            list.retain(|session| session.session_id != session_id);
            if list.is_empty() {
                sessions.remove(&user_id);
            }
        }
    }

    pub fn session_count(&self, user_id: UserId) -> usize {
        self.sessions
            .lock()
            .expect("registry lock")
            .get(&user_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Deliver to every live session of the user. Write failures mark the
    /// session closed; the client reconnects.
    pub fn publish(&self, user_id: UserId, message: &RealtimeMessage) -> usize {
        let mut sessions = self.sessions.lock().expect("registry lock");
        let Some(list) = sessions.get_mut(&user_id) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain(|session| match session.sender.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            sessions.remove(&user_id);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_registered_sessions_only() {
        let registry = SessionRegistry::new();
        let alice = UserId::generate();
        let bob = UserId::generate();
        let (_, mut alice_rx) = registry.register(alice);

        let message = RealtimeMessage {
            event_type: "task.progress_updated".into(),
            payload: serde_json::json!({}),
        };
        assert_eq!(registry.publish(alice, &message), 1);
        assert_eq!(registry.publish(bob, &message), 0);
        assert!(alice_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropped_receivers_close_the_session() {
        let registry = SessionRegistry::new();
        let alice = UserId::generate();
        let (_, receiver) = registry.register(alice);
        drop(receiver);

        let message = RealtimeMessage {
            event_type: "task.progress_updated".into(),
            payload: serde_json::json!({}),
        };
        assert_eq!(registry.publish(alice, &message), 0);
        assert_eq!(registry.session_count(alice), 0);
    }
}
