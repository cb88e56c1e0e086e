//! Provider webhook ingress.
//!
//! Verifies the provider signature (HMAC-SHA256 over `"{timestamp}.{body}"`
//! with a timestamp tolerance), dedupes by provider event id through the
//! append-only money-event audit, and turns the event into an idempotent
//! command against the money engine.

use crate::engine::{MoneyEngine, MoneyError};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use hustlexp_storage::{HustleStore, LedgerStore, NewMoneyEvent};
use hustlexp_types::{IdempotencyKey, MoneyEventPhase, MoneyOp, TaskId};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("malformed signature header")]
    MalformedSignature,

    #[error("signature mismatch")]
    BadSignature,

    #[error("timestamp outside tolerance")]
    StaleTimestamp,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Signature verifier for `t=<unix>,v1=<hex>` headers.
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Duration::minutes(5),
        }
    }

    pub fn verify(
        &self,
        body: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let mut timestamp = None;
        let mut signature = None;
        for part in signature_header.split(',') {
            match part.split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signature = Some(value.to_string()),
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(WebhookError::MalformedSignature),
        };

        let skew = (now.timestamp() - timestamp).abs();
        if skew > self.tolerance.num_seconds() {
            return Err(WebhookError::StaleTimestamp);
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| WebhookError::MalformedSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        // Constant-time-ish comparison over the decoded bytes.
        let provided = hex::decode(&signature).map_err(|_| WebhookError::MalformedSignature)?;
        let expected_bytes = hex::decode(&expected).expect("own hex encoding is valid");
        if provided.len() != expected_bytes.len()
            || provided
                .iter()
                .zip(expected_bytes.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                != 0
        {
            return Err(WebhookError::BadSignature);
        }
        Ok(())
    }

    /// Produce a header for a body (test + client-simulation helper).
    pub fn sign(&self, body: &[u8], at: DateTime<Utc>) -> String {
        let timestamp = at.timestamp();
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }
}

/// The provider event shapes the ingress understands.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    /// Provider-side event id, the dedup key.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: String,
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

/// What the ingress did with a verified event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Seen before; nothing done.
    Duplicate,
    /// Recorded, no state change required.
    Recorded,
    /// Mapped to a money command and applied.
    Applied,
    /// Recognized but irrelevant to the money lifecycle.
    Ignored,
}

/// Webhook ingress bound to the engine and store.
pub struct WebhookIngress {
    verifier: SignatureVerifier,
    store: Arc<dyn HustleStore>,
    engine: Arc<MoneyEngine>,
}

impl WebhookIngress {
    pub fn new(
        verifier: SignatureVerifier,
        store: Arc<dyn HustleStore>,
        engine: Arc<MoneyEngine>,
    ) -> Self {
        Self {
            verifier,
            store,
            engine,
        }
    }

    pub async fn process(
        &self,
        body: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        self.verifier.verify(body, signature_header, now)?;

        let event: ProviderEvent = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        let task_id = TaskId::parse(&event.task_id)
            .ok_or_else(|| WebhookError::MalformedPayload(format!("bad task id {}", event.task_id)))?;

        // Dedupe by provider event id through the append-only audit.
        let dedupe_key = IdempotencyKey::for_webhook(&event.id);
        let outcome = self
            .store
            .append_money_event(NewMoneyEvent {
                task_id,
                op: MoneyOp::Capture,
                phase: MoneyEventPhase::Confirmed,
                idempotency_key: dedupe_key.as_str().to_string(),
                provider_ref: Some(event.id.clone()),
                detail: serde_json::json!({ "type": event.event_type }),
            })
            .await
            .map_err(MoneyError::from)?;
        if outcome.is_duplicate() {
            info!(event_id = %event.id, "duplicate webhook dropped");
            return Ok(WebhookOutcome::Duplicate);
        }

        match event.event_type.as_str() {
            // Synchronous flows already committed these; the webhook is the
            // provider's confirmation and needs no further action.
            "payment_intent.succeeded" | "transfer.paid" => Ok(WebhookOutcome::Recorded),
            // A provider-initiated refund (e.g. card dispute chargeback)
            // becomes the idempotent refund command.
            "charge.refunded" => match self.engine.refund(task_id, event.amount_cents).await {
                Ok(_) => Ok(WebhookOutcome::Applied),
                // Already terminal: the command is a non-event.
                Err(MoneyError::InvalidState(_)) => Ok(WebhookOutcome::Recorded),
                Err(err) => Err(err.into()),
            },
            _ => Ok(WebhookOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let verifier = SignatureVerifier::new(b"whsec_test".to_vec());
        let body = br#"{"id":"evt_1","type":"transfer.paid","task_id":"x"}"#;
        let now = Utc::now();
        let header = verifier.sign(body, now);
        assert!(verifier.verify(body, &header, now).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let verifier = SignatureVerifier::new(b"whsec_test".to_vec());
        let now = Utc::now();
        let header = verifier.sign(b"original", now);
        assert!(matches!(
            verifier.verify(b"tampered", &header, now),
            Err(WebhookError::BadSignature)
        ));
    }

    #[test]
    fn stale_timestamps_are_rejected() {
        let verifier = SignatureVerifier::new(b"whsec_test".to_vec());
        let then = Utc::now() - Duration::minutes(30);
        let header = verifier.sign(b"body", then);
        assert!(matches!(
            verifier.verify(b"body", &header, Utc::now()),
            Err(WebhookError::StaleTimestamp)
        ));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let verifier = SignatureVerifier::new(b"whsec_test".to_vec());
        assert!(matches!(
            verifier.verify(b"body", "v1=deadbeef", Utc::now()),
            Err(WebhookError::MalformedSignature)
        ));
    }
}
