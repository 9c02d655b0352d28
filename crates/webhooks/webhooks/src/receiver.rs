//! Subscriber-side verification of incoming webhooks.

use chrono::Utc;

use cityforge_events::Event;

use crate::error::{WebhookError, WebhookResult};
use crate::signature::WebhookSigner;

/// Verifies signed deliveries on the receiving end.
///
/// A delivery without a signature is never trusted.
pub struct WebhookReceiver {
    signer: WebhookSigner,
    /// Reject events older than this many seconds.
    max_age_secs: Option<i64>,
}

impl WebhookReceiver {
    /// Creates a new webhook receiver.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            signer: WebhookSigner::new(secret),
            max_age_secs: None,
        }
    }

    /// Rejects events whose timestamp is older than `secs`.
    ///
    /// Retried deliveries carry the original event timestamp, so this should
    /// comfortably exceed the sender's total backoff.
    pub fn with_max_age(mut self, secs: i64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    /// Verifies the `X-Signature` header and parses the body.
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> WebhookResult<Event> {
        self.verify_signature(signature, body)?;

        let event = Event::from_json(body)?;

        if let Some(max_age) = self.max_age_secs {
            let age = Utc::now().signed_duration_since(event.timestamp).num_seconds();
            if age > max_age {
                return Err(WebhookError::InvalidPayload(format!(
                    "event {} is {}s old",
                    event.id, age
                )));
            }
        }

        Ok(event)
    }

    /// Verifies only the signature without parsing.
    pub fn verify_signature(&self, signature: Option<&str>, body: &[u8]) -> WebhookResult<()> {
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        if !self.signer.verify(body, signature) {
            return Err(WebhookError::InvalidSignature);
        }
        Ok(())
    }
}
