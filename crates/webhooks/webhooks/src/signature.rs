//! HMAC signature generation and verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix identifying the signature scheme in the `X-Signature` header.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Webhook signer for generating and verifying signatures.
pub struct WebhookSigner {
    secret: String,
}

impl WebhookSigner {
    /// Creates a new signer with the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generates the `X-Signature` header value for a payload.
    pub fn sign(&self, payload: &[u8]) -> String {
        format!("{}{}", SIGNATURE_PREFIX, self.digest(payload))
    }

    /// Verifies an `X-Signature` header value against the payload.
    pub fn verify(&self, payload: &[u8], header: &str) -> bool {
        let Some(provided) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
            return false;
        };
        constant_time_compare(&self.digest(payload), &provided.to_ascii_lowercase())
    }

    fn digest(&self, payload: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC can take key of any size");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Signs `payload` with `secret`, returning `"sha256=" + hex(HMAC-SHA256)`.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    WebhookSigner::new(secret).sign(payload)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
