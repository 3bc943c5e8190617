//! HMAC-SHA256 signatures over raw webhook bodies.
//!
//! Header format: `X-Auditq-Signature: sha256=<lowercase hex>`.

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Auditq-Signature";
pub const EVENT_HEADER: &str = "X-Auditq-Event";
pub const DELIVERY_HEADER: &str = "X-Auditq-Delivery";
pub const ATTEMPT_HEADER: &str = "X-Auditq-Attempt";

const PREFIX: &str = "sha256=";

fn digest(secret: &[u8], body: &[u8]) -> Result<Vec<u8>, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| {
        DeliveryError::Transport(format!("invalid webhook secret: {e}"))
    })?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, DeliveryError> {
    Ok(format!("{PREFIX}{}", hex::encode(digest(secret.as_bytes(), body)?)))
}

/// Check a received signature header against `body`. Comparison is constant
/// time; a header without the `sha256=` prefix never verifies.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(provided) = header.trim().strip_prefix(PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    match digest(secret.as_bytes(), body) {
        Ok(expected) => constant_time_eq(&expected, &provided),
        Err(_) => false,
    }
}
