//! Inbound webhook signatures: `X-Webhook-Signature: <hex HMAC-SHA256(secret, body)>`.
//! A `sha256=` prefix is accepted for form tools that add one.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Lowercase hex signature of `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a presented signature.
pub fn verify(secret: &str, body: &[u8], presented: &str) -> bool {
    let presented = presented.trim();
    let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
    let Ok(bytes) = hex::decode(presented) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&bytes).is_ok()
}
