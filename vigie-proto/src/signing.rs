//! HMAC-SHA256 body signatures. The key is the node token itself.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(token: &str) -> HmacSha256 {
    // HMAC accepts keys of any length, new_from_slice cannot fail here.
    match HmacSha256::new_from_slice(token.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    }
}

/// Hex-encoded HMAC-SHA256 of `body` keyed by `token`.
pub fn sign_body(token: &str, body: &[u8]) -> String {
    let mut mac = mac_for(token);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against `body`.
pub fn verify_body(token: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac = mac_for(token);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
