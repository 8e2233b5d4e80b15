//! HMAC-SHA256 signing for facilitator requests and settlement receipts.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8], body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac
}

/// Hex-encoded HMAC-SHA256 of `body`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    hex_encode(&mac_for(secret, body).finalize().into_bytes())
}

/// Check a hex signature in constant time. Malformed hex never matches.
pub fn verify_body(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let expected = hex_decode(signature).unwrap_or_else(|| vec![0u8; 32]);
    mac_for(secret, body).verify_slice(&expected).is_ok()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
