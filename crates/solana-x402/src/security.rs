//! Secret comparison for bearer tokens (admin bypass, metrics).

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compare two secrets without leaking content or length through timing.
///
/// Both sides are hashed to fixed-length digests first.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    Sha256::digest(a).ct_eq(&Sha256::digest(b)).into()
}

/// Whether an `Authorization` header value is `Bearer <expected>`.
pub fn bearer_matches(header: Option<&str>, expected: &str) -> bool {
    let provided = header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    !provided.is_empty() && constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_by_content() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokens"));
        assert!(!constant_time_eq(b"", b"token"));
    }

    #[test]
    fn bearer_header() {
        assert!(bearer_matches(Some("Bearer admin-1"), "admin-1"));
        assert!(!bearer_matches(Some("Bearer admin-2"), "admin-1"));
        assert!(!bearer_matches(Some("admin-1"), "admin-1"));
        assert!(!bearer_matches(None, "admin-1"));
        assert!(!bearer_matches(Some("Bearer "), ""));
    }
}
