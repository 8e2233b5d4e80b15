//! Subject identification.
//!
//! A browser is identified by the `x402_session` cookie, issued on first
//! contact; other clients may send the same id in `X-X402-Session`. The
//! admin bearer token marks the subject as holding the bypass permission.

use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header;
use actix_web::HttpRequest;
use x402::security::bearer_matches;
use x402::{Subject, SESSION_COOKIE, SESSION_HEADER};

const MAX_SESSION_LEN: usize = 128;

fn is_valid_session(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Session id carried by the request, if any and well-formed.
pub fn session_id(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_valid_session(id))
        .map(String::from);
    from_header.or_else(|| {
        req.cookie(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|id| is_valid_session(id))
    })
}

/// Identify the caller. Returns the cookie to set when a session was minted.
pub fn resolve_subject(
    req: &HttpRequest,
    admin_token: Option<&str>,
) -> (Subject, Option<Cookie<'static>>) {
    let (id, cookie) = match session_id(req) {
        Some(id) => (id, None),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            let cookie = Cookie::build(SESSION_COOKIE, id.clone())
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .finish();
            (id, Some(cookie))
        }
    };

    let mut subject = Subject::new(id);
    if let Some(token) = admin_token {
        let auth = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if bearer_matches(auth, token) {
            subject = subject.with_bypass();
        }
    }
    (subject, cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_header_wins_over_cookie() {
        let req = TestRequest::default()
            .insert_header((SESSION_HEADER, "from-header"))
            .cookie(Cookie::new(SESSION_COOKIE, "from-cookie"))
            .to_http_request();
        let (subject, cookie) = resolve_subject(&req, None);
        assert_eq!(subject.id, "from-header");
        assert!(cookie.is_none());
    }

    #[test]
    fn test_cookie_session_is_reused() {
        let req = TestRequest::default()
            .cookie(Cookie::new(SESSION_COOKIE, "abc-123"))
            .to_http_request();
        let (subject, cookie) = resolve_subject(&req, None);
        assert_eq!(subject.id, "abc-123");
        assert!(cookie.is_none());
    }

    #[test]
    fn test_new_session_is_minted() {
        let req = TestRequest::default()
            .insert_header((SESSION_HEADER, "bad value; with spaces"))
            .to_http_request();
        let (subject, cookie) = resolve_subject(&req, None);
        let cookie = cookie.expect("cookie issued");
        assert_eq!(cookie.value(), subject.id);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert!(uuid::Uuid::parse_str(&subject.id).is_ok());
    }

    #[test]
    fn test_admin_token_grants_bypass() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Bearer letmein"))
            .to_http_request();
        assert!(resolve_subject(&req, Some("letmein")).0.bypass);
        assert!(!resolve_subject(&req, Some("other")).0.bypass);
        assert!(!resolve_subject(&req, None).0.bypass);
    }
}
