//! Inbound authentication.
//!
//! User tokens arrive either OpenAI-style (`Authorization: Bearer`) or
//! Claude-style (`x-api-key`); both are accepted everywhere. The caller IP
//! feeds the per-user IP cap.

use axum::http::HeaderMap;

use crate::api::AppState;
use crate::core::config::AuthMode;
use crate::core::error::{ProxyError, Result};
use crate::services::user_store::User;

/// Best-effort client IP: proxy headers first, loopback fallback.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }
    "127.0.0.1".to_string()
}

/// Extract the user token; `x-api-key` takes priority over Bearer.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticate the request per the configured mode. Returns the user record
/// (None in anonymous mode) after IP recording and the inbound rate check.
pub fn authenticate_request(state: &AppState, headers: &HeaderMap) -> Result<Option<User>> {
    match state.config.auth_mode {
        AuthMode::None => Ok(None),
        AuthMode::UserToken => {
            let token = extract_token(headers).ok_or(ProxyError::Unauthorized)?;
            let ip = client_ip(headers);
            let user = state.user_store.authenticate(token, &ip)?;
            state.rate_limiter.check(token)?;
            Ok(Some(user))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("9.8.7.6, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(client_ip(&headers), "9.8.7.6");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(client_ip(&headers), "1.1.1.1");
        assert_eq!(client_ip(&HeaderMap::new()), "127.0.0.1");
    }

    #[test]
    fn test_extract_token_formats() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-123"));
        assert_eq!(extract_token(&headers), Some("tok-123"));

        headers.insert("x-api-key", HeaderValue::from_static("tok-456"));
        // x-api-key wins when both are present.
        assert_eq!(extract_token(&headers), Some("tok-456"));

        let mut empty = HeaderMap::new();
        empty.insert("authorization", HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_token(&empty), None);
    }
}
