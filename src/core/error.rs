//! Error taxonomy for the proxy.
//!
//! Every failure the proxy can produce is normalized to a [`ProxyError`]
//! variant with a stable wire `type` string, so clients and the streaming
//! fake-event path see a consistent shape. Classification is idempotent:
//! a `ProxyError` classifies to itself.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use super::families::{ModelFamily, Service};

/// Message spoofed on origin-blocked requests. Mimics a well-known upstream
/// policy-violation response so blocked scraper frontends self-disable.
pub const ORG_DISABLED_MESSAGE: &str =
    "Your account was disabled for violating our terms of service.";

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Inbound body or params failed validation. 400.
    #[error("Bad request: {message}")]
    Validation { message: String, issues: Vec<String> },

    /// Missing or invalid user token, disabled user, expired token. 401.
    #[error("Unauthorized")]
    Unauthorized,

    /// Origin-blocked request, spoofed as an upstream account policy action. 403.
    #[error("{0}")]
    OrgDisabled(String),

    /// The user is out of quota for the family. 429.
    #[error("Quota exceeded for model family {family}")]
    QuotaExceeded {
        family: ModelFamily,
        quota: u64,
        used: u64,
        requested: u64,
    },

    /// Per-user inbound request rate cap hit. 429.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// No enabled key serves the requested family. 503.
    #[error("No available key for {service}/{family}")]
    NoAvailableKey { service: Service, family: ModelFamily },

    /// Upstream kept returning 429 past the retry budget. 429.
    #[error("Upstream rate limited")]
    UpstreamRateLimited,

    /// Any other non-2xx from upstream; status and body are forwarded.
    #[error("Upstream error: {status}")]
    Upstream { status: u16, body: serde_json::Value },

    /// Upstream did not answer within the configured timeout. 504.
    #[error("Gateway timeout")]
    Timeout,

    /// The proxy is draining its queue for shutdown. 503.
    #[error("Proxy is shutting down")]
    ShuttingDown,

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Uncaught internal failure. 500.
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable wire `type` for this error. Mid-stream fake events carry the
    /// same strings.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Validation { .. } => "proxy_validation_error",
            ProxyError::Unauthorized => "proxy_unauthorized",
            ProxyError::OrgDisabled(_) => "organization_account_disabled",
            ProxyError::QuotaExceeded { .. } | ProxyError::RateLimited(_) => {
                "proxy_quota_exceeded"
            }
            ProxyError::NoAvailableKey { .. } => "proxy_no_available_key",
            ProxyError::UpstreamRateLimited => "upstream_rate_limited",
            ProxyError::Upstream { .. } => "upstream_error",
            ProxyError::Timeout => "proxy_timeout",
            ProxyError::ShuttingDown => "proxy_shutting_down",
            ProxyError::Request(_)
            | ProxyError::Serialization(_)
            | ProxyError::Internal(_) => "proxy_internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Validation { .. } => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::OrgDisabled(_) => StatusCode::FORBIDDEN,
            ProxyError::QuotaExceeded { .. }
            | ProxyError::RateLimited(_)
            | ProxyError::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::NoAvailableKey { .. } | ProxyError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            ProxyError::Serialization(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Classification is a no-op on already-typed errors.
    pub fn classify(self) -> ProxyError {
        self
    }

    /// JSON body for this error, as sent on the wire (and embedded in
    /// mid-stream fake events).
    pub fn body(&self) -> serde_json::Value {
        match self {
            ProxyError::Validation { message, issues } => json!({
                "error": {
                    "type": self.error_type(),
                    "message": message,
                    "issues": issues,
                }
            }),
            ProxyError::QuotaExceeded {
                family,
                quota,
                used,
                requested,
            } => json!({
                "error": {
                    "type": self.error_type(),
                    "message": self.to_string(),
                    "family": family,
                    "quota": quota,
                    "used": used,
                    "requested": requested,
                }
            }),
            // Forward the upstream payload untouched so clients see the
            // provider's own error shape.
            ProxyError::Upstream { body, .. } => body.clone(),
            other => {
                let mut error = json!({
                    "type": other.error_type(),
                    "message": other.to_string(),
                });
                if cfg!(debug_assertions) {
                    error["stack"] = json!(format!("{:?}", other));
                }
                json!({ "error": error })
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.body();
        (status, Json(body)).into_response()
    }
}

/// Convenience type alias for Results using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;
