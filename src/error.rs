//! Error taxonomy and JSON error responses for the control plane

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::engine::EngineError;

/// Error kinds surfaced at the HTTP edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or semantically invalid request
    Validation,
    /// No credentials presented
    AuthRequired,
    /// Credentials presented but not accepted
    AuthFailed,
    /// No active entitlement for the operation
    Unentitled,
    /// Authenticated but not allowed
    Forbidden,
    NotFound,
    Conflict,
    /// Per-owner workspace cap hit
    LimitReached,
    RateLimited,
    /// Workspace exists but is not in a runnable state
    NotRunning,
    /// Workspace container has no resolvable address
    Unreachable,
    /// Upstream container refused or dropped the connection
    UpstreamUnreachable,
    /// Payment provider API failure
    ProviderDown,
    /// Container engine failure
    Engine,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation | ErrorKind::LimitReached => StatusCode::BAD_REQUEST,
            ErrorKind::AuthRequired | ErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::Unentitled | ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamUnreachable | ErrorKind::ProviderDown => StatusCode::BAD_GATEWAY,
            ErrorKind::NotRunning | ErrorKind::Unreachable | ErrorKind::Engine => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Kind name used in the `error` field of the envelope
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::AuthRequired => "AuthRequired",
            ErrorKind::AuthFailed => "AuthFailed",
            ErrorKind::Unentitled => "Unentitled",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::LimitReached => "LimitReached",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::NotRunning => "NotRunning",
            ErrorKind::Unreachable => "Unreachable",
            ErrorKind::UpstreamUnreachable => "UpstreamUnreachable",
            ErrorKind::ProviderDown => "ProviderDown",
            ErrorKind::Engine => "EngineError",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// An error carrying its HTTP mapping and envelope content
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth_required() -> Self {
        Self::new(ErrorKind::AuthRequired, "authentication required")
    }

    pub fn auth_failed() -> Self {
        Self::new(ErrorKind::AuthFailed, "authentication failed")
    }

    pub fn unentitled() -> Self {
        Self::new(ErrorKind::Unentitled, "an active subscription is required")
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{} not found", what))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            "too many requests, please retry later",
        )
        .with_details(json!({ "retry_after_secs": retry_after_secs }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Render as the uniform envelope `{error, message, details?}`
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let status = self.kind.status_code();
        let retry_after = if self.kind == ErrorKind::RateLimited {
            self.details
                .as_ref()
                .and_then(|d| d.get("retry_after_secs"))
                .and_then(|v| v.as_u64())
        } else {
            None
        };

        let mut body = json!({
            "error": self.kind.as_str(),
            "message": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }

        let mut builder = Response::builder()
            .status(status)
            .header("Content-Type", "application/json");
        if let Some(secs) = retry_after {
            builder = builder.header("Retry-After", secs.to_string());
        }

        builder
            .body(
                Full::new(Bytes::from(body.to_string()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .expect("valid response with StatusCode enum and static headers")
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        // Never echo SQL or bind values to clients
        tracing::error!(error = %err, "database error");
        Self::internal("internal error")
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::new(ErrorKind::Engine, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_codes() {
        assert_eq!(ErrorKind::Validation.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::LimitReached.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::AuthRequired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Unentitled.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorKind::NotRunning.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorKind::UpstreamUnreachable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_envelope_shape() {
        let resp = ApiError::validation("name must not be blank").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_rate_limited_retry_after_header() {
        let resp = ApiError::rate_limited(42).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "42");
    }

    #[test]
    fn test_display_includes_kind() {
        let err = ApiError::unentitled();
        assert!(err.to_string().starts_with("Unentitled:"));
    }
}
