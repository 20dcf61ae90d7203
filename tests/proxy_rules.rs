//! Integration tests for the proxy's request-rewrite and header-hygiene
//! rules, and for the error surface they share with the HTTP edge.

use hyper::header::{HeaderMap, HeaderValue};
use hyper::StatusCode;
use paddock::error::{ApiError, ErrorKind};
use paddock::proxy::{
    credential_prefix, rewrite_path, strip_credential_header, WORKSPACE_TOKEN_HEADER,
};

// ============================================================================
// Path Rewriting
// ============================================================================

mod rewrite_tests {
    use super::*;

    #[test]
    fn test_empty_remainder_becomes_root() {
        assert_eq!(rewrite_path("", None), "/");
    }

    #[test]
    fn test_prefix_removed_rest_preserved() {
        assert_eq!(rewrite_path("health", None), "/health");
        assert_eq!(rewrite_path("api/v2/items", None), "/api/v2/items");
    }

    #[test]
    fn test_query_string_survives() {
        assert_eq!(
            rewrite_path("search", Some("q=hello&page=2")),
            "/search?q=hello&page=2"
        );
        assert_eq!(rewrite_path("", Some("raw")), "/?raw");
    }

    #[test]
    fn test_trailing_slash_preserved() {
        assert_eq!(rewrite_path("dir/", None), "/dir/");
    }
}

// ============================================================================
// Header Hygiene
// ============================================================================

mod header_tests {
    use super::*;

    #[test]
    fn test_credential_header_never_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WORKSPACE_TOKEN_HEADER,
            HeaderValue::from_str(&"a".repeat(64)).unwrap(),
        );
        headers.insert("accept", HeaderValue::from_static("*/*"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        strip_credential_header(&mut headers);

        assert!(headers.get(WORKSPACE_TOKEN_HEADER).is_none());
        assert!(!headers
            .keys()
            .any(|name| name.as_str().eq_ignore_ascii_case(WORKSPACE_TOKEN_HEADER)));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_duplicate_credential_headers_all_removed() {
        let mut headers = HeaderMap::new();
        headers.append(WORKSPACE_TOKEN_HEADER, HeaderValue::from_static("one"));
        headers.append(WORKSPACE_TOKEN_HEADER, HeaderValue::from_static("two"));
        headers.append(WORKSPACE_TOKEN_HEADER, HeaderValue::from_static("three"));

        strip_credential_header(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_credential_prefix_limits_log_exposure() {
        let credential = "0123456789abcdef0123456789abcdef";
        let prefix = credential_prefix(credential);
        assert_eq!(prefix, "01234567");
        assert!(prefix.len() < credential.len() / 2);
    }
}

// ============================================================================
// Error Surface
// ============================================================================

mod error_surface_tests {
    use super::*;

    #[test]
    fn test_proxy_error_status_mapping() {
        assert_eq!(
            ApiError::auth_required().into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::auth_failed().into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::unentitled().into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::new(ErrorKind::NotRunning, "workspace is not running")
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::new(ErrorKind::UpstreamUnreachable, "connection refused")
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_not_running_carries_current_state() {
        let err = ApiError::new(ErrorKind::NotRunning, "workspace is not running")
            .with_details(serde_json::json!({ "state": "stopped" }));
        assert_eq!(err.details.unwrap()["state"], "stopped");
    }
}
