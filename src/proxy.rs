//! Authenticated reverse proxy into workspace containers
//!
//! Resolves a per-workspace credential to the container's address on the
//! internal network and forwards the request. The upstream target is
//! evaluated per request against the workspace's current container
//! address, never captured at startup. Request and response bodies are
//! streamed; the credential header is stripped before forwarding.

use crate::db::{self, Db};
use crate::engine::Engine;
use crate::error::{ApiError, ErrorKind};
use crate::workspace::RuntimeState;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header carrying the per-workspace proxy credential.
pub const WORKSPACE_TOKEN_HEADER: &str = "x-workspace-token";

/// First characters of a credential, safe to log.
pub fn credential_prefix(credential: &str) -> &str {
    let end = credential
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(credential.len());
    &credential[..end]
}

/// Rewrite the request path by removing the proxy prefix; an empty
/// remainder becomes `/`. The query string is preserved.
pub fn rewrite_path(rest: &str, query: Option<&str>) -> String {
    let mut path = if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };
    if let Some(query) = query {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Remove the credential header (all occurrences) before forwarding.
/// The upstream must never see it.
pub fn strip_credential_header(headers: &mut HeaderMap) {
    headers.remove(WORKSPACE_TOKEN_HEADER);
}

pub struct ProxyGateway {
    db: Db,
    engine: Arc<Engine>,
    upstream: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    container_port: u16,
}

impl ProxyGateway {
    pub fn new(
        db: Db,
        engine: Arc<Engine>,
        container_port: u16,
        connect_timeout: Duration,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));

        let upstream = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            db,
            engine,
            upstream,
            container_port,
        }
    }

    /// Forward one request into the workspace named by the path, after
    /// credential, entitlement and runtime-state checks.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        workspace_id: Uuid,
        rest: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
        let credential = match req
            .headers()
            .get(WORKSPACE_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(value) if !value.is_empty() => value.to_string(),
            _ => return Err(ApiError::auth_required()),
        };

        let workspace = match db::find_workspace_by_credential(self.db.pool(), &credential).await?
        {
            Some(ws) => ws,
            None => {
                warn!(
                    credential_prefix = credential_prefix(&credential),
                    "Proxy credential not recognized"
                );
                return Err(ApiError::auth_failed());
            }
        };

        if workspace.id != workspace_id {
            warn!(
                credential_prefix = credential_prefix(&credential),
                workspace_id = %workspace_id,
                "Proxy credential does not match the addressed workspace"
            );
            return Err(ApiError::auth_failed());
        }

        if !db::user_is_entitled(self.db.pool(), workspace.owner_id).await? {
            return Err(ApiError::unentitled());
        }

        let handle = match (&workspace.engine_handle, workspace.state()) {
            (Some(handle), RuntimeState::Running) => handle.clone(),
            (_, state) => {
                return Err(ApiError::new(
                    ErrorKind::NotRunning,
                    "workspace is not running",
                )
                .with_details(json!({ "state": state.as_str() })));
            }
        };

        let ip = match self.engine.container_ip(&handle).await? {
            Some(ip) => ip,
            None => {
                return Err(ApiError::new(
                    ErrorKind::Unreachable,
                    "workspace container has no address on the internal network",
                ));
            }
        };

        // The target is resolved here, per request, from the container's
        // current address.
        let path = rewrite_path(rest, req.uri().query());
        let target: Uri = format!("http://{}:{}{}", ip, self.container_port, path)
            .parse()
            .map_err(|_| ApiError::internal("failed to build upstream target"))?;

        let (mut parts, body) = req.into_parts();
        strip_credential_header(&mut parts.headers);
        // Let the client derive Host from the upstream target
        parts.headers.remove(HOST);

        let mut upstream_req = Request::builder()
            .method(parts.method.clone())
            .uri(target)
            .body(body.boxed())
            .map_err(|_| ApiError::internal("failed to build upstream request"))?;
        *upstream_req.headers_mut() = parts.headers;

        debug!(
            workspace_id = %workspace_id,
            method = %parts.method,
            path = %path,
            "Forwarding to workspace"
        );

        match self.upstream.request(upstream_req).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "Upstream request failed");
                Err(ApiError::new(
                    ErrorKind::UpstreamUnreachable,
                    "workspace container did not accept the connection",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("", None), "/");
        assert_eq!(rewrite_path("health", None), "/health");
        assert_eq!(rewrite_path("/health", None), "/health");
        assert_eq!(rewrite_path("a/b/c", None), "/a/b/c");
        assert_eq!(rewrite_path("search", Some("q=1&n=2")), "/search?q=1&n=2");
        assert_eq!(rewrite_path("", Some("q=1")), "/?q=1");
    }

    #[test]
    fn test_strip_credential_header_removes_all() {
        let mut headers = HeaderMap::new();
        headers.append(
            WORKSPACE_TOKEN_HEADER,
            HeaderValue::from_static("aaaa"),
        );
        headers.append(
            WORKSPACE_TOKEN_HEADER,
            HeaderValue::from_static("bbbb"),
        );
        headers.insert("accept", HeaderValue::from_static("application/json"));

        strip_credential_header(&mut headers);

        assert!(headers.get(WORKSPACE_TOKEN_HEADER).is_none());
        assert!(!headers
            .iter()
            .any(|(name, _)| name.as_str().eq_ignore_ascii_case(WORKSPACE_TOKEN_HEADER)));
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_credential_prefix_is_short() {
        let cred = "aabbccddeeff00112233";
        assert_eq!(credential_prefix(cred), "aabbccdd");
        assert_eq!(credential_prefix("ab"), "ab");
    }
}
