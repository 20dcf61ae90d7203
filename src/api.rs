//! HTTP surface for the control plane
//!
//! Five route groups: auth, workspaces, payments, proxy, webhook.
//! Cross-cutting concerns run in a fixed order: CORS and security
//! headers, then the streaming proxy branch, then the raw-body webhook
//! branch (its signature is computed over bytes, so it must never pass
//! through a JSON parser first), then the 1 MiB body cap, then rate
//! limiting, authentication, validation, and finally the handler.
//! Every error leaves through the uniform envelope.

use crate::billing::{Billing, WEBHOOK_SIGNATURE_HEADER};
use crate::config::Config;
use crate::credentials::{validate_password, TokenSigner};
use crate::db::{self, Db, UserRecord, WorkspaceRecord};
use crate::error::{ApiError, ErrorKind};
use crate::proxy::ProxyGateway;
use crate::ratelimit::{RateLimiter, Scope};
use crate::workspace::{parse_memory_limit, WorkspaceManager};
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Request-body cap for API routes.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Everything a request handler needs.
pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub tokens: TokenSigner,
    pub workspaces: Arc<WorkspaceManager>,
    pub billing: Arc<Billing>,
    pub limiter: RateLimiter,
    pub proxy: ProxyGateway,
}

/// The control-plane HTTP server.
pub struct ApiServer {
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { state, shutdown_rx }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        info!(addr = %self.state.config.bind_addr, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(state, stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    state: Arc<AppState>,
    stream: S,
    addr: SocketAddr,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let client_ip = addr.ip();

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle(state, req, client_ip).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle(
    state: Arc<AppState>,
    req: Request<Incoming>,
    client_ip: IpAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let origin = state.config.frontend_origin.clone();

    if req.method() == Method::OPTIONS {
        return Ok(with_common_headers(preflight_response(), &origin));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "API request");

    let response = match route(state, req, client_ip).await {
        Ok(response) => response,
        Err(err) => {
            if err.kind == ErrorKind::Internal {
                error!(%method, %path, error = %err, "Request failed");
            }
            err.into_response()
        }
    };

    Ok(with_common_headers(response, &origin))
}

async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
    client_ip: IpAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // Proxy: streams bodies both ways, so it must branch before any
    // body handling.
    if let Some(rest) = path.strip_prefix("/api/proxy/") {
        let (workspace_id, tail) = split_proxy_path(rest)?;
        return state.proxy.forward(req, workspace_id, &tail).await;
    }

    // Webhook: signature over the raw bytes, before any JSON parsing.
    if method == Method::POST && path.starts_with("/api/webhooks/") {
        let provider = path.trim_start_matches("/api/webhooks/");
        if provider.is_empty() || provider.contains('/') {
            return Err(ApiError::not_found("route"));
        }
        return webhook(state, req, provider).await;
    }

    if method == Method::GET && path == "/health" {
        return health(state).await;
    }

    // Every remaining route takes the body-size cap before rate
    // limiting or authentication run.
    let (parts, body) = req.into_parts();
    let body = read_body_bytes(body).await?;

    match (method, path.as_str()) {
        (Method::POST, "/api/auth/register") => {
            check_limit(&state, Scope::Auth, &client_ip.to_string())?;
            register(state.clone(), &body).await
        }
        (Method::POST, "/api/auth/login") => {
            check_limit(&state, Scope::Auth, &client_ip.to_string())?;
            login(state.clone(), &body).await
        }
        (Method::GET, "/api/auth/me") => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let user = authenticate(&state, &parts.headers).await?;
            Ok(json_response(StatusCode::OK, json!({ "user": user_json(&user) })))
        }
        (Method::POST, "/api/auth/logout") => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let _user = authenticate(&state, &parts.headers).await?;
            Ok(json_response(
                StatusCode::OK,
                json!({ "message": "logged out" }),
            ))
        }

        (Method::GET, "/api/workspaces") => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let user = authenticate(&state, &parts.headers).await?;
            list_workspaces(state.clone(), user).await
        }
        (Method::POST, "/api/workspaces") => {
            let user = authenticate(&state, &parts.headers).await?;
            check_limit(&state, Scope::Lifecycle, &user.id.to_string())?;
            create_workspace(state.clone(), user, &body).await
        }

        (Method::POST, "/api/payments/checkout") => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let user = authenticate(&state, &parts.headers).await?;
            checkout(state.clone(), user, &body).await
        }
        (Method::GET, "/api/payments/subscription") => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let user = authenticate(&state, &parts.headers).await?;
            let status = state.billing.subscription_status(user.id).await?;
            Ok(json_response(StatusCode::OK, status))
        }
        (Method::POST, "/api/payments/cancel") => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let user = authenticate(&state, &parts.headers).await?;
            cancel_subscription(state.clone(), user, &body).await
        }

        (method, path) => {
            workspace_routes(state, method, path, &parts.headers, client_ip).await
        }
    }
}

/// `/api/workspaces/{id}` and `/api/workspaces/{id}/{start|stop}`.
async fn workspace_routes(
    state: Arc<AppState>,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    client_ip: IpAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let rest = match path.strip_prefix("/api/workspaces/") {
        Some(rest) if !rest.is_empty() => rest,
        _ => return Err(ApiError::not_found("route")),
    };

    let (id_str, action) = match rest.split_once('/') {
        Some((id, action)) => (id, Some(action)),
        None => (rest, None),
    };
    let id = Uuid::parse_str(id_str)
        .map_err(|_| ApiError::validation("workspace id must be a UUID"))?;

    match (method, action) {
        (Method::GET, None) => {
            check_limit(&state, Scope::Api, &client_ip.to_string())?;
            let user = authenticate(&state, headers).await?;
            let workspace = db::find_workspace(state.db.pool(), id)
                .await?
                .filter(|ws| ws.owner_id == user.id)
                .ok_or_else(|| ApiError::not_found("workspace"))?;
            Ok(json_response(
                StatusCode::OK,
                json!({ "workspace": workspace_json(&workspace, true) }),
            ))
        }
        (Method::POST, Some("start")) => {
            let user = authenticate(&state, headers).await?;
            check_limit(&state, Scope::Lifecycle, &user.id.to_string())?;
            let workspace = state.workspaces.start(user.id, id).await?;
            Ok(json_response(
                StatusCode::OK,
                json!({ "workspace": workspace_json(&workspace, true) }),
            ))
        }
        (Method::POST, Some("stop")) => {
            let user = authenticate(&state, headers).await?;
            check_limit(&state, Scope::Lifecycle, &user.id.to_string())?;
            let workspace = state.workspaces.stop(user.id, id).await?;
            Ok(json_response(
                StatusCode::OK,
                json!({ "workspace": workspace_json(&workspace, true) }),
            ))
        }
        (Method::DELETE, None) => {
            let user = authenticate(&state, headers).await?;
            check_limit(&state, Scope::Lifecycle, &user.id.to_string())?;
            state.workspaces.delete(user.id, id).await?;
            Ok(empty_response(StatusCode::NO_CONTENT))
        }
        _ => Err(ApiError::not_found("route")),
    }
}

// ==================== Handlers ====================

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    password: String,
}

async fn register(
    state: Arc<AppState>,
    body: &Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let request: RegisterRequest = read_json(body)?;

    let email = normalize_email(&request.email)?;
    validate_password(&request.password).map_err(ApiError::validation)?;

    let digest = crate::credentials::hash_password(&request.password, state.config.hash_cost)
        .map_err(|e| {
            error!(error = %e, "Password hashing failed");
            ApiError::internal("internal error")
        })?;

    let user = db::insert_user(state.db.pool(), &email, &digest)
        .await
        .map_err(|e| {
            if db::is_unique_violation(&e, "email") {
                ApiError::conflict("email is already registered")
            } else {
                e.into()
            }
        })?;

    info!(user_id = %user.id, "User registered");
    Ok(json_response(
        StatusCode::CREATED,
        json!({ "user": user_json(&user) }),
    ))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    state: Arc<AppState>,
    body: &Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let request: LoginRequest = read_json(body)?;
    let email = normalize_email(&request.email)?;

    let invalid = || ApiError::new(ErrorKind::AuthFailed, "invalid email or password");

    let user = db::find_user_by_email(state.db.pool(), &email)
        .await?
        .ok_or_else(invalid)?;

    let verified = crate::credentials::verify_password(&user.password_digest, &request.password)
        .unwrap_or(false);
    if !verified {
        warn!(user_id = %user.id, "Login with wrong password");
        return Err(invalid());
    }

    let (token, expires_in) = state.tokens.issue(user.id).map_err(|e| {
        error!(error = %e, "Token issuance failed");
        ApiError::internal("internal error")
    })?;

    info!(user_id = %user.id, "User logged in");
    Ok(json_response(
        StatusCode::OK,
        json!({
            "token": token,
            "expires_in": expires_in,
            "user": user_json(&user),
        }),
    ))
}

async fn list_workspaces(
    state: Arc<AppState>,
    user: UserRecord,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let workspaces = db::list_workspaces(state.db.pool(), user.id).await?;
    let views: Vec<serde_json::Value> = workspaces
        .iter()
        .map(|ws| workspace_json(ws, false))
        .collect();
    Ok(json_response(
        StatusCode::OK,
        json!({ "count": views.len(), "workspaces": views }),
    ))
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceRequest {
    name: String,
    #[serde(rename = "cpuLimit")]
    cpu_limit: Option<f64>,
    #[serde(rename = "memoryLimit")]
    memory_limit: Option<String>,
}

async fn create_workspace(
    state: Arc<AppState>,
    user: UserRecord,
    body: &Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let request: CreateWorkspaceRequest = read_json(body)?;

    let cpu_quota = request.cpu_limit.unwrap_or(state.config.default_cpu_quota);
    let memory_bytes = match request.memory_limit.as_deref() {
        Some(limit) => parse_memory_limit(limit)?,
        None => state.config.default_memory_bytes,
    };

    let workspace = state
        .workspaces
        .create(user.id, &request.name, cpu_quota, memory_bytes)
        .await?;

    Ok(json_response(
        StatusCode::CREATED,
        json!({ "workspace": workspace_json(&workspace, true) }),
    ))
}

#[derive(Debug, Deserialize, Default)]
struct CheckoutRequest {
    plan_id: Option<String>,
}

async fn checkout(
    state: Arc<AppState>,
    user: UserRecord,
    body: &Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let request: CheckoutRequest = read_json_or_default(body)?;

    if let Some(plan) = request.plan_id.as_deref() {
        if plan != state.config.payment_plan_id {
            return Err(ApiError::validation("unknown plan"));
        }
    }

    let (subscription_id, short_url) = state.billing.checkout(user.id).await?;
    Ok(json_response(
        StatusCode::OK,
        json!({ "subscription_id": subscription_id, "short_url": short_url }),
    ))
}

#[derive(Debug, Deserialize, Default)]
struct CancelRequest {
    #[allow(dead_code)]
    reason: Option<String>,
}

async fn cancel_subscription(
    state: Arc<AppState>,
    user: UserRecord,
    body: &Bytes,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let _request: CancelRequest = read_json_or_default(body)?;
    let end_date = state.billing.cancel(user.id).await?;
    Ok(json_response(StatusCode::OK, json!({ "end_date": end_date })))
}

async fn webhook(
    state: Arc<AppState>,
    req: Request<Incoming>,
    provider: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    let signature = req
        .headers()
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let raw = read_body_bytes(req.into_body()).await?;
    debug!(provider, bytes = raw.len(), "Webhook body received");

    let outcome = state
        .billing
        .process_webhook(&raw, signature.as_deref())
        .await?;

    Ok(json_response(
        StatusCode::OK,
        json!({ "status": outcome.as_str() }),
    ))
}

async fn health(
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ApiError> {
    if state.db.ping().await {
        Ok(json_response(
            StatusCode::OK,
            json!({ "status": "ok", "database": "ok" }),
        ))
    } else {
        Ok(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "status": "degraded", "database": "unreachable" }),
        ))
    }
}

// ==================== Cross-cutting Helpers ====================

fn check_limit(state: &AppState, scope: Scope, key: &str) -> Result<(), ApiError> {
    state
        .limiter
        .check(scope, key)
        .map_err(ApiError::rate_limited)
}

/// Resolve the bearer token to a user. Every failure mode maps to the
/// same pair of non-disclosing errors.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserRecord, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::auth_required)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::auth_failed)?;

    let user_id = state
        .tokens
        .verify(token)
        .map_err(|_| ApiError::auth_failed())?;

    db::find_user(state.db.pool(), user_id)
        .await?
        .ok_or_else(ApiError::auth_failed)
}

/// Parse `{workspace_id}/{rest...}` from a proxy path remainder.
fn split_proxy_path(rest: &str) -> Result<(Uuid, String), ApiError> {
    let (id_str, tail) = match rest.split_once('/') {
        Some((id, tail)) => (id, tail.to_string()),
        None => (rest, String::new()),
    };
    let id = Uuid::parse_str(id_str)
        .map_err(|_| ApiError::validation("workspace id must be a UUID"))?;
    Ok((id, tail))
}

pub(crate) fn normalize_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_lowercase();
    if email.len() < 3 || email.len() > 255 {
        return Err(ApiError::validation("email must be 3-255 characters"));
    }
    let (local, domain) = email
        .split_once('@')
        .ok_or_else(|| ApiError::validation("email must contain an @"))?;
    if local.is_empty() || domain.is_empty() || email.chars().any(char::is_whitespace) {
        return Err(ApiError::validation("email is not valid"));
    }
    Ok(email)
}

/// Parse a JSON body that was already collected under the size cap.
fn read_json<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::validation(format!("invalid request body: {}", e)))
}

/// Like [`read_json`] but an empty body parses as the default.
fn read_json_or_default<T>(bytes: &Bytes) -> Result<T, ApiError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ApiError::validation(format!("invalid request body: {}", e)))
}

/// Collect a request body under the 1 MiB cap.
async fn read_body_bytes(body: Incoming) -> Result<Bytes, ApiError> {
    let body = Limited::new(body, MAX_BODY_BYTES);
    match body.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(_) => Err(ApiError::validation(format!(
            "request body unreadable or larger than {} bytes",
            MAX_BODY_BYTES
        ))),
    }
}

// ==================== Views ====================

fn user_json(user: &UserRecord) -> serde_json::Value {
    json!({
        "id": user.id,
        "email": user.email,
        "created_at": user.created_at,
    })
}

/// Workspace view; the proxy credential is exposed only on owner-scoped
/// single-workspace responses.
fn workspace_json(ws: &WorkspaceRecord, include_credential: bool) -> serde_json::Value {
    let mut view = json!({
        "id": ws.id,
        "name": ws.name,
        "runtime_state": ws.runtime_state,
        "cpu_quota": ws.cpu_quota,
        "memory_bytes": ws.memory_bytes,
        "created_at": ws.created_at,
        "updated_at": ws.updated_at,
        "last_started_at": ws.last_started_at,
    });
    if include_credential {
        view["proxy_credential"] = json!(ws.proxy_credential);
    }
    view
}

// ==================== Responses ====================

fn json_response(
    status: StatusCode,
    body: serde_json::Value,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response")
}

fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response")
}

fn preflight_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header(
            "Access-Control-Allow-Headers",
            "content-type, authorization, x-workspace-token",
        )
        .header("Access-Control-Max-Age", "600")
        .body(
            Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response")
}

/// Security headers plus CORS pinned to the configured front-end origin,
/// applied to every response.
fn with_common_headers(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    origin: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let headers = response.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert("Access-Control-Allow-Origin", value);
        headers.insert("Vary", HeaderValue::from_static("Origin"));
    }
    response
}
