//! Subbot HTTP REST API
//!
//! Axum-based HTTP server exposing the session commands over HTTP. Runs
//! alongside the Unix socket IPC server on port 8787 (configurable).
//!
//! Each endpoint has a thin axum handler that builds an IPC request and
//! delegates to an inner function. The inner functions go through the same
//! router as the socket server and are directly testable without axum.
//!
//! Endpoints:
//! - GET    /health  store and capacity status
//! - GET    /version  server version info
//! - POST   /sessions  create a session, returns the challenge
//! - GET    /sessions?owner=  list sessions (all, or one owner's)
//! - GET    /sessions/:code  one session
//! - DELETE /sessions/:code  revoke
//! - POST   /sessions/:code/deactivate  stop, finish in `inactive`
//! - POST   /sessions/:code/reauthenticate  fresh authentication after error/inactive
//! - POST   /sessions/:code/relaunch  resume a disconnected session
//! - POST   /sessions/:code/messages  count a handled message
//! - GET    /events  paginated event log
//! - GET    /activation, PUT /activation  global on/off
//! - GET    /groups/:group/activation, PUT  per-group override

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use subbot_core::config::HttpConfig;
use subbot_core::ipc::{SubbotRequest, SubbotResponse, PROTOCOL_VERSION};
use subbot_core::models::{AuthMethod, EventKind};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::subsystems::orchestrator::Orchestrator;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub orchestrator: Arc<Orchestrator>,
    pub socket_path: String,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", post(create_handler).get(list_handler))
        .route("/sessions/:code", get(get_handler).delete(revoke_handler))
        .route("/sessions/:code/deactivate", post(deactivate_handler))
        .route("/sessions/:code/reauthenticate", post(reauthenticate_handler))
        .route("/sessions/:code/relaunch", post(relaunch_handler))
        .route("/sessions/:code/messages", post(message_handler))
        .route("/events", get(events_handler))
        .route(
            "/activation",
            get(global_activation_handler).put(set_global_activation_handler),
        )
        .route(
            "/groups/:group/activation",
            get(group_activation_handler).put(set_group_activation_handler),
        )
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    orchestrator: Arc<Orchestrator>,
    config: HttpConfig,
    socket_path: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(HttpState {
        orchestrator,
        socket_path,
    });

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Subbot HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub owner: Option<String>,
    pub display_name: Option<String>,
    #[serde(default = "default_method")]
    pub method: AuthMethod,
    pub phone_number: Option<String>,
}

fn default_method() -> AuthMethod {
    AuthMethod::Qr
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ActorBody {
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReauthenticateBody {
    #[serde(default = "default_method")]
    pub method: AuthMethod,
    pub phone_number: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    pub code: Option<String>,
    pub event_kind: Option<EventKind>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GlobalActivationBody {
    pub is_on: bool,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupActivationBody {
    pub is_active: bool,
    pub actor: String,
}

// ============================================================================
// Inner (directly testable) functions
// ============================================================================

/// Inner health check: probes the store and reports capacity.
pub async fn health_inner(
    orchestrator: &Orchestrator,
    socket_path: &str,
) -> (StatusCode, serde_json::Value) {
    let response = crate::router::handle_request(SubbotRequest::Health, orchestrator).await;
    if !response.is_ok() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": response.message,
            }),
        );
    }
    let mut body = response.data.unwrap_or_else(|| serde_json::json!({}));
    if let Some(obj) = body.as_object_mut() {
        obj.insert("version".to_string(), serde_json::json!(env!("CARGO_PKG_VERSION")));
        obj.insert("socket".to_string(), serde_json::json!(socket_path));
    }
    (StatusCode::OK, body)
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
    })
}

/// Inner create: requires a non-empty owner, then launches.
pub async fn create_inner(
    orchestrator: &Orchestrator,
    body: CreateSessionBody,
) -> (StatusCode, serde_json::Value) {
    let owner = match body.owner {
        Some(o) if !o.trim().is_empty() => o,
        _ => return bad_request("owner field is required"),
    };
    let (status, value) = route_inner(
        orchestrator,
        SubbotRequest::CreateSession {
            owner,
            display_name: body.display_name,
            method: body.method,
            phone_number: body.phone_number,
        },
    )
    .await;
    if status == StatusCode::OK {
        (StatusCode::CREATED, value)
    } else {
        (status, value)
    }
}

pub async fn list_inner(
    orchestrator: &Orchestrator,
    query: ListQuery,
) -> (StatusCode, serde_json::Value) {
    let request = match query.owner {
        Some(owner) if !owner.trim().is_empty() => SubbotRequest::ListSessions { owner },
        _ => SubbotRequest::ListAllSessions,
    };
    route_inner(orchestrator, request).await
}

pub async fn events_inner(
    orchestrator: &Orchestrator,
    query: EventsQuery,
) -> (StatusCode, serde_json::Value) {
    route_inner(
        orchestrator,
        SubbotRequest::Events {
            code: query.code,
            event_kind: query.event_kind,
            limit: query.limit,
            offset: query.offset,
        },
    )
    .await
}

/// Run any IPC request through the router and map the outcome to HTTP.
pub async fn route_inner(
    orchestrator: &Orchestrator,
    request: SubbotRequest,
) -> (StatusCode, serde_json::Value) {
    let response = crate::router::handle_request(request, orchestrator).await;
    match response_to_http(response) {
        Ok(data) => (StatusCode::OK, data),
        Err((status, body)) => (status, body),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.orchestrator, &state.socket_path).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn create_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<CreateSessionBody>,
) -> impl IntoResponse {
    let (status, body) = create_inner(&state.orchestrator, body).await;
    (status, Json(body))
}

pub async fn list_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let (status, body) = list_inner(&state.orchestrator, query).await;
    (status, Json(body))
}

pub async fn get_handler(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let (status, body) = route_inner(&state.orchestrator, SubbotRequest::GetSession { code }).await;
    (status, Json(body))
}

pub async fn revoke_handler(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
    Query(query): Query<ActorBody>,
) -> impl IntoResponse {
    let request = SubbotRequest::RevokeSession {
        code,
        actor: query.actor,
    };
    let (status, body) = route_inner(&state.orchestrator, request).await;
    (status, Json(body))
}

pub async fn deactivate_handler(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
    body: Option<Json<ActorBody>>,
) -> impl IntoResponse {
    let actor = body.and_then(|Json(b)| b.actor);
    let request = SubbotRequest::DeactivateSession { code, actor };
    let (status, body) = route_inner(&state.orchestrator, request).await;
    (status, Json(body))
}

pub async fn reauthenticate_handler(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
    Json(body): Json<ReauthenticateBody>,
) -> impl IntoResponse {
    let request = SubbotRequest::ReauthenticateSession {
        code,
        method: body.method,
        phone_number: body.phone_number,
        actor: body.actor,
    };
    let (status, body) = route_inner(&state.orchestrator, request).await;
    (status, Json(body))
}

pub async fn relaunch_handler(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let (status, body) =
        route_inner(&state.orchestrator, SubbotRequest::RelaunchSession { code }).await;
    (status, Json(body))
}

pub async fn message_handler(
    State(state): State<Arc<HttpState>>,
    Path(code): Path<String>,
) -> impl IntoResponse {
    let (status, body) =
        route_inner(&state.orchestrator, SubbotRequest::RecordMessage { code }).await;
    (status, Json(body))
}

pub async fn events_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let (status, body) = events_inner(&state.orchestrator, query).await;
    (status, Json(body))
}

pub async fn global_activation_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = route_inner(&state.orchestrator, SubbotRequest::GlobalActivation).await;
    (status, Json(body))
}

pub async fn set_global_activation_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<GlobalActivationBody>,
) -> impl IntoResponse {
    let request = SubbotRequest::SetGlobalActivation {
        is_on: body.is_on,
        actor: body.actor,
    };
    let (status, body) = route_inner(&state.orchestrator, request).await;
    (status, Json(body))
}

pub async fn group_activation_handler(
    State(state): State<Arc<HttpState>>,
    Path(group): Path<String>,
) -> impl IntoResponse {
    let (status, body) =
        route_inner(&state.orchestrator, SubbotRequest::GroupActivation { group }).await;
    (status, Json(body))
}

pub async fn set_group_activation_handler(
    State(state): State<Arc<HttpState>>,
    Path(group): Path<String>,
    Json(body): Json<GroupActivationBody>,
) -> impl IntoResponse {
    let request = SubbotRequest::SetGroupActivation {
        group,
        is_active: body.is_active,
        actor: body.actor,
    };
    let (status, body) = route_inner(&state.orchestrator, request).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

fn bad_request(msg: &str) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        serde_json::json!({
            "error": msg,
            "status": "error",
        }),
    )
}

/// HTTP status for a structured error kind.
pub fn status_for_kind(kind: Option<&str>) -> StatusCode {
    match kind {
        Some("validation") | Some("invalid_code") => StatusCode::BAD_REQUEST,
        Some("not_found") => StatusCode::NOT_FOUND,
        Some("already_active") | Some("conflict") | Some("invalid_transition") => {
            StatusCode::CONFLICT
        }
        Some("capacity_exceeded") => StatusCode::TOO_MANY_REQUESTS,
        Some("protocol") => StatusCode::BAD_GATEWAY,
        Some("persistence") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert an IPC `SubbotResponse` into an HTTP body, or a status plus error body.
pub fn response_to_http(
    response: SubbotResponse,
) -> std::result::Result<serde_json::Value, (StatusCode, serde_json::Value)> {
    if response.is_ok() {
        return Ok(response.data.unwrap_or(serde_json::json!({})));
    }
    let status = status_for_kind(response.error_kind.as_deref());
    Err((
        status,
        serde_json::json!({
            "error": response.message,
            "error_kind": response.error_kind,
            "status": "error",
        }),
    ))
}

// ============================================================================
// Unit Tests, call inner functions directly
// ============================================================================
