//! REST API handlers.
//!
//! Each handler goes through the node's `SolverServer` and returns JSON
//! responses. Administrative routes check `Right::ManageSolvers` for the
//! caller named in the request headers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use solvergrid_cluster::Address;
use solvergrid_core::{SolverKey, SolverKind};
use solvergrid_sectioning::{Right, RightContext, Role, SectioningAction, Subject};
use solvergrid_solver::{BatchItem, SolverConfig, SolverError};

use crate::ApiState;

pub const USER_HEADER: &str = "x-solvergrid-user";
pub const ROLE_HEADER: &str = "x-solvergrid-role";
pub const STUDENT_HEADER: &str = "x-solvergrid-student";

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn solver_error(e: &SolverError) -> Response {
    let status = match e {
        SolverError::NotFound { .. } => StatusCode::NOT_FOUND,
        SolverError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        SolverError::NoAvailableNode(_) | SolverError::Unavailable(_) | SolverError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

fn parse_kind(kind: &str) -> Result<SolverKind, Response> {
    kind.parse::<SolverKind>().map_err(|e| {
        error_response(&format!("unknown solver kind: {}", e.0), StatusCode::BAD_REQUEST).into_response()
    })
}

// ── Caller identity ────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The caller named by the identity headers.
pub fn subject_from_headers(headers: &HeaderMap) -> Result<Subject, String> {
    let user = header(headers, USER_HEADER).ok_or_else(|| format!("missing {USER_HEADER} header"))?;
    let role = match header(headers, ROLE_HEADER).unwrap_or("student") {
        "student" => Role::Student,
        "advisor" => Role::Advisor,
        "admin" => Role::Admin,
        other => return Err(format!("unknown role: {other}")),
    };
    let student_id = match header(headers, STUDENT_HEADER) {
        Some(raw) => Some(raw.parse().map_err(|_| format!("invalid {STUDENT_HEADER}: {raw}"))?),
        None => None,
    };
    if role == Role::Student && student_id.is_none() {
        return Err(format!("students must send {STUDENT_HEADER}"));
    }
    Ok(Subject {
        user: user.to_string(),
        role,
        student_id,
    })
}

fn caller(headers: &HeaderMap) -> Result<Subject, Response> {
    subject_from_headers(headers).map_err(|msg| error_response(&msg, StatusCode::UNAUTHORIZED).into_response())
}

fn authorize(state: &ApiState, headers: &HeaderMap, right: Right) -> Result<Subject, Response> {
    let subject = caller(headers)?;
    if !state.rights.check(right, &subject, &RightContext::default()) {
        warn!(user = %subject.user, ?right, "permission denied");
        return Err(error_response("permission denied", StatusCode::FORBIDDEN).into_response());
    }
    Ok(subject)
}

// ── Node and cluster ───────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct MasterInfo {
    pub address: Option<Address>,
    /// The answering node is the master.
    pub local: bool,
}

/// GET /api/v1/node
pub async fn node_info(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.server.node_info().await)
}

/// GET /api/v1/master
pub async fn master(State(state): State<ApiState>) -> impl IntoResponse {
    match state.server.master_address().await {
        Ok(address) => ApiResponse::ok(MasterInfo {
            local: address.as_ref() == Some(state.server.local_address()),
            address,
        })
        .into_response(),
        Err(e) => solver_error(&e),
    }
}

/// GET /api/v1/cluster/load
pub async fn cluster_load(State(state): State<ApiState>) -> impl IntoResponse {
    match state.server.cluster_load().await {
        Ok(load) => ApiResponse::ok(load).into_response(),
        Err(e) => solver_error(&e),
    }
}

// ── Solvers ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSolverRequest {
    pub key: SolverKey,
    #[serde(default)]
    pub config: SolverConfig,
}

/// GET /api/v1/solvers/{kind}
pub async fn list_solvers(State(state): State<ApiState>, Path(kind): Path<String>) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.server.list_solvers(kind).await {
        Ok(solvers) => ApiResponse::ok(solvers).into_response(),
        Err(e) => solver_error(&e),
    }
}

/// POST /api/v1/solvers/{kind}
pub async fn create_solver(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateSolverRequest>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    let subject = match authorize(&state, &headers, Right::ManageSolvers) {
        Ok(subject) => subject,
        Err(resp) => return resp,
    };
    match state.server.create_solver(kind, &req.key, req.config).await {
        Ok(info) => {
            info!(%kind, key = %req.key, node = %info.host, user = %subject.user, "solver created via API");
            (StatusCode::CREATED, ApiResponse::ok(info)).into_response()
        }
        Err(e) => solver_error(&e),
    }
}

/// GET /api/v1/solvers/{kind}/{key}
pub async fn get_solver(
    State(state): State<ApiState>,
    Path((kind, key)): Path<(String, String)>,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.server.get_solver(kind, &key).await {
        Ok(Some(info)) => ApiResponse::ok(info).into_response(),
        Ok(None) => error_response("solver not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => solver_error(&e),
    }
}

/// DELETE /api/v1/solvers/{kind}/{key}
pub async fn remove_solver(
    State(state): State<ApiState>,
    Path((kind, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&state, &headers, Right::ManageSolvers) {
        return resp;
    }
    match state.server.remove_solver(kind, &key).await {
        Ok(true) => ApiResponse::ok(serde_json::json!({ "removed": key })).into_response(),
        Ok(false) => error_response("solver not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => solver_error(&e),
    }
}

/// POST /api/v1/solvers/{kind}/{key}/refresh
pub async fn refresh_solver(
    State(state): State<ApiState>,
    Path((kind, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    if let Err(resp) = authorize(&state, &headers, Right::ManageSolvers) {
        return resp;
    }
    match state.server.refresh_solver(kind, &key).await {
        Ok(info) => ApiResponse::ok(info).into_response(),
        Err(e) => solver_error(&e),
    }
}

// ── Sectioning ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchRequestItem {
    pub student_id: u64,
    pub request_id: u64,
    pub action: SectioningAction,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<BatchRequestItem>,
}

/// POST /api/v1/sectioning/{key}/batch
///
/// Every item is decided on behalf of the caller; rights are checked per
/// request by the scheduler.
pub async fn section_batch(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BatchRequest>,
) -> impl IntoResponse {
    let subject = match caller(&headers) {
        Ok(subject) => subject,
        Err(resp) => return resp,
    };
    debug!(%key, user = %subject.user, items = req.items.len(), "sectioning batch");
    let batch = req
        .items
        .into_iter()
        .map(|item| BatchItem::new(item.student_id, item.request_id, item.action, subject.clone()))
        .collect();
    match state.server.section(&key, batch).await {
        Ok(outcomes) => ApiResponse::ok(outcomes).into_response(),
        Err(e) => solver_error(&e),
    }
}

// ── Lifecycle ──────────────────────────────────────────────────────

/// POST /api/v1/shutdown
pub async fn shutdown(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let subject = match authorize(&state, &headers, Right::ManageSolvers) {
        Ok(subject) => subject,
        Err(resp) => return resp,
    };
    info!(user = %subject.user, node = %state.server.local_address(), "shutdown requested");
    state.shutdown.send_replace(true);
    (StatusCode::ACCEPTED, ApiResponse::ok("shutting down")).into_response()
}
