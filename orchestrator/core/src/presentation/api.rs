// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! REST API
//!
//! Versioned under `/1.0`. Every response is an [`ApiResponse`] envelope:
//! sync for plain reads, async (HTTP 202) when an operation was created,
//! error otherwise.

use crate::application::instance_service::{CreateInstanceRequest, InstanceService};
use crate::application::operations::OperationRegistry;
use crate::domain::channel::{ChannelError, RemoteOperation};
use crate::domain::exec::{ExecError, ExecRequest};
use crate::domain::idmap::IdmapError;
use crate::domain::instance::{IdmapConfig, InstanceError};
use crate::domain::operation::{OperationError, OperationId};
use crate::domain::repository::RepositoryError;
use crate::domain::response::ApiResponse;
use crate::infrastructure::websocket::conn_from_axum;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub struct AppState {
    pub registry: OperationRegistry,
    pub instances: Arc<InstanceService>,
    /// Bound for waits that do not name a timeout.
    pub default_wait: Option<Duration>,
    pub start_time: Instant,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/1.0/operations", get(list_operations))
        .route(
            "/1.0/operations/{id}",
            get(get_operation).delete(cancel_operation),
        )
        .route("/1.0/operations/{id}/wait", get(wait_operation))
        .route("/1.0/operations/{id}/websocket", get(operation_websocket))
        .route("/1.0/instances", get(list_instances).post(create_instance))
        .route(
            "/1.0/instances/{name}",
            get(get_instance).delete(delete_instance),
        )
        .route("/1.0/instances/{name}/start", post(start_instance))
        .route("/1.0/instances/{name}/stop", post(stop_instance))
        .route("/1.0/instances/{name}/exec", post(exec_instance))
        .route("/1.0/instances/{name}/migration/sink", post(migration_sink))
        .route("/1.0/instances/{name}/migration/source", post(migration_source))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error rendered as the error envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        let body = ApiResponse::error(self.status.as_u16(), self.message);
        (self.status, Json(body)).into_response()
    }
}

fn channel_status(e: &ChannelError) -> StatusCode {
    match e {
        ChannelError::InvalidSecret => StatusCode::FORBIDDEN,
        ChannelError::AlreadyTaken(_) => StatusCode::CONFLICT,
        ChannelError::Unknown(_) => StatusCode::NOT_FOUND,
        ChannelError::ConnectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn operation_status(e: &OperationError) -> StatusCode {
    match e {
        OperationError::NotFound(_) => StatusCode::NOT_FOUND,
        OperationError::NotCancellable(_)
        | OperationError::NotWebsocket
        | OperationError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
        OperationError::NotPending
        | OperationError::NotRunning
        | OperationError::Completed
        | OperationError::InvalidTransition { .. } => StatusCode::CONFLICT,
        OperationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OperationError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        OperationError::Channel(e) => channel_status(e),
    }
}

fn idmap_status(e: &IdmapError) -> StatusCode {
    match e {
        IdmapError::PoolExhausted { .. } | IdmapError::BaseOverlap { .. } => StatusCode::CONFLICT,
        IdmapError::PoolTooSmall { .. }
        | IdmapError::PoolInconsistent(_)
        | IdmapError::NoUserMap(_)
        | IdmapError::Io { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl From<OperationError> for ApiError {
    fn from(e: OperationError) -> Self {
        Self::new(operation_status(&e), e.to_string())
    }
}

impl From<InstanceError> for ApiError {
    fn from(e: InstanceError) -> Self {
        let status = match &e {
            InstanceError::NotFound(_) => StatusCode::NOT_FOUND,
            InstanceError::InvalidName(_) => StatusCode::BAD_REQUEST,
            InstanceError::AlreadyExists(_)
            | InstanceError::Migrating(_)
            | InstanceError::AlreadyRunning(_)
            | InstanceError::Running(_)
            | InstanceError::NotRunning(_)
            | InstanceError::RemapPending(_)
            | InstanceError::Remapping(_) => StatusCode::CONFLICT,
            InstanceError::Idmap(e) => idmap_status(e),
            InstanceError::Repository(RepositoryError::NotFound(_)) => StatusCode::NOT_FOUND,
            InstanceError::Operation(e) => operation_status(e),
            InstanceError::Exec(ExecError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult = Result<(StatusCode, Json<ApiResponse>), ApiError>;

fn sync<T: Serialize>(value: &T) -> ApiResult {
    let metadata = serde_json::to_value(value)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((StatusCode::OK, Json(ApiResponse::sync(metadata))))
}

fn accepted(operation: &crate::application::operations::Operation) -> ApiResult {
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::operation(&operation.render()))))
}

fn parse_id(raw: &str) -> Result<OperationId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid operation id {:?}", raw)))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = if state.registry.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(json!({
        "status": status,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn list_operations(State(state): State<Arc<AppState>>) -> ApiResult {
    sync(&state.registry.list())
}

async fn get_operation(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let op = state.registry.get(parse_id(&id)?)?;
    sync(&op.render())
}

async fn cancel_operation(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let view = state.registry.cancel(parse_id(&id)?).await?;
    sync(&view)
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    /// Seconds; negative waits forever.
    timeout: Option<i64>,
}

async fn wait_operation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult {
    let id = parse_id(&id)?;
    let timeout = match query.timeout {
        Some(secs) if secs >= 0 => Some(Duration::from_secs(secs as u64)),
        Some(_) => None,
        None => state.default_wait,
    };
    let view = state.registry.wait(id, timeout).await?;
    sync(&view)
}

#[derive(Debug, Deserialize)]
struct WebsocketQuery {
    #[serde(default)]
    secret: String,
}

/// The secret is checked before the upgrade so a bad one never gets a socket.
async fn operation_websocket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WebsocketQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let claim = state.registry.claim(id, &query.secret)?;
    let name = claim.name().to_string();
    debug!(operation_id = %id, channel = %name, "Upgrading channel");

    Ok(ws.on_upgrade(move |socket| async move {
        let conn = conn_from_axum(&name, socket);
        if let Err(e) = claim.deliver(conn) {
            debug!(operation_id = %id, channel = %name, error = %e, "Operation stopped before channel attached");
        }
    }))
}

async fn list_instances(State(state): State<Arc<AppState>>) -> ApiResult {
    sync(&state.instances.list().await?)
}

async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateInstanceRequest>,
) -> ApiResult {
    let instance = state.instances.create(request).await?;
    sync(&instance)
}

async fn get_instance(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    sync(&state.instances.get(&name).await?)
}

async fn delete_instance(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    state.instances.delete(&name).await?;
    sync(&json!({}))
}

async fn start_instance(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    sync(&state.instances.start(&name).await?)
}

async fn stop_instance(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult {
    sync(&state.instances.stop(&name).await?)
}

async fn exec_instance(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult {
    let op = state.instances.exec(&name, request).await?;
    accepted(&op)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MigrationSinkRequest {
    #[serde(default)]
    pub idmap: IdmapConfig,
    #[serde(default)]
    pub live: bool,
}

async fn migration_sink(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<MigrationSinkRequest>,
) -> ApiResult {
    let create = CreateInstanceRequest {
        name,
        idmap: request.idmap,
    };
    let (_, op) = state.instances.create_migration_sink(create, request.live).await?;
    accepted(&op)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MigrationSourceRequest {
    pub target: RemoteOperation,
    #[serde(default)]
    pub live: bool,
}

async fn migration_source(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<MigrationSourceRequest>,
) -> ApiResult {
    let op = state
        .instances
        .start_migration_source(&name, request.target, request.live)
        .await?;
    accepted(&op)
}
