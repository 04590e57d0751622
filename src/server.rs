//! HTTP API for connection sharing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ShareError;
use crate::health::HealthStatus;
use crate::sharing::{ConfirmOutcome, SharingManager, SharingState, SharingStatus};
use crate::system::InterfaceInfo;

pub struct Server {
    manager: SharingManager,
    listen: SocketAddr,
}

struct AppState {
    manager: SharingManager,
}

impl Server {
    pub fn new(manager: SharingManager, listen: SocketAddr) -> Self {
        Self { manager, listen }
    }

    pub async fn run(&self) -> Result<()> {
        let state = Arc::new(AppState {
            manager: self.manager.clone(),
        });

        let app = router(state);

        info!("Starting HTTP server on http://{}", self.listen);

        let listener = tokio::net::TcpListener::bind(self.listen).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/network/interfaces", get(list_interfaces))
        .route("/api/network/connection_sharing/status", get(status))
        .route("/api/network/connection_sharing/enable", post(enable))
        .route("/api/network/connection_sharing/confirm", post(confirm))
        .route("/api/network/connection_sharing/disable", post(disable))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// Error response type
#[derive(Debug)]
struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ActionResponse {
            success: false,
            message: self.1,
        };
        (self.0, Json(body)).into_response()
    }
}

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        let code = match err {
            _ if err.is_validation() => StatusCode::BAD_REQUEST,
            ShareError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError(code, err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: SharingStatus,
    state: SharingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<HealthStatus>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let status = state.manager.status();
    let health = state.manager.check_health().await;

    Json(StatusResponse {
        state: status.state(),
        status,
        health,
    })
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    source: Option<String>,
    target: Option<String>,
    #[serde(default = "default_enable_nat")]
    enable_nat: bool,
}

fn default_enable_nat() -> bool {
    true
}

async fn enable(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnableRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    let (Some(source), Some(target)) = (request.source, request.target) else {
        return Err(AppError(
            StatusCode::BAD_REQUEST,
            "Source and target interfaces are required".to_string(),
        ));
    };

    let message = state
        .manager
        .enable_with_policy(&source, &target, request.enable_nat)
        .await?;
    Ok(ActionResponse::ok(message))
}

async fn confirm(State(state): State<Arc<AppState>>) -> Result<Json<ActionResponse>, AppError> {
    let response = match state.manager.confirm().await? {
        ConfirmOutcome::Confirmed(_) => ActionResponse {
            success: true,
            message: "Connection sharing configuration confirmed".to_string(),
        },
        ConfirmOutcome::NothingPending => ActionResponse {
            success: false,
            message: "No pending connection sharing configuration to confirm".to_string(),
        },
    };
    Ok(Json(response))
}

async fn disable(State(state): State<Arc<AppState>>) -> Result<Json<ActionResponse>, AppError> {
    let message = state.manager.disable(true).await?;
    Ok(ActionResponse::ok(message))
}

#[derive(Debug, Serialize)]
struct InterfacesResponse {
    interfaces: Vec<InterfaceInfo>,
}

async fn list_interfaces(
    State(state): State<Arc<AppState>>,
) -> Result<Json<InterfacesResponse>, AppError> {
    let interfaces = state.manager.interfaces().await?;
    Ok(Json(InterfacesResponse { interfaces }))
}
