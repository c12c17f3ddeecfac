//! HTTP request handlers

use crate::api::server::AppContext;
use crate::coordinator::{CoordinatorStatus, RefreshReport};
use crate::error::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    git_hash: String,
    build_profile: String,
    port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CalibrateRequest {
    known_volume_liters: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CalibrateResponse {
    pub tap: u8,
    pub pulses_per_liter: f64,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(e: Error) -> ApiError {
    let code = match &e {
        Error::TapNotConfigured(_) => StatusCode::NOT_FOUND,
        Error::CalibrationInvalid(_) | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}

// ============================================================================
// Health & Status
// ============================================================================

/// GET /health
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "superkeg-flow".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
        port: ctx.port,
    })
}

/// GET /status - counters, sessions and wiring for every configured tap
pub async fn status(State(ctx): State<AppContext>) -> Json<CoordinatorStatus> {
    Json(ctx.coordinator.status().await)
}

// ============================================================================
// Tap management
// ============================================================================

/// POST /taps/:tap/calibrate
///
/// Recomputes the tap's pulses-per-liter from a measured pour. The counter's
/// pulses since the last reset must correspond to `known_volume_liters`.
pub async fn calibrate_tap(
    State(ctx): State<AppContext>,
    Path(tap): Path<u8>,
    Json(req): Json<CalibrateRequest>,
) -> Result<Json<CalibrateResponse>, ApiError> {
    let pulses_per_liter = ctx
        .coordinator
        .calibrate_tap(tap, req.known_volume_liters)
        .await
        .map_err(api_error)?;

    info!(tap, "Calibrated via API: {:.2} pulses/L", pulses_per_liter);
    Ok(Json(CalibrateResponse { tap, pulses_per_liter }))
}

/// POST /taps/:tap/reset
pub async fn reset_tap(
    State(ctx): State<AppContext>,
    Path(tap): Path<u8>,
) -> Result<Json<StatusResponse>, ApiError> {
    ctx.coordinator.reset_tap(tap).await.map_err(api_error)?;
    info!(tap, "Counter reset via API");
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

/// POST /taps/refresh - re-read tap assignments after kegs are (un)tapped
pub async fn refresh_taps(State(ctx): State<AppContext>) -> Result<Json<RefreshReport>, ApiError> {
    let report = ctx.coordinator.refresh_assignments().await.map_err(api_error)?;
    info!(
        "Tap assignments refreshed: {} added, {} switched, {} removed",
        report.added.len(),
        report.switched.len(),
        report.removed.len()
    );
    Ok(Json(report))
}
