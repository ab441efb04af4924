//! HTTP control plane
//!
//! Routes:
//! - `POST /monitors` start a monitor, body `{"channel_url": ...}`
//! - `GET /monitors` list monitors visible to the caller
//! - `DELETE /monitors/:channel` stop the caller's monitor for a channel
//! - `GET /monitors/:channel/health` derived health snapshot
//! - `GET /healthz` daemon liveness
//! - `GET /metrics` metrics snapshot
//!
//! The caller is identified by the `x-owner-id` and `x-owner-tier` headers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use streamward_common::{
    HealthSnapshot, MonitorId, MonitorRecord, MonitorStatus, OwnerTier, Principal, UnknownVariant,
};
use thiserror::Error;

use crate::observability::{self, MetricsSnapshot};
use crate::supervisor::{ControlError, Supervisor};

pub const OWNER_HEADER: &str = "x-owner-id";
pub const TIER_HEADER: &str = "x-owner-tier";

#[derive(Clone)]
pub struct ApiState {
    supervisor: Arc<Supervisor>,
    started: Instant,
}

impl ApiState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            started: Instant::now(),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/monitors", post(start_monitor).get(list_monitors))
        .route("/monitors/:channel", delete(stop_monitor))
        .route("/monitors/:channel/health", get(monitor_health))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing x-owner-id header")]
    MissingOwner,

    #[error(transparent)]
    BadTier(#[from] UnknownVariant),

    #[error(transparent)]
    Control(#[from] ControlError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingOwner => StatusCode::UNAUTHORIZED,
            ApiError::BadTier(_) => StatusCode::BAD_REQUEST,
            ApiError::Control(ControlError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Control(ControlError::Policy(_)) => StatusCode::CONFLICT,
            ApiError::Control(ControlError::Launch(e)) if e.is_configuration() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Control(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

fn tier(headers: &HeaderMap) -> Result<OwnerTier, ApiError> {
    let raw = headers
        .get(TIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    Ok(raw.parse::<OwnerTier>()?)
}

fn owner_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn principal(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let owner = owner_id(headers).ok_or(ApiError::MissingOwner)?;
    Ok(Principal::new(owner, tier(headers)?))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub channel_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub id: MonitorId,
    pub status: MonitorStatus,
    pub process_handle: Option<u32>,
}

async fn start_monitor(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let principal = principal(&headers)?;
    let record = state
        .supervisor
        .start_monitor(&principal, &request.channel_url)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StartResponse {
            id: record.id,
            status: record.status,
            process_handle: record.process_handle,
        }),
    ))
}

async fn list_monitors(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<MonitorRecord>>, ApiError> {
    let principal = principal(&headers)?;
    Ok(Json(state.supervisor.list_monitors(&principal)))
}

async fn stop_monitor(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let principal = principal(&headers)?;
    state.supervisor.stop_monitor(&principal, &channel).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Never rejects. Anonymous callers see any owner's monitor for the
/// channel; an unrecognised tier is read as standard and reported as a warning.
async fn monitor_health(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
) -> Json<HealthSnapshot> {
    let mut warning = None;
    let principal = match owner_id(&headers) {
        None => Principal::new("", OwnerTier::Privileged),
        Some(owner) => {
            let tier = tier(&headers).unwrap_or_else(|e| {
                warning = Some(e.to_string());
                OwnerTier::Standard
            });
            Principal::new(owner, tier)
        }
    };
    let mut snapshot = state.supervisor.monitor_health(&principal, &channel).await;
    snapshot.warnings.extend(warning);
    Json(snapshot)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonHealth {
    pub status: String,
    pub uptime_secs: u64,
    pub version: String,
}

async fn healthz(State(state): State<ApiState>) -> Json<DaemonHealth> {
    Json(DaemonHealth {
        status: "ok".to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn metrics() -> Json<MetricsSnapshot> {
    Json(observability::metrics().snapshot())
}
