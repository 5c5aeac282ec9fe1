//! Route handlers and error mapping

use super::ServerState;
use crate::config::DatasetKind;
use crate::error::{ErrorCode, NetinfoError};
use crate::lens::enrich::{
    AsEnrichmentResult, CacheStats, EnrichmentEngine, EnrichmentResult, NetworkExpansion,
};
use crate::refresh::{DatasetStatus, TriggerAck};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

// =============================================================================
// Errors
// =============================================================================

/// JSON error body with a matching HTTP status
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorCode::StorageFailed,
            message: message.into(),
        }
    }
}

impl From<NetinfoError> for ApiError {
    fn from(err: NetinfoError) -> Self {
        let status = match err.code() {
            ErrorCode::InvalidQuery => StatusCode::BAD_REQUEST,
            ErrorCode::DatasetUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::FetchFailed | ErrorCode::ParseFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::StorageFailed => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct IpParams {
    pub ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AsnParams {
    pub asn: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CidrParams {
    pub cidr: Option<String>,
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value.ok_or_else(|| {
        NetinfoError::invalid_query(format!("missing '{}' parameter", name)).into()
    })
}

/// Run a lookup on the blocking pool; it may refresh a dataset inline
async fn run_lookup<T, F>(engine: &Arc<EnrichmentEngine>, lookup: F) -> Result<Json<T>, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&EnrichmentEngine) -> Result<T, NetinfoError> + Send + 'static,
{
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || lookup(&engine)).await {
        Ok(result) => result.map(Json).map_err(ApiError::from),
        Err(e) => {
            error!("lookup task failed: {}", e);
            Err(ApiError::internal("lookup task failed"))
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn lookup_ip(
    State(state): State<ServerState>,
    Query(params): Query<IpParams>,
) -> Result<Json<EnrichmentResult>, ApiError> {
    let ip = required(params.ip, "ip")?;
    run_lookup(&state.engine, move |engine| engine.lookup_ip(&ip)).await
}

pub async fn lookup_asn(
    State(state): State<ServerState>,
    Query(params): Query<AsnParams>,
) -> Result<Json<AsEnrichmentResult>, ApiError> {
    let asn = required(params.asn, "asn")?;
    run_lookup(&state.engine, move |engine| engine.lookup_asn(&asn)).await
}

pub async fn expand_network(
    State(state): State<ServerState>,
    Query(params): Query<CidrParams>,
) -> Result<Json<NetworkExpansion>, ApiError> {
    let cidr = required(params.cidr, "cidr")?;
    run_lookup(&state.engine, move |engine| engine.expand_network(&cidr)).await
}

pub async fn force_refresh(
    State(state): State<ServerState>,
    Path(kind): Path<String>,
) -> Result<(StatusCode, Json<TriggerAck>), ApiError> {
    let kind: DatasetKind = kind
        .parse()
        .map_err(|e: anyhow::Error| NetinfoError::invalid_query(e.to_string()))?;
    let ack = state.trigger.force(kind)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub datasets: Vec<DatasetStatus>,
    pub generation: u64,
    pub cache: CacheStats,
}

pub async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    let orchestrator = state.engine.orchestrator();
    Json(StatusResponse {
        datasets: orchestrator.status(),
        generation: orchestrator.current().generation,
        cache: state.engine.cache_stats(),
    })
}

pub async fn health() -> &'static str {
    "OK"
}
