//! HTTP lookup server
//!
//! A thin axum layer over [`EnrichmentEngine`]. Lookups run on tokio's
//! blocking pool because a lookup may refresh a dataset inline. Refresh
//! requests are handed to the [`ScheduledTrigger`] and acknowledged at once.
//!
//! | Route | Answer |
//! |-------|--------|
//! | `GET /lookup?ip=` | [`EnrichmentResult`](crate::lens::enrich::EnrichmentResult) |
//! | `GET /asn?asn=` | [`AsEnrichmentResult`](crate::lens::enrich::AsEnrichmentResult) |
//! | `GET /cidr?cidr=` | [`NetworkExpansion`](crate::lens::enrich::NetworkExpansion) |
//! | `POST /refresh/:kind` | [`TriggerAck`](crate::refresh::TriggerAck) |
//! | `GET /status` | per-dataset state and cache counters |
//! | `GET /health` | `OK` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use netinfo::server::{start_server, ServerConfig};
//!
//! let config = netinfo::NetinfoConfig::new(&None)?;
//! start_server(config, ServerConfig::default().with_port(9000)).await?;
//! ```

pub mod handlers;

pub use handlers::{ApiError, StatusResponse};

use crate::config::{DatasetKind, NetinfoConfig};
use crate::context::NetinfoContext;
use crate::error::NetinfoError;
use crate::fetch::HttpSourceFetcher;
use crate::lens::enrich::EnrichmentEngine;
use crate::refresh::{RefreshOrchestrator, ScheduledTrigger, TriggerSchedule};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

// =============================================================================
// Server Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub address: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Get the full bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared by every handler
#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<EnrichmentEngine>,
    pub trigger: Arc<ScheduledTrigger>,
}

/// Create the axum router
pub fn create_router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/lookup", get(handlers::lookup_ip))
        .route("/asn", get(handlers::lookup_asn))
        .route("/cidr", get(handlers::expand_network))
        .route("/refresh/:kind", post(handlers::force_refresh))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Server Startup
// =============================================================================

/// Load datasets and fail unless a routing table is available
///
/// Runs once before the listener opens, so no request ever reaches an
/// uninitialized engine in a healthy deployment.
pub fn bootstrap(orchestrator: &RefreshOrchestrator) -> Result<(), NetinfoError> {
    for (kind, result) in orchestrator.bootstrap() {
        match result {
            Ok(report) => info!("{} ready: {:?}", kind, report.outcome),
            Err(e) => warn!("{} not loaded: {}", kind, e),
        }
    }
    orchestrator.require(DatasetKind::Routing)
}

/// Bootstrap the datasets, start the refresh timer and serve until Ctrl-C
pub async fn start_server(config: NetinfoConfig, server_config: ServerConfig) -> anyhow::Result<()> {
    let fetcher = Arc::new(HttpSourceFetcher::new(&config));
    let schedule = TriggerSchedule::from_config(&config);
    let ctx = Arc::new(NetinfoContext::new(config)?);
    let orchestrator = Arc::new(RefreshOrchestrator::new(ctx, fetcher));

    info!("loading datasets before serving");
    let boot = orchestrator.clone();
    tokio::task::spawn_blocking(move || bootstrap(&boot)).await??;

    let trigger = Arc::new(ScheduledTrigger::spawn(orchestrator.clone(), schedule));
    let state = ServerState {
        engine: Arc::new(EnrichmentEngine::new(orchestrator)),
        trigger: trigger.clone(),
    };
    let app = create_router(state);

    let bind_address = server_config.bind_address();
    info!("Starting lookup server on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    trigger.shutdown().await;
    info!("lookup server stopped");
    Ok(())
}
