#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Netinfo - IP and ASN enrichment
//!
//! Netinfo answers "who routes this address and where is it" from three
//! periodically refreshed public datasets:
//!
//! - a prefix-to-origin routing table built from RouteViews RIB dumps
//! - the CIDR report's AS number to organization name listing
//! - a MaxMind GeoLite2 City database
//!
//! It can be used as a library, as a command-line tool or as a small HTTP
//! lookup service.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | `display` | Table formatting | `tabled`, `json_to_table` |
//! | `cli` | CLI binary and HTTP server (default) | `clap`, `axum`, `tracing-subscriber` |
//!
//! # Architecture
//!
//! - **[`config`]**: configuration file, dataset kinds, refresh policy
//! - **[`context`]**: configuration plus freshness ledger, built once at startup
//! - **[`database`]**: freshness ledger and the durable routing table
//! - **[`datasets`]**: routing table, AS-name directory, geolocation database
//! - **[`fetch`]**: upstream downloads behind the [`SourceFetcher`] trait
//! - **[`refresh`]**: staleness checks, coalesced rebuilds, atomic hand-off
//!   and the scheduled trigger
//! - **[`lens`]**: the enrichment engine and its result cache
//! - **[`server`]**: HTTP routes (requires `cli`)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use netinfo::{EnrichmentEngine, HttpSourceFetcher, NetinfoConfig, NetinfoContext, RefreshOrchestrator};
//! use std::sync::Arc;
//!
//! let config = NetinfoConfig::new(&None)?;
//! let fetcher = Arc::new(HttpSourceFetcher::new(&config));
//! let ctx = Arc::new(NetinfoContext::new(config)?);
//! let orchestrator = Arc::new(RefreshOrchestrator::new(ctx, fetcher));
//! orchestrator.bootstrap();
//!
//! let engine = EnrichmentEngine::new(orchestrator);
//! let result = engine.lookup_ip("1.1.1.1")?;
//! println!("AS{:?} {:?}", result.as_num, result.as_name);
//! ```

pub mod config;
pub mod context;
pub mod database;
pub mod datasets;
pub mod error;
pub mod fetch;
pub mod lens;
pub mod refresh;

// Server module - requires CLI feature
#[cfg(feature = "cli")]
pub mod server;

// =============================================================================
// Configuration and context
// =============================================================================

pub use config::{DatasetKind, NetinfoConfig, RefreshPolicy};
pub use context::NetinfoContext;
pub use error::{ErrorCode, NetinfoError, NetinfoResult};

// =============================================================================
// Datasets and storage
// =============================================================================

pub use database::{FreshnessLedger, FreshnessRecord, RoutingTableStore};
pub use datasets::{
    AsNameDirectory, GeoDirectory, GeoDirectoryLoader, GeoLocate, GeoRecord, RoutingEntry,
    RoutingTable, RoutingTableBuilder, UNKNOWN_AS_NAME,
};

// =============================================================================
// Fetching and refresh
// =============================================================================

pub use fetch::{FetchOutcome, HttpSourceFetcher, RawArtifact, SourceFetcher};
pub use refresh::{
    ActiveDataset, DatasetState, DatasetStatus, RefreshOrchestrator, RefreshOutcome,
    RefreshReport, ScheduledTrigger, TriggerAck, TriggerSchedule,
};

// =============================================================================
// Lookups
// =============================================================================

pub use lens::enrich::{
    AsEnrichmentResult, EnrichmentEngine, EnrichmentResult, LookupAnswer, NetworkExpansion,
    ResultCache,
};
pub use lens::utils::OutputFormat;

#[cfg(feature = "cli")]
pub use server::{create_router, start_server, ServerConfig, ServerState};
