//! Refresh orchestration
//!
//! [`RefreshOrchestrator`] owns the datasets in service. Each kind (routing
//! table, AS names, geolocation) is refreshed independently when it is
//! missing or older than the refresh interval, and the result is installed
//! by swapping in a whole new [`ActiveDataset`]. Readers take a snapshot
//! with [`RefreshOrchestrator::current`] and are never blocked by a refresh.
//!
//! At most one refresh per kind runs at a time. Callers that arrive while a
//! refresh is running wait for it and get its result instead of starting
//! another fetch. After a failed refresh the kind counts as stale, and
//! [`RefreshOrchestrator::ensure_fresh`] returns that failure without
//! fetching again until the retry backoff has passed.

pub mod trigger;

use crate::config::DatasetKind;
use crate::context::NetinfoContext;
use crate::database::{FreshnessRecord, RoutingTableStore};
use crate::datasets::as_names::AsNameDirectory;
use crate::datasets::geo::{GeoDirectory, GeoDirectoryLoader, GeoLocate};
use crate::datasets::routing::{RoutingTable, RoutingTableBuilder};
use crate::error::{NetinfoError, NetinfoResult};
use crate::fetch::{FetchOutcome, SourceFetcher};
use anyhow::anyhow;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use trigger::{ScheduledTrigger, TriggerAck, TriggerSchedule};

// =============================================================================
// Active dataset bundle
// =============================================================================

/// Immutable bundle of the datasets in service
///
/// Replaced wholesale on every successful refresh. A snapshot stays valid
/// for as long as the caller holds it.
#[derive(Clone, Default)]
pub struct ActiveDataset {
    pub routing: Option<Arc<RoutingTable>>,
    pub as_names: Option<Arc<AsNameDirectory>>,
    pub geo: Option<Arc<dyn GeoLocate>>,
    /// When the last component was installed
    pub built_at: Option<DateTime<Utc>>,
    /// Incremented on every install
    pub generation: u64,
}

impl ActiveDataset {
    pub fn is_loaded(&self, kind: DatasetKind) -> bool {
        match kind {
            DatasetKind::Routing => self.routing.is_some(),
            DatasetKind::AsNames => self.as_names.is_some(),
            DatasetKind::Geo => self.geo.is_some(),
        }
    }

    /// Number of entries in a component, when that is meaningful
    pub fn entry_count(&self, kind: DatasetKind) -> Option<usize> {
        match kind {
            DatasetKind::Routing => self.routing.as_ref().map(|t| t.len()),
            DatasetKind::AsNames => self.as_names.as_ref().map(|d| d.len()),
            DatasetKind::Geo => None,
        }
    }
}

enum Component {
    Routing(Arc<RoutingTable>),
    AsNames(Arc<AsNameDirectory>),
    Geo(Arc<dyn GeoLocate>),
}

// =============================================================================
// Reports and states
// =============================================================================

/// Lifecycle state of one dataset kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    Unloaded,
    Loaded,
    Stale,
    Refreshing,
}

impl std::fmt::Display for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DatasetState::Unloaded => "unloaded",
            DatasetState::Loaded => "loaded",
            DatasetState::Stale => "stale",
            DatasetState::Refreshing => "refreshing",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Nothing to do, the dataset was fresh
    Fresh,
    /// A new dataset was built and installed
    Rebuilt,
    /// Upstream had nothing new; only the ledger timestamp moved
    Unchanged,
    /// The persisted dataset was loaded from disk
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub kind: DatasetKind,
    pub outcome: RefreshOutcome,
    /// Upstream artifact in service after the refresh
    pub identifier: Option<String>,
    pub entries: Option<usize>,
    /// Generation of the active bundle after the refresh
    pub generation: u64,
}

/// Per-kind status line
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub kind: DatasetKind,
    pub state: DatasetState,
    pub last_update: Option<DateTime<Utc>>,
    pub source_identifier: Option<String>,
    pub entries: Option<usize>,
}

// =============================================================================
// Per-kind refresh gate
// =============================================================================

#[derive(Default)]
struct GateState {
    running: bool,
    epoch: u64,
    last: Option<NetinfoResult<RefreshReport>>,
    /// Set when the last refresh failed, cleared by the next success
    failed_at: Option<Instant>,
}

/// Lets one refresh run per kind; later callers wait for its result
#[derive(Default)]
struct RefreshGate {
    state: Mutex<GateState>,
    done: Condvar,
}

impl RefreshGate {
    fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    fn last_failed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .failed_at
            .is_some()
    }

    /// The last failure, if it happened less than `backoff` ago
    fn recent_failure(&self, backoff: Duration) -> Option<NetinfoError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match (state.failed_at, &state.last) {
            (Some(at), Some(Err(e))) if at.elapsed() < backoff => Some(e.clone()),
            _ => None,
        }
    }

    fn run<F>(&self, refresh: F) -> NetinfoResult<RefreshReport>
    where
        F: FnOnce() -> NetinfoResult<RefreshReport>,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.running {
                let epoch = state.epoch;
                while state.running && state.epoch == epoch {
                    state = self.done.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                return state.last.clone().unwrap_or_else(|| {
                    Err(NetinfoError::storage("coalesced refresh left no result"))
                });
            }
            state.running = true;
        }

        let mut guard = GateGuard {
            gate: self,
            result: None,
        };
        let result = refresh();
        guard.result = Some(result.clone());
        result
    }
}

/// Releases the gate even if the refresh panics
struct GateGuard<'a> {
    gate: &'a RefreshGate,
    result: Option<NetinfoResult<RefreshReport>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap_or_else(|e| e.into_inner());
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(NetinfoError::storage("refresh aborted")));
        state.running = false;
        state.epoch += 1;
        state.failed_at = match result {
            Ok(_) => None,
            Err(_) => Some(Instant::now()),
        };
        state.last = Some(result);
        self.gate.done.notify_all();
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct RefreshOrchestrator {
    ctx: Arc<NetinfoContext>,
    fetcher: Arc<dyn SourceFetcher>,
    active: ArcSwap<ActiveDataset>,
    gates: [RefreshGate; 3],
}

impl RefreshOrchestrator {
    /// Create an orchestrator with nothing loaded
    pub fn new(ctx: Arc<NetinfoContext>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            ctx,
            fetcher,
            active: ArcSwap::from_pointee(ActiveDataset::default()),
            gates: Default::default(),
        }
    }

    pub fn context(&self) -> &NetinfoContext {
        &self.ctx
    }

    /// Consistent snapshot of the datasets in service
    pub fn current(&self) -> Arc<ActiveDataset> {
        self.active.load_full()
    }

    fn gate(&self, kind: DatasetKind) -> &RefreshGate {
        match kind {
            DatasetKind::Routing => &self.gates[0],
            DatasetKind::AsNames => &self.gates[1],
            DatasetKind::Geo => &self.gates[2],
        }
    }

    fn record(&self, kind: DatasetKind) -> FreshnessRecord {
        self.ctx.ledger().record(kind)
    }

    fn is_stale_on_disk(&self, kind: DatasetKind) -> bool {
        self.record(kind)
            .is_stale(self.ctx.config().refresh_interval(kind), Utc::now())
    }

    fn needs_refresh(&self, kind: DatasetKind) -> bool {
        !self.current().is_loaded(kind)
            || self.gate(kind).last_failed()
            || self.is_stale_on_disk(kind)
    }

    /// The failure that blocks refreshing `kind` until the retry backoff passes
    pub fn recent_failure(&self, kind: DatasetKind) -> Option<NetinfoError> {
        self.gate(kind).recent_failure(self.ctx.config().retry_backoff())
    }

    pub fn state(&self, kind: DatasetKind) -> DatasetState {
        if self.gate(kind).is_running() {
            DatasetState::Refreshing
        } else if !self.current().is_loaded(kind) {
            DatasetState::Unloaded
        } else if self.needs_refresh(kind) {
            DatasetState::Stale
        } else {
            DatasetState::Loaded
        }
    }

    pub fn status(&self) -> Vec<DatasetStatus> {
        let current = self.current();
        DatasetKind::all()
            .into_iter()
            .map(|kind| {
                let record = self.record(kind);
                DatasetStatus {
                    kind,
                    state: self.state(kind),
                    last_update: record.last_update,
                    source_identifier: record.source_identifier,
                    entries: current.entry_count(kind),
                }
            })
            .collect()
    }

    /// Refresh `kind` if it is missing or stale
    ///
    /// Within the retry backoff of a failed refresh the failure is returned
    /// again without contacting the upstream source.
    pub fn ensure_fresh(&self, kind: DatasetKind) -> NetinfoResult<RefreshReport> {
        if !self.needs_refresh(kind) {
            return Ok(self.report(kind, RefreshOutcome::Fresh, None));
        }
        if let Some(e) = self.recent_failure(kind) {
            debug!("{} refresh failed recently, not retrying yet: {}", kind, e);
            return Err(e);
        }
        self.gate(kind).run(|| {
            // a refresh may have finished between the check and the gate
            if !self.needs_refresh(kind) {
                return Ok(self.report(kind, RefreshOutcome::Fresh, None));
            }
            if !self.is_stale_on_disk(kind) && self.restore(kind) {
                return Ok(self.report(kind, RefreshOutcome::Restored, None));
            }
            self.refresh(kind, false)
        })
    }

    /// Re-fetch `kind` regardless of its age or recent failures
    pub fn force_refresh(&self, kind: DatasetKind) -> NetinfoResult<RefreshReport> {
        self.gate(kind).run(|| self.refresh(kind, true))
    }

    /// Start a refresh on its own thread if `kind` needs one
    ///
    /// Returns whether a refresh was started. Failures are logged.
    pub fn ensure_fresh_background(self: &Arc<Self>, kind: DatasetKind) -> bool {
        if !self.needs_refresh(kind)
            || self.gate(kind).is_running()
            || self.recent_failure(kind).is_some()
        {
            return false;
        }
        let orchestrator = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("refresh-{}", kind))
            .spawn(move || {
                if let Err(e) = orchestrator.ensure_fresh(kind) {
                    warn!("background {} refresh failed: {}", kind, e);
                }
            });
        match spawned {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to start background {} refresh: {}", kind, e);
                false
            }
        }
    }

    /// Load the persisted artifact of `kind` if nothing is loaded yet
    ///
    /// Returns whether a dataset was restored.
    pub fn restore(&self, kind: DatasetKind) -> bool {
        if self.current().is_loaded(kind) {
            return false;
        }
        match self.load_persisted(kind) {
            Ok(component) => {
                let generation = self.install(component);
                info!("restored {} data from disk (generation {})", kind, generation);
                true
            }
            Err(e) => {
                debug!("no persisted {} data: {:#}", kind, e);
                false
            }
        }
    }

    /// Load persisted datasets, then fetch whatever is still missing
    pub fn bootstrap(&self) -> Vec<(DatasetKind, NetinfoResult<RefreshReport>)> {
        DatasetKind::all()
            .into_iter()
            .map(|kind| {
                if self.restore(kind) {
                    return (kind, Ok(self.report(kind, RefreshOutcome::Restored, None)));
                }
                let result = self.ensure_fresh(kind);
                if let Err(e) = &result {
                    warn!("initial {} refresh failed: {}", kind, e);
                }
                (kind, result)
            })
            .collect()
    }

    /// Fail unless `kind` has been loaded
    pub fn require(&self, kind: DatasetKind) -> NetinfoResult<()> {
        if self.current().is_loaded(kind) {
            Ok(())
        } else {
            Err(NetinfoError::unavailable(kind))
        }
    }

    fn load_persisted(&self, kind: DatasetKind) -> anyhow::Result<Component> {
        let config = self.ctx.config();
        match kind {
            DatasetKind::Routing => RoutingTableStore::load(&config.routing_table_path())
                .map(|t| Component::Routing(Arc::new(t))),
            DatasetKind::AsNames => AsNameDirectory::load(&config.as_names_path())
                .map(|d| Component::AsNames(Arc::new(d))),
            DatasetKind::Geo => {
                let path = config.geo_db_path();
                if !path.exists() {
                    return Err(anyhow!("no database at {}", path.display()));
                }
                GeoDirectory::open(&path).map(|d| Component::Geo(Arc::new(d)))
            }
        }
    }

    fn refresh(&self, kind: DatasetKind, force: bool) -> NetinfoResult<RefreshReport> {
        debug!("refreshing {} data (force: {})", kind, force);
        let result = match kind {
            DatasetKind::Routing => self.refresh_routing(force),
            DatasetKind::AsNames => self.refresh_as_names(),
            DatasetKind::Geo => self.refresh_geo(),
        };
        match &result {
            Ok(report) => info!(
                "{} refresh: {:?}, {} entries, generation {}",
                kind,
                report.outcome,
                report
                    .entries
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                report.generation
            ),
            Err(e) => warn!("{} refresh failed, keeping current data: {}", kind, e),
        }
        result
    }

    fn refresh_routing(&self, force: bool) -> NetinfoResult<RefreshReport> {
        let kind = DatasetKind::Routing;
        let path = self.ctx.config().routing_table_path();
        let record = self.record(kind);
        let loaded = self.current().routing.is_some();

        let artifact = match self
            .fetcher
            .fetch_routing_table(record.source_identifier.as_deref(), force)?
        {
            FetchOutcome::Fetched(artifact) => artifact,
            FetchOutcome::NoUpdateNeeded { identifier } if loaded => {
                self.mark_refreshed(kind, Some(&identifier))?;
                return Ok(self.report(kind, RefreshOutcome::Unchanged, None));
            }
            FetchOutcome::NoUpdateNeeded { identifier } => match RoutingTableStore::load(&path) {
                Ok(table) => {
                    self.mark_refreshed(kind, Some(&identifier))?;
                    self.install(Component::Routing(Arc::new(table)));
                    return Ok(self.report(kind, RefreshOutcome::Restored, None));
                }
                Err(e) => {
                    warn!("no usable persisted routing table ({:#}), downloading again", e);
                    match self.fetcher.fetch_routing_table(Some(&identifier), true)? {
                        FetchOutcome::Fetched(artifact) => artifact,
                        FetchOutcome::NoUpdateNeeded { .. } => {
                            return Err(NetinfoError::fetch(
                                kind,
                                "forced download returned no artifact",
                            ))
                        }
                    }
                }
            },
        };

        if artifact.unchanged
            && loaded
            && record.source_identifier.as_deref() == Some(artifact.identifier.as_str())
        {
            debug!("{} is unchanged, skipping rebuild", artifact.identifier);
            self.mark_refreshed(kind, Some(&artifact.identifier))?;
            return Ok(self.report(kind, RefreshOutcome::Unchanged, None));
        }

        let table = RoutingTableBuilder::build_from_file(&artifact.path)
            .map_err(|e| NetinfoError::parse(kind, format!("{:#}", e)))?;
        RoutingTableStore::write_atomic(&path, &table, &artifact.identifier)?;
        self.mark_refreshed(kind, Some(&artifact.identifier))?;
        self.install(Component::Routing(Arc::new(table)));
        Ok(self.report(kind, RefreshOutcome::Rebuilt, None))
    }

    fn refresh_as_names(&self) -> NetinfoResult<RefreshReport> {
        let kind = DatasetKind::AsNames;
        let config = self.ctx.config();

        let raw = self.fetcher.fetch_as_names()?;
        let (directory, report) = AsNameDirectory::parse_html(&raw, config.min_name_match_ratio)
            .map_err(|e| NetinfoError::parse(kind, format!("{:#}", e)))?;
        if report.malformed > 0 {
            warn!(
                "{} of {} AS name lines could not be parsed",
                report.malformed, report.anchor_lines
            );
        }
        directory.save_atomic(&config.as_names_path())?;
        self.mark_refreshed(kind, None)?;
        self.install(Component::AsNames(Arc::new(directory)));
        Ok(self.report(kind, RefreshOutcome::Rebuilt, None))
    }

    fn refresh_geo(&self) -> NetinfoResult<RefreshReport> {
        let kind = DatasetKind::Geo;
        let archive = self.fetcher.fetch_geo_archive()?;
        let directory = GeoDirectoryLoader::new(&self.ctx.config().geo_dir())
            .install_from_archive(&archive)
            .map_err(|e| NetinfoError::parse(kind, format!("{:#}", e)))?;
        self.mark_refreshed(kind, None)?;
        self.install(Component::Geo(Arc::new(directory)));
        Ok(self.report(kind, RefreshOutcome::Rebuilt, None))
    }

    fn mark_refreshed(&self, kind: DatasetKind, identifier: Option<&str>) -> NetinfoResult<()> {
        self.ctx
            .ledger()
            .record_success(kind, Utc::now(), identifier)?;
        Ok(())
    }

    /// Swap in a bundle with one component replaced; returns its generation
    fn install(&self, component: Component) -> u64 {
        let now = Utc::now();
        let previous = self.active.rcu(|current| {
            let mut next = ActiveDataset::clone(current);
            match &component {
                Component::Routing(table) => next.routing = Some(Arc::clone(table)),
                Component::AsNames(names) => next.as_names = Some(Arc::clone(names)),
                Component::Geo(geo) => next.geo = Some(Arc::clone(geo)),
            }
            next.generation = current.generation + 1;
            next.built_at = Some(now);
            next
        });
        previous.generation + 1
    }

    /// Install a geolocation source directly, bypassing fetch and ledger
    pub fn install_geo(&self, geo: Arc<dyn GeoLocate>) -> u64 {
        self.install(Component::Geo(geo))
    }

    fn report(
        &self,
        kind: DatasetKind,
        outcome: RefreshOutcome,
        identifier: Option<String>,
    ) -> RefreshReport {
        let current = self.current();
        RefreshReport {
            kind,
            outcome,
            identifier: identifier.or_else(|| self.record(kind).source_identifier),
            entries: current.entry_count(kind),
            generation: current.generation,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::NetinfoConfig;
    use crate::datasets::as_names::tests::LISTING;
    use crate::datasets::routing::tests::write_mrt;
    use crate::fetch::{store_download, RawArtifact};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;
    use tempfile::TempDir;

    /// In-memory stand-in for the upstream sources
    pub(crate) struct FakeFetcher {
        dir: TempDir,
        pub identifier: Mutex<String>,
        pub announcements: Mutex<Vec<(String, u32)>>,
        pub listing: Mutex<String>,
        pub fail_routing: AtomicBool,
        pub fail_names: AtomicBool,
        pub names_delay: Mutex<Duration>,
        pub routing_calls: AtomicUsize,
        pub routing_downloads: AtomicUsize,
        pub names_calls: AtomicUsize,
        pub geo_calls: AtomicUsize,
    }

    impl FakeFetcher {
        pub(crate) fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                // plain MRT, so no compression suffix
                identifier: Mutex::new("rib.20240101.1200".to_string()),
                announcements: Mutex::new(vec![
                    ("10.0.0.0/8".to_string(), 64500),
                    ("10.1.0.0/16".to_string(), 64501),
                    ("192.0.2.0/24".to_string(), 13335),
                ]),
                listing: Mutex::new(LISTING.to_string()),
                fail_routing: AtomicBool::new(false),
                fail_names: AtomicBool::new(false),
                names_delay: Mutex::new(Duration::ZERO),
                routing_calls: AtomicUsize::new(0),
                routing_downloads: AtomicUsize::new(0),
                names_calls: AtomicUsize::new(0),
                geo_calls: AtomicUsize::new(0),
            }
        }
    }

    impl SourceFetcher for FakeFetcher {
        fn fetch_routing_table(
            &self,
            last_identifier: Option<&str>,
            force: bool,
        ) -> NetinfoResult<FetchOutcome> {
            self.routing_calls.fetch_add(1, Ordering::SeqCst);
            let identifier = self.identifier.lock().unwrap().clone();
            if !force && last_identifier == Some(identifier.as_str()) {
                return Ok(FetchOutcome::NoUpdateNeeded { identifier });
            }
            self.routing_downloads.fetch_add(1, Ordering::SeqCst);
            if self.fail_routing.load(Ordering::SeqCst) {
                return Err(NetinfoError::fetch(DatasetKind::Routing, "connection refused"));
            }

            let scratch = self.dir.path().join("upstream.mrt");
            let announcements = self.announcements.lock().unwrap().clone();
            let refs: Vec<(&str, u32)> =
                announcements.iter().map(|(p, a)| (p.as_str(), *a)).collect();
            write_mrt(&scratch, &refs);

            let path: PathBuf = self.dir.path().join("ribs").join(&identifier);
            let bytes = std::fs::read(&scratch).unwrap();
            let unchanged = store_download(bytes.as_slice(), &path).unwrap();
            Ok(FetchOutcome::Fetched(RawArtifact {
                identifier,
                path,
                unchanged,
            }))
        }

        fn fetch_as_names(&self) -> NetinfoResult<Vec<u8>> {
            self.names_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.names_delay.lock().unwrap();
            std::thread::sleep(delay);
            if self.fail_names.load(Ordering::SeqCst) {
                return Err(NetinfoError::fetch(DatasetKind::AsNames, "timed out"));
            }
            Ok(self.listing.lock().unwrap().as_bytes().to_vec())
        }

        fn fetch_geo_archive(&self) -> NetinfoResult<PathBuf> {
            self.geo_calls.fetch_add(1, Ordering::SeqCst);
            Err(NetinfoError::fetch(DatasetKind::Geo, "geolocation source unreachable"))
        }
    }

    pub(crate) fn orchestrator_with(
        data_dir: &std::path::Path,
        fetcher: Arc<FakeFetcher>,
        configure: impl FnOnce(&mut NetinfoConfig),
    ) -> Arc<RefreshOrchestrator> {
        let mut config = NetinfoConfig::with_data_dir(data_dir.to_string_lossy());
        configure(&mut config);
        let ctx = Arc::new(NetinfoContext::new(config).unwrap());
        Arc::new(RefreshOrchestrator::new(ctx, fetcher))
    }

    fn setup() -> (TempDir, Arc<FakeFetcher>, Arc<RefreshOrchestrator>) {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |_| {});
        (dir, fetcher, orchestrator)
    }

    #[test]
    fn test_initial_load() {
        let (dir, fetcher, orchestrator) = setup();
        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Unloaded);
        assert!(orchestrator.require(DatasetKind::Routing).is_err());

        let report = orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Rebuilt);
        assert_eq!(report.entries, Some(3));
        assert_eq!(report.identifier.as_deref(), Some("rib.20240101.1200"));
        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Loaded);
        assert_eq!(fetcher.routing_downloads.load(Ordering::SeqCst), 1);

        assert!(dir.path().join("asn").join("current.sqlite3").exists());
        let record = orchestrator.context().ledger().record(DatasetKind::Routing);
        assert!(record.last_update.is_some());
    }

    #[test]
    fn test_fresh_dataset_not_refetched() {
        let (_dir, fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        let before = orchestrator.current();

        let report = orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Fresh);
        assert_eq!(fetcher.routing_calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&before, &orchestrator.current()));
    }

    #[test]
    fn test_forced_refresh_failure_keeps_bundle() {
        let (_dir, fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        let before = orchestrator.current();

        fetcher.fail_routing.store(true, Ordering::SeqCst);
        let err = orchestrator
            .force_refresh(DatasetKind::Routing)
            .unwrap_err();

        assert_eq!(err.code(), crate::error::ErrorCode::FetchFailed);
        assert!(Arc::ptr_eq(&before, &orchestrator.current()));
        // the ledger is still young, but the failed attempt marks it stale
        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Stale);
        assert_eq!(orchestrator.status()[0].state, DatasetState::Stale);
    }

    #[test]
    fn test_success_after_failure_clears_stale() {
        let (_dir, fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();

        fetcher.fail_routing.store(true, Ordering::SeqCst);
        orchestrator.force_refresh(DatasetKind::Routing).unwrap_err();
        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Stale);

        fetcher.fail_routing.store(false, Ordering::SeqCst);
        orchestrator.force_refresh(DatasetKind::Routing).unwrap();
        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Loaded);
    }

    #[test]
    fn test_failed_refresh_backs_off() {
        let (_dir, fetcher, orchestrator) = setup();
        for _ in 0..4 {
            let err = orchestrator.ensure_fresh(DatasetKind::Geo).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::FetchFailed);
        }
        assert_eq!(fetcher.geo_calls.load(Ordering::SeqCst), 1);
        assert!(orchestrator.recent_failure(DatasetKind::Geo).is_some());
        assert!(!orchestrator.ensure_fresh_background(DatasetKind::Geo));

        // an explicit refresh is not held back
        orchestrator.force_refresh(DatasetKind::Geo).unwrap_err();
        assert_eq!(fetcher.geo_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator =
            orchestrator_with(dir.path(), fetcher.clone(), |c| c.retry_backoff_secs = 0);

        fetcher.fail_names.store(true, Ordering::SeqCst);
        orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap_err();
        assert!(orchestrator.recent_failure(DatasetKind::AsNames).is_none());

        fetcher.fail_names.store(false, Ordering::SeqCst);
        let report = orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Rebuilt);
        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_upstream_dump_builds_directly() {
        let fetcher = FakeFetcher::new();
        let artifact = match fetcher.fetch_routing_table(None, false).unwrap() {
            FetchOutcome::Fetched(artifact) => artifact,
            FetchOutcome::NoUpdateNeeded { .. } => panic!("expected a download"),
        };
        let table = RoutingTableBuilder::build_from_file(&artifact.path).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_intervals_are_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |c| {
            c.routing_refresh_secs = 0;
        });
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap();
        std::thread::sleep(Duration::from_millis(1100));

        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Stale);
        assert_eq!(orchestrator.state(DatasetKind::AsNames), DatasetState::Loaded);
        let report = orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Fresh);
        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forced_refresh_of_identical_dump_skips_rebuild() {
        let (_dir, fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        let before = orchestrator.current();

        let report = orchestrator.force_refresh(DatasetKind::Routing).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Unchanged);
        assert_eq!(fetcher.routing_downloads.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(&before, &orchestrator.current()));
    }

    #[test]
    fn test_forced_refresh_installs_new_table() {
        let (_dir, fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        let old = orchestrator.current();

        *fetcher.identifier.lock().unwrap() = "rib.20240101.1400".to_string();
        fetcher
            .announcements
            .lock()
            .unwrap()
            .push(("10.1.2.0/24".to_string(), 64999));

        let report = orchestrator.force_refresh(DatasetKind::Routing).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Rebuilt);
        assert_eq!(report.generation, old.generation + 1);

        let ip = "10.1.2.3".parse().unwrap();
        let current = orchestrator.current();
        assert_eq!(
            current.routing.as_ref().unwrap().longest_match(ip).unwrap().origin_as,
            64999
        );
        // the old snapshot is untouched
        assert_eq!(
            old.routing.as_ref().unwrap().longest_match(ip).unwrap().origin_as,
            64501
        );
    }

    #[test]
    fn test_stale_with_same_dump_advances_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator =
            orchestrator_with(dir.path(), fetcher.clone(), |c| {
                c.set_refresh_interval_secs(0)
            });

        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        let first = orchestrator
            .context()
            .ledger()
            .record(DatasetKind::Routing)
            .last_update
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(orchestrator.state(DatasetKind::Routing), DatasetState::Stale);

        let report = orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        assert_eq!(report.outcome, RefreshOutcome::Unchanged);
        assert_eq!(fetcher.routing_downloads.load(Ordering::SeqCst), 1);
        let second = orchestrator
            .context()
            .ledger()
            .record(DatasetKind::Routing)
            .last_update
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_unparseable_dump_keeps_prior_table() {
        let (_dir, fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        let before = orchestrator.current();

        *fetcher.identifier.lock().unwrap() = "rib.20240101.1400".to_string();
        fetcher.announcements.lock().unwrap().clear();

        let err = orchestrator
            .force_refresh(DatasetKind::Routing)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ParseFailed);
        assert!(Arc::ptr_eq(&before, &orchestrator.current()));
        assert_eq!(
            orchestrator
                .context()
                .ledger()
                .record(DatasetKind::Routing)
                .source_identifier
                .as_deref(),
            Some("rib.20240101.1200")
        );
    }

    #[test]
    fn test_concurrent_ensure_fresh_coalesces() {
        let (_dir, fetcher, orchestrator) = setup();
        *fetcher.names_delay.lock().unwrap() = Duration::from_millis(300);

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    orchestrator.ensure_fresh(DatasetKind::AsNames)
                })
            })
            .collect();

        let generations: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().generation)
            .collect();

        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 1);
        assert!(generations.iter().all(|g| *g == 1));
    }

    #[test]
    fn test_concurrent_failure_shared() {
        let (_dir, fetcher, orchestrator) = setup();
        *fetcher.names_delay.lock().unwrap() = Duration::from_millis(300);
        fetcher.fail_names.store(true, Ordering::SeqCst);

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let orchestrator = orchestrator.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    orchestrator.ensure_fresh(DatasetKind::AsNames)
                })
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::FetchFailed);
        }
        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.state(DatasetKind::AsNames), DatasetState::Unloaded);
    }

    #[test]
    fn test_as_names_with_malformed_line() {
        let (dir, _fetcher, orchestrator) = setup();
        let report = orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap();
        assert_eq!(report.entries, Some(3));

        let names = orchestrator.current().as_names.clone().unwrap();
        assert_eq!(names.name_for(15169), "GOOGLE - Google LLC, US");
        assert!(dir.path().join("asn").join("as_names.json").exists());
    }

    #[test]
    fn test_geo_failure_leaves_unloaded() {
        let (_dir, fetcher, orchestrator) = setup();
        let err = orchestrator.ensure_fresh(DatasetKind::Geo).unwrap_err();
        assert_eq!(err.kind(), Some(DatasetKind::Geo));
        assert_eq!(fetcher.geo_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.state(DatasetKind::Geo), DatasetState::Unloaded);
        assert!(orchestrator.current().geo.is_none());
    }

    #[test]
    fn test_bootstrap_restores_persisted_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fetcher = Arc::new(FakeFetcher::new());
            let orchestrator = orchestrator_with(dir.path(), fetcher, |_| {});
            orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
            orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap();
        }

        let fetcher = Arc::new(FakeFetcher::new());
        fetcher.fail_routing.store(true, Ordering::SeqCst);
        fetcher.fail_names.store(true, Ordering::SeqCst);
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |_| {});

        let results = orchestrator.bootstrap();
        assert_eq!(results.len(), 3);
        for (kind, result) in &results {
            match kind {
                DatasetKind::Routing | DatasetKind::AsNames => {
                    assert_eq!(result.as_ref().unwrap().outcome, RefreshOutcome::Restored)
                }
                DatasetKind::Geo => assert!(result.is_err()),
            }
        }
        assert_eq!(fetcher.routing_calls.load(Ordering::SeqCst), 0);
        assert!(orchestrator.require(DatasetKind::Routing).is_ok());
        assert_eq!(
            orchestrator.state(DatasetKind::Geo),
            DatasetState::Unloaded
        );
    }

    #[test]
    fn test_fresh_ledger_restores_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fetcher = Arc::new(FakeFetcher::new());
            let orchestrator = orchestrator_with(dir.path(), fetcher, |_| {});
            orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
            orchestrator.ensure_fresh(DatasetKind::AsNames).unwrap();
        }

        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator = orchestrator_with(dir.path(), fetcher.clone(), |_| {});
        for kind in [DatasetKind::Routing, DatasetKind::AsNames] {
            let report = orchestrator.ensure_fresh(kind).unwrap();
            assert_eq!(report.outcome, RefreshOutcome::Restored);
        }
        assert_eq!(fetcher.routing_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.current().generation, 2);
    }

    #[test]
    fn test_unloaded_with_current_dump_restores_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let fetcher = Arc::new(FakeFetcher::new());
            let orchestrator = orchestrator_with(dir.path(), fetcher, |_| {});
            orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        }
        std::thread::sleep(Duration::from_millis(1100));

        // stale by age, but upstream still publishes the same dump
        let fetcher = Arc::new(FakeFetcher::new());
        let orchestrator =
            orchestrator_with(dir.path(), fetcher.clone(), |c| {
                c.set_refresh_interval_secs(0)
            });
        let report = orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();

        assert_eq!(report.outcome, RefreshOutcome::Restored);
        assert_eq!(fetcher.routing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.routing_downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restore_only_when_unloaded() {
        let (_dir, _fetcher, orchestrator) = setup();
        assert!(!orchestrator.restore(DatasetKind::Routing));
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();
        assert!(!orchestrator.restore(DatasetKind::Routing));
    }

    #[test]
    fn test_background_refresh() {
        let (_dir, fetcher, orchestrator) = setup();
        assert!(orchestrator.ensure_fresh_background(DatasetKind::AsNames));

        for _ in 0..50 {
            if orchestrator.current().as_names.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(orchestrator.current().as_names.is_some());
        assert_eq!(fetcher.names_calls.load(Ordering::SeqCst), 1);
        // fresh now, nothing to start
        assert!(!orchestrator.ensure_fresh_background(DatasetKind::AsNames));
    }

    #[test]
    fn test_status() {
        let (_dir, _fetcher, orchestrator) = setup();
        orchestrator.ensure_fresh(DatasetKind::Routing).unwrap();

        let status = orchestrator.status();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0].kind, DatasetKind::Routing);
        assert_eq!(status[0].state, DatasetState::Loaded);
        assert_eq!(status[0].entries, Some(3));
        assert_eq!(status[2].state, DatasetState::Unloaded);
    }
}
