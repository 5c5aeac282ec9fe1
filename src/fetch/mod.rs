//! Upstream dataset retrieval
//!
//! [`SourceFetcher`] is the seam between refresh orchestration and the
//! network. [`HttpSourceFetcher`] talks to RouteViews, the CIDR report and
//! MaxMind with a shared `ureq` agent whose timeouts are always finite.
//! Downloads are streamed to a temporary file and renamed into place, so a
//! partially downloaded artifact is never visible under its final name.

use crate::config::{DatasetKind, NetinfoConfig};
use crate::error::{NetinfoError, NetinfoResult};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest AS-name listing accepted into memory
const AS_NAMES_MAX_BYTES: u64 = 64 * 1024 * 1024;

const GEO_ARCHIVE_FILE: &str = "GeoLite2-City.tar.gz";

/// A downloaded routing dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArtifact {
    /// Upstream file name, e.g. `rib.20240101.1200.bz2`
    pub identifier: String,
    /// Where the dump is retained
    pub path: PathBuf,
    /// The bytes equal the previously retained dump of the same name
    pub unchanged: bool,
}

/// Result of asking for the routing dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(RawArtifact),
    /// The expected upstream dump is the one already in service
    NoUpdateNeeded { identifier: String },
}

/// Retrieves raw datasets from their upstream origins
pub trait SourceFetcher: Send + Sync {
    /// Fetch the newest routing dump
    ///
    /// Without `force`, returns [`FetchOutcome::NoUpdateNeeded`] without any
    /// network call when the expected dump equals `last_identifier`.
    fn fetch_routing_table(
        &self,
        last_identifier: Option<&str>,
        force: bool,
    ) -> NetinfoResult<FetchOutcome>;

    /// Fetch the raw AS-name listing
    fn fetch_as_names(&self) -> NetinfoResult<Vec<u8>>;

    /// Fetch the geolocation archive, returning where it was saved
    fn fetch_geo_archive(&self) -> NetinfoResult<PathBuf>;
}

// =============================================================================
// RIB naming
// =============================================================================

/// Name of the RIB dump published for `now`
///
/// Dumps are published every two hours; an odd hour maps to the preceding
/// even hour.
pub fn rib_identifier(now: DateTime<Utc>) -> String {
    let hour = now.hour() - now.hour() % 2;
    format!(
        "rib.{:04}{:02}{:02}.{:02}00.bz2",
        now.year(),
        now.month(),
        now.day(),
        hour
    )
}

/// Download URL of the RIB dump published for `now`
pub fn rib_url(base_url: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}/{:04}.{:02}/RIBS/{}",
        base_url.trim_end_matches('/'),
        now.year(),
        now.month(),
        rib_identifier(now)
    )
}

// =============================================================================
// HTTP fetcher
// =============================================================================

pub struct HttpSourceFetcher {
    agent: ureq::Agent,
    rib_base_url: String,
    as_names_url: String,
    geo_archive_url: String,
    ribs_dir: PathBuf,
    geo_dir: PathBuf,
}

impl HttpSourceFetcher {
    pub fn new(config: &NetinfoConfig) -> Self {
        Self {
            agent: build_agent(config.fetch_timeout(), config.connect_timeout()),
            rib_base_url: config.rib_base_url.clone(),
            as_names_url: config.as_names_url.clone(),
            geo_archive_url: config.geo_archive_url.clone(),
            ribs_dir: config.ribs_dir(),
            geo_dir: config.geo_dir(),
        }
    }

    /// Routing fetch for an explicit point in time
    pub fn fetch_routing_table_at(
        &self,
        now: DateTime<Utc>,
        last_identifier: Option<&str>,
        force: bool,
    ) -> NetinfoResult<FetchOutcome> {
        let identifier = rib_identifier(now);
        if !force && last_identifier == Some(identifier.as_str()) {
            debug!("routing dump {} already in service", identifier);
            return Ok(FetchOutcome::NoUpdateNeeded { identifier });
        }

        let url = rib_url(&self.rib_base_url, now);
        info!("downloading routing dump {}", url);
        let reader = self
            .open(&url)
            .map_err(|e| NetinfoError::fetch(DatasetKind::Routing, format!("{:#}", e)))?;

        let target = self.ribs_dir.join(&identifier);
        let unchanged = store_download(reader, &target)
            .map_err(|e| NetinfoError::fetch(DatasetKind::Routing, format!("{:#}", e)))?;

        Ok(FetchOutcome::Fetched(RawArtifact {
            identifier,
            path: target,
            unchanged,
        }))
    }

    fn open(&self, url: &str) -> Result<impl Read> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| anyhow!("request to {} failed: {}", url, e))?;
        Ok(response.into_body().into_reader())
    }
}

impl SourceFetcher for HttpSourceFetcher {
    fn fetch_routing_table(
        &self,
        last_identifier: Option<&str>,
        force: bool,
    ) -> NetinfoResult<FetchOutcome> {
        self.fetch_routing_table_at(Utc::now(), last_identifier, force)
    }

    fn fetch_as_names(&self) -> NetinfoResult<Vec<u8>> {
        info!("downloading AS names from {}", self.as_names_url);
        let bytes = self
            .agent
            .get(&self.as_names_url)
            .call()
            .map_err(|e| {
                NetinfoError::fetch(
                    DatasetKind::AsNames,
                    format!("request to {} failed: {}", self.as_names_url, e),
                )
            })?
            .body_mut()
            .with_config()
            .limit(AS_NAMES_MAX_BYTES)
            .read_to_vec()
            .map_err(|e| {
                NetinfoError::fetch(
                    DatasetKind::AsNames,
                    format!("failed to read response: {}", e),
                )
            })?;
        Ok(bytes)
    }

    fn fetch_geo_archive(&self) -> NetinfoResult<PathBuf> {
        info!("downloading geolocation archive from {}", self.geo_archive_url);
        let reader = self
            .open(&self.geo_archive_url)
            .map_err(|e| NetinfoError::fetch(DatasetKind::Geo, format!("{:#}", e)))?;

        let target = self.geo_dir.join(GEO_ARCHIVE_FILE);
        store_download(reader, &target)
            .map_err(|e| NetinfoError::fetch(DatasetKind::Geo, format!("{:#}", e)))?;
        Ok(target)
    }
}

fn build_agent(global: Duration, connect: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(global))
        .timeout_connect(Some(connect))
        .build();
    config.into()
}

/// Stream `reader` into `target` through a temporary file
///
/// Returns `true` when `target` already existed with identical content; the
/// existing file is then kept as is.
pub(crate) fn store_download<R: Read>(mut reader: R, target: &Path) -> Result<bool> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
    }

    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    let partial = target.with_file_name(name);

    let mut file = fs::File::create(&partial)
        .map_err(|e| anyhow!("Failed to create {}: {}", partial.display(), e))?;
    let copied = std::io::copy(&mut reader, &mut file);
    drop(file);
    let written = match copied {
        Ok(n) => n,
        Err(e) => {
            if let Err(rm) = fs::remove_file(&partial) {
                warn!("Failed to remove {}: {}", partial.display(), rm);
            }
            return Err(anyhow!("download interrupted: {}", e));
        }
    };
    debug!("downloaded {} bytes to {}", written, partial.display());

    if target.exists() && same_contents(&partial, target)? {
        fs::remove_file(&partial)
            .map_err(|e| anyhow!("Failed to remove {}: {}", partial.display(), e))?;
        return Ok(true);
    }

    fs::rename(&partial, target).map_err(|e| {
        anyhow!(
            "Failed to move {} to {}: {}",
            partial.display(),
            target.display(),
            e
        )
    })?;
    Ok(false)
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    let len_a = fs::metadata(a)
        .map_err(|e| anyhow!("Failed to stat {}: {}", a.display(), e))?
        .len();
    let len_b = fs::metadata(b)
        .map_err(|e| anyhow!("Failed to stat {}: {}", b.display(), e))?
        .len();
    if len_a != len_b {
        return Ok(false);
    }

    let open = |p: &Path| {
        fs::File::open(p)
            .map(BufReader::new)
            .map_err(|e| anyhow!("Failed to open {}: {}", p.display(), e))
    };
    let (mut ra, mut rb) = (open(a)?, open(b)?);
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = ra.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        rb.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}
