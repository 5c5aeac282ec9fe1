use anyhow::{anyhow, Result};
use config::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RIB_BASE_URL: &str = "http://archive.routeviews.org/bgpdata";
pub const DEFAULT_AS_NAMES_URL: &str = "https://www.cidr-report.org/as2.0/autnums.html";
pub const DEFAULT_GEO_ARCHIVE_URL: &str =
    "https://geolite.maxmind.com/download/geoip/database/GeoLite2-City.tar.gz";

#[derive(Debug, Clone)]
pub struct NetinfoConfig {
    /// Path to the directory holding ledger, dumps and current datasets
    pub data_dir: String,

    /// Maximum routing table age before it is refreshed (default: 30 minutes)
    pub routing_refresh_secs: u64,

    /// Maximum AS-name directory age before it is refreshed (default: 12 hours)
    pub as_names_refresh_secs: u64,

    /// Maximum geolocation database age before it is refreshed (default: 1 week)
    pub geo_refresh_secs: u64,

    /// How long a failed refresh blocks further attempts (default: 5 minutes)
    pub retry_backoff_secs: u64,

    /// TTL for memoized lookup results (default: 1 hour)
    pub cache_ttl_secs: u64,

    /// Global timeout for a single download (default: 10 minutes)
    pub fetch_timeout_secs: u64,

    /// Connect timeout for downloads (default: 30 seconds)
    pub connect_timeout_secs: u64,

    /// Period of the background refresh timer (default: 5 minutes)
    pub schedule_tick_secs: u64,

    /// What a lookup does when it finds stale data
    pub refresh_policy: RefreshPolicy,

    /// Largest block `expand_network` will enumerate
    pub expand_limit: u64,

    /// Minimum share of anchor lines that must parse as AS names
    pub min_name_match_ratio: f64,

    pub rib_base_url: String,
    pub as_names_url: String,
    pub geo_archive_url: String,
}

const EMPTY_CONFIG: &str = r#"### netinfo configuration file

### directory for datasets and the freshness ledger
# data_dir = "~/.netinfo"

### refresh and cache settings (in seconds)
# routing_refresh_secs = 1800      # 30 minutes
# as_names_refresh_secs = 43200    # 12 hours
# geo_refresh_secs = 604800        # 1 week
# retry_backoff_secs = 300         # wait after a failed refresh
# cache_ttl_secs = 3600            # 1 hour
# schedule_tick_secs = 300         # 5 minutes

### download timeouts (in seconds)
# fetch_timeout_secs = 600
# connect_timeout_secs = 30

### "inline" blocks a lookup while stale data refreshes,
### "background" answers from stale data and refreshes out of band
# refresh_policy = "inline"

### largest CIDR block (in addresses) that may be expanded
# expand_limit = 65536

### AS-name builds fail when fewer than this share of entries parse
# min_name_match_ratio = 0.5

### upstream sources
# rib_base_url = "http://archive.routeviews.org/bgpdata"
# as_names_url = "https://www.cidr-report.org/as2.0/autnums.html"
# geo_archive_url = "https://geolite.maxmind.com/download/geoip/database/GeoLite2-City.tar.gz"
"#;

impl Default for NetinfoConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.netinfo", home_dir),
            routing_refresh_secs: 1800,    // 30 minutes
            as_names_refresh_secs: 43_200, // 12 hours
            geo_refresh_secs: 604_800,     // 1 week
            retry_backoff_secs: 300,
            cache_ttl_secs: 3600,        // 1 hour
            fetch_timeout_secs: 600,     // 10 minutes
            connect_timeout_secs: 30,
            schedule_tick_secs: 300, // 5 minutes
            refresh_policy: RefreshPolicy::Inline,
            expand_limit: 65536,
            min_name_match_ratio: 0.5,
            rib_base_url: DEFAULT_RIB_BASE_URL.to_string(),
            as_names_url: DEFAULT_AS_NAMES_URL.to_string(),
            geo_archive_url: DEFAULT_GEO_ARCHIVE_URL.to_string(),
        }
    }
}

impl NetinfoConfig {
    /// Function to create and initialize a new configuration
    pub fn new(path: &Option<String>) -> Result<NetinfoConfig> {
        let mut builder = Config::builder();

        // By default use $HOME/.netinfo/netinfo.toml as the configuration file path
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?
            .to_owned();

        let netinfo_dir = format!("{}/.netinfo", home_dir.as_str());

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                std::fs::create_dir_all(netinfo_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create netinfo directory: {}", e))?;
                let p = format!("{}/netinfo.toml", netinfo_dir.as_str());
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // E.g., `NETINFO_DATA_DIR=/srv/netinfo netinfo serve` would set the data directory
        builder = builder.add_source(config::Environment::with_prefix("NETINFO"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Self::from_values(&values, &netinfo_dir)
    }

    /// Build a configuration from flat key/value settings, falling back to defaults
    pub fn from_values(values: &HashMap<String, String>, default_dir: &str) -> Result<Self> {
        let defaults = NetinfoConfig::default();

        let data_dir = match values.get("data_dir") {
            Some(p) => expand_home(p),
            None => default_dir.to_string(),
        };
        std::fs::create_dir_all(data_dir.as_str())
            .map_err(|e| anyhow!("Unable to create data directory {}: {}", data_dir, e))?;

        let refresh_policy = match values.get("refresh_policy") {
            Some(s) => s.parse::<RefreshPolicy>()?,
            None => defaults.refresh_policy,
        };

        let min_name_match_ratio = values
            .get("min_name_match_ratio")
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|r| (0.0..=1.0).contains(r))
            .unwrap_or(defaults.min_name_match_ratio);

        Ok(NetinfoConfig {
            data_dir,
            routing_refresh_secs: parse_u64(
                values,
                "routing_refresh_secs",
                defaults.routing_refresh_secs,
            ),
            as_names_refresh_secs: parse_u64(
                values,
                "as_names_refresh_secs",
                defaults.as_names_refresh_secs,
            ),
            geo_refresh_secs: parse_u64(values, "geo_refresh_secs", defaults.geo_refresh_secs),
            retry_backoff_secs: parse_u64(
                values,
                "retry_backoff_secs",
                defaults.retry_backoff_secs,
            ),
            cache_ttl_secs: parse_u64(values, "cache_ttl_secs", defaults.cache_ttl_secs),
            fetch_timeout_secs: parse_u64(
                values,
                "fetch_timeout_secs",
                defaults.fetch_timeout_secs,
            )
            .max(1),
            connect_timeout_secs: parse_u64(
                values,
                "connect_timeout_secs",
                defaults.connect_timeout_secs,
            )
            .max(1),
            schedule_tick_secs: parse_u64(
                values,
                "schedule_tick_secs",
                defaults.schedule_tick_secs,
            )
            .max(1),
            refresh_policy,
            expand_limit: parse_u64(values, "expand_limit", defaults.expand_limit),
            min_name_match_ratio,
            rib_base_url: values
                .get("rib_base_url")
                .cloned()
                .unwrap_or(defaults.rib_base_url),
            as_names_url: values
                .get("as_names_url")
                .cloned()
                .unwrap_or(defaults.as_names_url),
            geo_archive_url: values
                .get("geo_archive_url")
                .cloned()
                .unwrap_or(defaults.geo_archive_url),
        })
    }

    /// Create a configuration rooted at the given directory with default settings
    pub fn with_data_dir(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    fn data_path(&self) -> PathBuf {
        PathBuf::from(self.data_dir.trim_end_matches('/'))
    }

    /// Get the path to the freshness ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.data_path().join("freshness.json")
    }

    /// Directory holding routing artifacts
    pub fn asn_dir(&self) -> PathBuf {
        self.data_path().join("asn")
    }

    /// Directory where downloaded RIB dumps are retained
    pub fn ribs_dir(&self) -> PathBuf {
        self.asn_dir().join("ribs")
    }

    /// Durable "current" routing table
    pub fn routing_table_path(&self) -> PathBuf {
        self.asn_dir().join("current.sqlite3")
    }

    /// Durable "current" AS-name directory
    pub fn as_names_path(&self) -> PathBuf {
        self.asn_dir().join("as_names.json")
    }

    /// Directory holding the geolocation database
    pub fn geo_dir(&self) -> PathBuf {
        self.data_path().join("geoip")
    }

    /// Durable "current" geolocation database
    pub fn geo_db_path(&self) -> PathBuf {
        self.geo_dir().join(GEO_CURRENT_FILE)
    }

    /// Maximum age of `kind` before it counts as stale
    pub fn refresh_interval(&self, kind: DatasetKind) -> Duration {
        Duration::from_secs(self.refresh_interval_secs(kind))
    }

    pub fn refresh_interval_secs(&self, kind: DatasetKind) -> u64 {
        match kind {
            DatasetKind::Routing => self.routing_refresh_secs,
            DatasetKind::AsNames => self.as_names_refresh_secs,
            DatasetKind::Geo => self.geo_refresh_secs,
        }
    }

    /// Set the refresh interval of every kind at once
    pub fn set_refresh_interval_secs(&mut self, secs: u64) {
        self.routing_refresh_secs = secs;
        self.as_names_refresh_secs = secs;
        self.geo_refresh_secs = secs;
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn schedule_tick(&self) -> Duration {
        Duration::from_secs(self.schedule_tick_secs)
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        [
            format!("Data Directory:     {}", self.data_dir),
            format!("Ledger Path:        {}", self.ledger_path().display()),
            format!("Routing Refresh:    {} seconds", self.routing_refresh_secs),
            format!("AS Names Refresh:   {} seconds", self.as_names_refresh_secs),
            format!("GeoIP Refresh:      {} seconds", self.geo_refresh_secs),
            format!("Retry Backoff:      {} seconds", self.retry_backoff_secs),
            format!("Cache TTL:          {} seconds", self.cache_ttl_secs),
            format!("Schedule Tick:      {} seconds", self.schedule_tick_secs),
            format!("Fetch Timeout:      {} seconds", self.fetch_timeout_secs),
            format!("Refresh Policy:     {}", self.refresh_policy),
            format!("Expand Limit:       {} addresses", self.expand_limit),
            format!("RIB Source:         {}", self.rib_base_url),
            format!("AS Names Source:    {}", self.as_names_url),
            format!("GeoIP Source:       {}", self.geo_archive_url),
        ]
        .join("\n")
    }

    /// Get the config file path
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.netinfo/netinfo.toml", home_dir)
    }
}

/// File name of the installed geolocation database inside the geo directory
pub const GEO_CURRENT_FILE: &str = "current.mmdb";

fn parse_u64(values: &HashMap<String, String>, key: &str, default: u64) -> u64 {
    values
        .get(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().to_string(),
        _ => path.to_string(),
    }
}

// =============================================================================
// Dataset kinds and refresh policy
// =============================================================================

/// The independently refreshed datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Prefix-to-origin table built from a RIB dump
    Routing,
    /// AS number to organization name listing
    AsNames,
    /// Geolocation database
    Geo,
}

impl DatasetKind {
    pub fn all() -> [DatasetKind; 3] {
        [DatasetKind::Routing, DatasetKind::AsNames, DatasetKind::Geo]
    }

    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Routing => "routing",
            DatasetKind::AsNames => "as_names",
            DatasetKind::Geo => "geo",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DatasetKind::Routing => "Prefix-to-origin routing table (from RouteViews RIB dumps)",
            DatasetKind::AsNames => "AS number to organization names (from CIDR report)",
            DatasetKind::Geo => "IP geolocation database (GeoLite2 City)",
        }
    }
}

impl std::str::FromStr for DatasetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "routing" | "rib" | "asn" => Ok(DatasetKind::Routing),
            "as_names" | "as-names" | "asnames" | "names" => Ok(DatasetKind::AsNames),
            "geo" | "geoip" => Ok(DatasetKind::Geo),
            other => Err(anyhow!(
                "unknown dataset '{}', use 'routing', 'as_names' or 'geo'",
                other
            )),
        }
    }
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What a lookup does when it finds a stale dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Refresh synchronously before answering
    #[default]
    Inline,
    /// Answer from the current data and refresh out of band
    Background,
}

impl std::str::FromStr for RefreshPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(RefreshPolicy::Inline),
            "background" | "serve-stale" => Ok(RefreshPolicy::Background),
            other => Err(anyhow!(
                "unknown refresh policy '{}', use 'inline' or 'background'",
                other
            )),
        }
    }
}

impl std::fmt::Display for RefreshPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshPolicy::Inline => write!(f, "inline"),
            RefreshPolicy::Background => write!(f, "background"),
        }
    }
}
