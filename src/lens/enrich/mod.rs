//! Enrichment lens
//!
//! Answers IP, ASN and CIDR queries from the datasets currently in service.
//! Before reading, the engine makes sure the datasets it needs are fresh
//! according to the configured [`RefreshPolicy`]:
//!
//! - `inline`: a stale dataset is refreshed before the lookup returns. If the
//!   refresh fails the stale data is served.
//! - `background`: stale data is served at once and a refresh is started out
//!   of band. A dataset that was never loaded is still loaded inline.
//!
//! A routing table is required for IP and ASN lookups. AS names and
//! geolocation are best effort: when they are missing, names resolve to
//! [`UNKNOWN_AS_NAME`] and geo fields are left out.

pub mod cache;

use crate::config::{DatasetKind, RefreshPolicy};
use crate::datasets::as_names::UNKNOWN_AS_NAME;
use crate::datasets::geo::GeoRecord;
use crate::datasets::routing::RoutingEntry;
use crate::error::{NetinfoError, NetinfoResult};
use crate::refresh::{ActiveDataset, RefreshOrchestrator};
use ipnet::IpNet;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use cache::{CacheStats, ResultCache};

// =============================================================================
// Types
// =============================================================================

/// Everything known about one IP address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentResult {
    /// Origin AS of the longest matching prefix
    pub as_num: Option<u32>,
    /// Longest matching prefix in CIDR notation
    pub network: Option<String>,
    pub as_name: Option<String>,
    pub ip: String,
    pub ip_version: u8,
    /// Address as a zero-padded `0x` hex integer
    pub ip_hex: String,
    pub network_broadcast: Option<String>,
    pub network_netmask: Option<String>,
    pub network_hostmask: Option<String>,
    pub network_size: Option<u128>,
    /// Absent when no geolocation database is loaded
    #[serde(flatten)]
    pub geo: Option<GeoRecord>,
}

/// Name and announced prefixes of one AS
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsEnrichmentResult {
    pub as_num: u32,
    pub prefixes: Vec<String>,
    pub prefix_count: usize,
    pub as_name: String,
}

/// Every address of a CIDR block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkExpansion {
    pub cidr: String,
    pub network_addresses: Vec<String>,
    pub network_size: u128,
}

/// Answer to a free-form query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LookupAnswer {
    Ip(EnrichmentResult),
    Asn(AsEnrichmentResult),
    Network(NetworkExpansion),
}

/// What a free-form query string turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Ip(IpAddr),
    Asn(u32),
    Network(IpNet),
}

impl QueryKind {
    /// Classify `query` as an address, an `AS<n>` number or a CIDR block
    pub fn detect(query: &str) -> NetinfoResult<Self> {
        let query = query.trim();
        if query.contains('/') {
            return parse_network(query).map(QueryKind::Network);
        }
        if let Ok(ip) = query.parse::<IpAddr>() {
            return Ok(QueryKind::Ip(ip));
        }
        parse_asn(query).map(QueryKind::Asn)
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn parse_ip(input: &str) -> NetinfoResult<IpAddr> {
    input
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| NetinfoError::invalid_query(format!("'{}' is not an IP address", input)))
}

/// Accepts `13335`, `AS13335` and `as13335`
pub fn parse_asn(input: &str) -> NetinfoResult<u32> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("AS")
        .or_else(|| trimmed.strip_prefix("as"))
        .or_else(|| trimmed.strip_prefix("As"))
        .unwrap_or(trimmed);
    digits
        .parse::<u32>()
        .map_err(|_| NetinfoError::invalid_query(format!("'{}' is not an AS number", input)))
}

fn parse_network(input: &str) -> NetinfoResult<IpNet> {
    input
        .trim()
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| NetinfoError::invalid_query(format!("'{}' is not a CIDR block", input)))
}

/// Number of addresses in `net`, saturating for an IPv6 /0
pub fn network_size(net: &IpNet) -> u128 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

fn ip_hex(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("0x{:08x}", u32::from(v4)),
        IpAddr::V6(v6) => format!("0x{:032x}", u128::from(v6)),
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Lookup engine over the orchestrator's active datasets
///
/// # Example
///
/// ```rust,ignore
/// use netinfo::lens::enrich::EnrichmentEngine;
///
/// let engine = EnrichmentEngine::new(orchestrator);
/// let result = engine.lookup_ip("1.1.1.1")?;
/// println!("{:?} {:?}", result.as_num, result.network);
/// ```
pub struct EnrichmentEngine {
    orchestrator: Arc<RefreshOrchestrator>,
    ip_cache: ResultCache<EnrichmentResult>,
    asn_cache: ResultCache<AsEnrichmentResult>,
    cache_ttl: Duration,
    policy: RefreshPolicy,
    expand_limit: u64,
}

impl EnrichmentEngine {
    /// Create an engine with TTL, policy and expansion limit from the configuration
    pub fn new(orchestrator: Arc<RefreshOrchestrator>) -> Self {
        let config = orchestrator.context().config();
        let cache_ttl = config.cache_ttl();
        let policy = config.refresh_policy;
        let expand_limit = config.expand_limit;
        Self {
            orchestrator,
            ip_cache: ResultCache::new(),
            asn_cache: ResultCache::new(),
            cache_ttl,
            policy,
            expand_limit,
        }
    }

    pub fn orchestrator(&self) -> &Arc<RefreshOrchestrator> {
        &self.orchestrator
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    /// Combined statistics of the IP and ASN caches
    pub fn cache_stats(&self) -> CacheStats {
        let ip = self.ip_cache.stats();
        let asn = self.asn_cache.stats();
        CacheStats {
            hits: ip.hits + asn.hits,
            misses: ip.misses + asn.misses,
            entries: ip.entries + asn.entries,
        }
    }

    pub fn clear_cache(&self) {
        self.ip_cache.clear();
        self.asn_cache.clear();
    }

    /// Bring `kind` up to date according to the refresh policy
    ///
    /// Fails only when `kind` has never been loaded and loading it failed.
    fn prepare(&self, kind: DatasetKind) -> NetinfoResult<()> {
        let loaded = self.orchestrator.current().is_loaded(kind);
        match (self.policy, loaded) {
            (RefreshPolicy::Background, true) => {
                if self.orchestrator.ensure_fresh_background(kind) {
                    debug!("serving {} data while it refreshes", kind);
                }
                Ok(())
            }
            _ => {
                // failures inside the retry backoff were already logged
                let retrying = self.orchestrator.recent_failure(kind).is_none();
                match self.orchestrator.ensure_fresh(kind) {
                    Ok(_) => Ok(()),
                    Err(e) if self.orchestrator.current().is_loaded(kind) => {
                        if retrying {
                            warn!("serving stale {} data: {}", kind, e);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        if retrying {
                            warn!("{} data unavailable: {}", kind, e);
                        }
                        Err(NetinfoError::unavailable(kind))
                    }
                }
            }
        }
    }

    /// Like `prepare`, but a missing optional dataset is not an error
    fn prepare_optional(&self, kind: DatasetKind) {
        if let Err(e) = self.prepare(kind) {
            debug!("continuing without {} data: {}", kind, e);
        }
    }

    /// Enrich one IP address
    ///
    /// An address outside every announced prefix is not an error; its
    /// routing fields are `None`.
    pub fn lookup_ip(&self, ip: &str) -> NetinfoResult<EnrichmentResult> {
        let ip = parse_ip(ip)?;
        let key = ip.to_string();
        if let Some(hit) = self.ip_cache.get(&key) {
            return Ok(hit);
        }

        self.prepare(DatasetKind::Routing)?;
        self.prepare_optional(DatasetKind::AsNames);
        self.prepare_optional(DatasetKind::Geo);

        let snapshot = self.orchestrator.current();
        let result = enrich_ip(&snapshot, ip)?;
        self.ip_cache.set(key, result.clone(), self.cache_ttl);
        Ok(result)
    }

    /// Name and originated prefixes of an AS
    ///
    /// An AS with no announced prefixes yields an empty list.
    pub fn lookup_asn(&self, asn: &str) -> NetinfoResult<AsEnrichmentResult> {
        let asn = parse_asn(asn)?;
        let key = format!("AS{}", asn);
        if let Some(hit) = self.asn_cache.get(&key) {
            return Ok(hit);
        }

        self.prepare(DatasetKind::Routing)?;
        self.prepare_optional(DatasetKind::AsNames);

        let snapshot = self.orchestrator.current();
        let table = snapshot
            .routing
            .as_ref()
            .ok_or(NetinfoError::unavailable(DatasetKind::Routing))?;
        let prefixes: Vec<String> = table
            .prefixes_for_asn(asn)
            .iter()
            .map(|p| p.to_string())
            .collect();
        let result = AsEnrichmentResult {
            as_num: asn,
            prefix_count: prefixes.len(),
            prefixes,
            as_name: as_name(&snapshot, asn),
        };
        self.asn_cache.set(key, result.clone(), self.cache_ttl);
        Ok(result)
    }

    /// Enumerate every address of `cidr`
    ///
    /// Host bits are cleared first, so `192.0.2.1/30` expands like
    /// `192.0.2.0/30`. Blocks larger than the configured limit are rejected.
    pub fn expand_network(&self, cidr: &str) -> NetinfoResult<NetworkExpansion> {
        let net = parse_network(cidr)?;
        let size = network_size(&net);
        if size > u128::from(self.expand_limit) {
            return Err(NetinfoError::invalid_query(format!(
                "{} holds {} addresses, more than the limit of {}",
                net, size, self.expand_limit
            )));
        }

        let network_addresses = match net {
            IpNet::V4(v4) => {
                let start = u32::from(v4.network());
                (0..size)
                    .map(|offset| Ipv4Addr::from(start + offset as u32).to_string())
                    .collect()
            }
            IpNet::V6(v6) => {
                let start = u128::from(v6.network());
                (0..size)
                    .map(|offset| Ipv6Addr::from(start + offset).to_string())
                    .collect()
            }
        };

        Ok(NetworkExpansion {
            cidr: net.to_string(),
            network_addresses,
            network_size: size,
        })
    }

    /// Answer a query that may be an IP, an `AS<n>` number or a CIDR block
    pub fn lookup(&self, query: &str) -> NetinfoResult<LookupAnswer> {
        match QueryKind::detect(query)? {
            QueryKind::Ip(ip) => self.lookup_ip(&ip.to_string()).map(LookupAnswer::Ip),
            QueryKind::Asn(asn) => self.lookup_asn(&asn.to_string()).map(LookupAnswer::Asn),
            QueryKind::Network(net) => self
                .expand_network(&net.to_string())
                .map(LookupAnswer::Network),
        }
    }
}

fn as_name(snapshot: &ActiveDataset, asn: u32) -> String {
    snapshot
        .as_names
        .as_ref()
        .map(|names| names.name_for(asn))
        .unwrap_or(UNKNOWN_AS_NAME)
        .to_string()
}

fn enrich_ip(snapshot: &ActiveDataset, ip: IpAddr) -> NetinfoResult<EnrichmentResult> {
    let table = snapshot
        .routing
        .as_ref()
        .ok_or(NetinfoError::unavailable(DatasetKind::Routing))?;
    let matched: Option<RoutingEntry> = table.longest_match(ip);

    let mut result = EnrichmentResult {
        as_num: None,
        network: None,
        as_name: None,
        ip: ip.to_string(),
        ip_version: if ip.is_ipv4() { 4 } else { 6 },
        ip_hex: ip_hex(ip),
        network_broadcast: None,
        network_netmask: None,
        network_hostmask: None,
        network_size: None,
        geo: snapshot.geo.as_ref().map(|geo| geo.locate(ip).unwrap_or_default()),
    };

    if let Some(entry) = matched {
        let net = entry.prefix;
        result.as_num = Some(entry.origin_as);
        result.network = Some(entry.netblock());
        result.as_name = Some(as_name(snapshot, entry.origin_as));
        result.network_broadcast = Some(net.broadcast().to_string());
        result.network_netmask = Some(net.netmask().to_string());
        result.network_hostmask = Some(net.hostmask().to_string());
        result.network_size = Some(network_size(&net));
    }

    Ok(result)
}
