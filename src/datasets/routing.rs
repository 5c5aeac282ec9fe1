//! Prefix-to-origin routing table built from MRT RIB dumps
//!
//! The table keeps one origin AS per announced prefix in an [`IpnetTrie`] for
//! longest-prefix matching, plus a reverse index from origin AS to the
//! prefixes it announces.

use anyhow::{anyhow, Result};
use bgpkit_parser::models::ElemType;
use bgpkit_parser::{BgpElem, BgpkitParser};
use ipnet::IpNet;
use ipnet_trie::IpnetTrie;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

/// One announced prefix and the AS that originates it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub prefix: IpNet,
    pub origin_as: u32,
}

impl RoutingEntry {
    pub fn new(prefix: IpNet, origin_as: u32) -> Self {
        Self {
            prefix: prefix.trunc(),
            origin_as,
        }
    }

    /// Netblock in CIDR notation
    pub fn netblock(&self) -> String {
        self.prefix.to_string()
    }
}

/// Immutable longest-prefix-match table
pub struct RoutingTable {
    trie: IpnetTrie<u32>,
    by_origin: HashMap<u32, Vec<IpNet>>,
    len: usize,
}

impl RoutingTable {
    /// Build a table from entries; the first entry for a prefix wins
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = RoutingEntry>,
    {
        let mut trie = IpnetTrie::<u32>::new();
        let mut by_origin: HashMap<u32, Vec<IpNet>> = HashMap::new();
        let mut len = 0usize;

        for entry in entries {
            let prefix = entry.prefix.trunc();
            if trie.exact_match(prefix).is_some() {
                continue;
            }
            trie.insert(prefix, entry.origin_as);
            by_origin.entry(entry.origin_as).or_default().push(prefix);
            len += 1;
        }

        for prefixes in by_origin.values_mut() {
            prefixes.sort();
        }

        RoutingTable {
            trie,
            by_origin,
            len,
        }
    }

    /// Most specific entry covering `ip`
    pub fn longest_match(&self, ip: IpAddr) -> Option<RoutingEntry> {
        let max_len = if ip.is_ipv4() { 32 } else { 128 };
        let host = IpNet::new(ip, max_len).ok()?;
        self.trie
            .longest_match(&host)
            .map(|(prefix, origin_as)| RoutingEntry {
                prefix,
                origin_as: *origin_as,
            })
    }

    /// Entry for exactly this prefix
    pub fn exact_match(&self, prefix: IpNet) -> Option<RoutingEntry> {
        let prefix = prefix.trunc();
        self.trie
            .exact_match(prefix)
            .map(|origin_as| RoutingEntry {
                prefix,
                origin_as: *origin_as,
            })
    }

    /// Prefixes originated by `asn`, sorted; empty when it announces none
    pub fn prefixes_for_asn(&self, asn: u32) -> &[IpNet] {
        self.by_origin
            .get(&asn)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All entries, ordered by origin AS then prefix
    pub fn entries(&self) -> Vec<RoutingEntry> {
        let ordered: BTreeMap<u32, &Vec<IpNet>> =
            self.by_origin.iter().map(|(k, v)| (*k, v)).collect();
        ordered
            .into_iter()
            .flat_map(|(origin_as, prefixes)| {
                prefixes
                    .iter()
                    .map(move |prefix| RoutingEntry::new(*prefix, origin_as))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct origin ASes
    pub fn origin_count(&self) -> usize {
        self.by_origin.len()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Accumulates announcements into a [`RoutingTable`]
///
/// Records that cannot be used (withdrawals, missing origin, default routes)
/// are skipped one by one; only a dump that yields no entry at all fails.
#[derive(Default)]
pub struct RoutingTableBuilder {
    entries: Vec<RoutingEntry>,
    seen: usize,
    skipped: usize,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one parsed element; returns whether it was kept
    pub fn ingest_elem(&mut self, elem: &BgpElem) -> bool {
        self.seen += 1;

        if elem.elem_type != ElemType::ANNOUNCE {
            self.skipped += 1;
            return false;
        }

        let prefix = elem.prefix.prefix;
        if prefix.prefix_len() == 0 {
            self.skipped += 1;
            return false;
        }

        let origin = elem
            .origin_asns
            .as_ref()
            .and_then(|asns| asns.first())
            .map(|asn| asn.to_u32());

        match origin {
            Some(origin_as) => {
                self.entries.push(RoutingEntry::new(prefix, origin_as));
                true
            }
            None => {
                self.skipped += 1;
                false
            }
        }
    }

    /// Parse an MRT file (optionally compressed) and build the table
    pub fn build_from_file(path: &Path) -> Result<RoutingTable> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid dump path: {}", path.display()))?;
        let parser = BgpkitParser::new(path_str)
            .map_err(|e| anyhow!("Failed to open dump {}: {}", path.display(), e))?
            .disable_warnings();

        let mut builder = RoutingTableBuilder::new();
        for elem in parser {
            builder.ingest_elem(&elem);
        }
        debug!(
            "ingested {} elements from {}, {} skipped",
            builder.seen,
            path.display(),
            builder.skipped
        );
        builder.finish()
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Finish the build; fails when nothing usable was ingested
    pub fn finish(self) -> Result<RoutingTable> {
        if self.entries.is_empty() {
            return Err(anyhow!(
                "no usable announcements among {} records",
                self.seen
            ));
        }
        let table = RoutingTable::from_entries(self.entries);
        info!(
            "built routing table: {} prefixes, {} origins",
            table.len(),
            table.origin_count()
        );
        Ok(table)
    }
}
