//! AS number to organization name directory
//!
//! Built from the CIDR report `autnums.html` listing, where every entry is a
//! line of the form:
//!
//! ```text
//! <a href="/cgi-bin/as-report?as=AS13335&view=2.0">AS13335</a> CLOUDFLARENET - Cloudflare, Inc., US
//! ```

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Name reported for AS numbers missing from the directory
pub const UNKNOWN_AS_NAME: &str = "Unknown";

static ANCHOR_LINE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"<a .+>AS(?P<code>.+?)\s*</a>\s*(?P<name>.*)"));

/// Outcome of parsing a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AsNameParseReport {
    /// Lines that were anchor tags
    pub anchor_lines: usize,
    /// Anchor lines that yielded a name
    pub parsed: usize,
    /// Anchor lines that did not match or had a non-numeric AS
    pub malformed: usize,
}

impl AsNameParseReport {
    pub fn match_ratio(&self) -> f64 {
        if self.anchor_lines == 0 {
            return 0.0;
        }
        self.parsed as f64 / self.anchor_lines as f64
    }
}

/// Immutable AS number to name mapping
#[derive(Debug, Clone, Default)]
pub struct AsNameDirectory {
    names: HashMap<u32, String>,
}

impl AsNameDirectory {
    /// Parse a raw listing
    ///
    /// The body is decoded as Latin-1. Malformed anchor lines are skipped and
    /// counted; the build fails only when no name was found or when the share
    /// of parsed anchor lines is below `min_match_ratio`.
    pub fn parse_html(raw: &[u8], min_match_ratio: f64) -> Result<(Self, AsNameParseReport)> {
        let re = ANCHOR_LINE
            .as_ref()
            .map_err(|e| anyhow!("invalid AS name pattern: {}", e))?;

        let text: String = raw.iter().map(|b| *b as char).collect();

        let mut names = HashMap::new();
        let mut report = AsNameParseReport {
            anchor_lines: 0,
            parsed: 0,
            malformed: 0,
        };

        for line in text.lines().map(str::trim).filter(|l| l.starts_with("<a")) {
            report.anchor_lines += 1;
            let parsed = re.captures(line).and_then(|caps| {
                let code = caps.name("code")?.as_str().trim().parse::<u32>().ok()?;
                let name = caps.name("name").map(|m| m.as_str().trim()).unwrap_or("");
                Some((code, name.to_string()))
            });
            match parsed {
                Some((code, name)) => {
                    names.insert(code, name);
                    report.parsed += 1;
                }
                None => {
                    debug!("skipping malformed AS name line: {}", line);
                    report.malformed += 1;
                }
            }
        }

        if names.is_empty() {
            return Err(anyhow!(
                "no AS names found among {} anchor lines",
                report.anchor_lines
            ));
        }
        if report.match_ratio() < min_match_ratio {
            return Err(anyhow!(
                "only {} of {} anchor lines parsed ({:.1}% < {:.1}%), listing format may have changed",
                report.parsed,
                report.anchor_lines,
                report.match_ratio() * 100.0,
                min_match_ratio * 100.0
            ));
        }

        info!(
            "parsed {} AS names ({} malformed lines skipped)",
            names.len(),
            report.malformed
        );
        Ok((AsNameDirectory { names }, report))
    }

    pub fn from_names(names: HashMap<u32, String>) -> Self {
        Self { names }
    }

    /// Name for `asn`, or [`UNKNOWN_AS_NAME`]
    pub fn name_for(&self, asn: u32) -> &str {
        self.names
            .get(&asn)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_AS_NAME)
    }

    pub fn get(&self, asn: u32) -> Option<&str> {
        self.names.get(&asn).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Write the directory as JSON, replacing `path` atomically
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create directory {}: {}", parent.display(), e))?;
        }
        let ordered: BTreeMap<&u32, &String> = self.names.iter().collect();
        let content = serde_json::to_string(&ordered)
            .map_err(|e| anyhow!("Failed to serialize AS names: {}", e))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| anyhow!("Failed to write {}: {}", tmp.display(), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| anyhow!("Failed to replace {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Load a directory saved by [`AsNameDirectory::save_atomic`]
    pub fn load(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Invalid path: {}", path.display()))?;
        let names = oneio::read_json_struct::<HashMap<u32, String>>(path_str)
            .map_err(|e| anyhow!("Failed to load AS names from {}: {}", path.display(), e))?;
        if names.is_empty() {
            return Err(anyhow!("AS name file {} is empty", path.display()));
        }
        Ok(Self { names })
    }
}
