//! Persisted freshness ledger
//!
//! One JSON file records, per dataset kind, when it was last refreshed and
//! which upstream artifact produced it:
//!
//! ```json
//! {
//!   "asn": {"last_rib_file": "rib.20240101.1200.bz2", "last_update": "2024-01-01 12:05:00"},
//!   "as_names": {"last_update": "2024-01-01 00:00:00"},
//!   "geoip": {"last_update": null}
//! }
//! ```
//!
//! The file is created with empty sections when absent and is rewritten
//! through a temporary file plus rename, so a reader never sees half a ledger.

use crate::config::DatasetKind;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Freshness of one dataset kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    /// When the dataset was last refreshed successfully
    pub last_update: Option<DateTime<Utc>>,
    /// Upstream artifact that produced the dataset, if the source names one
    pub source_identifier: Option<String>,
}

impl FreshnessRecord {
    /// Whether the dataset is older than `interval` at `now`
    ///
    /// A dataset that was never refreshed is always stale.
    pub fn is_stale(&self, interval: Duration, now: DateTime<Utc>) -> bool {
        match self.last_update {
            None => true,
            Some(at) => {
                let age = now.signed_duration_since(at);
                age.num_seconds() > interval.as_secs() as i64
            }
        }
    }
}

// =============================================================================
// On-disk layout
// =============================================================================

mod ledger_time {
    use super::TIMESTAMP_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_str(&t.format(TIMESTAMP_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(s) => NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
                .map(|t| Some(t.and_utc()))
                .map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoutingSection {
    #[serde(default)]
    last_rib_file: Option<String>,
    #[serde(default, with = "ledger_time")]
    last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TimestampSection {
    #[serde(default, with = "ledger_time")]
    last_update: Option<DateTime<Utc>>,
}

/// Full ledger contents, one section per dataset kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    asn: RoutingSection,
    #[serde(default)]
    as_names: TimestampSection,
    #[serde(default)]
    geoip: TimestampSection,
}

impl LedgerState {
    pub fn record(&self, kind: DatasetKind) -> FreshnessRecord {
        match kind {
            DatasetKind::Routing => FreshnessRecord {
                last_update: self.asn.last_update,
                source_identifier: self.asn.last_rib_file.clone(),
            },
            DatasetKind::AsNames => FreshnessRecord {
                last_update: self.as_names.last_update,
                source_identifier: None,
            },
            DatasetKind::Geo => FreshnessRecord {
                last_update: self.geoip.last_update,
                source_identifier: None,
            },
        }
    }

    fn last_update_mut(&mut self, kind: DatasetKind) -> &mut Option<DateTime<Utc>> {
        match kind {
            DatasetKind::Routing => &mut self.asn.last_update,
            DatasetKind::AsNames => &mut self.as_names.last_update,
            DatasetKind::Geo => &mut self.geoip.last_update,
        }
    }

    /// Apply a successful refresh
    ///
    /// `last_update` never moves backwards. The identifier is only replaced
    /// when one is given.
    fn apply(&mut self, kind: DatasetKind, at: DateTime<Utc>, identifier: Option<&str>) {
        // on-disk precision is whole seconds
        let at = at.with_nanosecond(0).unwrap_or(at);
        let slot = self.last_update_mut(kind);
        *slot = Some(match *slot {
            Some(prev) if prev > at => prev,
            _ => at,
        });
        if let (DatasetKind::Routing, Some(id)) = (kind, identifier) {
            self.asn.last_rib_file = Some(id.to_string());
        }
    }
}

// =============================================================================
// Ledger handle
// =============================================================================

/// Durable per-kind freshness records with an in-memory mirror
///
/// The orchestrator is the only writer; every write goes to disk before the
/// mirror is updated.
pub struct FreshnessLedger {
    path: PathBuf,
    state: RwLock<LedgerState>,
}

impl FreshnessLedger {
    /// Open the ledger at `path`, creating it with empty sections if absent
    ///
    /// An unreadable ledger is treated as empty (every dataset stale) and is
    /// overwritten on the next successful refresh.
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            match Self::read_file(path) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "ignoring unreadable ledger {}: {}, all datasets considered stale",
                        path.display(),
                        e
                    );
                    LedgerState::default()
                }
            }
        } else {
            let state = LedgerState::default();
            write_state(path, &state)?;
            info!("created freshness ledger at {}", path.display());
            state
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    fn read_file(path: &Path) -> Result<LedgerState> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read ledger {}: {}", path.display(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse ledger {}: {}", path.display(), e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record for a dataset kind
    pub fn record(&self, kind: DatasetKind) -> FreshnessRecord {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .record(kind)
    }

    /// Snapshot of all sections
    pub fn snapshot(&self) -> LedgerState {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Persist a successful refresh of `kind`
    pub fn record_success(
        &self,
        kind: DatasetKind,
        at: DateTime<Utc>,
        identifier: Option<&str>,
    ) -> Result<FreshnessRecord> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut next = state.clone();
        next.apply(kind, at, identifier);
        write_state(&self.path, &next)?;
        *state = next;
        Ok(state.record(kind))
    }
}

fn write_state(path: &Path, state: &LedgerState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow!("Failed to create ledger directory: {}", e))?;
    }
    let content = serde_json::to_string_pretty(state)
        .map_err(|e| anyhow!("Failed to serialize ledger: {}", e))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .map_err(|e| anyhow!("Failed to write ledger {}: {}", tmp.display(), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| anyhow!("Failed to replace ledger {}: {}", path.display(), e))?;
    Ok(())
}
