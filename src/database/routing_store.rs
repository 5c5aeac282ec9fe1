//! Durable "current" routing table
//!
//! A built [`RoutingTable`] is written into a fresh SQLite file next to the
//! current one and renamed over it, so the file at the canonical path is
//! always a complete table.

use crate::database::core::DatabaseConn;
use crate::datasets::routing::{RoutingEntry, RoutingTable};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Metadata stored alongside a persisted table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingStoreMeta {
    /// When the table was written
    pub updated_at: DateTime<Utc>,
    /// Dump the table was built from
    pub source: String,
    pub prefix_count: u64,
}

/// SQL schema definitions for the routing table file
struct RoutingSchema;

impl RoutingSchema {
    const ROUTES_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS routes (
            prefix TEXT PRIMARY KEY,
            origin_as INTEGER NOT NULL
        );
    "#;

    const META_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS routes_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            updated_at INTEGER NOT NULL,
            source TEXT NOT NULL DEFAULT '',
            prefix_count INTEGER NOT NULL DEFAULT 0
        );
    "#;
}

pub struct RoutingTableStore;

impl RoutingTableStore {
    /// Persist `table` at `path`, replacing any previous file atomically
    pub fn write_atomic(path: &Path, table: &RoutingTable, source: &str) -> Result<RoutingStoreMeta> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create directory {}: {}", parent.display(), e))?;
        }

        let tmp = scratch_path(path);
        if tmp.exists() {
            fs::remove_file(&tmp)
                .map_err(|e| anyhow!("Failed to remove stale {}: {}", tmp.display(), e))?;
        }

        let meta = {
            let db = DatabaseConn::open_path(&tmp)?;
            db.execute(RoutingSchema::ROUTES_TABLE)?;
            db.execute(RoutingSchema::META_TABLE)?;

            let tx = db.transaction()?;
            {
                let mut stmt = tx
                    .prepare("INSERT OR IGNORE INTO routes (prefix, origin_as) VALUES (?1, ?2)")
                    .map_err(|e| anyhow!("Failed to prepare insert: {}", e))?;
                for entry in table.entries() {
                    stmt.execute(params![entry.netblock(), entry.origin_as])
                        .map_err(|e| anyhow!("Failed to insert route: {}", e))?;
                }
            }

            let meta = RoutingStoreMeta {
                updated_at: Utc::now(),
                source: source.to_string(),
                prefix_count: table.len() as u64,
            };
            tx.execute(
                "INSERT OR REPLACE INTO routes_meta (id, updated_at, source, prefix_count) VALUES (1, ?1, ?2, ?3)",
                params![meta.updated_at.timestamp(), meta.source, meta.prefix_count],
            )
            .map_err(|e| anyhow!("Failed to write routing metadata: {}", e))?;
            tx.commit()
                .map_err(|e| anyhow!("Failed to commit routing table: {}", e))?;
            meta
        };

        fs::rename(&tmp, path).map_err(|e| {
            anyhow!(
                "Failed to move {} to {}: {}",
                tmp.display(),
                path.display(),
                e
            )
        })?;

        info!(
            "stored {} routes from {} at {}",
            meta.prefix_count,
            source,
            path.display()
        );
        Ok(meta)
    }

    /// Load a persisted table
    pub fn load(path: &Path) -> Result<RoutingTable> {
        if !path.exists() {
            return Err(anyhow!("no routing table at {}", path.display()));
        }
        let db = DatabaseConn::open_path(path)?;
        if !db.table_exists("routes")? {
            return Err(anyhow!("{} holds no routing table", path.display()));
        }

        let mut stmt = db
            .conn
            .prepare("SELECT prefix, origin_as FROM routes")
            .map_err(|e| anyhow!("Failed to prepare route query: {}", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))
            .map_err(|e| anyhow!("Failed to query routes: {}", e))?;

        let mut entries = Vec::new();
        for row in rows {
            let (prefix, origin_as) = row.map_err(|e| anyhow!("Failed to read route: {}", e))?;
            match prefix.parse::<IpNet>() {
                Ok(prefix) => entries.push(RoutingEntry::new(prefix, origin_as)),
                Err(_) => warn!("skipping invalid stored prefix {}", prefix),
            }
        }

        if entries.is_empty() {
            return Err(anyhow!("routing table at {} is empty", path.display()));
        }
        Ok(RoutingTable::from_entries(entries))
    }

    /// Read the metadata of a persisted table, if there is one
    pub fn read_meta(path: &Path) -> Result<Option<RoutingStoreMeta>> {
        if !path.exists() {
            return Ok(None);
        }
        let db = DatabaseConn::open_path(path)?;
        if !db.table_exists("routes_meta")? {
            return Ok(None);
        }

        let result = db.conn.query_row(
            "SELECT updated_at, source, prefix_count FROM routes_meta WHERE id = 1",
            [],
            |row| {
                let timestamp: i64 = row.get(0)?;
                Ok(RoutingStoreMeta {
                    updated_at: DateTime::from_timestamp(timestamp, 0).unwrap_or_default(),
                    source: row.get(1)?,
                    prefix_count: row.get(2)?,
                })
            },
        );

        match result {
            Ok(meta) => Ok(Some(meta)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(anyhow!("Failed to read routing metadata: {}", e)),
        }
    }
}

fn scratch_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::routing::tests::write_mrt;
    use crate::datasets::routing::RoutingTableBuilder;

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asn").join("current.sqlite3");
        let table = RoutingTable::from_entries(vec![
            RoutingEntry::new("10.0.0.0/8".parse().unwrap(), 64500),
            RoutingEntry::new("2001:db8::/32".parse().unwrap(), 64502),
        ]);

        let meta = RoutingTableStore::write_atomic(&path, &table, "rib.20240101.1200.bz2").unwrap();
        assert_eq!(meta.prefix_count, 2);
        assert!(!scratch_path(&path).exists());

        let loaded = RoutingTableStore::load(&path).unwrap();
        assert_eq!(loaded.entries(), table.entries());

        let stored = RoutingTableStore::read_meta(&path).unwrap().unwrap();
        assert_eq!(stored.source, "rib.20240101.1200.bz2");
        assert_eq!(stored.prefix_count, 2);
    }

    #[test]
    fn test_replace_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current.sqlite3");
        let first = RoutingTable::from_entries(vec![RoutingEntry::new(
            "10.0.0.0/8".parse().unwrap(),
            1,
        )]);
        let second = RoutingTable::from_entries(vec![RoutingEntry::new(
            "192.0.2.0/24".parse().unwrap(),
            2,
        )]);

        RoutingTableStore::write_atomic(&path, &first, "a").unwrap();
        RoutingTableStore::write_atomic(&path, &second, "b").unwrap();

        let loaded = RoutingTableStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.longest_match("10.0.0.1".parse().unwrap()).is_none());
        assert_eq!(
            RoutingTableStore::read_meta(&path).unwrap().unwrap().source,
            "b"
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sqlite3");
        assert!(RoutingTableStore::load(&path).is_err());
        assert!(RoutingTableStore::read_meta(&path).unwrap().is_none());
    }

    #[test]
    fn test_persisted_lookups_match_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("rib.mrt");
        write_mrt(
            &dump,
            &[
                ("10.0.0.0/8", 64500),
                ("10.1.0.0/16", 64501),
                ("10.1.1.0/24", 64502),
                ("198.51.100.0/24", 64503),
            ],
        );

        let in_memory = RoutingTableBuilder::build_from_file(&dump).unwrap();
        let path = dir.path().join("current.sqlite3");
        RoutingTableStore::write_atomic(&path, &in_memory, "rib.mrt").unwrap();
        let reloaded = RoutingTableStore::load(&path).unwrap();

        for ip in [
            "10.0.0.1",
            "10.1.0.1",
            "10.1.1.1",
            "198.51.100.200",
            "203.0.113.1",
        ] {
            let ip = ip.parse().unwrap();
            assert_eq!(in_memory.longest_match(ip), reloaded.longest_match(ip));
        }
    }
}
