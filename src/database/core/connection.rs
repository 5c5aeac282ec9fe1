//! Database connection management
//!
//! Thin wrapper around the SQLite connection used for the persisted routing table.

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::path::Path;

/// Core database connection wrapper
///
/// Opens file-based databases with consistent configuration and error
/// handling.
pub struct DatabaseConn {
    pub conn: Connection,
}

impl DatabaseConn {
    /// Open (or create) a database at the specified path
    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| anyhow!("Failed to open database at '{}': {}", path.display(), e))?;

        let db = DatabaseConn { conn };
        db.configure()?;
        Ok(db)
    }

    fn configure(&self) -> Result<()> {
        // The routing table file is written once into a scratch path and then
        // renamed into place, so a rollback journal is enough; WAL side files
        // would not follow the rename.
        let _: String = self
            .conn
            .query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to set journal mode: {}", e))?;

        self.conn
            .execute("PRAGMA synchronous=NORMAL", [])
            .map_err(|e| anyhow!("Failed to set synchronous mode: {}", e))?;

        self.conn
            .execute("PRAGMA temp_store=MEMORY", [])
            .map_err(|e| anyhow!("Failed to set temp store: {}", e))?;

        Ok(())
    }

    /// Execute a SQL statement
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.conn
            .execute(sql, [])
            .map_err(|e| anyhow!("Failed to execute SQL: {}", e))
    }

    /// Begin an unchecked transaction
    pub fn transaction(&self) -> Result<rusqlite::Transaction<'_>> {
        self.conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))
    }

    /// Check if a table exists in the database
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        let count: i32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [table_name],
                |row| row.get(0),
            )
            .map_err(|e| anyhow!("Failed to check table existence: {}", e))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite3");
        let db = DatabaseConn::open_path(&path).unwrap();
        db.execute("CREATE TABLE t (id INTEGER)").unwrap();
        drop(db);
        assert!(path.exists());
    }

    #[test]
    fn test_table_exists() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("test.sqlite3")).unwrap();
        db.execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY)")
            .unwrap();

        assert!(db.table_exists("test_table").unwrap());
        assert!(!db.table_exists("nonexistent_table").unwrap());
    }

    #[test]
    fn test_transaction_commits() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("test.sqlite3")).unwrap();
        db.execute("CREATE TABLE t (id INTEGER)").unwrap();

        let tx = db.transaction().unwrap();
        tx.execute("INSERT INTO t (id) VALUES (1), (2)", []).unwrap();
        tx.commit().unwrap();

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
