//! Database module
//!
//! On-disk state that survives a restart:
//!
//! ```text
//! database/
//! ├── core/           # SQLite DatabaseConn wrapper
//! ├── ledger          # freshness ledger (JSON file)
//! └── routing_store   # durable routing table (SQLite)
//! ```
//!
//! Every file here is replaced atomically: it is written next to its final
//! path and renamed into place, so a reader never sees a partial write.

pub mod core;
pub mod ledger;
pub mod routing_store;

pub use core::DatabaseConn;
pub use ledger::{FreshnessLedger, FreshnessRecord, LedgerState};
pub use routing_store::{RoutingStoreMeta, RoutingTableStore};
