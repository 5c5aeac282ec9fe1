//! Core database infrastructure
//!
//! - `DatabaseConn`: SQLite connection wrapper with configuration

mod connection;

pub use connection::DatabaseConn;
