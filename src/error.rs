//! Error types for refresh and lookup operations
//!
//! Internal helpers return `anyhow::Result`. Everything that crosses the
//! orchestrator/engine boundary returns [`NetinfoError`], so callers can tell a
//! failed download apart from a malformed query or a dataset that was never
//! loaded.

use crate::config::DatasetKind;
use serde::Serialize;

/// Result type for refresh and lookup operations
pub type NetinfoResult<T> = Result<T, NetinfoError>;

/// Machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Upstream unreachable, non-success response or timeout
    FetchFailed,
    /// Downloaded artifact could not be turned into a dataset
    ParseFailed,
    /// Lookup requested before the dataset was ever loaded
    DatasetUnavailable,
    /// Malformed IP, CIDR or ASN input
    InvalidQuery,
    /// Local file or database failure
    StorageFailed,
}

/// Error type for refresh and lookup operations
///
/// `Clone` so that every caller coalesced onto one refresh observes the same
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetinfoError {
    /// Fetching a dataset from its upstream origin failed
    Fetch { kind: DatasetKind, message: String },
    /// A whole artifact (dump, listing or archive) was unusable
    Parse { kind: DatasetKind, message: String },
    /// No dataset of this kind has been loaded yet
    DatasetUnavailable { kind: DatasetKind },
    /// The query itself is malformed
    InvalidQuery { message: String },
    /// Local persistence failed
    Storage { message: String },
}

impl NetinfoError {
    pub fn fetch(kind: DatasetKind, message: impl Into<String>) -> Self {
        Self::Fetch {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(kind: DatasetKind, message: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(kind: DatasetKind) -> Self {
        Self::DatasetUnavailable { kind }
    }

    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> ErrorCode {
        match self {
            NetinfoError::Fetch { .. } => ErrorCode::FetchFailed,
            NetinfoError::Parse { .. } => ErrorCode::ParseFailed,
            NetinfoError::DatasetUnavailable { .. } => ErrorCode::DatasetUnavailable,
            NetinfoError::InvalidQuery { .. } => ErrorCode::InvalidQuery,
            NetinfoError::Storage { .. } => ErrorCode::StorageFailed,
        }
    }

    /// Dataset kind the error relates to, if any
    pub fn kind(&self) -> Option<DatasetKind> {
        match self {
            NetinfoError::Fetch { kind, .. }
            | NetinfoError::Parse { kind, .. }
            | NetinfoError::DatasetUnavailable { kind } => Some(*kind),
            NetinfoError::InvalidQuery { .. } | NetinfoError::Storage { .. } => None,
        }
    }
}

impl std::fmt::Display for NetinfoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetinfoError::Fetch { kind, message } => {
                write!(f, "failed to fetch {} data: {}", kind, message)
            }
            NetinfoError::Parse { kind, message } => {
                write!(f, "failed to build {} data: {}", kind, message)
            }
            NetinfoError::DatasetUnavailable { kind } => {
                write!(f, "{} data not initialized", kind)
            }
            NetinfoError::InvalidQuery { message } => write!(f, "invalid query: {}", message),
            NetinfoError::Storage { message } => write!(f, "storage error: {}", message),
        }
    }
}

impl std::error::Error for NetinfoError {}

impl From<anyhow::Error> for NetinfoError {
    fn from(err: anyhow::Error) -> Self {
        Self::storage(format!("{:#}", err))
    }
}
