//! Error types for minireg

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Election Errors ===
    #[error("Not master: current master is {0}")]
    NotMaster(String),

    #[error("Lost mastership during operation")]
    LostMastership,

    #[error("Node {0} is not eligible to become master")]
    IneligibleForMaster(String),

    #[error("Node is stopped")]
    NodeStopped,

    #[error("Forwarding to master {master} failed: {reason}")]
    ForwardFailed { master: String, reason: String },

    // === Coordination Errors ===
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Corrupted id counter at {path}: {value:?} is not an integer")]
    CorruptedCounter { path: String, value: String },

    // === Store Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotMaster(_)
                | Error::LostMastership
                | Error::CoordinationUnavailable(_)
                | Error::VersionConflict { .. }
                | Error::ForwardFailed { .. }
        )
    }

    /// Errors that must abort startup instead of being absorbed by a role change.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptedCounter { .. } | Error::InvalidConfig(_)
        )
    }

    /// Stable numeric code reported by the admin API
    pub fn error_code(&self) -> u32 {
        match self {
            Error::NotFound(_) => 40401,
            Error::InvalidInput(_) => 42201,
            Error::IneligibleForMaster(_) => 40901,
            Error::NotMaster(_) => 50003,
            Error::LostMastership => 50004,
            Error::CoordinationUnavailable(_) => 50005,
            Error::ForwardFailed { .. } => 50201,
            _ => 50001,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) | Error::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::IneligibleForMaster(_) => StatusCode::CONFLICT,
            Error::ForwardFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::CoordinationUnavailable(_) | Error::NodeStopped => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Store(format!("bincode: {}", e))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
