//! Error types shared across the federation node.

use thiserror::Error;

/// Result type alias using the node's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Node-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lease pool exhausted: {diagnostic}")]
    LeasePoolExhausted { diagnostic: String },

    #[error("WireGuard driver error: {0}")]
    WireGuard(String),

    #[error("Dante driver error: {0}")]
    Dante(String),

    #[error("Config parse failure: {0}")]
    ConfigParse(String),

    #[error("Lock acquisition timed out after {ms}ms: {name}")]
    LockTimeout { name: String, ms: u64 },

    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Coarse status-code family used by `tpn-web` to map errors onto HTTP responses.
    pub fn status_family(&self) -> StatusFamily {
        match self {
            Error::NotFound { .. } => StatusFamily::NotFound,
            Error::AlreadyExists { .. } => StatusFamily::Conflict,
            Error::InvalidConfig(_) | Error::ConfigParse(_) => StatusFamily::BadRequest,
            Error::Unauthorized(_) => StatusFamily::Unauthorized,
            Error::Forbidden(_) => StatusFamily::Forbidden,
            Error::LeasePoolExhausted { .. } => StatusFamily::ServiceUnavailable,
            Error::Timeout { .. } | Error::LockTimeout { .. } => StatusFamily::GatewayTimeout,
            _ => StatusFamily::Internal,
        }
    }
}

/// Coarse HTTP status family, decoupled from axum so `tpn-common` stays web-framework agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFamily {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ServiceUnavailable,
    GatewayTimeout,
    Internal,
}
