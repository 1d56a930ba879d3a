// src/error.rs

//! Error types for catalog-sync
//!
//! A single error enum covers every failure the sync core can report.
//! Sync-cycle failures (`NetworkFailure`, `ValidationFailure`,
//! `ReplaceFailure`) are recoverable: the next natural check retries them.
//! `ConfigFailure` is the only fatal kind and only stops the manual trigger.

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the sync core
#[derive(Error, Debug)]
pub enum Error {
    /// Timeout, connection error, non-success status or unusable body
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Candidate artifact failed an integrity check
    #[error("Validation failure: {0}")]
    ValidationFailure(#[from] ValidationError),

    /// Moving the validated candidate over the live artifact failed
    #[error("Replace failure: {0}")]
    ReplaceFailure(String),

    /// Missing or placeholder secret, or an otherwise unusable configuration
    #[error("Configuration failure: {0}")]
    ConfigFailure(String),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    IoError(String),

    /// State store error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Malformed persisted record or remote payload
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Component could not be constructed
    #[error("Initialization error: {0}")]
    InitError(String),
}

impl Error {
    /// Stable tag for logs and JSON responses
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NetworkFailure(_) => "network_failure",
            Error::ValidationFailure(_) => "validation_failure",
            Error::ReplaceFailure(_) => "replace_failure",
            Error::ConfigFailure(_) => "config_failure",
            Error::IoError(_) => "io_error",
            Error::DatabaseError(_) => "database_error",
            Error::ParseError(_) => "parse_error",
            Error::InitError(_) => "init_error",
        }
    }

    /// Only configuration problems stop the caller outright
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigFailure(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkFailure(err.to_string())
    }
}

/// The integrity check that rejected a candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Smaller than the minimum size threshold
    TooSmall { size: u64, min: u64 },
    /// First bytes do not carry the expected signature
    BadHeader,
    /// File could not be read or opened as a database
    Unreadable(String),
    /// A required table is absent
    MissingTable(String),
    /// A required column is absent from the primary table
    MissingColumn { table: String, column: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::TooSmall { size, min } => {
                write!(f, "file too small ({size} bytes, minimum {min})")
            }
            ValidationError::BadHeader => write!(f, "file header does not match SQLite format 3"),
            ValidationError::Unreadable(msg) => write!(f, "cannot open candidate: {msg}"),
            ValidationError::MissingTable(table) => write!(f, "missing required table '{table}'"),
            ValidationError::MissingColumn { table, column } => {
                write!(f, "table '{table}' is missing required column '{column}'")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
