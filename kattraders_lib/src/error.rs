//! Error types for the ingestion pipeline.
//!
//! Only [`ConfigError`] and the fatal variants of [`IngestError`] stop a run.
//! [`FetchError`] and [`StoreError`] are attributed to the scope that raised
//! them and end up in the run report.

use crate::ingest::IngestReport;

/// A precondition that blocks all work. Raised before any fetch.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0} is empty; set it in the environment or pass it explicitly")]
    MissingCredential(&'static str),
    #[error("invalid date '{0}'. Expected format: YYYY-MM-DD (e.g., 2024-05-01)")]
    InvalidDate(String),
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    #[error("invalid market pair '{0}'. Expected MARKET_CODE:CORP_CODE (e.g., 110001:11000103)")]
    InvalidMarketPair(String),
    #[error("unknown scope source '{0}'. Valid values: auto, explicit, catalog, global")]
    InvalidScopeSource(String),
    #[error("no scopes to ingest: {0}")]
    NoScopes(String),
    #[error("failed to read seed file {path}: {reason}")]
    SeedFile { path: String, reason: String },
}

/// A page could not be fetched.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// Network failure, timeout, non-2xx status, or an upstream result code.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response arrived but was not the documented JSON envelope.
    #[error("malformed response: {reason}")]
    Malformed { reason: String, excerpt: String },
}

impl From<kattrades_api::Error> for FetchError {
    fn from(e: kattrades_api::Error) -> Self {
        match e {
            kattrades_api::Error::Malformed { reason, excerpt } => {
                FetchError::Malformed { reason, excerpt }
            }
            other => FetchError::Transport(other.to_string()),
        }
    }
}

/// A write was rejected by the storage layer.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("date parse error: {0}")]
    Date(#[from] chrono::ParseError),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Errors that abort an ingestion run.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    /// Every scope that had rows to write failed to write them.
    #[error("all {} scope writes failed", .0.write_failures())]
    AllWritesFailed(Box<IngestReport>),
}
