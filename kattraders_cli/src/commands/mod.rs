//! CLI subcommand implementations.

pub mod aggregates;
pub mod ingest;
pub mod markets;

use std::path::PathBuf;

/// Database path used when neither `--db` nor `KAT_DB_PATH` is set.
pub const DEFAULT_DB_PATH: &str = "kattraders.db";

/// Resolves the database path: explicit flag, then `KAT_DB_PATH`, then the default.
pub fn resolve_db_path(flag: Option<&PathBuf>) -> PathBuf {
    flag.cloned()
        .or_else(|| std::env::var("KAT_DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}
