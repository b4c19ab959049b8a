//! The `markets` subcommand: list the market catalog.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use kattraders_lib::Db;

use crate::output::{print_json, print_markets_table, OutputFormat};

/// Arguments for the `markets` subcommand.
#[derive(Args)]
pub struct MarketsArgs {
    /// SQLite database path (falls back to KAT_DB_PATH, then kattraders.db)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

pub fn run(args: &MarketsArgs, format: &OutputFormat) -> Result<()> {
    let db = Db::open(super::resolve_db_path(args.db.as_ref()))?;
    db.init()?;
    let markets = db.query_markets()?;

    if markets.is_empty() {
        eprintln!("Market catalog is empty; run `kattraders ingest` first");
    }
    match format {
        OutputFormat::Table => print_markets_table(&markets),
        OutputFormat::Json => print_json(&markets),
    }
    Ok(())
}
