//! The `aggregates` subcommand: list stored daily price aggregates.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use kattraders_lib::{validation, Db, DbAggregateFilter};

use crate::output::{print_aggregates_table, print_json, OutputFormat};

/// Arguments for the `aggregates` subcommand.
#[derive(Args)]
pub struct AggregatesArgs {
    /// SQLite database path (falls back to KAT_DB_PATH, then kattraders.db)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Settlement date (YYYY-MM-DD)
    #[arg(long)]
    pub date: Option<String>,

    /// Wholesale market code
    #[arg(long)]
    pub market: Option<String>,

    /// Commodity name (small class name)
    #[arg(long)]
    pub commodity: Option<String>,

    /// Maximum rows to show
    #[arg(long)]
    pub limit: Option<i64>,
}

pub fn run(args: &AggregatesArgs, format: &OutputFormat) -> Result<()> {
    let filter = DbAggregateFilter {
        date: args
            .date
            .as_deref()
            .map(validation::validate_date)
            .transpose()?,
        market_code: args.market.clone(),
        commodity: args.commodity.clone(),
        limit: args.limit,
    };

    let db = Db::open(super::resolve_db_path(args.db.as_ref()))?;
    db.init()?;
    let aggregates = db.query_aggregates(&filter)?;

    match format {
        OutputFormat::Table => print_aggregates_table(&aggregates),
        OutputFormat::Json => print_json(&aggregates),
    }
    Ok(())
}
