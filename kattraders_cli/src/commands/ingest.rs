//! The `ingest` subcommand: fetch one settlement date into SQLite.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use kattraders_lib::config::{load_seed_markets, today_kst, DEFAULT_LARGE_CLASS, DEFAULT_MID_CLASS};
use kattraders_lib::kattrades_api::{self, Client};
use kattraders_lib::{
    validation, AggregateFilter, ApiSource, Db, IngestConfig, IngestError, IngestReport,
    Orchestrator, ProgressEvent, RetryPolicy, ScopeSource, ScopeStatus,
};

use crate::output::{print_ingest_report, print_json, OutputFormat};

/// Arguments for the `ingest` subcommand.
#[derive(Args)]
pub struct IngestArgs {
    /// SQLite database path (falls back to KAT_DB_PATH, then kattraders.db)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// API service key (falls back to KAT_SERVICE_KEY)
    #[arg(long)]
    pub service_key: Option<String>,

    /// Settlement date to ingest (YYYY-MM-DD). Defaults to today in KST.
    #[arg(long)]
    pub date: Option<String>,

    /// Large commodity class code
    #[arg(long, default_value = DEFAULT_LARGE_CLASS)]
    pub large_class: String,

    /// Mid commodity class code
    #[arg(long, default_value = DEFAULT_MID_CLASS)]
    pub mid_class: String,

    /// Send no commodity class filter at all
    #[arg(long)]
    pub no_class_filter: bool,

    /// Where scopes come from: auto, explicit, catalog, global
    #[arg(long, default_value = "auto")]
    pub scope_source: String,

    /// Market pair to ingest, as MARKET_CODE:CORP_CODE (repeatable)
    #[arg(long = "market")]
    pub markets: Vec<String>,

    /// TOML file with fallback [[markets]] entries
    #[arg(long)]
    pub seed_file: Option<PathBuf>,

    /// Rows per page (1-1000)
    #[arg(long, default_value = "50")]
    pub page_size: u32,

    /// Pages one scope may request before it is failed
    #[arg(long, default_value = "200")]
    pub max_pages: u32,

    /// Scopes fetched at the same time (1-8)
    #[arg(long, default_value = "2")]
    pub concurrency: usize,

    /// Delay between pages of one scope in milliseconds
    #[arg(long, default_value = "300")]
    pub page_delay_ms: u64,

    /// Wall-clock budget for the whole run in seconds
    #[arg(long, default_value = "600")]
    pub timeout_secs: u64,

    /// Retries for transient request failures
    #[arg(long, default_value = "3")]
    pub retry_max: usize,

    /// Base retry delay in milliseconds (doubles per attempt)
    #[arg(long, default_value = "2000")]
    pub retry_base_ms: u64,

    /// Only aggregate this commodity (small class name)
    #[arg(long)]
    pub aggregate_commodity: Option<String>,

    /// Only aggregate this unit quantity
    #[arg(long)]
    pub aggregate_unit_qty: Option<f64>,
}

/// Builds the run configuration from flags and environment.
pub fn build_config(args: &IngestArgs) -> Result<IngestConfig> {
    let service_key = args
        .service_key
        .clone()
        .or_else(|| std::env::var("KAT_SERVICE_KEY").ok())
        .unwrap_or_default();
    let target_date = match args.date.as_deref() {
        Some(date) => validation::validate_date(date)?,
        None => today_kst(),
    };

    let mut config = IngestConfig::new(&service_key, target_date);
    config.service_key = validation::require_credential("KAT_SERVICE_KEY", &service_key)?;
    if args.no_class_filter {
        config.large_class = None;
        config.mid_class = None;
    } else {
        config.large_class = non_blank(&args.large_class);
        config.mid_class = non_blank(&args.mid_class);
    }
    config.page_size = validation::validate_page_size(args.page_size)?;
    config.max_pages = validation::validate_max_pages(args.max_pages)?;
    config.concurrency = validation::validate_concurrency(args.concurrency)?;
    config.page_delay = Duration::from_millis(args.page_delay_ms);
    config.run_timeout = validation::validate_run_timeout(args.timeout_secs)?;
    config.retry = RetryPolicy {
        max_retries: args.retry_max,
        base_delay: Duration::from_millis(args.retry_base_ms),
        ..RetryPolicy::default()
    };
    config.scope_source = args.scope_source.parse::<ScopeSource>()?;

    let mut markets = Vec::new();
    for pair in &args.markets {
        markets.push(validation::parse_market_pair(pair)?);
    }
    if let Some(path) = &args.seed_file {
        markets.extend(load_seed_markets(path)?);
    }
    config.markets = markets;

    config.aggregate = AggregateFilter {
        commodity: args.aggregate_commodity.as_deref().and_then(non_blank),
        unit_qty: args.aggregate_unit_qty,
    };

    config.validate()?;
    Ok(config)
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub async fn run(args: &IngestArgs, format: &OutputFormat) -> Result<()> {
    let config = build_config(args)?;
    let db_path = super::resolve_db_path(args.db.as_ref());
    let mut db = Db::open(&db_path)?;
    db.init()?;

    let client = match std::env::var("KAT_BASE_URL").ok() {
        Some(url) => Client::with_base_url(&url, &config.service_key, kattrades_api::DEFAULT_TIMEOUT)?,
        None => Client::new(&config.service_key)?,
    };

    eprintln!(
        "Ingesting {} into {} (scope source: {})",
        config.target_date,
        db_path.display(),
        config.scope_source
    );

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len:5} {msg}",
        )
        .unwrap(),
    );
    pb.set_message("fetching scopes...");
    let progress = pb.clone();

    let source = ApiSource::new(client, &config);
    let orchestrator = Orchestrator::new(source, config).with_progress(move |event| match event {
        ProgressEvent::Resolved { scopes } => progress.set_length(scopes as u64),
        ProgressEvent::ScopeFinished(outcome) => {
            match &outcome.status {
                ScopeStatus::Failed { stage, reason } => progress.println(format!(
                    "  Warning: {} failed during {:?}: {}",
                    outcome.scope, stage, reason
                )),
                ScopeStatus::Abandoned => {
                    progress.println(format!("  Warning: {} abandoned", outcome.scope))
                }
                ScopeStatus::Succeeded { .. } => {}
            }
            progress.inc(1);
        }
    });

    let result = orchestrator.run(&mut db).await;
    pb.finish_and_clear();

    match result {
        Ok(report) => {
            emit(&report, format);
            Ok(())
        }
        Err(IngestError::AllWritesFailed(report)) => {
            emit(&report, format);
            bail!("all {} scope writes failed", report.write_failures())
        }
        Err(e) => Err(e.into()),
    }
}

fn emit(report: &IngestReport, format: &OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => print_ingest_report(report),
    }
}
