mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "kattraders")]
#[command(about = "Ingest wholesale agricultural auction trades from the KAT real-time API")]
struct Cli {
    /// Output format: table or json
    #[arg(long, default_value = "table", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one settlement date and store trades, markets and daily aggregates
    Ingest(Box<commands::ingest::IngestArgs>),
    /// List the market catalog
    Markets(commands::markets::MarketsArgs),
    /// List stored daily price aggregates
    Aggregates(commands::aggregates::AggregatesArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kattraders=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let format = match cli.output.as_str() {
        "json" => OutputFormat::Json,
        _ => OutputFormat::Table,
    };

    match &cli.command {
        Commands::Ingest(args) => commands::ingest::run(args.as_ref(), &format).await?,
        Commands::Markets(args) => commands::markets::run(args, &format)?,
        Commands::Aggregates(args) => commands::aggregates::run(args, &format)?,
    }

    Ok(())
}
