use serde::Serialize;
use kattraders_lib::{DailyAggregate, DbMarketRow, IngestReport, ScopeOutcome, ScopeStatus};
use tabled::{Table, Tabled};

#[derive(Clone, Debug)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Tabled, Serialize)]
struct MarketRow {
    #[tabled(rename = "Market")]
    #[serde(rename = "Market")]
    market_code: String,
    #[tabled(rename = "Corp")]
    #[serde(rename = "Corp")]
    corp_code: String,
    #[tabled(rename = "Market Name")]
    #[serde(rename = "Market Name")]
    market_name: String,
    #[tabled(rename = "Corp Name")]
    #[serde(rename = "Corp Name")]
    corp_name: String,
    #[tabled(rename = "Last Seen")]
    #[serde(rename = "Last Seen")]
    last_seen: String,
}

#[derive(Tabled, Serialize)]
struct AggregateRow {
    #[tabled(rename = "Date")]
    #[serde(rename = "Date")]
    date: String,
    #[tabled(rename = "Market")]
    #[serde(rename = "Market")]
    market_code: String,
    #[tabled(rename = "Commodity")]
    #[serde(rename = "Commodity")]
    commodity: String,
    #[tabled(rename = "Unit")]
    #[serde(rename = "Unit")]
    unit_qty: String,
    #[tabled(rename = "Trades")]
    #[serde(rename = "Trades")]
    count: u64,
    #[tabled(rename = "Avg/kg")]
    #[serde(rename = "Avg/kg")]
    average: String,
    #[tabled(rename = "Min/kg")]
    #[serde(rename = "Min/kg")]
    min: String,
    #[tabled(rename = "Max/kg")]
    #[serde(rename = "Max/kg")]
    max: String,
}

#[derive(Tabled, Serialize)]
struct ScopeRow {
    #[tabled(rename = "Scope")]
    #[serde(rename = "Scope")]
    scope: String,
    #[tabled(rename = "Status")]
    #[serde(rename = "Status")]
    status: String,
    #[tabled(rename = "Rows")]
    #[serde(rename = "Rows")]
    rows: String,
    #[tabled(rename = "Pages")]
    #[serde(rename = "Pages")]
    pages: String,
    #[tabled(rename = "Detail")]
    #[serde(rename = "Detail")]
    detail: String,
}

// -- Row builders --

fn build_market_rows(markets: &[DbMarketRow]) -> Vec<MarketRow> {
    markets
        .iter()
        .map(|m| MarketRow {
            market_code: m.market_code.clone(),
            corp_code: m.corp_code.clone(),
            market_name: m.market_name.clone().unwrap_or_default(),
            corp_name: m.corp_name.clone().unwrap_or_default(),
            last_seen: m.last_seen.clone(),
        })
        .collect()
}

fn build_aggregate_rows(aggregates: &[DailyAggregate]) -> Vec<AggregateRow> {
    aggregates
        .iter()
        .map(|a| AggregateRow {
            date: a.date.to_string(),
            market_code: a.market_code.clone(),
            commodity: a.commodity_name.clone(),
            unit_qty: format_qty(a.unit_qty),
            count: a.count,
            average: format_price(a.average),
            min: format_price(a.min),
            max: format_price(a.max),
        })
        .collect()
}

fn build_scope_rows(outcomes: &[ScopeOutcome]) -> Vec<ScopeRow> {
    outcomes
        .iter()
        .map(|o| {
            let (status, rows, pages, mut detail) = match &o.status {
                ScopeStatus::Succeeded {
                    rows_written,
                    pages,
                    ..
                } => (
                    "ok".to_string(),
                    rows_written.to_string(),
                    pages.to_string(),
                    String::new(),
                ),
                ScopeStatus::Failed { stage, reason } => (
                    format!("failed ({})", format!("{:?}", stage).to_lowercase()),
                    "-".to_string(),
                    "-".to_string(),
                    reason.clone(),
                ),
                ScopeStatus::Abandoned => (
                    "abandoned".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    String::new(),
                ),
            };
            if !o.warnings.is_empty() {
                if !detail.is_empty() {
                    detail.push_str("; ");
                }
                detail.push_str(&o.warnings.join("; "));
            }
            ScopeRow {
                scope: o.scope.clone(),
                status,
                rows,
                pages,
                detail,
            }
        })
        .collect()
}

// -- Table output --

pub fn print_markets_table(markets: &[DbMarketRow]) {
    println!("{}", Table::new(build_market_rows(markets)));
}

pub fn print_aggregates_table(aggregates: &[DailyAggregate]) {
    println!("{}", Table::new(build_aggregate_rows(aggregates)));
}

pub fn print_ingest_report(report: &IngestReport) {
    println!("{}", Table::new(build_scope_rows(&report.scopes)));
    eprintln!(
        "{}: {} rows written, {}/{} scopes succeeded, {} failed, {} abandoned",
        report.date,
        report.rows_written,
        report.succeeded(),
        report.scopes_attempted,
        report.failed(),
        report.abandoned()
    );
    eprintln!(
        "Markets observed: {}, aggregates written: {}, key collisions: {} ({} new), malformed pages: {}",
        report.markets_observed,
        report.aggregates_written,
        report.collisions.len(),
        report.new_collisions,
        report.malformed_pages.len()
    );
    for page in &report.malformed_pages {
        eprintln!(
            "  Malformed page {} for {}: {} | {}",
            page.page_no, page.scope, page.reason, page.excerpt
        );
    }
    for warning in &report.warnings {
        eprintln!("  Warning: {}", warning);
    }
    if report.timed_out {
        eprintln!("Run timed out before every scope finished");
    }
}

// -- JSON output --

pub fn print_json<T: serde::Serialize>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize to JSON: {}", e),
    }
}

/// Formats a per-kg amount with thousands separators and one decimal, or `-`.
fn format_price(value: Option<f64>) -> String {
    let Some(value) = value else {
        return "-".to_string();
    };
    let rounded = (value * 10.0).round() / 10.0;
    let whole = rounded.trunc().abs() as u64;
    let tenths = ((rounded.abs() - whole as f64) * 10.0).round() as u64;
    let sign = if rounded < 0.0 { "-" } else { "" };
    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if tenths == 0 {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{}", sign, grouped, tenths)
    }
}

fn format_qty(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
