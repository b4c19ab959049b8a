//! Run configuration, built once by the caller and handed to the orchestrator.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Utc};
use serde::Deserialize;

use crate::aggregate::AggregateFilter;
use crate::catalog::MarketPair;
use crate::error::ConfigError;
use crate::source::RetryPolicy;
use crate::validation;

/// Default large commodity class (fruit vegetables).
pub const DEFAULT_LARGE_CLASS: &str = "08";
/// Default mid commodity class (strawberries).
pub const DEFAULT_MID_CLASS: &str = "03";

const KST_OFFSET_SECS: i32 = 9 * 3600;

/// Where the list of (market, corp) scopes comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScopeSource {
    /// Catalog pairs, falling back to the configured pairs when the catalog is empty.
    #[default]
    Auto,
    /// Only the configured pairs.
    Explicit,
    /// Only pairs already known to the market catalog.
    Catalog,
    /// One unscoped pass filtered by date and commodity class only.
    Global,
}

impl FromStr for ScopeSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ScopeSource::Auto),
            "explicit" => Ok(ScopeSource::Explicit),
            "catalog" => Ok(ScopeSource::Catalog),
            "global" => Ok(ScopeSource::Global),
            _ => Err(ConfigError::InvalidScopeSource(s.to_string())),
        }
    }
}

impl fmt::Display for ScopeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScopeSource::Auto => "auto",
            ScopeSource::Explicit => "explicit",
            ScopeSource::Catalog => "catalog",
            ScopeSource::Global => "global",
        };
        f.write_str(s)
    }
}

/// Everything one ingestion run needs. No field is read from the
/// environment after construction.
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Settlement date to ingest.
    pub target_date: NaiveDate,
    /// API service key.
    pub service_key: String,
    /// Large commodity class filter; `None` sends no filter.
    pub large_class: Option<String>,
    /// Mid commodity class filter; `None` sends no filter.
    pub mid_class: Option<String>,
    pub page_size: u32,
    /// Pages one scope may request before it is failed.
    pub max_pages: u32,
    /// Scopes fetched at the same time.
    pub concurrency: usize,
    /// Pause between pages of the same scope.
    pub page_delay: Duration,
    /// Wall-clock budget for the whole run.
    pub run_timeout: Duration,
    pub scope_source: ScopeSource,
    /// Configured (market, corp) pairs for `Explicit`, and the fallback for `Auto`.
    pub markets: Vec<MarketPair>,
    pub aggregate: AggregateFilter,
    pub retry: RetryPolicy,
}

impl IngestConfig {
    /// A config with the documented defaults for everything but the key and date.
    pub fn new(service_key: &str, target_date: NaiveDate) -> Self {
        Self {
            target_date,
            service_key: service_key.to_string(),
            large_class: Some(DEFAULT_LARGE_CLASS.to_string()),
            mid_class: Some(DEFAULT_MID_CLASS.to_string()),
            page_size: 50,
            max_pages: 200,
            concurrency: 2,
            page_delay: Duration::from_millis(300),
            run_timeout: Duration::from_secs(600),
            scope_source: ScopeSource::Auto,
            markets: Vec::new(),
            aggregate: AggregateFilter::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Checks every precondition that does not need the store.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::require_credential("KAT_SERVICE_KEY", &self.service_key)?;
        validation::validate_page_size(self.page_size)?;
        validation::validate_max_pages(self.max_pages)?;
        validation::validate_concurrency(self.concurrency)?;
        validation::validate_run_timeout(self.run_timeout.as_secs())?;
        if self.scope_source == ScopeSource::Explicit && self.markets.is_empty() {
            return Err(ConfigError::NoScopes(
                "explicit scope source selected but no markets configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Today's date on the source's calendar (Korea Standard Time, UTC+9).
pub fn today_kst() -> NaiveDate {
    let kst = FixedOffset::east_opt(KST_OFFSET_SECS).expect("UTC+9 is a valid offset");
    Utc::now().with_timezone(&kst).date_naive()
}

#[derive(Deserialize)]
struct SeedFile {
    #[serde(default)]
    markets: Vec<SeedMarket>,
}

#[derive(Deserialize)]
struct SeedMarket {
    whsl_mrkt_cd: String,
    corp_cd: String,
}

/// Loads fallback market pairs from a TOML file:
///
/// ```toml
/// [[markets]]
/// whsl_mrkt_cd = "110001"
/// corp_cd = "11000103"
/// ```
///
/// Entries with an empty code on either side are skipped.
pub fn load_seed_markets(path: impl AsRef<Path>) -> Result<Vec<MarketPair>, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::SeedFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_seed_markets(&text).map_err(|reason| ConfigError::SeedFile {
        path: path.display().to_string(),
        reason,
    })
}

fn parse_seed_markets(text: &str) -> Result<Vec<MarketPair>, String> {
    let seed: SeedFile = toml::from_str(text).map_err(|e| e.to_string())?;
    let mut pairs: Vec<MarketPair> = seed
        .markets
        .iter()
        .filter_map(|m| MarketPair::new(&m.whsl_mrkt_cd, &m.corp_cd))
        .collect();
    pairs.sort();
    pairs.dedup();
    Ok(pairs)
}
