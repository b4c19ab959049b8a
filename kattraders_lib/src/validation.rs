//! Input validation for command-line and environment supplied settings.

use std::time::Duration;

use chrono::NaiveDate;

use crate::catalog::MarketPair;
use crate::error::ConfigError;

pub const MAX_PAGE_SIZE: u32 = 1000;
pub const MAX_PAGES: u32 = 10_000;
pub const MAX_CONCURRENCY: usize = 8;
pub const MAX_RUN_TIMEOUT_SECS: u64 = 86_400;

/// Parse a `YYYY-MM-DD` settlement date.
pub fn validate_date(input: &str) -> Result<NaiveDate, ConfigError> {
    let trimmed = input.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate(trimmed.to_string()))
}

/// Validate page size (must be 1..=1000).
pub fn validate_page_size(page_size: u32) -> Result<u32, ConfigError> {
    in_range("page_size", page_size as u64, 1, MAX_PAGE_SIZE as u64).map(|_| page_size)
}

/// Validate the page cap per scope (must be 1..=10000).
pub fn validate_max_pages(max_pages: u32) -> Result<u32, ConfigError> {
    in_range("max_pages", max_pages as u64, 1, MAX_PAGES as u64).map(|_| max_pages)
}

/// Validate worker count (must be 1..=8).
pub fn validate_concurrency(concurrency: usize) -> Result<usize, ConfigError> {
    in_range("concurrency", concurrency as u64, 1, MAX_CONCURRENCY as u64).map(|_| concurrency)
}

/// Validate the run budget in seconds (must be 1..=86400).
pub fn validate_run_timeout(secs: u64) -> Result<Duration, ConfigError> {
    in_range("timeout_secs", secs, 1, MAX_RUN_TIMEOUT_SECS).map(|_| Duration::from_secs(secs))
}

/// Trim a credential and reject it when empty.
pub fn require_credential(name: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::MissingCredential(name));
    }
    Ok(trimmed.to_string())
}

/// Parse `MARKET_CODE:CORP_CODE`.
pub fn parse_market_pair(input: &str) -> Result<MarketPair, ConfigError> {
    let (market, corp) = input
        .split_once(':')
        .ok_or_else(|| ConfigError::InvalidMarketPair(input.to_string()))?;
    MarketPair::new(market, corp).ok_or_else(|| ConfigError::InvalidMarketPair(input.to_string()))
}

fn in_range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRange {
            name,
            min,
            max,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "validation_tests.rs"]
mod tests;
