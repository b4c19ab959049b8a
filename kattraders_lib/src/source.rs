//! [`PageSource`] backed by the live trades API, with retry on transient failures.

use std::future::Future;
use std::time::Duration;

use chrono::NaiveDate;
use kattrades_api::{Client, Query, TradeQuery};
use rand::Rng;

use crate::config::IngestConfig;
use crate::error::FetchError;
use crate::normalize::unwrap_items;
use crate::paginate::{Page, PageSource, Scope};

/// Exponential backoff for transient request failures (network errors,
/// HTTP 429 and 5xx). Malformed bodies and upstream rejections are not retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), with +/-20% jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(30) as u32;
        let base = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        base.mul_f64(jitter)
    }
}

/// Runs `f` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut f: F,
) -> Result<T, kattrades_api::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kattrades_api::Error>>,
{
    let mut attempt = 0usize;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > policy.max_retries || !err.is_transient() {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "{} request failed (attempt {}/{}), retrying in {:.1}s: {}",
                    label,
                    attempt,
                    policy.max_retries,
                    delay.as_secs_f64(),
                    err
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Fetches pages from the trades endpoint for one settlement date and
/// commodity class filter.
pub struct ApiSource {
    client: Client,
    date: NaiveDate,
    large_class: Option<String>,
    mid_class: Option<String>,
    retry: RetryPolicy,
}

impl ApiSource {
    pub fn new(client: Client, config: &IngestConfig) -> Self {
        Self {
            client,
            date: config.target_date,
            large_class: config.large_class.clone(),
            mid_class: config.mid_class.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Builds the request for one page of `scope`.
    pub fn query_for(&self, scope: &Scope, page_no: u32, page_size: u32) -> TradeQuery {
        let mut query = TradeQuery::default()
            .with_settlement_date(self.date)
            .with_page(page_no)
            .with_page_size(page_size);
        if let Some(code) = &self.large_class {
            query = query.with_large_class(code);
        }
        if let Some(code) = &self.mid_class {
            query = query.with_mid_class(code);
        }
        if let Scope::Market(pair) = scope {
            query = query
                .with_market(pair.market_code())
                .with_corp(pair.corp_code());
        }
        query
    }
}

impl PageSource for ApiSource {
    async fn fetch_page(
        &self,
        scope: &Scope,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page, FetchError> {
        let query = self.query_for(scope, page_no, page_size);
        let label = format!("{} page {}", scope, page_no);
        let body = with_retry(&self.retry, &label, || self.client.get_trades(&query)).await?;
        Ok(Page {
            total_count: body.total_count(),
            items: unwrap_items(body.items),
        })
    }
}
