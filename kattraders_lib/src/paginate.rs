//! Sequential page harvesting for one scope.
//!
//! Page N+1 is only requested after page N arrives, since whether to continue
//! depends on page N's size and the declared total.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use kattrades_api::types::RawItem;
use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;

use crate::catalog::MarketPair;
use crate::error::FetchError;

/// One unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Filtered to one (market, corp) pair.
    Market(MarketPair),
    /// No market filter; date and commodity filters only.
    Global,
}

impl Scope {
    pub fn pair(&self) -> Option<&MarketPair> {
        match self {
            Scope::Market(pair) => Some(pair),
            Scope::Global => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Market(pair) => write!(f, "{}", pair),
            Scope::Global => f.write_str("global"),
        }
    }
}

/// One page as returned by a [`PageSource`].
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<RawItem>,
    /// Declared total, when the source reported a usable integer.
    pub total_count: Option<u64>,
}

/// Something that can return one page of trades for a scope.
pub trait PageSource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        scope: &Scope,
        page_no: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<Page, FetchError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PaginatorSettings {
    pub page_size: u32,
    pub max_pages: u32,
    /// Base pause between pages. Up to 20% random jitter is added.
    pub page_delay: Duration,
}

/// A page whose body could not be understood. Pagination stops there.
#[derive(Debug, Clone, Serialize)]
pub struct MalformedPage {
    pub page_no: u32,
    pub reason: String,
    pub excerpt: String,
}

/// Everything collected for one scope.
#[derive(Debug, Default)]
pub struct Harvest {
    pub items: Vec<RawItem>,
    pub pages_fetched: u32,
    pub total_count: Option<u64>,
    pub malformed: Option<MalformedPage>,
}

#[derive(thiserror::Error, Debug)]
pub enum PaginateError {
    #[error("page {page_no}: {source}")]
    Fetch {
        page_no: u32,
        #[source]
        source: FetchError,
    },
    #[error("page cap of {max_pages} reached before the source was exhausted")]
    PageCapExceeded { max_pages: u32 },
}

/// Fetches pages for `scope` until the source is exhausted.
///
/// Stops on the first empty page, or once `page_no * page_size` reaches a
/// known total. Items past a known total are dropped. Needing a page beyond
/// `max_pages` fails the scope.
pub async fn paginate<S: PageSource>(
    source: &S,
    scope: &Scope,
    settings: &PaginatorSettings,
) -> Result<Harvest, PaginateError> {
    let page_size = settings.page_size.max(1);
    let mut harvest = Harvest::default();
    let mut page_no: u32 = 1;

    loop {
        if page_no > settings.max_pages {
            tracing::warn!(
                "{}: stopping at page cap {} ({} items so far)",
                scope,
                settings.max_pages,
                harvest.items.len()
            );
            return Err(PaginateError::PageCapExceeded {
                max_pages: settings.max_pages,
            });
        }
        if page_no > 1 && !settings.page_delay.is_zero() {
            sleep(jittered(settings.page_delay)).await;
        }

        let page = match source.fetch_page(scope, page_no, page_size).await {
            Ok(page) => page,
            Err(FetchError::Malformed { reason, excerpt }) => {
                tracing::warn!("{}: page {} malformed: {}", scope, page_no, reason);
                harvest.pages_fetched += 1;
                harvest.malformed = Some(MalformedPage {
                    page_no,
                    reason,
                    excerpt,
                });
                break;
            }
            Err(source) => return Err(PaginateError::Fetch { page_no, source }),
        };
        harvest.pages_fetched += 1;
        if harvest.total_count.is_none() {
            harvest.total_count = page.total_count;
        }

        if page.items.is_empty() {
            break;
        }

        let mut items = page.items;
        if let Some(total) = harvest.total_count {
            let room = total.saturating_sub(harvest.items.len() as u64);
            items.truncate(usize::try_from(room).unwrap_or(usize::MAX));
        }
        tracing::debug!("{}: page {} ({} items)", scope, page_no, items.len());
        harvest.items.extend(items);

        if let Some(total) = harvest.total_count {
            let requested = u64::from(page_no) * u64::from(page_size);
            if requested >= total || harvest.items.len() as u64 >= total {
                break;
            }
        }
        page_no += 1;
    }

    Ok(harvest)
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.2);
    base.mul_f64(factor)
}
