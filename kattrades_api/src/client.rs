//! HTTP client for the KAT real-time auction trades API.

use std::time::Duration;

use url::Url;

use crate::{
    query::{Query, TradeQuery},
    types::{Body, Envelope},
    Error,
};

/// Production endpoint for settled auction trades.
pub const DEFAULT_BASE_URL: &str = "https://apis.data.go.kr/B552845/katRealTime2/trades2";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the trades endpoint.
///
/// The service key is appended to every request as `serviceKey`. One
/// `reqwest::Client` is built up front and shared by every request, so the
/// client is cheap to share behind an `Arc` across scope workers.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl Client {
    /// Creates a client pointing at the production endpoint.
    pub fn new(service_key: &str) -> Result<Self, Error> {
        Self::with_base_url(DEFAULT_BASE_URL, service_key, DEFAULT_TIMEOUT)
    }

    /// Creates a client with a custom endpoint and timeout. Used for testing with wiremock.
    pub fn with_base_url(
        base_url: &str,
        service_key: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            service_key: service_key.to_string(),
        })
    }

    fn get_url(&self, query: &impl Query) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            tracing::error!("Invalid URL constructed: {}", e);
            Error::InvalidUrl(e.to_string())
        })?;
        url.query_pairs_mut()
            .append_pair("serviceKey", &self.service_key);
        Ok(query.add_to_url(&url))
    }

    /// Fetches one page of trades and returns the envelope body.
    ///
    /// A non-success header result code becomes [`Error::Upstream`]; a body
    /// that is not JSON or lacks `response.body` becomes [`Error::Malformed`]
    /// with an excerpt of what was received.
    pub async fn get_trades(&self, query: &TradeQuery) -> Result<Body, Error> {
        let url = self.get_url(query)?;
        let resp = self
            .http
            .get(url)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to get trades page {}: {}", query.common.page_no, e);
                Error::Network(e)
            })?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let snippet = truncate_body(&text);
            tracing::error!("Request failed with status {}: {}", status, snippet);
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body: snippet,
            });
        }

        let envelope = serde_json::from_str::<Envelope>(&text).map_err(|e| {
            let snippet = truncate_body(&text);
            tracing::warn!("Failed to parse trades page: {} | body: {}", e, snippet);
            Error::Malformed {
                reason: e.to_string(),
                excerpt: snippet,
            }
        })?;

        if let Some(header) = &envelope.response.header {
            if !header.is_success() {
                return Err(Error::Upstream {
                    code: header.result_code.clone().unwrap_or_default(),
                    message: header.result_msg.clone().unwrap_or_default(),
                });
            }
        }

        envelope.response.body.ok_or_else(|| Error::Malformed {
            reason: "response.body missing".to_string(),
            excerpt: truncate_body(&text),
        })
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &body[..end])
    }
}
