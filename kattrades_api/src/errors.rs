//! Error types for the API client.

/// Errors that can occur when requesting a page of trades.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request never produced a response (connect failure, timeout, body read).
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The API returned a non-success status with a body snippet.
    #[error("Request failed with status {status}")]
    HttpStatus { status: u16, body: String },
    /// The envelope header carried a non-success result code.
    #[error("API rejected request ({code}): {message}")]
    Upstream { code: String, message: String },
    /// The body was not JSON, or not shaped like the documented envelope.
    #[error("Malformed response: {reason}")]
    Malformed { reason: String, excerpt: String },
    /// A URL could not be built from the base URL and query.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl Error {
    /// True for failures worth retrying: timeouts, connection errors, HTTP 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
