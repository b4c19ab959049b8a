//! Library layer for kattraders: pagination, normalization, deduplication,
//! market catalog, daily aggregation and the ingestion orchestrator.
//!
//! Wraps the `kattrades_api` client with retry and bounded-concurrency
//! scope workers, and persists results to SQLite.

pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod normalize;
pub mod paginate;
pub mod row_key;
pub mod source;
pub mod validation;

pub use kattrades_api;
pub use kattrades_api::types;

pub use aggregate::{AggregateFilter, DailyAggregate};
pub use catalog::{MarketCatalog, MarketEntry, MarketPair};
pub use config::{IngestConfig, ScopeSource};
pub use db::{Db, DbAggregateFilter, DbMarketRow, TradeStore, UpsertSummary};
pub use error::{ConfigError, FetchError, IngestError, StoreError};
pub use ingest::{IngestReport, Orchestrator, ProgressEvent, ScopeOutcome, ScopeStatus};
pub use paginate::{PageSource, Scope};
pub use source::{ApiSource, RetryPolicy};
