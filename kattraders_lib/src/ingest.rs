//! Ingestion orchestrator: one settlement date across many (market, corp) scopes.
//!
//! Scope workers run concurrently (bounded by a semaphore) and only fetch.
//! Every finished scope is sent over an mpsc channel to the single receiver,
//! which owns the store and does all catalog, key and upsert work. A failure
//! in one scope never touches its siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::aggregate::aggregate;
use crate::catalog::{list_known, MarketCatalog, MarketPair};
use crate::config::{IngestConfig, ScopeSource};
use crate::db::TradeStore;
use crate::error::{ConfigError, IngestError};
use crate::normalize::{normalize_all, TradeRecord};
use crate::paginate::{paginate, Harvest, PageSource, PaginateError, PaginatorSettings, Scope};
use crate::row_key::{
    canonical_payload, dedup_batch, derive_row_key, IngestedRow, KeyCollision, RowKeyKind,
};

/// Stage at which a scope failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScopeStatus {
    Succeeded {
        rows_written: usize,
        pages: u32,
        items: usize,
    },
    Failed {
        stage: FailureStage,
        reason: String,
    },
    /// Still running when the run's wall-clock budget ran out.
    Abandoned,
}

/// What happened to one scope.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeOutcome {
    pub scope: String,
    #[serde(flatten)]
    pub status: ScopeStatus,
    pub warnings: Vec<String>,
}

impl ScopeOutcome {
    fn failed(scope: &Scope, stage: FailureStage, reason: String, warnings: Vec<String>) -> Self {
        Self {
            scope: scope.to_string(),
            status: ScopeStatus::Failed { stage, reason },
            warnings,
        }
    }
}

/// A malformed page, tagged with the scope that received it.
#[derive(Debug, Clone, Serialize)]
pub struct MalformedPageReport {
    pub scope: String,
    pub page_no: u32,
    pub reason: String,
    pub excerpt: String,
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub date: NaiveDate,
    pub scope_source: String,
    pub scopes_attempted: usize,
    pub rows_written: usize,
    pub markets_observed: usize,
    pub aggregates_written: usize,
    pub collisions: Vec<KeyCollision>,
    /// Collisions that were not in the collision log before this run.
    pub new_collisions: usize,
    pub malformed_pages: Vec<MalformedPageReport>,
    pub scopes: Vec<ScopeOutcome>,
    /// Run-level problems that did not fail any scope.
    pub warnings: Vec<String>,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl IngestReport {
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ScopeStatus::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ScopeStatus::Failed { .. }))
    }

    pub fn abandoned(&self) -> usize {
        self.count(|s| matches!(s, ScopeStatus::Abandoned))
    }

    pub fn write_failures(&self) -> usize {
        self.count(|s| {
            matches!(
                s,
                ScopeStatus::Failed {
                    stage: FailureStage::Write,
                    ..
                }
            )
        })
    }

    fn count(&self, pred: impl Fn(&ScopeStatus) -> bool) -> usize {
        self.scopes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Progress notifications, delivered on the receiving side of the run.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// Scope list resolved; `scopes` workers will run.
    Resolved { scopes: usize },
    /// One scope reached a final state.
    ScopeFinished(&'a ScopeOutcome),
}

type ProgressFn = Box<dyn Fn(ProgressEvent<'_>) + Send + Sync>;

/// Message from a scope worker to the writer.
struct ScopeBatch {
    index: usize,
    scope: Scope,
    result: Result<Harvest, PaginateError>,
}

/// Mutable run state owned by the receiver.
#[derive(Default)]
struct RunState {
    rows_written: usize,
    write_attempts: usize,
    write_successes: usize,
    catalog: MarketCatalog,
    markets: BTreeSet<MarketPair>,
    collisions: Vec<KeyCollision>,
    new_collisions: usize,
    malformed_pages: Vec<MalformedPageReport>,
    /// Aggregator input: every distinct lot of this run with its stored
    /// market code. Keyed by Row Key, plus the canonical payload for
    /// fallback keys so colliding lots are all counted.
    aggregate_input: BTreeMap<(String, String), (String, TradeRecord)>,
}

pub struct Orchestrator<S: PageSource> {
    source: Arc<S>,
    config: IngestConfig,
    progress: Option<ProgressFn>,
}

impl<S: PageSource> Orchestrator<S> {
    pub fn new(source: S, config: IngestConfig) -> Self {
        Self {
            source: Arc::new(source),
            config,
            progress: None,
        }
    }

    pub fn with_progress(
        mut self,
        progress: impl Fn(ProgressEvent<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    fn notify(&self, event: ProgressEvent<'_>) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    /// Builds the scope list for this run. An empty list is a [`ConfigError`].
    pub fn resolve_scopes<T: TradeStore>(&self, store: &T) -> Result<Vec<Scope>, IngestError> {
        let configured = || -> Vec<Scope> {
            let unique: BTreeSet<&MarketPair> = self.config.markets.iter().collect();
            unique.into_iter().cloned().map(Scope::Market).collect()
        };

        let scopes = match self.config.scope_source {
            ScopeSource::Global => vec![Scope::Global],
            ScopeSource::Explicit => configured(),
            ScopeSource::Catalog => list_known(store)?.into_iter().map(Scope::Market).collect(),
            ScopeSource::Auto => match list_known(store) {
                Ok(known) if !known.is_empty() => known.into_iter().map(Scope::Market).collect(),
                Ok(_) => {
                    tracing::info!("market catalog is empty, using configured markets");
                    configured()
                }
                Err(e) => {
                    tracing::warn!("market catalog unreadable ({}), using configured markets", e);
                    configured()
                }
            },
        };

        if scopes.is_empty() {
            return Err(ConfigError::NoScopes(format!(
                "scope source '{}' resolved to no markets",
                self.config.scope_source
            ))
            .into());
        }
        Ok(scopes)
    }

    /// Runs one ingestion pass and writes results to `store`.
    ///
    /// Returns the report for any completed run, including one with zero
    /// rows or failed scopes. Errors only on configuration problems, or
    /// when at least one scope tried to write and none succeeded.
    pub async fn run<T: TradeStore>(&self, store: &mut T) -> Result<IngestReport, IngestError> {
        self.config.validate()?;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.run_timeout;

        let scopes = self.resolve_scopes(store)?;
        tracing::info!(
            "Ingesting {} for {} scope(s) (source: {}, concurrency: {})",
            self.config.target_date,
            scopes.len(),
            self.config.scope_source,
            self.config.concurrency
        );
        self.notify(ProgressEvent::Resolved {
            scopes: scopes.len(),
        });

        let settings = PaginatorSettings {
            page_size: self.config.page_size,
            max_pages: self.config.max_pages,
            page_delay: self.config.page_delay,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let (tx, mut rx) = mpsc::channel::<ScopeBatch>(self.config.concurrency * 2);
        let mut join_set = JoinSet::new();

        for (index, scope) in scopes.iter().cloned().enumerate() {
            let source = Arc::clone(&self.source);
            let sem = Arc::clone(&semaphore);
            let sender = tx.clone();
            let settings = settings.clone();
            join_set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return;
                };
                let result = paginate(source.as_ref(), &scope, &settings).await;
                let _ = sender.send(ScopeBatch {
                    index,
                    scope,
                    result,
                })
                .await;
            });
        }
        drop(tx);

        let mut state = RunState::default();
        let mut outcomes: Vec<Option<ScopeOutcome>> = vec![None; scopes.len()];
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(batch)) => {
                    let index = batch.index;
                    let outcome = self.write_scope(store, &mut state, batch);
                    self.notify(ProgressEvent::ScopeFinished(&outcome));
                    outcomes[index] = Some(outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Run timeout of {}s reached, abandoning remaining scopes",
                        self.config.run_timeout.as_secs()
                    );
                    timed_out = true;
                    join_set.abort_all();
                    break;
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("scope worker panicked: {}", e);
                }
            }
        }

        let scope_outcomes: Vec<ScopeOutcome> = scopes
            .iter()
            .zip(outcomes)
            .map(|(scope, outcome)| match outcome {
                Some(outcome) => outcome,
                None if timed_out => {
                    let outcome = ScopeOutcome {
                        scope: scope.to_string(),
                        status: ScopeStatus::Abandoned,
                        warnings: Vec::new(),
                    };
                    self.notify(ProgressEvent::ScopeFinished(&outcome));
                    outcome
                }
                None => ScopeOutcome::failed(
                    scope,
                    FailureStage::Fetch,
                    "worker exited without a result".to_string(),
                    Vec::new(),
                ),
            })
            .collect();

        let mut report = IngestReport {
            date: self.config.target_date,
            scope_source: self.config.scope_source.to_string(),
            scopes_attempted: scopes.len(),
            rows_written: state.rows_written,
            markets_observed: state.markets.len(),
            aggregates_written: 0,
            collisions: state.collisions,
            new_collisions: state.new_collisions,
            malformed_pages: state.malformed_pages,
            scopes: scope_outcomes,
            warnings: Vec::new(),
            timed_out,
            elapsed_ms: 0,
        };

        if state.write_attempts > 0 && state.write_successes == 0 {
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            tracing::error!("All {} scope writes failed", state.write_attempts);
            return Err(IngestError::AllWritesFailed(Box::new(report)));
        }

        let aggregates = aggregate(
            self.config.target_date,
            state
                .aggregate_input
                .values()
                .map(|(market, record)| (market.as_str(), record)),
            &self.config.aggregate,
        );
        if !aggregates.is_empty() {
            match store.replace_aggregates(&aggregates) {
                Ok(n) => report.aggregates_written = n,
                Err(e) => {
                    tracing::warn!("Failed to write daily aggregates: {}", e);
                    report
                        .warnings
                        .push(format!("daily aggregates not written: {}", e));
                }
            }
        }

        let date = self.config.target_date.format("%Y-%m-%d").to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        for (key, value) in [("last_ingest_date", date.as_str()), ("last_ingest_at", now.as_str())] {
            if let Err(e) = store.set_meta(key, value) {
                tracing::warn!("Failed to record {}: {}", key, e);
                report.warnings.push(format!("{} not recorded: {}", key, e));
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.rows_written == 0 {
            tracing::info!("Run finished with zero rows for {}", self.config.target_date);
        }
        tracing::info!(
            "Run complete: {} rows, {} succeeded, {} failed, {} abandoned",
            report.rows_written,
            report.succeeded(),
            report.failed(),
            report.abandoned()
        );
        Ok(report)
    }

    /// Normalizes, keys and upserts one finished scope. Runs on the receiver.
    fn write_scope<T: TradeStore>(
        &self,
        store: &mut T,
        state: &mut RunState,
        batch: ScopeBatch,
    ) -> ScopeOutcome {
        let scope = batch.scope;
        let mut warnings = Vec::new();

        let harvest = match batch.result {
            Ok(harvest) => harvest,
            Err(e) => {
                tracing::warn!("{}: fetch failed: {}", scope, e);
                return ScopeOutcome::failed(&scope, FailureStage::Fetch, e.to_string(), warnings);
            }
        };

        if let Some(malformed) = harvest.malformed {
            warnings.push(format!(
                "page {} malformed: {}",
                malformed.page_no, malformed.reason
            ));
            state.malformed_pages.push(MalformedPageReport {
                scope: scope.to_string(),
                page_no: malformed.page_no,
                reason: malformed.reason,
                excerpt: malformed.excerpt,
            });
        }

        let (records, issues) = normalize_all(&harvest.items);
        if !issues.is_empty() {
            for issue in &issues {
                tracing::debug!("{}: unparseable {} value {:?}", scope, issue.field, issue.raw);
            }
            warnings.push(format!("{} numeric field(s) could not be parsed", issues.len()));
        }

        state.catalog.observe(&records);
        state
            .markets
            .extend(state.catalog.staged().map(|entry| entry.pair.clone()));
        if let Err(e) = state.catalog.flush(store) {
            tracing::warn!("{}: market catalog update failed: {}", scope, e);
            warnings.push(format!("market catalog update failed: {}", e));
        }

        let mut unkeyed = 0usize;
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let codes = match &scope {
                Scope::Market(pair) => Some((
                    pair.market_code().to_string(),
                    pair.corp_code().to_string(),
                )),
                Scope::Global => record
                    .market_code
                    .clone()
                    .zip(record.corp_code.clone()),
            };
            let Some((market_code, corp_code)) = codes else {
                unkeyed += 1;
                continue;
            };
            rows.push(IngestedRow {
                row_key: derive_row_key(self.config.target_date, &market_code, &corp_code, &record),
                settlement_date: self.config.target_date,
                market_code,
                corp_code,
                large_class: self.config.large_class.clone(),
                mid_class: self.config.mid_class.clone(),
                record,
            });
        }
        if unkeyed > 0 {
            tracing::warn!("{}: skipped {} record(s) without market/corp codes", scope, unkeyed);
            warnings.push(format!("{} record(s) without market/corp codes skipped", unkeyed));
        }

        let deduped = dedup_batch(rows);
        if deduped.rows.is_empty() {
            tracing::info!("{}: no rows for {}", scope, self.config.target_date);
            return ScopeOutcome {
                scope: scope.to_string(),
                status: ScopeStatus::Succeeded {
                    rows_written: 0,
                    pages: harvest.pages_fetched,
                    items: harvest.items.len(),
                },
                warnings,
            };
        }

        state.write_attempts += 1;
        let summary = match store.upsert_trades(&deduped.rows) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!("{}: write failed: {}", scope, e);
                return ScopeOutcome::failed(&scope, FailureStage::Write, e.to_string(), warnings);
            }
        };
        state.write_successes += 1;
        state.rows_written += summary.written;

        if !deduped.collisions.is_empty() {
            match store.record_collisions(&deduped.collisions) {
                Ok(new) => state.new_collisions += new,
                Err(e) => {
                    tracing::warn!("{}: failed to record key collisions: {}", scope, e);
                    warnings.push(format!("key collisions not recorded: {}", e));
                }
            }
            warnings.push(format!(
                "{} row key collision(s) in batch",
                deduped.collisions.len()
            ));
        }
        if !summary.collisions.is_empty() {
            warnings.push(format!(
                "{} stored row(s) overwritten with a different payload",
                summary.collisions.len()
            ));
        }
        state.new_collisions += summary.new_collisions;
        state.collisions.extend(deduped.collisions);
        state.collisions.extend(summary.collisions);

        for row in deduped.rows.into_iter().chain(deduped.rejected) {
            let variant = match row.row_key.kind() {
                RowKeyKind::Lot => String::new(),
                RowKeyKind::Fallback => canonical_payload(&row.record.payload),
            };
            state.aggregate_input.insert(
                (row.row_key.as_str().to_string(), variant),
                (row.market_code, row.record),
            );
        }

        tracing::info!(
            "{}: wrote {} row(s) from {} page(s)",
            scope,
            summary.written,
            harvest.pages_fetched
        );
        ScopeOutcome {
            scope: scope.to_string(),
            status: ScopeStatus::Succeeded {
                rows_written: summary.written,
                pages: harvest.pages_fetched,
                items: harvest.items.len(),
            },
            warnings,
        }
    }
}

#[cfg(test)]
#[path = "ingest_tests.rs"]
mod tests;
