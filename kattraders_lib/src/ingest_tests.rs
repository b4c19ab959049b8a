use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kattrades_api::types::RawItem;
use serde_json::{json, Value};

use super::*;
use crate::aggregate::DailyAggregate;
use crate::catalog::MarketEntry;
use crate::db::{Db, DbAggregateFilter, UpsertSummary};
use crate::error::{FetchError, StoreError};
use crate::paginate::Page;

enum Script {
    Items(Vec<RawItem>),
    Transport,
    Hang,
}

/// Serves scripted items per scope, paged by the requested size.
#[derive(Default)]
struct MockSource {
    scripts: HashMap<Scope, Script>,
}

impl MockSource {
    fn with(mut self, scope: Scope, script: Script) -> Self {
        self.scripts.insert(scope, script);
        self
    }
}

impl PageSource for MockSource {
    async fn fetch_page(
        &self,
        scope: &Scope,
        page_no: u32,
        page_size: u32,
    ) -> Result<Page, FetchError> {
        match self.scripts.get(scope) {
            None => Ok(Page {
                items: Vec::new(),
                total_count: Some(0),
            }),
            Some(Script::Transport) => Err(FetchError::Transport("connection reset".into())),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Items(items)) => {
                let start = ((page_no - 1) * page_size) as usize;
                let end = (start + page_size as usize).min(items.len());
                Ok(Page {
                    items: items.get(start..end).unwrap_or_default().to_vec(),
                    total_count: Some(items.len() as u64),
                })
            }
        }
    }
}

/// Delegates to an in-memory [`Db`] but can be told to reject trade writes.
struct FlakyStore {
    inner: Db,
    reject_trades: bool,
}

impl TradeStore for FlakyStore {
    fn upsert_trades(&mut self, rows: &[IngestedRow]) -> Result<UpsertSummary, StoreError> {
        if self.reject_trades {
            return Err(StoreError::Rejected("disk full".into()));
        }
        self.inner.upsert_trades(rows)
    }

    fn upsert_markets(&mut self, entries: &[MarketEntry]) -> Result<usize, StoreError> {
        self.inner.upsert_markets(entries)
    }

    fn list_markets(&self) -> Result<Vec<MarketEntry>, StoreError> {
        self.inner.list_markets()
    }

    fn replace_aggregates(&mut self, aggregates: &[DailyAggregate]) -> Result<usize, StoreError> {
        self.inner.replace_aggregates(aggregates)
    }

    fn record_collisions(&mut self, collisions: &[KeyCollision]) -> Result<usize, StoreError> {
        self.inner.record_collisions(collisions)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_meta(key, value)
    }
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn open_test_db() -> Db {
    let db = Db::open_in_memory().expect("open in-memory db");
    db.init().expect("init schema");
    db
}

fn pair(market: &str, corp: &str) -> MarketPair {
    MarketPair::new(market, corp).unwrap()
}

fn item(value: Value) -> RawItem {
    let Value::Object(map) = value else {
        panic!("fixture must be an object")
    };
    map
}

fn trade(market: &str, corp: &str, lot: &str, per_kg: &str) -> RawItem {
    item(json!({
        "trd_clcln_ymd": "2024-05-01",
        "whsl_mrkt_cd": market,
        "whsl_mrkt_nm": "시장",
        "corp_cd": corp,
        "corp_nm": "법인",
        "gds_sclsf_nm": "설향",
        "unit_qty": "2",
        "kg_unit_prc": per_kg,
        "spm_no": lot,
    }))
}

fn config(markets: Vec<MarketPair>) -> IngestConfig {
    let mut config = IngestConfig::new("test-key", date());
    config.scope_source = ScopeSource::Explicit;
    config.markets = markets;
    config.page_size = 2;
    config.page_delay = Duration::ZERO;
    config
}

#[tokio::test]
async fn failing_scope_does_not_affect_sibling() {
    let a = pair("110001", "11000101");
    let b = pair("210001", "21000101");
    let source = MockSource::default()
        .with(Scope::Market(a.clone()), Script::Transport)
        .with(
            Scope::Market(b.clone()),
            Script::Items(vec![
                trade("210001", "21000101", "1", "1000"),
                trade("210001", "21000101", "2", "2000"),
                trade("210001", "21000101", "3", "3000"),
            ]),
        );
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config(vec![a, b]))
        .run(&mut db)
        .await
        .unwrap();

    assert_eq!(report.scopes_attempted, 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.rows_written, 3);
    assert_eq!(db.trade_count().unwrap(), 3);

    let failed = report
        .scopes
        .iter()
        .find(|o| o.scope == "110001/11000101")
        .unwrap();
    assert!(matches!(
        failed.status,
        ScopeStatus::Failed {
            stage: FailureStage::Fetch,
            ..
        }
    ));
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let a = pair("110001", "11000101");
    let items = vec![
        trade("110001", "11000101", "1", "1000"),
        trade("110001", "11000101", "2", "2000"),
        item(json!({
            "whsl_mrkt_cd": "110001",
            "corp_cd": "11000101",
            "gds_sclsf_nm": "설향",
            "unit_qty": 2,
            "auctn_seq": "9",
            "scsbd_dt": "2024-05-01 09:00:00",
        })),
    ];
    let mut db = open_test_db();

    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let source =
            MockSource::default().with(Scope::Market(a.clone()), Script::Items(items.clone()));
        Orchestrator::new(source, config(vec![a.clone()]))
            .run(&mut db)
            .await
            .unwrap();
        snapshots.push((
            db.row_keys_for_date(date()).unwrap(),
            db.query_aggregates(&DbAggregateFilter::default()).unwrap(),
        ));
    }

    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[0].0.len(), 3);
    assert_eq!(snapshots[0].1.len(), 1);
    assert_eq!(snapshots[0].1[0].count, 2);
    assert_eq!(snapshots[0].1[0].average, Some(1500.0));
    assert_eq!(db.collision_count().unwrap(), 0);
}

#[tokio::test]
async fn zero_rows_is_a_successful_run() {
    let a = pair("110001", "11000101");
    let mut db = open_test_db();

    let report = Orchestrator::new(MockSource::default(), config(vec![a]))
        .run(&mut db)
        .await
        .unwrap();

    assert_eq!(report.rows_written, 0);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.aggregates_written, 0);
    assert_eq!(
        db.get_meta("last_ingest_date").unwrap().as_deref(),
        Some("2024-05-01")
    );
}

#[tokio::test]
async fn all_fetches_failing_is_not_fatal() {
    let a = pair("110001", "11000101");
    let source = MockSource::default().with(Scope::Market(a.clone()), Script::Transport);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config(vec![a]))
        .run(&mut db)
        .await
        .unwrap();
    assert_eq!(report.failed(), 1);
    assert_eq!(report.write_failures(), 0);
}

#[tokio::test]
async fn every_write_failing_is_fatal() {
    let a = pair("110001", "11000101");
    let source = MockSource::default().with(
        Scope::Market(a.clone()),
        Script::Items(vec![trade("110001", "11000101", "1", "1000")]),
    );
    let mut store = FlakyStore {
        inner: open_test_db(),
        reject_trades: true,
    };

    let err = Orchestrator::new(source, config(vec![a]))
        .run(&mut store)
        .await
        .unwrap_err();
    let report = match err {
        IngestError::AllWritesFailed(report) => report,
        other => panic!("expected AllWritesFailed, got {other:?}"),
    };
    assert_eq!(report.write_failures(), 1);
    assert_eq!(store.inner.trade_count().unwrap(), 0);
}

#[tokio::test]
async fn catalog_source_with_empty_catalog_is_config_error() {
    let mut config = config(Vec::new());
    config.scope_source = ScopeSource::Catalog;
    let mut db = open_test_db();

    let err = Orchestrator::new(MockSource::default(), config)
        .run(&mut db)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Config(ConfigError::NoScopes(_))));
}

#[tokio::test]
async fn missing_key_fails_before_any_fetch() {
    let mut config = config(vec![pair("110001", "11000101")]);
    config.service_key = String::new();
    let mut db = open_test_db();

    let err = Orchestrator::new(MockSource::default(), config)
        .run(&mut db)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IngestError::Config(ConfigError::MissingCredential(_))
    ));
}

#[tokio::test]
async fn auto_prefers_catalog_then_falls_back_to_configured() {
    let seed = pair("110001", "11000101");
    let known = pair("210001", "21000101");
    let mut config = config(vec![seed.clone()]);
    config.scope_source = ScopeSource::Auto;
    let mut db = open_test_db();

    let orchestrator = Orchestrator::new(MockSource::default(), config);
    assert_eq!(
        orchestrator.resolve_scopes(&db).unwrap(),
        vec![Scope::Market(seed)]
    );

    db.upsert_markets(&[MarketEntry {
        pair: known.clone(),
        market_name: None,
        corp_name: None,
    }])
    .unwrap();
    assert_eq!(
        orchestrator.resolve_scopes(&db).unwrap(),
        vec![Scope::Market(known)]
    );
}

#[tokio::test]
async fn global_pass_keys_rows_by_record_codes_and_fills_catalog() {
    let source = MockSource::default().with(
        Scope::Global,
        Script::Items(vec![
            trade("110001", "11000101", "1", "1000"),
            trade("210001", "21000101", "1", "2000"),
            item(json!({"spm_no": "orphan"})),
        ]),
    );
    let mut config = config(Vec::new());
    config.scope_source = ScopeSource::Global;
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();

    assert_eq!(report.rows_written, 2);
    assert_eq!(report.markets_observed, 2);
    assert_eq!(report.scopes[0].warnings.len(), 1);
    assert_eq!(
        db.row_keys_for_date(date()).unwrap(),
        vec![
            "2024-05-01|110001|11000101|spm:1".to_string(),
            "2024-05-01|210001|21000101|spm:1".to_string()
        ]
    );
    assert_eq!(db.list_markets().unwrap().len(), 2);
}

#[tokio::test]
async fn in_batch_fallback_collision_is_reported() {
    let a = pair("110001", "11000101");
    let colliding = |per_kg: &str| {
        item(json!({
            "whsl_mrkt_cd": "110001",
            "corp_cd": "11000101",
            "auctn_seq": "7",
            "scsbd_dt": "2024-05-01 09:00:00",
            "kg_unit_prc": per_kg,
        }))
    };
    let source = MockSource::default().with(
        Scope::Market(a.clone()),
        Script::Items(vec![colliding("1000"), colliding("3000")]),
    );
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config(vec![a]))
        .run(&mut db)
        .await
        .unwrap();
    assert_eq!(report.rows_written, 1);
    assert_eq!(report.collisions.len(), 1);
    assert_eq!(report.new_collisions, 1);
    assert_eq!(db.collision_count().unwrap(), 1);
}

fn shared_fallback_lot(per_kg: &str) -> RawItem {
    item(json!({
        "whsl_mrkt_cd": "110001",
        "corp_cd": "11000101",
        "gds_sclsf_nm": "설향",
        "unit_qty": "2",
        "auctn_seq": "7",
        "scsbd_dt": "2024-05-01 09:00:00",
        "kg_unit_prc": per_kg,
    }))
}

#[tokio::test]
async fn fallback_collision_rerun_is_stable_in_any_item_order() {
    let a = pair("110001", "11000101");
    let key = "2024-05-01|110001|11000101|auct:7|dt:2024-05-01 09:00:00";
    let forward = vec![shared_fallback_lot("1000"), shared_fallback_lot("3000")];
    let reversed = vec![shared_fallback_lot("3000"), shared_fallback_lot("1000")];
    let mut db = open_test_db();

    let mut snapshots = Vec::new();
    let mut new_collisions = Vec::new();
    for items in [forward.clone(), forward, reversed] {
        let source = MockSource::default().with(Scope::Market(a.clone()), Script::Items(items));
        let report = Orchestrator::new(source, config(vec![a.clone()]))
            .run(&mut db)
            .await
            .unwrap();
        new_collisions.push(report.new_collisions);
        snapshots.push((
            db.row_keys_for_date(date()).unwrap(),
            db.payload_for(key).unwrap(),
            db.query_aggregates(&DbAggregateFilter::default()).unwrap(),
            db.collision_count().unwrap(),
        ));
    }

    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[0], snapshots[2]);
    assert_eq!(new_collisions, vec![1, 0, 0]);

    let (keys, payload, aggregates, collisions) = &snapshots[0];
    assert_eq!(keys, &vec![key.to_string()]);
    assert_eq!(payload.as_ref().unwrap()["kg_unit_prc"], "1000");
    assert_eq!(*collisions, 1);
    // Both lots count even though only one is stored under the key.
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].count, 2);
    assert_eq!(aggregates[0].average, Some(2000.0));
    assert_eq!(aggregates[0].min, Some(1000.0));
    assert_eq!(aggregates[0].max, Some(3000.0));
}

#[tokio::test]
async fn scoped_item_without_market_code_is_aggregated() {
    let a = pair("110001", "11000101");
    let source = MockSource::default().with(
        Scope::Market(a.clone()),
        Script::Items(vec![item(json!({
            "gds_sclsf_nm": "설향",
            "unit_qty": "2",
            "kg_unit_prc": "1500",
            "spm_no": "1",
        }))]),
    );
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config(vec![a]))
        .run(&mut db)
        .await
        .unwrap();
    assert_eq!(report.rows_written, 1);
    assert_eq!(report.aggregates_written, 1);

    let aggregates = db.query_aggregates(&DbAggregateFilter::default()).unwrap();
    assert_eq!(aggregates[0].market_code, "110001");
    assert_eq!(aggregates[0].average, Some(1500.0));
}

#[tokio::test(start_paused = true)]
async fn run_timeout_abandons_unfinished_scopes() {
    let slow = pair("110001", "11000101");
    let fast = pair("210001", "21000101");
    let source = MockSource::default()
        .with(Scope::Market(slow.clone()), Script::Hang)
        .with(
            Scope::Market(fast.clone()),
            Script::Items(vec![trade("210001", "21000101", "1", "1000")]),
        );
    let mut config = config(vec![slow, fast]);
    config.run_timeout = Duration::from_secs(5);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();
    assert!(report.timed_out);
    assert_eq!(report.abandoned(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(db.trade_count().unwrap(), 1);
}

#[tokio::test]
async fn progress_sees_every_scope() {
    let a = pair("110001", "11000101");
    let b = pair("210001", "21000101");
    let seen = Arc::new(Mutex::new((0usize, Vec::new())));
    let sink = Arc::clone(&seen);

    Orchestrator::new(MockSource::default(), config(vec![a, b]))
        .with_progress(move |event| {
            let mut seen = sink.lock().unwrap();
            match event {
                ProgressEvent::Resolved { scopes } => seen.0 = scopes,
                ProgressEvent::ScopeFinished(outcome) => seen.1.push(outcome.scope.clone()),
            }
        })
        .run(&mut open_test_db())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.0, 2);
    assert_eq!(seen.1.len(), 2);
}
