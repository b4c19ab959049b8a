use std::time::Duration;

use chrono::NaiveDate;
use kattraders_lib::kattrades_api::Client;
use kattraders_lib::{
    ApiSource, Db, DbAggregateFilter, IngestConfig, MarketPair, Orchestrator, RetryPolicy,
    ScopeSource, ScopeStatus,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TRADES_PAGE: &str = include_str!("../../kattrades_api/tests/fixtures/trades_page.json");
const KEY_ERROR: &str = include_str!("../../kattrades_api/tests/fixtures/key_error.json");

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn open_test_db() -> Db {
    let db = Db::open_in_memory().expect("open in-memory db");
    db.init().expect("init schema");
    db
}

fn config_for(markets: Vec<MarketPair>) -> IngestConfig {
    let mut config = IngestConfig::new("test-key", date());
    config.scope_source = ScopeSource::Explicit;
    config.markets = markets;
    config.page_delay = Duration::ZERO;
    config.retry = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
    };
    config
}

fn source_for(server: &MockServer, config: &IngestConfig) -> ApiSource {
    let client = Client::with_base_url(
        &format!("{}/trades2", server.uri()),
        &config.service_key,
        Duration::from_secs(5),
    )
    .unwrap();
    ApiSource::new(client, config)
}

#[tokio::test]
async fn ingest_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .and(query_param("serviceKey", "test-key"))
        .and(query_param("cond[whsl_mrkt_cd::EQ]", "110001"))
        .and(query_param("cond[corp_cd::EQ]", "11000103"))
        .and(query_param("cond[trd_clcln_ymd::EQ]", "2024-05-01"))
        .and(query_param("cond[gds_lclsf_cd::EQ]", "08"))
        .and(query_param("cond[gds_mclsf_cd::EQ]", "03"))
        .and(query_param("pageNo", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRADES_PAGE))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(vec![MarketPair::new("110001", "11000103").unwrap()]);
    let source = source_for(&server, &config);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();

    assert_eq!(report.rows_written, 2);
    assert_eq!(report.markets_observed, 1);
    assert_eq!(report.aggregates_written, 1);
    assert_eq!(
        db.row_keys_for_date(date()).unwrap(),
        vec![
            "2024-05-01|110001|11000103|auct:8|dt:2024-05-01 09:05:00".to_string(),
            "2024-05-01|110001|11000103|spm:123".to_string(),
        ]
    );

    let aggregates = db
        .query_aggregates(&DbAggregateFilter::default())
        .unwrap();
    assert_eq!(aggregates[0].commodity_name, "설향");
    assert_eq!(aggregates[0].unit_qty, 2.5);
    assert_eq!(aggregates[0].count, 1);
    assert_eq!(aggregates[0].average, Some(2000.0));

    let markets = db.query_markets().unwrap();
    assert_eq!(markets.len(), 1);
    assert_eq!(markets[0].market_name.as_deref(), Some("서울가락"));
    assert_eq!(markets[0].corp_name.as_deref(), Some("중앙청과"));
}

#[tokio::test]
async fn transient_status_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRADES_PAGE))
        .mount(&server)
        .await;

    let config = config_for(vec![MarketPair::new("110001", "11000103").unwrap()]);
    let source = source_for(&server, &config);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.rows_written, 2);
}

#[tokio::test]
async fn failing_market_is_isolated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .and(query_param("cond[whsl_mrkt_cd::EQ]", "210001"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .and(query_param("cond[whsl_mrkt_cd::EQ]", "110001"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRADES_PAGE))
        .mount(&server)
        .await;

    let config = config_for(vec![
        MarketPair::new("210001", "21000101").unwrap(),
        MarketPair::new("110001", "11000103").unwrap(),
    ]);
    let source = source_for(&server, &config);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(db.trade_count().unwrap(), 2);
}

#[tokio::test]
async fn upstream_rejection_fails_scope_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(KEY_ERROR))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(vec![MarketPair::new("110001", "11000103").unwrap()]);
    let source = source_for(&server, &config);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();
    assert!(matches!(report.scopes[0].status, ScopeStatus::Failed { .. }));
    assert_eq!(db.trade_count().unwrap(), 0);
}

#[tokio::test]
async fn malformed_page_keeps_excerpt_and_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/trades2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<OpenAPI_ServiceResponse><cmmMsgHeader/></OpenAPI_ServiceResponse>"),
        )
        .mount(&server)
        .await;

    let config = config_for(vec![MarketPair::new("110001", "11000103").unwrap()]);
    let source = source_for(&server, &config);
    let mut db = open_test_db();

    let report = Orchestrator::new(source, config)
        .run(&mut db)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.rows_written, 0);
    assert_eq!(report.malformed_pages.len(), 1);
    assert!(report.malformed_pages[0]
        .excerpt
        .starts_with("<OpenAPI_ServiceResponse>"));
}
