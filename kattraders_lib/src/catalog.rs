//! Market catalog: (market, corporation) pairs discovered from observed trades.
//!
//! Entries are keyed on the code pair, created on first sighting and never
//! deleted. Names are overwritten by the latest observation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::db::TradeStore;
use crate::error::StoreError;
use crate::normalize::TradeRecord;

/// A (wholesale market code, corporation code) pair. Both codes are trimmed
/// and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MarketPair {
    market_code: String,
    corp_code: String,
}

impl MarketPair {
    /// Returns `None` when either code is blank.
    pub fn new(market_code: &str, corp_code: &str) -> Option<Self> {
        let market_code = market_code.trim();
        let corp_code = corp_code.trim();
        if market_code.is_empty() || corp_code.is_empty() {
            return None;
        }
        Some(Self {
            market_code: market_code.to_string(),
            corp_code: corp_code.to_string(),
        })
    }

    pub fn market_code(&self) -> &str {
        &self.market_code
    }

    pub fn corp_code(&self) -> &str {
        &self.corp_code
    }
}

impl fmt::Display for MarketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.market_code, self.corp_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketEntry {
    pub pair: MarketPair,
    pub market_name: Option<String>,
    pub corp_name: Option<String>,
}

/// Stages catalog upserts from observed records until they are flushed.
#[derive(Debug, Default)]
pub struct MarketCatalog {
    staged: BTreeMap<MarketPair, MarketEntry>,
}

impl MarketCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages one entry per distinct code pair in `records`. Records with a
    /// blank market or corp code are skipped. A name present in a later
    /// record replaces the staged one.
    pub fn observe(&mut self, records: &[TradeRecord]) {
        for record in records {
            let (Some(market), Some(corp)) = (&record.market_code, &record.corp_code) else {
                continue;
            };
            let Some(pair) = MarketPair::new(market, corp) else {
                continue;
            };
            let entry = self.staged.entry(pair.clone()).or_insert_with(|| MarketEntry {
                pair,
                market_name: None,
                corp_name: None,
            });
            if record.market_name.is_some() {
                entry.market_name = record.market_name.clone();
            }
            if record.corp_name.is_some() {
                entry.corp_name = record.corp_name.clone();
            }
        }
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn staged(&self) -> impl Iterator<Item = &MarketEntry> {
        self.staged.values()
    }

    /// Writes staged entries. On failure the entries stay staged so a later
    /// flush can retry them.
    pub fn flush<S: TradeStore>(&mut self, store: &mut S) -> Result<usize, StoreError> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let entries: Vec<MarketEntry> = self.staged.values().cloned().collect();
        let written = store.upsert_markets(&entries)?;
        self.staged.clear();
        Ok(written)
    }
}

/// All pairs currently in the catalog.
pub fn list_known<S: TradeStore>(store: &S) -> Result<BTreeSet<MarketPair>, StoreError> {
    Ok(store
        .list_markets()?
        .into_iter()
        .map(|entry| entry.pair)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::normalize::normalize_record;
    use serde_json::{json, Value};

    fn record(value: Value) -> TradeRecord {
        let Value::Object(map) = value else {
            panic!("fixture must be an object")
        };
        normalize_record(&map).record
    }

    fn open_test_db() -> Db {
        let db = Db::open_in_memory().expect("open in-memory db");
        db.init().expect("init schema");
        db
    }

    #[test]
    fn pair_rejects_blank_codes() {
        assert!(MarketPair::new("", "1").is_none());
        assert!(MarketPair::new("1", "  ").is_none());
        assert_eq!(
            MarketPair::new(" 110001 ", "11000103").unwrap().to_string(),
            "110001/11000103"
        );
    }

    #[test]
    fn observe_dedups_and_keeps_latest_names() {
        let mut catalog = MarketCatalog::new();
        catalog.observe(&[
            record(json!({"whsl_mrkt_cd": "110001", "corp_cd": "11000103", "whsl_mrkt_nm": "old"})),
            record(json!({"whsl_mrkt_cd": "110001", "corp_cd": "11000103", "whsl_mrkt_nm": "new", "corp_nm": "중앙청과"})),
            record(json!({"whsl_mrkt_cd": "110001", "corp_cd": "11000103"})),
        ]);
        assert_eq!(catalog.staged_len(), 1);
        let entry = catalog.staged().next().unwrap();
        assert_eq!(entry.market_name.as_deref(), Some("new"));
        assert_eq!(entry.corp_name.as_deref(), Some("중앙청과"));
    }

    #[test]
    fn observe_skips_empty_codes() {
        let mut catalog = MarketCatalog::new();
        catalog.observe(&[
            record(json!({"whsl_mrkt_cd": "", "corp_cd": "11000103"})),
            record(json!({"whsl_mrkt_cd": "110001"})),
            record(json!({"whsl_mrkt_cd": "110001", "corp_cd": " "})),
        ]);
        assert_eq!(catalog.staged_len(), 0);
    }

    #[test]
    fn flush_writes_and_clears() {
        let mut db = open_test_db();
        let mut catalog = MarketCatalog::new();
        catalog.observe(&[
            record(json!({"whsl_mrkt_cd": "110001", "corp_cd": "11000103"})),
            record(json!({"whsl_mrkt_cd": "210001", "corp_cd": "21000101"})),
        ]);
        assert_eq!(catalog.flush(&mut db).unwrap(), 2);
        assert_eq!(catalog.staged_len(), 0);
        assert_eq!(catalog.flush(&mut db).unwrap(), 0);

        let known = list_known(&db).unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.contains(&MarketPair::new("110001", "11000103").unwrap()));
    }

    #[test]
    fn names_overwritten_on_later_flush() {
        let mut db = open_test_db();
        let mut catalog = MarketCatalog::new();
        catalog.observe(&[record(
            json!({"whsl_mrkt_cd": "110001", "corp_cd": "11000103", "whsl_mrkt_nm": "가락"}),
        )]);
        catalog.flush(&mut db).unwrap();
        catalog.observe(&[record(
            json!({"whsl_mrkt_cd": "110001", "corp_cd": "11000103", "whsl_mrkt_nm": "서울가락"}),
        )]);
        catalog.flush(&mut db).unwrap();

        let markets = db.list_markets().unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].market_name.as_deref(), Some("서울가락"));
    }
}
