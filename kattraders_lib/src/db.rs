//! SQLite storage for ingested trades, the market catalog and daily aggregates.

use std::path::Path;

use chrono::{NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::aggregate::DailyAggregate;
use crate::catalog::{MarketEntry, MarketPair};
use crate::error::StoreError;
use crate::row_key::{canonical_payload, IngestedRow, KeyCollision, RowKeyKind};

/// Result of one [`TradeStore::upsert_trades`] call.
#[derive(Debug, Default)]
pub struct UpsertSummary {
    /// Rows inserted or updated.
    pub written: usize,
    /// Fallback keys whose stored payload differed from the incoming one.
    pub collisions: Vec<KeyCollision>,
    /// How many of `collisions` were not in the collision log yet.
    pub new_collisions: usize,
}

/// The writes and reads the ingestion pipeline needs from storage.
///
/// Every batch write is atomic: either all of `rows` land or none do.
pub trait TradeStore {
    /// Upserts rows keyed on their Row Key (last write wins). A fallback key
    /// that already holds a different payload is logged to the collision
    /// table and returned before being overwritten.
    fn upsert_trades(&mut self, rows: &[IngestedRow]) -> Result<UpsertSummary, StoreError>;

    /// Upserts catalog entries keyed on the code pair. Names are overwritten.
    fn upsert_markets(&mut self, entries: &[MarketEntry]) -> Result<usize, StoreError>;

    fn list_markets(&self) -> Result<Vec<MarketEntry>, StoreError>;

    /// Replaces the stored aggregate for each partition key in `aggregates`.
    fn replace_aggregates(&mut self, aggregates: &[DailyAggregate]) -> Result<usize, StoreError>;

    /// Logs collisions, skipping ones already logged. Returns how many were new.
    fn record_collisions(&mut self, collisions: &[KeyCollision]) -> Result<usize, StoreError>;

    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../schema/sqlite.sql");
        self.conn.execute_batch(schema)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row(
                "SELECT value FROM ingest_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn trade_count(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM raw_trades_ingest", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Row Keys stored for one settlement date, sorted.
    pub fn row_keys_for_date(&self, date: NaiveDate) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT row_key FROM raw_trades_ingest
             WHERE trd_clcln_ymd = ?1
             ORDER BY row_key",
        )?;
        let rows = stmt.query_map(params![date.format("%Y-%m-%d").to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// The stored payload for a Row Key.
    pub fn payload_for(&self, row_key: &str) -> Result<Option<Value>, StoreError> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM raw_trades_ingest WHERE row_key = ?1",
                params![row_key],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn collision_count(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM row_key_collisions", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Catalog entries with their first/last sighting timestamps.
    pub fn query_markets(&self) -> Result<Vec<DbMarketRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT whsl_mrkt_cd, corp_cd, whsl_mrkt_nm, corp_nm, first_seen, last_seen
             FROM markets
             ORDER BY whsl_mrkt_cd, corp_cd",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DbMarketRow {
                market_code: row.get(0)?,
                corp_code: row.get(1)?,
                market_name: row.get(2)?,
                corp_name: row.get(3)?,
                first_seen: row.get(4)?,
                last_seen: row.get(5)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Query stored daily aggregates. Supports filtering by date, market
    /// code and commodity name.
    pub fn query_aggregates(
        &self,
        filter: &DbAggregateFilter,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let mut sql = String::from(
            "SELECT trd_clcln_ymd, whsl_mrkt_cd, commodity_nm, unit_qty, trade_count,
                    avg_kg_unit_prc, min_kg_unit_prc, max_kg_unit_prc
             FROM daily_aggregates
             WHERE 1=1",
        );

        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(date) = filter.date {
            params_vec.push(Box::new(date.format("%Y-%m-%d").to_string()));
            sql.push_str(&format!(" AND trd_clcln_ymd = ?{}", params_vec.len()));
        }
        if let Some(ref market) = filter.market_code {
            params_vec.push(Box::new(market.clone()));
            sql.push_str(&format!(" AND whsl_mrkt_cd = ?{}", params_vec.len()));
        }
        if let Some(ref commodity) = filter.commodity {
            params_vec.push(Box::new(commodity.clone()));
            sql.push_str(&format!(" AND commodity_nm = ?{}", params_vec.len()));
        }

        sql.push_str(" ORDER BY trd_clcln_ymd DESC, whsl_mrkt_cd, commodity_nm, unit_qty");

        if let Some(n) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<f64>>(6)?,
                row.get::<_, Option<f64>>(7)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (date, market_code, commodity_name, unit_qty, count, average, min, max) = row?;
            result.push(DailyAggregate {
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")?,
                market_code,
                commodity_name,
                unit_qty,
                count: count.max(0) as u64,
                average,
                min,
                max,
            });
        }
        Ok(result)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Stored payload text. Object keys are sorted so equal payloads store equal.
fn payload_text(value: &Value) -> String {
    match value {
        Value::Object(map) => canonical_payload(map),
        other => other.to_string(),
    }
}

impl TradeStore for Db {
    fn upsert_trades(&mut self, rows: &[IngestedRow]) -> Result<UpsertSummary, StoreError> {
        let now = now_rfc3339();
        let mut summary = UpsertSummary::default();
        let tx = self.conn.transaction()?;

        {
            let mut stmt_existing =
                tx.prepare("SELECT payload FROM raw_trades_ingest WHERE row_key = ?1")?;
            let mut stmt_collision = tx.prepare(
                "INSERT INTO row_key_collisions (row_key, kept_payload, rejected_payload, detected_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(row_key, kept_payload, rejected_payload) DO NOTHING",
            )?;
            let mut stmt_trade = tx.prepare(
                "INSERT INTO raw_trades_ingest (
                   row_key, row_key_kind, trd_clcln_ymd, whsl_mrkt_cd, corp_cd,
                   gds_lclsf_cd, gds_mclsf_cd, gds_sclsf_nm, unit_qty, qty,
                   scsbd_prc, trd_amt, kg_unit_prc, scsbd_dt, spm_no, auctn_seq,
                   payload, ingested_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(row_key) DO UPDATE SET
                   row_key_kind = excluded.row_key_kind,
                   trd_clcln_ymd = excluded.trd_clcln_ymd,
                   whsl_mrkt_cd = excluded.whsl_mrkt_cd,
                   corp_cd = excluded.corp_cd,
                   gds_lclsf_cd = excluded.gds_lclsf_cd,
                   gds_mclsf_cd = excluded.gds_mclsf_cd,
                   gds_sclsf_nm = excluded.gds_sclsf_nm,
                   unit_qty = excluded.unit_qty,
                   qty = excluded.qty,
                   scsbd_prc = excluded.scsbd_prc,
                   trd_amt = excluded.trd_amt,
                   kg_unit_prc = excluded.kg_unit_prc,
                   scsbd_dt = excluded.scsbd_dt,
                   spm_no = excluded.spm_no,
                   auctn_seq = excluded.auctn_seq,
                   payload = excluded.payload,
                   ingested_at = excluded.ingested_at",
            )?;

            for row in rows {
                let key = row.row_key.as_str();
                let incoming = row.payload_value();

                if row.row_key.kind() == RowKeyKind::Fallback {
                    let stored: Option<String> = stmt_existing
                        .query_row(params![key], |r| r.get(0))
                        .optional()?;
                    if let Some(stored) = stored {
                        let stored: Value = serde_json::from_str(&stored)?;
                        if stored != incoming {
                            tracing::warn!("fallback row key {} overwritten with a different payload", key);
                            summary.new_collisions += stmt_collision.execute(params![
                                key,
                                payload_text(&stored),
                                payload_text(&incoming),
                                now
                            ])?;
                            summary.collisions.push(KeyCollision {
                                row_key: key.to_string(),
                                kept_payload: stored,
                                rejected_payload: incoming.clone(),
                            });
                        }
                    }
                }

                let record = &row.record;
                stmt_trade.execute(params![
                    key,
                    row.row_key.kind().as_str(),
                    row.settlement_date.format("%Y-%m-%d").to_string(),
                    row.market_code,
                    row.corp_code,
                    record.large_class_code.as_ref().or(row.large_class.as_ref()),
                    record.mid_class_code.as_ref().or(row.mid_class.as_ref()),
                    record.small_class_name,
                    record.unit_qty,
                    record.quantity,
                    record.settlement_price,
                    record.amount,
                    record.per_kg_amount,
                    record.settled_at,
                    record.lot_no,
                    record.auction_seq,
                    payload_text(&incoming),
                    now,
                ])?;
                summary.written += 1;
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    fn upsert_markets(&mut self, entries: &[MarketEntry]) -> Result<usize, StoreError> {
        let now = now_rfc3339();
        let tx = self.conn.transaction()?;
        let mut written = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO markets (whsl_mrkt_cd, corp_cd, whsl_mrkt_nm, corp_nm, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(whsl_mrkt_cd, corp_cd) DO UPDATE SET
                   whsl_mrkt_nm = excluded.whsl_mrkt_nm,
                   corp_nm = excluded.corp_nm,
                   last_seen = excluded.last_seen",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.pair.market_code(),
                    entry.pair.corp_code(),
                    entry.market_name,
                    entry.corp_name,
                    now,
                ])?;
                written += 1;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn list_markets(&self) -> Result<Vec<MarketEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT whsl_mrkt_cd, corp_cd, whsl_mrkt_nm, corp_nm
             FROM markets
             ORDER BY whsl_mrkt_cd, corp_cd",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (market_code, corp_code, market_name, corp_name) = row?;
            let Some(pair) = MarketPair::new(&market_code, &corp_code) else {
                tracing::warn!("skipping catalog row with blank code: {:?}/{:?}", market_code, corp_code);
                continue;
            };
            result.push(MarketEntry {
                pair,
                market_name,
                corp_name,
            });
        }
        Ok(result)
    }

    fn replace_aggregates(&mut self, aggregates: &[DailyAggregate]) -> Result<usize, StoreError> {
        let now = now_rfc3339();
        let tx = self.conn.transaction()?;
        let mut written = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO daily_aggregates (
                   trd_clcln_ymd, whsl_mrkt_cd, commodity_nm, unit_qty, trade_count,
                   avg_kg_unit_prc, min_kg_unit_prc, max_kg_unit_prc, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(trd_clcln_ymd, whsl_mrkt_cd, commodity_nm, unit_qty) DO UPDATE SET
                   trade_count = excluded.trade_count,
                   avg_kg_unit_prc = excluded.avg_kg_unit_prc,
                   min_kg_unit_prc = excluded.min_kg_unit_prc,
                   max_kg_unit_prc = excluded.max_kg_unit_prc,
                   updated_at = excluded.updated_at",
            )?;
            for agg in aggregates {
                stmt.execute(params![
                    agg.date.format("%Y-%m-%d").to_string(),
                    agg.market_code,
                    agg.commodity_name,
                    agg.unit_qty,
                    agg.count as i64,
                    agg.average,
                    agg.min,
                    agg.max,
                    now,
                ])?;
                written += 1;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn record_collisions(&mut self, collisions: &[KeyCollision]) -> Result<usize, StoreError> {
        if collisions.is_empty() {
            return Ok(0);
        }
        let now = now_rfc3339();
        let mut inserted = 0;
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO row_key_collisions (row_key, kept_payload, rejected_payload, detected_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(row_key, kept_payload, rejected_payload) DO NOTHING",
            )?;
            for c in collisions {
                inserted += stmt.execute(params![
                    c.row_key,
                    payload_text(&c.kept_payload),
                    payload_text(&c.rejected_payload),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn set_meta(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO ingest_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

/// A catalog row returned by [`Db::query_markets`].
#[derive(Debug, Clone, Serialize)]
pub struct DbMarketRow {
    pub market_code: String,
    pub corp_code: String,
    pub market_name: Option<String>,
    pub corp_name: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

/// Filter parameters for [`Db::query_aggregates`].
#[derive(Debug, Default)]
pub struct DbAggregateFilter {
    pub date: Option<NaiveDate>,
    pub market_code: Option<String>,
    pub commodity: Option<String>,
    pub limit: Option<i64>,
}
