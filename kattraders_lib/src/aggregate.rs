//! Per-day price summaries by market, commodity and unit size.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::normalize::TradeRecord;

const UNIT_QTY_EPSILON: f64 = 1e-9;

/// Restricts which records are aggregated. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateFilter {
    pub commodity: Option<String>,
    pub unit_qty: Option<f64>,
}

impl AggregateFilter {
    pub fn matches(&self, commodity: &str, unit_qty: f64) -> bool {
        let commodity_ok = self
            .commodity
            .as_deref()
            .map_or(true, |wanted| wanted.trim() == commodity);
        let unit_ok = self
            .unit_qty
            .map_or(true, |wanted| (wanted - unit_qty).abs() < UNIT_QTY_EPSILON);
        commodity_ok && unit_ok
    }
}

/// Summary of per-kilogram amounts for one (date, market, commodity, unit) key.
/// `average`, `min` and `max` are `None` when no record had an amount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub market_code: String,
    pub commodity_name: String,
    pub unit_qty: f64,
    pub count: u64,
    pub average: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Default)]
struct Running {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Running {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Unit quantity as an orderable map key. `-0.0` and `0.0` share a key.
#[derive(Debug, Clone, Copy, PartialEq)]
struct UnitKey(f64);

impl Eq for UnitKey {}

impl PartialOrd for UnitKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UnitKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0 + 0.0).total_cmp(&(other.0 + 0.0))
    }
}

/// Partitions `(market_code, record)` pairs by (market code, commodity
/// name, unit qty) and summarises their per-kilogram amounts. The market
/// code is the one the row was stored under, not the payload's.
///
/// Records without a commodity name or unit qty, a blank market code, or
/// rejected by `filter`, are skipped. Records with an absent amount still belong to their partition
/// but do not contribute to the statistics, so a partition can have
/// `count == 0`. Output is sorted by key.
pub fn aggregate<'a>(
    date: NaiveDate,
    records: impl IntoIterator<Item = (&'a str, &'a TradeRecord)>,
    filter: &AggregateFilter,
) -> Vec<DailyAggregate> {
    let mut groups: BTreeMap<(String, String, UnitKey), Running> = BTreeMap::new();

    for (market, record) in records {
        let market = market.trim();
        let (Some(commodity), Some(unit_qty)) = (record.commodity_name(), record.unit_qty) else {
            continue;
        };
        if market.is_empty() {
            continue;
        }
        if !filter.matches(commodity, unit_qty) {
            continue;
        }
        let running = groups
            .entry((market.to_string(), commodity.to_string(), UnitKey(unit_qty)))
            .or_default();
        if let Some(amount) = record.per_kg_amount {
            running.push(amount);
        }
    }

    groups
        .into_iter()
        .map(|((market_code, commodity_name, unit), running)| DailyAggregate {
            date,
            market_code,
            commodity_name,
            unit_qty: unit.0 + 0.0,
            count: running.count,
            average: (running.count > 0).then(|| running.sum / running.count as f64),
            min: running.min,
            max: running.max,
        })
        .collect()
}
