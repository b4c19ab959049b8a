//! Row Key derivation and in-batch deduplication.
//!
//! A Row Key identifies one observed trade across runs:
//!
//! * `date|market|corp|spm:<lot>` when the lot number is present;
//! * `date|market|corp|auct:<seq>|dt:<settled_at>` otherwise.
//!
//! The fallback form is not guaranteed unique. Two different lots that share
//! auction sequence and settlement time collide. One payload is stored under
//! the key, the others are reported and still counted by the aggregator.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::normalize::TradeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKeyKind {
    /// Built from the lot number.
    Lot,
    /// Built from auction sequence and settlement timestamp.
    Fallback,
}

impl RowKeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKeyKind::Lot => "lot",
            RowKeyKind::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    value: String,
    kind: RowKeyKind,
}

impl RowKey {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> RowKeyKind {
        self.kind
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Derives the idempotency key for one record.
pub fn derive_row_key(
    date: NaiveDate,
    market_code: &str,
    corp_code: &str,
    record: &TradeRecord,
) -> RowKey {
    let prefix = format!(
        "{}|{}|{}",
        date.format("%Y-%m-%d"),
        market_code.trim(),
        corp_code.trim()
    );
    match record.lot_no.as_deref().map(str::trim) {
        Some(lot) if !lot.is_empty() => RowKey {
            value: format!("{}|spm:{}", prefix, lot),
            kind: RowKeyKind::Lot,
        },
        _ => RowKey {
            value: format!(
                "{}|auct:{}|dt:{}",
                prefix,
                record.auction_seq.as_deref().unwrap_or("").trim(),
                record.settled_at.as_deref().unwrap_or("").trim()
            ),
            kind: RowKeyKind::Fallback,
        },
    }
}

/// A record keyed and tagged with the query that produced it, ready to upsert.
#[derive(Debug, Clone)]
pub struct IngestedRow {
    pub row_key: RowKey,
    /// The settlement date that was queried.
    pub settlement_date: NaiveDate,
    pub market_code: String,
    pub corp_code: String,
    /// Commodity class filters sent with the query.
    pub large_class: Option<String>,
    pub mid_class: Option<String>,
    pub record: TradeRecord,
}

impl IngestedRow {
    pub fn payload_value(&self) -> Value {
        Value::Object(self.record.payload.clone())
    }
}

/// A fallback key seen with two different payloads.
#[derive(Debug, Clone, Serialize)]
pub struct KeyCollision {
    pub row_key: String,
    /// The payload that was kept (or already stored).
    pub kept_payload: Value,
    /// The payload that could not be stored under the key.
    pub rejected_payload: Value,
}

/// Serializes a payload with its keys sorted, so equal payloads have equal text.
pub fn canonical_payload(payload: &Map<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = payload.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

/// One batch after collapsing rows that share a Row Key.
#[derive(Debug, Default)]
pub struct Deduped {
    /// One row per Row Key, in first-seen key order.
    pub rows: Vec<IngestedRow>,
    /// Distinct lots that lost their fallback key to another payload.
    pub rejected: Vec<IngestedRow>,
    pub collisions: Vec<KeyCollision>,
}

/// Collapses rows that share a Row Key.
///
/// Lot keys are last-write-wins. Fallback keys with identical payloads are
/// collapsed silently. When a fallback key carries differing payloads the
/// one with the smallest canonical form is kept, whatever the arrival order;
/// every other distinct payload goes to `rejected` and is reported as a
/// [`KeyCollision`].
pub fn dedup_batch(rows: Vec<IngestedRow>) -> Deduped {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<IngestedRow>> = HashMap::with_capacity(rows.len());
    for row in rows {
        let key = row.row_key.as_str().to_string();
        match groups.get_mut(&key) {
            Some(group) => group.push(row),
            None => {
                order.push(key.clone());
                groups.insert(key, vec![row]);
            }
        }
    }

    let mut out = Deduped::default();
    for key in order {
        let Some(group) = groups.remove(&key) else {
            continue;
        };
        if group[0].row_key.kind() == RowKeyKind::Lot {
            out.rows.extend(group.into_iter().last());
            continue;
        }

        let mut distinct: BTreeMap<String, IngestedRow> = BTreeMap::new();
        for row in group {
            distinct
                .entry(canonical_payload(&row.record.payload))
                .or_insert(row);
        }
        let mut distinct = distinct.into_values();
        let Some(kept) = distinct.next() else {
            continue;
        };
        for row in distinct {
            tracing::warn!("row key collision with differing payload: {}", key);
            out.collisions.push(KeyCollision {
                row_key: key.clone(),
                kept_payload: kept.payload_value(),
                rejected_payload: row.payload_value(),
            });
            out.rejected.push(row);
        }
        out.rows.push(kept);
    }

    out
}
