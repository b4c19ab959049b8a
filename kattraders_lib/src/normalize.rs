//! Converts raw API items into typed [`TradeRecord`]s.
//!
//! All loose typing from the wire stops here. Numbers may arrive as JSON
//! numbers, numeric strings, strings with thousands separators, empty strings
//! or not at all; everything downstream only sees `Option<f64>`, where `None`
//! means "absent" and is never confused with zero.

use kattrades_api::types::{Items, RawItem};
use serde::Serialize;
use serde_json::Value;

/// Outcome of coercing one numeric field.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Present(f64),
    /// Missing key, `null`, or blank string.
    Absent,
    /// Something was there but it is not a finite number. Holds the raw text.
    Malformed(String),
}

impl Coerced {
    pub fn value(&self) -> Option<f64> {
        match self {
            Coerced::Present(v) => Some(*v),
            _ => None,
        }
    }
}

/// Coerce a loosely typed field into a number without ever failing.
pub fn coerce_number(value: Option<&Value>) -> Coerced {
    match value {
        None | Some(Value::Null) => Coerced::Absent,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => Coerced::Present(v),
            _ => Coerced::Malformed(n.to_string()),
        },
        Some(Value::String(s)) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return Coerced::Absent;
            }
            match cleaned.parse::<f64>() {
                Ok(v) if v.is_finite() => Coerced::Present(v),
                _ => Coerced::Malformed(s.clone()),
            }
        }
        Some(other) => Coerced::Malformed(other.to_string()),
    }
}

/// Coerce a loosely typed field into trimmed text. Blank becomes `None`.
pub fn coerce_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Flattens the `items` wrapper into a list of objects.
///
/// `item` may be an array, a single object (exactly one match), or missing.
/// Entries that are not JSON objects are dropped.
pub fn unwrap_items(items: Items) -> Vec<RawItem> {
    let Some(item) = items.item else {
        return Vec::new();
    };
    let mut dropped = 0usize;
    let out: Vec<RawItem> = item
        .into_vec()
        .into_iter()
        .filter_map(|value| match value {
            Value::Object(map) => Some(map),
            _ => {
                dropped += 1;
                None
            }
        })
        .collect();
    if dropped > 0 {
        tracing::warn!("dropped {} non-object entries from items.item", dropped);
    }
    out
}

/// One settled auction transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub settlement_date: Option<String>,
    pub market_code: Option<String>,
    pub market_name: Option<String>,
    pub corp_code: Option<String>,
    pub corp_name: Option<String>,
    pub large_class_code: Option<String>,
    pub large_class_name: Option<String>,
    pub mid_class_code: Option<String>,
    pub mid_class_name: Option<String>,
    pub small_class_code: Option<String>,
    pub small_class_name: Option<String>,
    pub origin_code: Option<String>,
    pub origin_name: Option<String>,
    pub unit_code: Option<String>,
    pub unit_name: Option<String>,
    pub unit_qty: Option<f64>,
    pub quantity: Option<f64>,
    pub settlement_price: Option<f64>,
    pub amount: Option<f64>,
    pub per_kg_amount: Option<f64>,
    pub settled_at: Option<String>,
    pub lot_no: Option<String>,
    pub auction_seq: Option<String>,
    /// The item exactly as received.
    #[serde(skip)]
    pub payload: RawItem,
}

impl TradeRecord {
    /// The commodity name used to group prices (small classification name).
    pub fn commodity_name(&self) -> Option<&str> {
        self.small_class_name.as_deref()
    }
}

/// A numeric field that held something other than a number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldIssue {
    pub field: &'static str,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub record: TradeRecord,
    pub issues: Vec<FieldIssue>,
}

/// Maps one raw item to a [`TradeRecord`]. Never fails; malformed numeric
/// fields become `None` and are listed in `issues`.
pub fn normalize_record(raw: &RawItem) -> Normalized {
    let mut issues = Vec::new();
    let mut number = |field: &'static str| match coerce_number(raw.get(field)) {
        Coerced::Present(v) => Some(v),
        Coerced::Absent => None,
        Coerced::Malformed(text) => {
            issues.push(FieldIssue { field, raw: text });
            None
        }
    };

    let unit_qty = number("unit_qty");
    let quantity = number("qty");
    let settlement_price = number("scsbd_prc");
    let amount = number("trd_amt");
    let per_kg_amount = number("kg_unit_prc");

    let text = |field: &str| coerce_text(raw.get(field));
    let record = TradeRecord {
        settlement_date: text("trd_clcln_ymd"),
        market_code: text("whsl_mrkt_cd"),
        market_name: text("whsl_mrkt_nm"),
        corp_code: text("corp_cd"),
        corp_name: text("corp_nm"),
        large_class_code: text("gds_lclsf_cd"),
        large_class_name: text("gds_lclsf_nm"),
        mid_class_code: text("gds_mclsf_cd"),
        mid_class_name: text("gds_mclsf_nm"),
        small_class_code: text("gds_sclsf_cd"),
        small_class_name: text("gds_sclsf_nm"),
        origin_code: text("plor_cd"),
        origin_name: text("plor_nm"),
        unit_code: text("unit_cd"),
        unit_name: text("unit_nm"),
        unit_qty,
        quantity,
        settlement_price,
        amount,
        per_kg_amount,
        settled_at: text("scsbd_dt"),
        lot_no: text("spm_no"),
        auction_seq: text("auctn_seq"),
        payload: raw.clone(),
    };

    Normalized { record, issues }
}

/// Normalizes a batch, returning the records and the total number of field issues.
pub fn normalize_all(items: &[RawItem]) -> (Vec<TradeRecord>, Vec<FieldIssue>) {
    let mut records = Vec::with_capacity(items.len());
    let mut issues = Vec::new();
    for item in items {
        let normalized = normalize_record(item);
        records.push(normalized.record);
        issues.extend(normalized.issues);
    }
    (records, issues)
}
