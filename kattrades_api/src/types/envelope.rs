use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single trade item as it came off the wire. Field types are left loose;
/// typing happens in the normalizer.
pub type RawItem = serde_json::Map<String, Value>;

/// Result codes the API uses for success.
const SUCCESS_CODES: &[&str] = &["00", "0", "INFO-000"];

#[derive(Serialize, Deserialize, Debug)]
pub struct Envelope {
    pub response: ResponseBody,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ResponseBody {
    #[serde(default)]
    pub header: Option<Header>,
    #[serde(default)]
    pub body: Option<Body>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default)]
    pub result_code: Option<String>,
    #[serde(default)]
    pub result_msg: Option<String>,
}

impl Header {
    /// A missing result code counts as success; the body decides from there.
    pub fn is_success(&self) -> bool {
        match self.result_code.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(code) => SUCCESS_CODES.contains(&code),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    /// Declared number of rows matching the query. Sometimes a number,
    /// sometimes a string, sometimes missing.
    #[serde(default)]
    pub total_count: Option<Value>,
    #[serde(default)]
    pub page_no: Option<Value>,
    #[serde(default)]
    pub num_of_rows: Option<Value>,
    #[serde(default, deserialize_with = "items_or_empty")]
    pub items: Items,
}

impl Body {
    /// The declared total when it is a non-negative integer, either as a JSON
    /// number or a numeric string.
    pub fn total_count(&self) -> Option<u64> {
        match self.total_count.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
    }
}

/// The `items` wrapper. When no rows match, the API sends `""` (or nothing)
/// instead of an object, which deserializes to an empty `Items`.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Items {
    #[serde(default)]
    pub item: Option<OneOrMany<Value>>,
}

/// The API returns a bare object instead of a one-element array when exactly
/// one row matches.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

fn items_or_empty<'de, D>(deserializer: D) -> Result<Items, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Object(_) => serde_json::from_value(value).map_err(serde::de::Error::custom),
        _ => Ok(Items::default()),
    }
}
