//! Core data types shared by the decoder, the transports and the stores.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A vehicle identification number, used only as a request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vin(String);

impl Vin {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Vin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Vin {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Vin {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One element of the endpoint's `Results` array.
///
/// The endpoint returns a few hundred keys per VIN; only the ones the
/// pipeline reads are kept. Missing and `null` values become empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeResult {
    #[serde(rename = "VIN", default, deserialize_with = "null_as_empty")]
    pub vin: String,
    #[serde(rename = "Make", default, deserialize_with = "null_as_empty")]
    pub make: String,
    #[serde(rename = "Model", default, deserialize_with = "null_as_empty")]
    pub model: String,
    #[serde(rename = "ErrorCode", default, deserialize_with = "null_as_empty")]
    pub error_code: String,
    #[serde(rename = "ErrorText", default, deserialize_with = "null_as_empty")]
    pub error_text: String,
}

fn null_as_empty<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(de)?.unwrap_or_default())
}

impl DecodeResult {
    /// Map to a [`DecodedRecord`], or `None` when the endpoint found no model.
    pub fn to_record(&self) -> Option<DecodedRecord> {
        if self.model.is_empty() {
            return None;
        }
        Some(DecodedRecord {
            vin: self.vin.clone(),
            brand: self.make.clone(),
            model: self.model.clone(),
        })
    }
}

/// A decoded VIN as persisted in `vin_model_match`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub vin: String,
    pub brand: String,
    pub model: String,
}

impl Record for DecodedRecord {
    fn columns() -> &'static [&'static str] {
        &["vin", "brand", "model"]
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.vin.clone()),
            SqlValue::Text(self.brand.clone()),
            SqlValue::Text(self.model.clone()),
        ]
    }
}

/// A value bound as a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Key used when collapsing duplicate primary keys inside one batch.
    pub(crate) fn key_fragment(&self) -> String {
        match self {
            Self::Null => "\u{0}null".into(),
            Self::Bool(b) => format!("b:{b}"),
            Self::Int(i) => format!("i:{i}"),
            Self::Float(f) => format!("f:{f}"),
            Self::Text(s) => format!("t:{s}"),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

/// A row type with a fixed column layout that can be bulk-upserted.
pub trait Record {
    /// Column names, in the order [`values`](Record::values) yields them.
    fn columns() -> &'static [&'static str];

    fn values(&self) -> Vec<SqlValue>;
}

/// Conflict resolution for [`RecordStore::upsert`](crate::store::RecordStore::upsert).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Keep the existing row (first write wins).
    #[default]
    Ignore,
    /// Overwrite non-key columns with the new values (last write wins).
    Update,
}

/// Result set of [`RecordStore::select`](crate::store::RecordStore::select).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows keyed by column name.
    pub fn into_maps(self) -> Vec<Map<String, Value>> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }

    /// Values of the first column, in row order.
    pub fn first_column(&self) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(|r| r.first())
    }
}

/// Outcome of one complete decode run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Chunks handed to the endpoint (including abandoned ones).
    pub chunks_submitted: usize,
    /// Chunks abandoned after exhausting retries or returning a bad body.
    pub chunks_skipped: usize,
    pub vins_submitted: usize,
    /// VINs that produced a record.
    pub records_decoded: usize,
    pub flushes: usize,
    pub records_persisted: usize,
    /// Records lost because every flush attempt for them failed.
    pub records_dropped: usize,
    pub cancelled: bool,
}
