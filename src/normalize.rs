//! Row Normaliser (C2)
//!
//! Converts a raw [`RawRowBatch`] fetched from the store into a [`RowBatch`]
//! in which every cell is either a primitive, an ISO-8601 UTC millisecond
//! string, a flat array of primitives, or null -- never a database-native
//! JSON or temporal type (spec.md §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single normalised cell value, ready to be embedded in an index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Array(Vec<CellValue>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// The column metadata and scalar types the gateway reports for a fetched
/// row set, prior to normalisation. Mirrors spec.md §3's "Row Batch"
/// invariant: exactly one of these shapes per cell.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// A `timestamptz` column value, still attached to its original offset.
    Timestamp(DateTime<Utc>),
    /// A `json`/`jsonb` column, still as a database-native JSON value.
    Json(JsonValue),
    /// A homogeneous database array column (e.g. `text[]`).
    TextArray(Vec<Option<String>>),
}

#[derive(Debug, Clone)]
pub struct RawRowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawCell>>,
}

#[derive(Debug, Clone)]
pub struct RowBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RowBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Render each row as a field -> value document, the shape the index
    /// client upserts (spec.md §3, "Index Document").
    pub fn documents(&self) -> Vec<serde_json::Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                let mut doc = serde_json::Map::new();
                for (col, cell) in self.columns.iter().zip(row.iter()) {
                    doc.insert(col.clone(), cell_to_json(cell));
                }
                doc
            })
            .collect()
    }
}

fn cell_to_json(cell: &CellValue) -> JsonValue {
    match cell {
        CellValue::Null => JsonValue::Null,
        CellValue::Bool(b) => JsonValue::Bool(*b),
        CellValue::Integer(i) => JsonValue::from(*i),
        CellValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CellValue::Text(s) => JsonValue::String(s.clone()),
        CellValue::Array(items) => JsonValue::Array(items.iter().map(cell_to_json).collect()),
    }
}

/// Format a UTC timestamp as `YYYY-MM-DDTHH:MM:SS.sssZ` (spec.md §4.2 rule 1,
/// §6 wire format (d)).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Apply the C2 normalisation rules to a single raw cell, in the order
/// specified by spec.md §4.2.
fn normalize_cell(cell: &RawCell) -> CellValue {
    match cell {
        RawCell::Null => CellValue::Null,
        RawCell::Bool(b) => CellValue::Bool(*b),
        RawCell::Integer(i) => CellValue::Integer(*i),
        RawCell::Float(f) => CellValue::Float(*f),
        RawCell::Timestamp(ts) => CellValue::Text(format_timestamp(ts)),
        RawCell::Text(s) => {
            // Rule 2: text that parses as JSON *and* is an array becomes an
            // array; any other parse outcome (object, scalar, parse failure)
            // leaves the text unchanged. Parse failure is silent, not an error.
            match serde_json::from_str::<JsonValue>(s) {
                Ok(JsonValue::Array(items)) => {
                    CellValue::Array(items.iter().map(json_to_cell).collect())
                }
                _ => CellValue::Text(s.clone()),
            }
        }
        RawCell::Json(value) => match value {
            JsonValue::Array(items) => {
                CellValue::Array(items.iter().map(json_to_cell).collect())
            }
            other => json_to_cell(other),
        },
        RawCell::TextArray(items) => CellValue::Array(
            items
                .iter()
                .map(|v| match v {
                    Some(s) => CellValue::Text(s.clone()),
                    None => CellValue::Null,
                })
                .collect(),
        ),
    }
}

fn json_to_cell(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Null,
        JsonValue::Bool(b) => CellValue::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CellValue::Integer(i)
            } else {
                CellValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => CellValue::Text(s.clone()),
        JsonValue::Array(items) => CellValue::Array(items.iter().map(json_to_cell).collect()),
        // Objects have no flat representation in the target schema; preserve
        // them as opaque text rather than silently dropping fields.
        JsonValue::Object(_) => CellValue::Text(value.to_string()),
    }
}

/// Normalise a raw row batch, cell by cell, in fetch order (C2 entry point).
pub fn normalize(batch: &RawRowBatch) -> RowBatch {
    RowBatch {
        columns: batch.columns.clone(),
        rows: batch
            .rows
            .iter()
            .map(|row| row.iter().map(normalize_cell).collect())
            .collect(),
    }
}
