//! Store content: tables of rows of cells, plus flat values.
//!
//! Every map is a `BTreeMap` so that serialization (and therefore every
//! fingerprint derived from it) is independent of insertion order.

use crate::{error::Result, CellId, Error, RowId, TableId, ValueId};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Largest integer a double can represent exactly (2^53 - 1).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A primitive cell or value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    String(String),
    Number(f64),
    Boolean(bool),
}

impl CellValue {
    /// Convert a JSON scalar into a cell value.
    ///
    /// Returns `Ok(None)` for `null` (an absent cell) and an error for arrays,
    /// objects and non-finite numbers.
    pub fn from_json(value: &serde_json::Value) -> Result<Option<Self>> {
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Bool(b) => Ok(Some(CellValue::Boolean(*b))),
            serde_json::Value::String(s) => Ok(Some(CellValue::String(s.clone()))),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => Ok(Some(CellValue::Number(f))),
                _ => Err(Error::malformed(format!("number {} is not representable", n))),
            },
            serde_json::Value::Array(_) => Err(Error::malformed("arrays are not cell values")),
            serde_json::Value::Object(_) => Err(Error::malformed("objects are not cell values")),
        }
    }

    /// Convert to a JSON scalar. Integral numbers become JSON integers.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            CellValue::String(s) => Ok(serde_json::Value::String(s.clone())),
            CellValue::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
            CellValue::Number(f) => {
                if let Some(i) = integral(*f) {
                    return Ok(serde_json::Value::from(i));
                }
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| Error::malformed(format!("number {} is not finite", f)))
            }
        }
    }

    /// Whether this value can be persisted (numbers must be finite).
    pub fn is_valid(&self) -> bool {
        match self {
            CellValue::Number(f) => f.is_finite(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

fn integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        Some(f as i64)
    } else {
        None
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::String(s) => write!(f, "{}", s),
            CellValue::Number(n) => match integral(*n) {
                Some(i) => write!(f, "{}", i),
                None => write!(f, "{}", n),
            },
            CellValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            CellValue::String(s) => serializer.serialize_str(s),
            CellValue::Boolean(b) => serializer.serialize_bool(*b),
            CellValue::Number(n) => match integral(*n) {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*n),
            },
        }
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct CellVisitor;

        impl<'de> Visitor<'de> for CellVisitor {
            type Value = CellValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<CellValue, E> {
                Ok(CellValue::Boolean(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<CellValue, E> {
                Ok(CellValue::Number(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<CellValue, E> {
                Ok(CellValue::Number(v as f64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<CellValue, E> {
                if v.is_finite() {
                    Ok(CellValue::Number(v))
                } else {
                    Err(E::custom("non-finite number"))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CellValue, E> {
                Ok(CellValue::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<CellValue, E> {
                Ok(CellValue::String(v))
            }
        }

        deserializer.deserialize_any(CellVisitor)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::String(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::String(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Number(v)
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Number(v as f64)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        CellValue::Number(f64::from(v))
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Boolean(v)
    }
}

/// Cells of one row, keyed by cell id.
pub type Row = BTreeMap<CellId, CellValue>;

/// Rows of one table, keyed by row id.
pub type Table = BTreeMap<RowId, Row>;

/// All tables, keyed by table id.
pub type Tables = BTreeMap<TableId, Table>;

/// Flat key-value pairs living beside the tables.
pub type Values = BTreeMap<ValueId, CellValue>;

/// A complete snapshot of store content.
///
/// Serializes as the two-element array `[tables, values]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub tables: Tables,
    pub values: Values,
}

impl Content {
    /// Create empty content.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create content from tables and values.
    pub fn from_parts(tables: Tables, values: Values) -> Self {
        Self { tables, values }
    }

    /// True when there are no tables (not even empty ones) and no values.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }

    pub fn table(&self, table_id: &str) -> Option<&Table> {
        self.tables.get(table_id)
    }

    pub fn row(&self, table_id: &str, row_id: &str) -> Option<&Row> {
        self.tables.get(table_id)?.get(row_id)
    }

    pub fn cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&CellValue> {
        self.row(table_id, row_id)?.get(cell_id)
    }

    pub fn value(&self, value_id: &str) -> Option<&CellValue> {
        self.values.get(value_id)
    }

    /// Set a single cell, creating the table and row as needed.
    pub fn set_cell(
        &mut self,
        table_id: impl Into<TableId>,
        row_id: impl Into<RowId>,
        cell_id: impl Into<CellId>,
        value: impl Into<CellValue>,
    ) -> &mut Self {
        self.tables
            .entry(table_id.into())
            .or_default()
            .entry(row_id.into())
            .or_default()
            .insert(cell_id.into(), value.into());
        self
    }

    /// Replace a whole row.
    pub fn set_row(
        &mut self,
        table_id: impl Into<TableId>,
        row_id: impl Into<RowId>,
        row: Row,
    ) -> &mut Self {
        let table = self.tables.entry(table_id.into()).or_default();
        let row_id = row_id.into();
        // A row exists only through its cells.
        if row.is_empty() {
            table.remove(&row_id);
        } else {
            table.insert(row_id, row);
        }
        self
    }

    /// Replace a whole table. An empty table stays present; rows without
    /// cells are dropped.
    pub fn set_table(&mut self, table_id: impl Into<TableId>, mut table: Table) -> &mut Self {
        table.retain(|_, row| !row.is_empty());
        self.tables.insert(table_id.into(), table);
        self
    }

    pub fn set_value(&mut self, value_id: impl Into<ValueId>, value: impl Into<CellValue>) -> &mut Self {
        self.values.insert(value_id.into(), value.into());
        self
    }

    pub fn remove_table(&mut self, table_id: &str) -> Option<Table> {
        self.tables.remove(table_id)
    }

    /// Remove a row. The table is kept even when it becomes empty.
    pub fn remove_row(&mut self, table_id: &str, row_id: &str) -> Option<Row> {
        self.tables.get_mut(table_id)?.remove(row_id)
    }

    /// Remove a cell; a row left without cells is removed as well.
    pub fn remove_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) -> Option<CellValue> {
        let table = self.tables.get_mut(table_id)?;
        let row = table.get_mut(row_id)?;
        let removed = row.remove(cell_id);
        if row.is_empty() {
            table.remove(row_id);
        }
        removed
    }

    pub fn remove_value(&mut self, value_id: &str) -> Option<CellValue> {
        self.values.remove(value_id)
    }

    /// Count rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Check every cell and value is persistable.
    pub fn validate(&self) -> Result<()> {
        for (table_id, table) in &self.tables {
            for (row_id, row) in table {
                for (cell_id, cell) in row {
                    if !cell.is_valid() {
                        return Err(Error::malformed(format!(
                            "cell {}/{}/{} is not a finite number",
                            table_id, row_id, cell_id
                        )));
                    }
                }
            }
        }
        for (value_id, value) in &self.values {
            if !value.is_valid() {
                return Err(Error::malformed(format!(
                    "value {} is not a finite number",
                    value_id
                )));
            }
        }
        Ok(())
    }
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.tables, &self.values).serialize(serializer)
    }
}
