//! Content codec: store content to and from its persisted encodings.
//!
//! Two encodings exist:
//!
//! - **JSON**: the whole content as the string `[tables, values]`, stored in
//!   one column of one row.
//! - **Tabular**: one row set per store table, each row carrying its row id
//!   in a designated column and every cell in a column of the same name.
//!   Values use a two-column layout (row id column, [`VALUE_COLUMN_NAME`]).
//!
//! Nothing here performs I/O.

use crate::config::{DbTable, PersistMode, JSON_ROW_ID, VALUE_COLUMN_NAME};
use crate::content::{CellValue, Content, Row, Table, Tables, Values};
use crate::{error::Result, DbRow, Error, TableId};
use serde_json::Value;

/// Rows for one database table, ready to be written or just read.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
    /// Store table the rows belong to; `None` for the values table.
    pub table_id: Option<TableId>,
    pub db_table: DbTable,
    pub rows: Vec<DbRow>,
}

/// Encoded content.
#[derive(Debug, Clone, PartialEq)]
pub enum WireForm {
    Json {
        db_table: DbTable,
        store_column: String,
        blob: String,
    },
    Tabular {
        tables: Vec<TableRows>,
        values: Option<TableRows>,
    },
}

/// A table decoded from rows, with any rows that had to be skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded<T> {
    pub content: T,
    pub warnings: Vec<String>,
}

// ============================================================================
// JSON encoding
// ============================================================================

/// Serialize content as `[tables, values]`.
pub fn encode_json(content: &Content) -> Result<String> {
    content.validate()?;
    serde_json::to_string(content).map_err(|e| Error::malformed(e.to_string()))
}

/// Parse `[tables, values]`. `[{},{}]` is an empty store.
pub fn decode_json(text: &str) -> Result<Content> {
    let parsed: Value =
        serde_json::from_str(text).map_err(|e| Error::malformed(format!("invalid JSON: {}", e)))?;

    let parts = match parsed {
        Value::Array(parts) if parts.len() == 2 => parts,
        Value::Array(parts) => {
            return Err(Error::malformed(format!(
                "expected a 2-element array, got {} elements",
                parts.len()
            )))
        }
        other => {
            return Err(Error::malformed(format!(
                "expected a 2-element array, got {}",
                json_type_name(&other)
            )))
        }
    };
    let mut parts = parts.into_iter();
    let tables_json = parts.next().unwrap_or(Value::Null);
    let values_json = parts.next().unwrap_or(Value::Null);

    let tables_obj = tables_json
        .as_object()
        .ok_or_else(|| Error::malformed("tables must be an object"))?;
    let values_obj = values_json
        .as_object()
        .ok_or_else(|| Error::malformed("values must be an object"))?;

    let mut tables = Tables::new();
    for (table_id, table_json) in tables_obj {
        let rows = table_json
            .as_object()
            .ok_or_else(|| Error::malformed(format!("table '{}' must be an object", table_id)))?;
        let mut table = Table::new();
        for (row_id, row_json) in rows {
            let cells = row_json.as_object().ok_or_else(|| {
                Error::malformed(format!("row '{}/{}' must be an object", table_id, row_id))
            })?;
            let mut row = Row::new();
            for (cell_id, cell_json) in cells {
                let cell = CellValue::from_json(cell_json).map_err(|e| {
                    Error::malformed(format!("cell '{}/{}/{}': {}", table_id, row_id, cell_id, e))
                })?;
                if let Some(cell) = cell {
                    row.insert(cell_id.clone(), cell);
                }
            }
            if !row.is_empty() {
                table.insert(row_id.clone(), row);
            }
        }
        tables.insert(table_id.clone(), table);
    }

    let mut values = Values::new();
    for (value_id, value_json) in values_obj {
        let value = CellValue::from_json(value_json)
            .map_err(|e| Error::malformed(format!("value '{}': {}", value_id, e)))?;
        if let Some(value) = value {
            values.insert(value_id.clone(), value);
        }
    }

    Ok(Content::from_parts(tables, values))
}

/// The single row holding a JSON-encoded store.
pub fn json_row(id_column: &str, store_column: &str, blob: &str) -> DbRow {
    let mut row = DbRow::new();
    row.insert(id_column.to_string(), Value::String(JSON_ROW_ID.to_string()));
    row.insert(store_column.to_string(), Value::String(blob.to_string()));
    row
}

/// Find the store blob among rows read from the store table.
///
/// Returns `Ok(None)` when there is no `'_'` row, i.e. nothing was ever saved.
pub fn decode_json_rows(rows: &[DbRow], id_column: &str, store_column: &str) -> Result<Option<Content>> {
    let row = rows
        .iter()
        .rev()
        .find(|row| row.get(id_column).and_then(Value::as_str) == Some(JSON_ROW_ID));
    let Some(row) = row else {
        return Ok(None);
    };
    match row.get(store_column) {
        Some(Value::String(blob)) => decode_json(blob).map(Some),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(Error::malformed(format!(
            "store column '{}' holds {}, expected text",
            store_column,
            json_type_name(other)
        ))),
    }
}

// ============================================================================
// Tabular encoding
// ============================================================================

/// Flatten a table into rows of `{row_id_column: rowId, ...cells}`.
pub fn encode_table(table_id: &str, table: &Table, row_id_column: &str) -> Result<Vec<DbRow>> {
    let mut rows = Vec::with_capacity(table.len());
    for (row_id, cells) in table {
        let mut row = DbRow::new();
        row.insert(row_id_column.to_string(), Value::String(row_id.clone()));
        for (cell_id, cell) in cells {
            if cell_id == row_id_column {
                return Err(Error::SchemaConflict {
                    table_id: table_id.to_string(),
                    cell_id: cell_id.clone(),
                });
            }
            row.insert(cell_id.clone(), cell.to_json()?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Rebuild a table from rows.
///
/// Rows without a usable row id are skipped and reported as warnings. A
/// column holding something other than a scalar fails the whole table. Rows
/// with no non-null cells are dropped. When two rows share an id the later
/// one wins.
pub fn decode_table(rows: &[DbRow], row_id_column: &str) -> Result<Decoded<Table>> {
    let mut decoded = Decoded::<Table>::default();
    for (index, row) in rows.iter().enumerate() {
        let Some(row_id) = row_id_of(row, row_id_column) else {
            decoded
                .warnings
                .push(format!("row {} has no '{}' column value", index, row_id_column));
            continue;
        };
        let mut cells = Row::new();
        for (column, raw) in row {
            if column == row_id_column {
                continue;
            }
            let cell = CellValue::from_json(raw).map_err(|e| {
                Error::malformed(format!("row '{}' column '{}': {}", row_id, column, e))
            })?;
            if let Some(cell) = cell {
                cells.insert(column.clone(), cell);
            }
        }
        if !cells.is_empty() {
            decoded.content.insert(row_id, cells);
        }
    }
    Ok(decoded)
}

/// Flatten values into rows of `{row_id_column: valueId, value: v}`.
pub fn encode_values(values: &Values, row_id_column: &str) -> Result<Vec<DbRow>> {
    values
        .iter()
        .map(|(value_id, value)| {
            let mut row = DbRow::new();
            row.insert(row_id_column.to_string(), Value::String(value_id.clone()));
            row.insert(VALUE_COLUMN_NAME.to_string(), value.to_json()?);
            Ok(row)
        })
        .collect()
}

/// Rebuild values from rows. Rows without an id or a value are skipped.
pub fn decode_values(rows: &[DbRow], row_id_column: &str) -> Result<Decoded<Values>> {
    let mut decoded = Decoded::<Values>::default();
    for (index, row) in rows.iter().enumerate() {
        let Some(value_id) = row_id_of(row, row_id_column) else {
            decoded
                .warnings
                .push(format!("row {} has no '{}' column value", index, row_id_column));
            continue;
        };
        let raw = row.get(VALUE_COLUMN_NAME).unwrap_or(&Value::Null);
        match CellValue::from_json(raw)
            .map_err(|e| Error::malformed(format!("value '{}': {}", value_id, e)))?
        {
            Some(value) => {
                decoded.content.insert(value_id, value);
            }
            None => decoded
                .warnings
                .push(format!("value '{}' has no '{}' column value", value_id, VALUE_COLUMN_NAME)),
        }
    }
    Ok(decoded)
}

fn row_id_of(row: &DbRow, row_id_column: &str) -> Option<String> {
    match row.get(row_id_column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Whole-content contract
// ============================================================================

/// Encode content for saving under `mode`.
///
/// In tabular mode only tables with a save mapping are encoded; a mapped table
/// absent from the store encodes to an empty row set.
pub fn encode(content: &Content, mode: &PersistMode) -> Result<WireForm> {
    match mode {
        PersistMode::Json {
            store_table_name,
            store_id_column_name,
            store_column_name,
        } => Ok(WireForm::Json {
            db_table: DbTable::new(store_table_name.clone(), store_id_column_name.clone()),
            store_column: store_column_name.clone(),
            blob: encode_json(content)?,
        }),
        PersistMode::Tabular { values, .. } => {
            let empty = Table::new();
            let tables = mode
                .save_mappings()
                .map(|(table_id, db_table)| {
                    let table = content.tables.get(table_id).unwrap_or(&empty);
                    Ok(TableRows {
                        table_id: Some(table_id.clone()),
                        db_table: db_table.clone(),
                        rows: encode_table(table_id, table, &db_table.row_id_column)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let values = match values {
                Some(mapping) if mapping.save => Some(TableRows {
                    table_id: None,
                    db_table: mapping.table.clone(),
                    rows: encode_values(&content.values, &mapping.table.row_id_column)?,
                }),
                _ => None,
            };

            Ok(WireForm::Tabular { tables, values })
        }
    }
}

/// Inverse of [`encode`]. Row warnings are dropped here; use the per-table
/// functions to observe them.
pub fn decode(wire: &WireForm) -> Result<Content> {
    match wire {
        WireForm::Json { blob, .. } => decode_json(blob),
        WireForm::Tabular { tables, values } => {
            let mut content = Content::new();
            for rows in tables {
                let table = decode_table(&rows.rows, &rows.db_table.row_id_column)?;
                if let Some(table_id) = &rows.table_id {
                    content.tables.insert(table_id.clone(), table.content);
                }
            }
            if let Some(values) = values {
                content.values = decode_values(&values.rows, &values.db_table.row_id_column)?.content;
            }
            Ok(content)
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
