//! Persister configuration.
//!
//! [`DatabasePersisterConfig`] is the user-facing shape (deserializable from
//! JSON, including the bare-string shorthand). [`PersistMode`] is the
//! validated form the rest of the engine works with.

use crate::{error::Result, Error, TableId};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

pub const DEFAULT_STORE_TABLE_NAME: &str = "tinybase";
pub const DEFAULT_STORE_ID_COLUMN_NAME: &str = "_id";
pub const DEFAULT_STORE_COLUMN_NAME: &str = "store";
pub const DEFAULT_ROW_ID_COLUMN_NAME: &str = "_id";
pub const DEFAULT_VALUES_TABLE_NAME: &str = "tinybase_values";

/// Column holding each value in the values table.
pub const VALUE_COLUMN_NAME: &str = "value";

/// Row id of the single row holding the whole store in JSON mode.
pub const JSON_ROW_ID: &str = "_";

// ============================================================================
// User-facing configuration
// ============================================================================

/// Configuration accepted by a database persister.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatabasePersisterConfig {
    /// A bare string names the JSON-mode store table.
    Shorthand(String),
    Mode(ModeConfig),
}

/// Configuration discriminated by its `mode` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ModeConfig {
    Json(JsonConfig),
    Tabular(TabularConfig),
}

/// JSON mode: the whole store serialized into one column of one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id_column_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_column_name: Option<String>,
}

/// Tabular mode: each store table maps to its own database table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabularConfig {
    #[serde(default)]
    pub tables: TablesConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<ValuesConfig>,
}

/// Per-direction table mappings, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TablesConfig {
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub load: Vec<(TableId, TableEntry)>,
    #[serde(default, with = "ordered_map", skip_serializing_if = "Vec::is_empty")]
    pub save: Vec<(TableId, TableEntry)>,
}

/// One side of a table mapping: a table name, or a name plus id column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableEntry {
    Name(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        db_table_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_id_column_name: Option<String>,
    },
}

impl TableEntry {
    fn resolve(&self) -> DbTable {
        match self {
            TableEntry::Name(name) => DbTable::new(name.clone(), DEFAULT_ROW_ID_COLUMN_NAME),
            TableEntry::Detailed {
                db_table_name,
                row_id_column_name,
            } => DbTable::new(
                db_table_name.clone(),
                row_id_column_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ROW_ID_COLUMN_NAME.to_string()),
            ),
        }
    }
}

impl From<&str> for TableEntry {
    fn from(name: &str) -> Self {
        TableEntry::Name(name.to_string())
    }
}

/// Values table configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesConfig {
    #[serde(default)]
    pub load: bool,
    #[serde(default)]
    pub save: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id_column_name: Option<String>,
}

impl DatabasePersisterConfig {
    /// JSON mode with every field defaulted.
    pub fn json() -> Self {
        DatabasePersisterConfig::Mode(ModeConfig::Json(JsonConfig::default()))
    }

    /// Parse from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::invalid_config(e.to_string()))
    }

    /// Validate and resolve defaults.
    pub fn resolve(&self) -> Result<PersistMode> {
        match self {
            DatabasePersisterConfig::Shorthand(table) => PersistMode::json(JsonConfig {
                store_table_name: Some(table.clone()),
                ..JsonConfig::default()
            }),
            DatabasePersisterConfig::Mode(ModeConfig::Json(config)) => PersistMode::json(config.clone()),
            DatabasePersisterConfig::Mode(ModeConfig::Tabular(config)) => PersistMode::tabular(config),
        }
    }
}

impl From<&str> for DatabasePersisterConfig {
    fn from(table: &str) -> Self {
        DatabasePersisterConfig::Shorthand(table.to_string())
    }
}

impl From<JsonConfig> for DatabasePersisterConfig {
    fn from(config: JsonConfig) -> Self {
        DatabasePersisterConfig::Mode(ModeConfig::Json(config))
    }
}

impl From<TabularConfig> for DatabasePersisterConfig {
    fn from(config: TabularConfig) -> Self {
        DatabasePersisterConfig::Mode(ModeConfig::Tabular(config))
    }
}

impl TabularConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store table from a database table.
    pub fn load(mut self, table_id: impl Into<TableId>, entry: impl Into<TableEntry>) -> Self {
        self.tables.load.push((table_id.into(), entry.into()));
        self
    }

    /// Save a store table to a database table.
    pub fn save(mut self, table_id: impl Into<TableId>, entry: impl Into<TableEntry>) -> Self {
        self.tables.save.push((table_id.into(), entry.into()));
        self
    }

    /// Load and save a store table through the same database table.
    pub fn both(self, table_id: impl Into<TableId>, entry: impl Into<TableEntry>) -> Self {
        let table_id = table_id.into();
        let entry = entry.into();
        self.load(table_id.clone(), entry.clone()).save(table_id, entry)
    }

    pub fn with_values(mut self, values: ValuesConfig) -> Self {
        self.values = Some(values);
        self
    }
}

// ============================================================================
// Resolved mode
// ============================================================================

/// A database table plus the column holding row ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbTable {
    pub name: String,
    pub row_id_column: String,
}

impl DbTable {
    pub fn new(name: impl Into<String>, row_id_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            row_id_column: row_id_column.into(),
        }
    }
}

/// How one store table is mirrored. Either side may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub table_id: TableId,
    pub load: Option<DbTable>,
    pub save: Option<DbTable>,
}

/// How store values are mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuesMapping {
    pub table: DbTable,
    pub load: bool,
    pub save: bool,
}

/// The validated persistence mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistMode {
    Json {
        store_table_name: String,
        store_id_column_name: String,
        store_column_name: String,
    },
    Tabular {
        tables: Vec<TableMapping>,
        values: Option<ValuesMapping>,
    },
}

impl PersistMode {
    fn json(config: JsonConfig) -> Result<Self> {
        let store_table_name = config
            .store_table_name
            .unwrap_or_else(|| DEFAULT_STORE_TABLE_NAME.to_string());
        let store_id_column_name = config
            .store_id_column_name
            .unwrap_or_else(|| DEFAULT_STORE_ID_COLUMN_NAME.to_string());
        let store_column_name = config
            .store_column_name
            .unwrap_or_else(|| DEFAULT_STORE_COLUMN_NAME.to_string());

        non_empty("storeTableName", &store_table_name)?;
        non_empty("storeIdColumnName", &store_id_column_name)?;
        non_empty("storeColumnName", &store_column_name)?;
        if store_id_column_name == store_column_name {
            return Err(Error::invalid_config(format!(
                "store id column and store column are both '{}'",
                store_column_name
            )));
        }

        Ok(PersistMode::Json {
            store_table_name,
            store_id_column_name,
            store_column_name,
        })
    }

    fn tabular(config: &TabularConfig) -> Result<Self> {
        let mut tables: Vec<TableMapping> = Vec::new();

        for (table_id, entry) in &config.tables.load {
            let db_table = checked(table_id, entry)?;
            if tables.iter().any(|m| &m.table_id == table_id) {
                return Err(Error::invalid_config(format!(
                    "table '{}' has more than one load mapping",
                    table_id
                )));
            }
            tables.push(TableMapping {
                table_id: table_id.clone(),
                load: Some(db_table),
                save: None,
            });
        }

        for (table_id, entry) in &config.tables.save {
            let db_table = checked(table_id, entry)?;
            match tables.iter_mut().find(|m| &m.table_id == table_id) {
                Some(mapping) if mapping.save.is_some() => {
                    return Err(Error::invalid_config(format!(
                        "table '{}' has more than one save mapping",
                        table_id
                    )))
                }
                Some(mapping) => mapping.save = Some(db_table),
                None => tables.push(TableMapping {
                    table_id: table_id.clone(),
                    load: None,
                    save: Some(db_table),
                }),
            }
        }

        let values = config.values.as_ref().map(|v| ValuesMapping {
            table: DbTable::new(
                v.table_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_VALUES_TABLE_NAME.to_string()),
                v.row_id_column_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ROW_ID_COLUMN_NAME.to_string()),
            ),
            load: v.load,
            save: v.save,
        });

        // Two writers targeting one database table would clobber each other.
        let mut save_targets = HashSet::new();
        for db_table in tables.iter().filter_map(|m| m.save.as_ref()) {
            if !save_targets.insert(db_table.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "database table '{}' is saved to by more than one store table",
                    db_table.name
                )));
            }
        }
        if let Some(values) = &values {
            non_empty("values tableName", &values.table.name)?;
            non_empty("values rowIdColumnName", &values.table.row_id_column)?;
            if values.table.row_id_column == VALUE_COLUMN_NAME {
                return Err(Error::invalid_config(format!(
                    "values row id column cannot be '{}'",
                    VALUE_COLUMN_NAME
                )));
            }
            let shared = tables.iter().any(|m| {
                m.save.as_ref().is_some_and(|t| t.name == values.table.name)
                    || m.load.as_ref().is_some_and(|t| t.name == values.table.name)
            });
            if shared {
                return Err(Error::invalid_config(format!(
                    "values table '{}' is also mapped to a store table",
                    values.table.name
                )));
            }
        }

        Ok(PersistMode::Tabular { tables, values })
    }

    /// Mappings that load, in declaration order.
    pub fn load_mappings(&self) -> impl Iterator<Item = (&TableId, &DbTable)> {
        self.table_mappings()
            .iter()
            .filter_map(|m| m.load.as_ref().map(|t| (&m.table_id, t)))
    }

    /// Mappings that save, in declaration order.
    pub fn save_mappings(&self) -> impl Iterator<Item = (&TableId, &DbTable)> {
        self.table_mappings()
            .iter()
            .filter_map(|m| m.save.as_ref().map(|t| (&m.table_id, t)))
    }

    fn table_mappings(&self) -> &[TableMapping] {
        match self {
            PersistMode::Json { .. } => &[],
            PersistMode::Tabular { tables, .. } => tables,
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, PersistMode::Json { .. })
    }
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::invalid_config(format!("{} cannot be empty", field)))
    } else {
        Ok(())
    }
}

fn checked(table_id: &str, entry: &TableEntry) -> Result<DbTable> {
    if table_id.is_empty() {
        return Err(Error::invalid_config("store table id cannot be empty"));
    }
    let db_table = entry.resolve();
    non_empty("dbTableName", &db_table.name)?;
    non_empty("rowIdColumnName", &db_table.row_id_column)?;
    Ok(db_table)
}

/// Serde adapter keeping a JSON object's key order as a `Vec` of pairs.
mod ordered_map {
    use super::*;
    use std::marker::PhantomData;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S, V>(entries: &Vec<(String, V)>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> std::result::Result<Vec<(String, V)>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de>,
    {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = Vec<(String, V)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of store table ids to database tables")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}
