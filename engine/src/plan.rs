//! Command planning.
//!
//! The planner turns a mode (for loads) or an encoded [`WireForm`] (for
//! saves) into an ordered list of medium commands. Commands are
//! driver-independent; rendering them for a particular database is the
//! medium adapter's job.
//!
//! Commands are grouped into steps, one per database table touched, so the
//! reconciler can drop steps whose content has not changed since the last
//! successful write.

use crate::codec::{json_row, TableRows, WireForm};
use crate::config::{DbTable, PersistMode, VALUE_COLUMN_NAME};
use crate::{error::Result, Content, DbRow, TableId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Direction of a persistence operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Load,
    Save,
}

/// Storage class of a column created by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColumnKind {
    /// Plain text (ids, the JSON store blob).
    Text,
    /// A cell: string, number or boolean.
    Cell,
}

/// A single medium command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Create the table if missing and add any missing columns.
    CreateTableIfAbsent {
        table: String,
        id_column: String,
        columns: Vec<(String, ColumnKind)>,
    },
    SelectAll {
        table: String,
    },
    DeleteAll {
        table: String,
    },
    /// Insert rows; a row whose id already exists is replaced.
    InsertOrReplaceRows {
        table: String,
        id_column: String,
        rows: Vec<DbRow>,
    },
}

impl Command {
    pub fn table(&self) -> &str {
        match self {
            Command::CreateTableIfAbsent { table, .. }
            | Command::SelectAll { table }
            | Command::DeleteAll { table }
            | Command::InsertOrReplaceRows { table, .. } => table,
        }
    }

    /// True for commands that change the medium.
    pub fn is_write(&self) -> bool {
        !matches!(self, Command::SelectAll { .. })
    }
}

/// What a step reads or writes, in store terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// The whole store as one JSON row.
    Store { db_table: String },
    /// One store table mapped to one database table.
    Table { table_id: TableId, db_table: String },
    /// Store values in their own table.
    Values { db_table: String },
}

impl Target {
    pub fn db_table(&self) -> &str {
        match self {
            Target::Store { db_table } | Target::Table { db_table, .. } | Target::Values { db_table } => {
                db_table
            }
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Store { db_table } => write!(f, "store -> {}", db_table),
            Target::Table { table_id, db_table } => write!(f, "table {} -> {}", table_id, db_table),
            Target::Values { db_table } => write!(f, "values -> {}", db_table),
        }
    }
}

/// One read of one database table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadStep {
    pub target: Target,
    pub db_table: DbTable,
    pub command: Command,
}

/// All writes for one database table.
///
/// `rows` is the complete intended table content and is what fingerprints
/// are computed over.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveStep {
    pub target: Target,
    pub db_table: DbTable,
    pub rows: Vec<DbRow>,
    pub commands: Vec<Command>,
}

/// Plan the reads for a load, in configuration order.
///
/// Tables without a load mapping are never read.
pub fn plan_load(mode: &PersistMode) -> Vec<LoadStep> {
    match mode {
        PersistMode::Json {
            store_table_name,
            store_id_column_name,
            ..
        } => vec![LoadStep {
            target: Target::Store {
                db_table: store_table_name.clone(),
            },
            db_table: DbTable::new(store_table_name.clone(), store_id_column_name.clone()),
            command: Command::SelectAll {
                table: store_table_name.clone(),
            },
        }],
        PersistMode::Tabular { values, .. } => {
            let mut steps: Vec<LoadStep> = mode
                .load_mappings()
                .map(|(table_id, db_table)| LoadStep {
                    target: Target::Table {
                        table_id: table_id.clone(),
                        db_table: db_table.name.clone(),
                    },
                    db_table: db_table.clone(),
                    command: Command::SelectAll {
                        table: db_table.name.clone(),
                    },
                })
                .collect();
            if let Some(values) = values.as_ref().filter(|v| v.load) {
                steps.push(LoadStep {
                    target: Target::Values {
                        db_table: values.table.name.clone(),
                    },
                    db_table: values.table.clone(),
                    command: Command::SelectAll {
                        table: values.table.name.clone(),
                    },
                });
            }
            steps
        }
    }
}

/// Plan the writes for a save of already-encoded content.
///
/// Each step creates its table if absent, then fully replaces its rows:
/// `DeleteAll` strictly before `InsertOrReplaceRows`. An empty row set still
/// produces the create and delete, so empty tables stay present.
pub fn plan_save(wire: &WireForm) -> Vec<SaveStep> {
    match wire {
        WireForm::Json {
            db_table,
            store_column,
            blob,
        } => {
            let rows = vec![json_row(&db_table.row_id_column, store_column, blob)];
            let create = Command::CreateTableIfAbsent {
                table: db_table.name.clone(),
                id_column: db_table.row_id_column.clone(),
                columns: vec![(store_column.clone(), ColumnKind::Text)],
            };
            vec![SaveStep {
                target: Target::Store {
                    db_table: db_table.name.clone(),
                },
                db_table: db_table.clone(),
                commands: replace_commands(create, db_table, &rows),
                rows,
            }]
        }
        WireForm::Tabular { tables, values } => {
            let mut steps: Vec<SaveStep> = tables
                .iter()
                .filter_map(|t| {
                    let table_id = t.table_id.clone()?;
                    Some(tabular_step(
                        Target::Table {
                            table_id,
                            db_table: t.db_table.name.clone(),
                        },
                        t,
                    ))
                })
                .collect();
            if let Some(values) = values {
                steps.push(tabular_step(
                    Target::Values {
                        db_table: values.db_table.name.clone(),
                    },
                    values,
                ));
            }
            steps
        }
    }
}

fn tabular_step(target: Target, table: &TableRows) -> SaveStep {
    let columns: BTreeSet<&String> = table
        .rows
        .iter()
        .flat_map(|row| row.keys())
        .filter(|column| **column != table.db_table.row_id_column)
        .collect();
    let mut columns: Vec<(String, ColumnKind)> = columns
        .into_iter()
        .map(|c| (c.clone(), ColumnKind::Cell))
        .collect();
    if matches!(target, Target::Values { .. }) && columns.is_empty() {
        columns.push((VALUE_COLUMN_NAME.to_string(), ColumnKind::Cell));
    }

    let create = Command::CreateTableIfAbsent {
        table: table.db_table.name.clone(),
        id_column: table.db_table.row_id_column.clone(),
        columns,
    };
    SaveStep {
        target,
        db_table: table.db_table.clone(),
        commands: replace_commands(create, &table.db_table, &table.rows),
        rows: table.rows.clone(),
    }
}

fn replace_commands(create: Command, db_table: &DbTable, rows: &[DbRow]) -> Vec<Command> {
    let mut commands = vec![
        create,
        Command::DeleteAll {
            table: db_table.name.clone(),
        },
    ];
    if !rows.is_empty() {
        commands.push(Command::InsertOrReplaceRows {
            table: db_table.name.clone(),
            id_column: db_table.row_id_column.clone(),
            rows: rows.to_vec(),
        });
    }
    commands
}

/// Flat command list for a direction.
///
/// Saves need the content to encode; loads ignore it.
pub fn plan(direction: Direction, mode: &PersistMode, content: &Content) -> Result<Vec<Command>> {
    match direction {
        Direction::Load => Ok(plan_load(mode).into_iter().map(|s| s.command).collect()),
        Direction::Save => {
            let wire = crate::codec::encode(content, mode)?;
            Ok(plan_save(&wire)
                .into_iter()
                .flat_map(|s| s.commands)
                .collect())
        }
    }
}
