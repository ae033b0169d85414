//! The medium adapter: runs planned commands against a driver.
//!
//! Reads check for the table first, so a table that was never written loads
//! as "nothing there" rather than failing. Each save step creates or widens
//! its table, then runs its delete and inserts in one driver transaction.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use stowage_engine::{ColumnKind, Command, DbRow, SaveStep};

use crate::db::{Param, SharedDriver, Statement};
use crate::error::DriverError;

/// Executes engine commands on one driver.
#[derive(Clone)]
pub struct MediumAdapter {
    driver: SharedDriver,
}

impl MediumAdapter {
    pub fn new(driver: SharedDriver) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, DriverError> {
        let dialect = self.driver.dialect();
        let rows = self
            .driver
            .execute(&dialect.table_exists(), &[Param::text(table)])
            .await?;
        Ok(!rows.is_empty())
    }

    /// Names of the columns a table currently has.
    pub async fn columns(&self, table: &str) -> Result<BTreeSet<String>, DriverError> {
        let dialect = self.driver.dialect();
        let rows = self
            .driver
            .execute(&dialect.list_columns(), &[Param::text(table)])
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|mut row| match row.remove("name") {
                Some(Value::String(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    /// All rows of `table`, or `None` if it does not exist.
    pub async fn select_all(&self, table: &str) -> Result<Option<Vec<DbRow>>, DriverError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let sql = self.driver.dialect().select_all(table);
        self.driver.execute(&sql, &[]).await.map(Some)
    }

    /// Run a read command.
    pub async fn read(&self, command: &Command) -> Result<Option<Vec<DbRow>>, DriverError> {
        self.select_all(command.table()).await
    }

    /// Create the table if absent and add any missing columns.
    pub async fn ensure_table(
        &self,
        table: &str,
        id_column: &str,
        columns: &[(String, ColumnKind)],
    ) -> Result<(), DriverError> {
        let dialect = self.driver.dialect();
        self.driver
            .run(&dialect.create_table(table, id_column, columns), &[])
            .await?;

        let existing = self.columns(table).await?;
        for (column, kind) in columns {
            if !existing.contains(column) {
                tracing::debug!(table = %table, column = %column, "Adding column");
                self.driver
                    .run(&dialect.add_column(table, column, *kind), &[])
                    .await?;
            }
        }
        Ok(())
    }

    /// Run every command of a save step. Returns the number of commands run.
    pub async fn write(&self, step: &SaveStep) -> Result<usize, DriverError> {
        let dialect = self.driver.dialect();
        let mut kinds: HashMap<&str, ColumnKind> = HashMap::new();
        let mut statements = Vec::new();

        for command in &step.commands {
            match command {
                Command::CreateTableIfAbsent {
                    table,
                    id_column,
                    columns,
                } => {
                    self.ensure_table(table, id_column, columns).await?;
                    kinds.extend(columns.iter().map(|(c, k)| (c.as_str(), *k)));
                }
                Command::DeleteAll { table } => {
                    statements.push(Statement::new(dialect.delete_all(table), Vec::new()));
                }
                Command::InsertOrReplaceRows {
                    table,
                    id_column,
                    rows,
                } => {
                    for row in rows {
                        statements.push(self.upsert(table, id_column, row, &kinds));
                    }
                }
                Command::SelectAll { .. } => {}
            }
        }

        self.driver.transaction(&statements).await?;
        tracing::debug!(
            target_table = %step.db_table.name,
            rows = step.rows.len(),
            "Wrote table"
        );
        Ok(step.commands.len())
    }

    fn upsert(&self, table: &str, id_column: &str, row: &DbRow, kinds: &HashMap<&str, ColumnKind>) -> Statement {
        let id = match row.get(id_column) {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let columns: Vec<&str> = row
            .keys()
            .map(String::as_str)
            .filter(|c| *c != id_column)
            .collect();

        let mut params = Vec::with_capacity(columns.len() + 1);
        params.push(Param::Text(id));
        for column in &columns {
            let value = row[*column].clone();
            params.push(match (kinds.get(column), value) {
                (Some(ColumnKind::Text), Value::String(text)) => Param::Text(text),
                (_, value) => Param::Cell(value),
            });
        }

        Statement::new(self.driver.dialect().upsert(table, id_column, &columns), params)
    }
}
