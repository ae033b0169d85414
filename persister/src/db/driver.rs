//! The driver seam between persisters and a concrete database.

use async_trait::async_trait;
use serde_json::Value;
use stowage_engine::DbRow;
use tokio::sync::broadcast;

use super::Dialect;
use crate::error::DriverError;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// Plain text: row ids, table names, the JSON store blob.
    Text(String),
    /// A cell or value. Strings, numbers, booleans and null.
    Cell(Value),
}

impl Param {
    pub fn text(value: impl Into<String>) -> Self {
        Param::Text(value.into())
    }
}

/// One SQL statement with its parameters, for batching into a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A database connection as seen by a persister.
///
/// Implementations must be safe to share between the persister's worker and
/// its background tasks.
#[async_trait]
pub trait Driver: Send + Sync {
    /// SQL flavor used to render commands for this driver.
    fn dialect(&self) -> Dialect;

    /// Run a query and return its rows as column name to JSON scalar.
    async fn execute(&self, sql: &str, params: &[Param]) -> Result<Vec<DbRow>, DriverError>;

    /// Run a statement, returning the number of affected rows.
    async fn run(&self, sql: &str, params: &[Param]) -> Result<u64, DriverError>;

    /// Run statements as one unit.
    ///
    /// The default runs them in order without atomicity; drivers backed by a
    /// real database override this with a transaction.
    async fn transaction(&self, statements: &[Statement]) -> Result<u64, DriverError> {
        let mut affected = 0;
        for statement in statements {
            affected += self.run(&statement.sql, &statement.params).await?;
        }
        Ok(affected)
    }

    /// Native change notifications, if the database offers them.
    ///
    /// `None` makes auto-load fall back to polling.
    fn changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }

    /// Release pooled connections.
    async fn close(&self) {}
}
