//! SQLite driver.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use stowage_engine::DbRow;

use super::{Dialect, Driver, Param, Statement};
use crate::error::DriverError;

/// Driver over a SQLite connection pool.
///
/// Cell columns are created without a declared type, so strings, integers
/// and reals come back as written. Booleans are stored as integers and read
/// back as `0` and `1`.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    pool: SqlitePool,
}

impl SqliteDriver {
    /// Open a database file, creating it if missing.
    pub async fn connect(database_url: &str) -> Result<Self, DriverError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// A private in-memory database.
    ///
    /// Pinned to a single connection that is never recycled, since every
    /// SQLite memory connection is its own database.
    pub async fn memory() -> Result<Self, DriverError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.pool.is_closed() {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

/// Build a statement for `sql` with `params` bound.
///
/// Statements are never cached: the SQL is generated per table, and a
/// cached `SELECT *` keeps its old column list after `ALTER TABLE`.
fn bind<'q>(sql: &'q str, params: &'q [Param]) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, DriverError> {
    let mut query = sqlx::query(sql).persistent(false);
    for (index, param) in params.iter().enumerate() {
        query = match param {
            Param::Text(text) | Param::Cell(Value::String(text)) => query.bind(text.as_str()),
            Param::Cell(Value::Bool(flag)) => query.bind(*flag),
            Param::Cell(Value::Number(number)) => match (number.as_i64(), number.as_f64()) {
                (Some(integer), _) => query.bind(integer),
                (None, Some(real)) => query.bind(real),
                (None, None) => {
                    return Err(DriverError::UnsupportedValue {
                        index: index + 1,
                        reason: format!("number {} is out of range", number),
                    })
                }
            },
            Param::Cell(Value::Null) => query.bind(None::<String>),
            Param::Cell(other) => {
                return Err(DriverError::UnsupportedValue {
                    index: index + 1,
                    reason: format!("{} is not a scalar", other),
                })
            }
        };
    }
    Ok(query)
}

/// Convert a row by the storage class of each value.
fn decode_row(row: &SqliteRow) -> Result<DbRow, DriverError> {
    let mut decoded = DbRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT8" | "BIGINT" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" | "FLOAT" | "DOUBLE" => {
                    let real = row.try_get_unchecked::<f64, _>(index)?;
                    serde_json::Number::from_f64(real)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
                "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
                    Value::Array(bytes.into_iter().map(Value::from).collect())
                }
                _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        decoded.insert(column.name().to_string(), value);
    }
    Ok(decoded)
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Param]) -> Result<Vec<DbRow>, DriverError> {
        self.ensure_open()?;
        let rows = bind(sql, params)?.fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn run(&self, sql: &str, params: &[Param]) -> Result<u64, DriverError> {
        self.ensure_open()?;
        let result = bind(sql, params)?.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<u64, DriverError> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for statement in statements {
            let result = bind(&statement.sql, &statement.params)?
                .execute(&mut *tx)
                .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
