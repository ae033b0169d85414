//! PostgreSQL driver.
//!
//! Cell columns are `JSONB`, so strings, numbers and booleans keep their
//! types. Reads go through `row_to_json`, which hands back every row in the
//! same shape regardless of column types.
//!
//! With a notification channel configured the driver `LISTEN`s on it and
//! every committed transaction issues a `pg_notify`, giving auto-load a
//! native change feed instead of polling.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgListener, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use stowage_engine::DbRow;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{Dialect, Driver, Param, Statement};
use crate::error::DriverError;

/// Capacity of the change broadcast. Lagging receivers only lose
/// duplicates, since every notification means the same thing.
const CHANGE_CAPACITY: usize = 16;

/// Column holding each row as JSON text.
const ROW_COLUMN: &str = "__row";

/// Driver over a PostgreSQL connection pool.
#[derive(Debug)]
pub struct PgDriver {
    pool: PgPool,
    notify: Option<Notify>,
}

#[derive(Debug)]
struct Notify {
    channel: String,
    sender: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PgDriver {
    /// Connect without change notifications.
    pub async fn connect(database_url: &str) -> Result<Self, DriverError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool, notify: None })
    }

    /// Connect and listen for changes on `channel`.
    pub async fn connect_with_notifications(database_url: &str, channel: &str) -> Result<Self, DriverError> {
        let driver = Self::connect(database_url).await?;
        driver.listen(channel).await
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, notify: None }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start listening on `channel`.
    pub async fn listen(mut self, channel: &str) -> Result<Self, DriverError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;

        let (sender, _) = broadcast::channel(CHANGE_CAPACITY);
        let forward = sender.clone();
        let name = channel.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        tracing::trace!(channel = %name, payload = notification.payload(), "Change notification");
                        // No receivers just means nobody is auto-loading yet.
                        let _ = forward.send(());
                    }
                    Err(e) => {
                        tracing::warn!(channel = %name, error = %e, "Change listener stopped");
                        break;
                    }
                }
            }
        });

        tracing::info!(channel = %channel, "Listening for change notifications");
        self.notify = Some(Notify {
            channel: channel.to_string(),
            sender,
            listener: Mutex::new(Some(handle)),
        });
        Ok(self)
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.pool.is_closed() {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

/// Build a statement for `sql` with `params` bound. Never cached, so a
/// widened table is read with its current columns.
fn bind<'q>(sql: &'q str, params: &'q [Param]) -> Result<Query<'q, Postgres, PgArguments>, DriverError> {
    let mut query = sqlx::query(sql).persistent(false);
    for (index, param) in params.iter().enumerate() {
        query = match param {
            Param::Text(text) => query.bind(text.as_str()),
            Param::Cell(value @ (Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null)) => {
                query.bind(sqlx::types::Json(value))
            }
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

#[async_trait]
impl Driver for PgDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[Param]) -> Result<Vec<DbRow>, DriverError> {
        self.ensure_open()?;
        let wrapped = format!(
            "SELECT row_to_json(q)::text AS {} FROM ({}) AS q",
            ROW_COLUMN, sql
        );
        let rows = bind(&wrapped, params)?
            .fetch_all(&self.pool)
            .await?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get(ROW_COLUMN)?;
            let parsed: DbRow = serde_json::from_str(&text)
                .map_err(|e| DriverError::Database(sqlx::Error::Decode(Box::new(e))))?;
            decoded.push(parsed);
        }
        Ok(decoded)
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
        if let Some(notify) = &self.notify {
            // Delivered on commit only.
            sqlx::query("SELECT pg_notify($1, '')")
                .bind(&notify.channel)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(affected)
    }

    fn changes(&self) -> Option<broadcast::Receiver<()>> {
        self.notify.as_ref().map(|n| n.sender.subscribe())
    }

    async fn close(&self) {
        if let Some(handle) = self.notify.as_ref().and_then(|n| n.listener.lock().take()) {
            handle.abort();
        }
        self.pool.close().await;
    }
}
