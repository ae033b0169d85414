//! Database connection setup.

use std::sync::Arc;

use super::{Driver, PgDriver, SqliteDriver};
use crate::error::DriverError;

/// Shared handle to a driver.
pub type SharedDriver = Arc<dyn Driver>;

/// Connect to the database named by `database_url`.
///
/// `postgres://` and `postgresql://` URLs open a [`PgDriver`], listening on
/// `notify_channel` when given. `sqlite:` URLs open a [`SqliteDriver`].
pub async fn connect(database_url: &str, notify_channel: Option<&str>) -> Result<SharedDriver, DriverError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let driver = match notify_channel {
            Some(channel) => PgDriver::connect_with_notifications(database_url, channel).await?,
            None => PgDriver::connect(database_url).await?,
        };
        tracing::info!(notifications = notify_channel.is_some(), "Connected to PostgreSQL");
        return Ok(Arc::new(driver));
    }

    if database_url.starts_with("sqlite:") {
        if notify_channel.is_some() {
            tracing::warn!("SQLite has no change notifications, auto-load will poll");
        }
        let driver = SqliteDriver::connect(database_url).await?;
        tracing::info!("Connected to SQLite");
        return Ok(Arc::new(driver));
    }

    Err(DriverError::UnsupportedUrl(database_url.to_string()))
}
