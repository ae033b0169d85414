//! Unified error handling for persisters.

use std::fmt;

use stowage_engine::TableId;

/// Errors raised by a database driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Parameter {index} cannot be bound: {reason}")]
    UnsupportedValue { index: usize, reason: String },

    #[error("Unsupported database URL '{0}', expected postgres:// or sqlite:")]
    UnsupportedUrl(String),

    #[error("Driver is closed")]
    Closed,
}

/// One table that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    /// Store table id, or `None` for the values table.
    pub table_id: Option<TableId>,
    pub db_table: String,
    pub reason: String,
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table_id {
            Some(table_id) => write!(f, "table '{}' ({}): {}", table_id, self.db_table, self.reason),
            None => write!(f, "values ({}): {}", self.db_table, self.reason),
        }
    }
}

/// Persister error type.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Persisted data could not be decoded, or content could not be encoded.
    #[error("Malformed content: {0}")]
    MalformedContent(String),

    /// A cell id collides with the row id column of its table.
    #[error("Cell '{cell_id}' of table '{table_id}' collides with the row id column")]
    SchemaConflict { table_id: TableId, cell_id: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The medium could not be reached or rejected a command.
    #[error("Medium unavailable: {0}")]
    MediumUnavailable(#[from] DriverError),

    /// The persister was destroyed before or while the operation was queued.
    #[error("Persister destroyed")]
    PersisterDestroyed,

    /// Some tables loaded and were applied; these did not.
    #[error("Partial load failure: {} table(s) failed, {} applied", .failed.len(), .applied.len())]
    PartialLoadFailure {
        failed: Vec<TableFailure>,
        applied: Vec<TableId>,
    },
}

impl From<stowage_engine::Error> for PersistError {
    fn from(err: stowage_engine::Error) -> Self {
        match err {
            stowage_engine::Error::MalformedContent(message) => PersistError::MalformedContent(message),
            stowage_engine::Error::SchemaConflict { table_id, cell_id } => {
                PersistError::SchemaConflict { table_id, cell_id }
            }
            stowage_engine::Error::InvalidConfig(message) => PersistError::InvalidConfig(message),
        }
    }
}

impl From<sqlx::Error> for PersistError {
    fn from(err: sqlx::Error) -> Self {
        PersistError::MediumUnavailable(DriverError::Database(err))
    }
}

/// Result type alias for persister operations.
pub type Result<T> = std::result::Result<T, PersistError>;
