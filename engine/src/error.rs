//! Error types for the Stowage engine.

use crate::{CellId, TableId};
use thiserror::Error;

/// All possible errors from the Stowage engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Codec errors
    #[error("malformed content: {0}")]
    MalformedContent(String),

    #[error("cell id '{cell_id}' in table '{table_id}' collides with the row id column")]
    SchemaConflict { table_id: TableId, cell_id: CellId },

    // Configuration errors
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedContent(message.into())
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig(message.into())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
