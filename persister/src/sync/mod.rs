//! Synchronization: the per-persister worker and the auto-sync controller.
//!
//! All loads and saves of one persister are serialized through its
//! [`worker`]. The [`controller`] owns the background auto-load and
//! auto-save tasks, which only ever talk to the worker.

pub(crate) mod controller;
pub(crate) mod worker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stowage_engine::{TableId, Target};

pub use controller::SyncState;

/// What started an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// A direct `load()` or `save()` call.
    Caller,
    /// Auto-load or auto-save.
    Auto,
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Whether the store content changed.
    pub applied: bool,
    /// Store tables read from the medium.
    pub tables: Vec<TableId>,
    /// Rows skipped while decoding.
    pub warnings: Vec<String>,
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    /// Targets actually written. Empty when nothing had changed.
    pub written: Vec<Target>,
    /// Write commands issued.
    pub commands: usize,
}

impl SaveReport {
    /// True when every target was unchanged and nothing was written.
    pub fn is_skipped(&self) -> bool {
        self.written.is_empty()
    }
}

/// Counters kept by a persister.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersisterStats {
    pub loads: u64,
    /// Loads that changed the store.
    pub loads_applied: u64,
    pub saves: u64,
    /// Saves that wrote at least one target.
    pub saves_written: u64,
    /// Saves with nothing to write.
    pub saves_skipped: u64,
    pub write_commands: u64,
    /// Loads and saves that returned an error.
    pub failures: u64,
    /// Errors raised by auto-load and auto-save.
    pub auto_errors: u64,
    pub last_load_at: Option<DateTime<Utc>>,
    pub last_save_at: Option<DateTime<Utc>>,
}
