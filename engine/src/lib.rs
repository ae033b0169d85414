//! # Stowage Engine
//!
//! The persistence reconciliation engine behind Stowage persisters.
//!
//! This crate decides what to read, what to write and when, for mirroring an
//! in-memory store of tables and values into a row-oriented database. It
//! never touches the database itself: it produces commands and consumes rows,
//! and the persister crate executes them.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of drivers, sockets or runtimes
//! - **Deterministic**: `BTreeMap` everywhere, so encodings and fingerprints
//!   do not depend on insertion order
//! - **Minimal writes**: unchanged content is never rewritten
//!
//! ## Core Concepts
//!
//! ### Content
//!
//! [`Content`] is a snapshot of the store: tables of rows of cells, plus flat
//! values. Cells and values are [`CellValue`]s (string, number or boolean).
//!
//! ### Modes
//!
//! A [`DatabasePersisterConfig`] resolves into a [`PersistMode`]:
//! - [`PersistMode::Json`] - the whole store as one JSON string in one row
//! - [`PersistMode::Tabular`] - each store table mapped to its own database
//!   table, with independent load and save sides
//!
//! ### Codec
//!
//! The [`codec`] module converts content to and from its wire forms.
//!
//! ### Planning
//!
//! The [`plan`] module turns a mode or an encoded [`WireForm`] into ordered
//! [`Command`]s: `CreateTableIfAbsent`, `SelectAll`, `DeleteAll` and
//! `InsertOrReplaceRows`.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] caches a [`Fingerprint`] per save target and drops
//! writes of unchanged content; on load it merges external content and
//! reports whether anything actually changed.
//!
//! ## Quick Start
//!
//! ```rust
//! use stowage_engine::{
//!     codec, plan_save, Content, DatabasePersisterConfig, Reconciler,
//! };
//!
//! // 1. Resolve a configuration
//! let mode = DatabasePersisterConfig::from("my_store").resolve().unwrap();
//!
//! // 2. Build some content
//! let mut content = Content::new();
//! content.set_cell("pets", "fido", "species", "dog");
//!
//! // 3. Encode and plan a save
//! let wire = codec::encode(&content, &mode).unwrap();
//! let steps = plan_save(&wire);
//!
//! // 4. Only unchanged-since-last-write steps are dropped
//! let mut reconciler = Reconciler::new();
//! let pending = reconciler.pending(steps).unwrap();
//! assert_eq!(pending.len(), 1);
//! for (step, fingerprint) in pending {
//!     // ...execute step.commands, then:
//!     reconciler.record(step.target, fingerprint);
//! }
//! let again = reconciler.pending(plan_save(&wire)).unwrap();
//! assert!(again.is_empty());
//! ```

pub mod codec;
pub mod config;
pub mod content;
pub mod error;
pub mod plan;
pub mod reconcile;

// Re-export main types at crate root
pub use codec::{Decoded, TableRows, WireForm};
pub use config::{
    DatabasePersisterConfig, DbTable, JsonConfig, ModeConfig, PersistMode, TableEntry,
    TableMapping, TabularConfig, ValuesConfig, ValuesMapping,
};
pub use content::{CellValue, Content, Row, Table, Tables, Values};
pub use error::Error;
pub use plan::{plan, plan_load, plan_save, ColumnKind, Command, Direction, LoadStep, SaveStep, Target};
pub use reconcile::{ExternalSnapshot, Fingerprint, Loaded, Merge, Reconciler, RowNormalizer};

/// Type aliases for clarity
pub type TableId = String;
pub type RowId = String;
pub type CellId = String;
pub type ValueId = String;

/// A raw database row: column name to JSON scalar.
pub type DbRow = std::collections::BTreeMap<String, serde_json::Value>;
