//! # Stowage Persister
//!
//! Keeps a reactive in-memory store mirrored in a SQL database.
//!
//! The decisions (what to read, what to write, whether anything changed) are
//! made by `stowage-engine`; this crate carries them out:
//!
//! - [`db`] - the [`Driver`](db::Driver) seam with SQLite and PostgreSQL drivers
//! - [`medium`] - runs engine commands against a driver
//! - [`store`] - the [`ReactiveStore`](store::ReactiveStore) contract and an
//!   in-memory store
//! - [`sync`] - the per-persister worker and auto-sync tasks
//! - [`persister`] - the public [`Persister`] facade
//!
//! ```no_run
//! use std::sync::Arc;
//! use stowage_persister::{db::SqliteDriver, MemoryStore, Persister, PersisterOptions};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new_shared();
//! let driver = Arc::new(SqliteDriver::connect("sqlite:pets.db").await?);
//! let persister = Persister::new(store.clone(), driver, "pets_store", PersisterOptions::default())?;
//!
//! store.set_cell("pets", "fido", "species", "dog");
//! persister.save().await?;
//! persister.start_auto_load().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod medium;
pub mod persister;
pub mod store;
pub mod sync;

pub use config::{Config, ErrorHook, PersisterOptions};
pub use error::{DriverError, PersistError, Result, TableFailure};
pub use persister::Persister;
pub use store::{ChangeEvent, ChangeOrigin, MemoryStore, ReactiveStore, Subscription, SubscriptionId};
pub use sync::{LoadReport, PersisterStats, SaveReport, SyncState, Trigger};

pub use stowage_engine as engine;
