//! The persister facade.
//!
//! A [`Persister`] pairs one reactive store with one database. It exposes
//! `load` and `save`, the auto-sync switches, and `destroy`. All medium work
//! runs on the persister's worker task, one operation at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use stowage_engine::{DatabasePersisterConfig, PersistMode};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::PersisterOptions;
use crate::db::SharedDriver;
use crate::error::{PersistError, Result};
use crate::medium::MediumAdapter;
use crate::store::ReactiveStore;
use crate::sync::controller::{spawn_auto_load, spawn_auto_save, ErrorReporter, SyncController};
use crate::sync::worker::{Shared, Worker, WorkerHandle};
use crate::sync::{LoadReport, PersisterStats, SaveReport, SyncState, Trigger};

/// Keeps a store and a database table set in sync.
pub struct Persister {
    config: DatabasePersisterConfig,
    mode: Arc<PersistMode>,
    options: PersisterOptions,
    store: Arc<dyn ReactiveStore>,
    driver: SharedDriver,
    worker: WorkerHandle,
    controller: Mutex<SyncController>,
}

impl Persister {
    /// Create a persister. Must be called inside a Tokio runtime.
    ///
    /// The configuration is validated here; nothing touches the database
    /// until the first load or save.
    pub fn new(
        store: Arc<dyn ReactiveStore>,
        driver: SharedDriver,
        config: impl Into<DatabasePersisterConfig>,
        options: PersisterOptions,
    ) -> Result<Self> {
        let config = config.into();
        let mode = Arc::new(config.resolve()?);
        let shared = Arc::new(Shared::new());
        let worker = Worker::spawn(
            shared,
            mode.clone(),
            store.clone(),
            MediumAdapter::new(driver.clone()),
            options.queue_capacity,
        );

        tracing::info!(
            persister_id = %worker.shared().id,
            mode = if mode.is_json() { "json" } else { "tabular" },
            "Persister created"
        );

        Ok(Self {
            config,
            mode,
            options,
            store,
            driver,
            worker,
            controller: Mutex::new(SyncController::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.worker.shared().id
    }

    /// Read the medium and apply it to the store.
    ///
    /// Resolves after the store has been updated. In tabular mode, tables
    /// that failed are reported in [`PersistError::PartialLoadFailure`]
    /// while the others are still applied.
    pub async fn load(&self) -> Result<LoadReport> {
        self.worker.load(Trigger::Caller).await
    }

    /// Write the store to the medium, skipping anything unchanged since the
    /// last successful write.
    pub async fn save(&self) -> Result<SaveReport> {
        self.worker.save(Trigger::Caller).await
    }

    /// Load now, then keep loading whenever the medium changes.
    ///
    /// Returns once the first load finished. Errors of that load and of
    /// later ones go to the log and to the `on_error` hook.
    pub async fn start_auto_load(&self) -> Result<()> {
        let ready = {
            let mut controller = self.controller.lock();
            if controller.is_destroyed() {
                return Err(PersistError::PersisterDestroyed);
            }
            if controller.is_auto_loading() {
                return Ok(());
            }
            let (ready, started) = oneshot::channel();
            controller.set_auto_load(spawn_auto_load(
                self.worker.clone(),
                self.driver.changes(),
                self.options.autoload_interval,
                self.reporter(),
                ready,
            ));
            started
        };
        // Dropped without firing if the persister was destroyed meanwhile.
        let _ = ready.await;
        Ok(())
    }

    /// Save now, then save after every burst of caller edits to the store.
    ///
    /// Returns once the first save finished.
    pub async fn start_auto_save(&self) -> Result<()> {
        let ready = {
            let mut controller = self.controller.lock();
            if controller.is_destroyed() {
                return Err(PersistError::PersisterDestroyed);
            }
            if controller.is_auto_saving() {
                return Ok(());
            }
            let (ready, started) = oneshot::channel();
            controller.set_auto_save(spawn_auto_save(
                self.worker.clone(),
                self.store.subscribe(),
                self.options.autosave_debounce,
                self.reporter(),
                ready,
            ));
            started
        };
        let _ = ready.await;
        Ok(())
    }

    pub fn stop_auto_load(&self) {
        if let Some(task) = self.controller.lock().take_auto_load() {
            task.stop();
            tracing::debug!(persister_id = %self.id(), "Auto-load stopping");
        }
    }

    pub fn stop_auto_save(&self) {
        if let Some(task) = self.controller.lock().take_auto_save() {
            if let Some(id) = task.subscription() {
                self.store.unsubscribe(id);
            }
            task.stop();
            tracing::debug!(persister_id = %self.id(), "Auto-save stopping");
        }
    }

    /// Stop everything. Later calls fail with
    /// [`PersistError::PersisterDestroyed`].
    ///
    /// An operation already running completes; queued ones fail.
    pub fn destroy(&self) {
        let (auto_load, auto_save) = {
            let mut controller = self.controller.lock();
            if controller.is_destroyed() {
                return;
            }
            self.worker.shared().mark_destroyed();
            controller.destroy()
        };

        if let Some(task) = auto_load {
            task.stop();
        }
        if let Some(task) = auto_save {
            if let Some(id) = task.subscription() {
                self.store.unsubscribe(id);
            }
            task.stop();
        }
        // The worker exits on its own once it reaches this request.
        self.worker.destroy();

        tracing::info!(persister_id = %self.id(), "Persister destroyed");
    }

    /// The configuration this persister was created with.
    pub fn config(&self) -> &DatabasePersisterConfig {
        &self.config
    }

    /// The validated mode derived from the configuration.
    pub fn mode(&self) -> &PersistMode {
        &self.mode
    }

    pub fn options(&self) -> &PersisterOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn ReactiveStore> {
        &self.store
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    pub fn is_auto_loading(&self) -> bool {
        self.controller.lock().is_auto_loading()
    }

    pub fn is_auto_saving(&self) -> bool {
        self.controller.lock().is_auto_saving()
    }

    pub fn state(&self) -> SyncState {
        self.controller.lock().state()
    }

    pub fn stats(&self) -> PersisterStats {
        self.worker.shared().stats()
    }

    fn reporter(&self) -> ErrorReporter {
        ErrorReporter::new(self.worker.clone(), self.options.on_error.clone())
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("id", &self.id())
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
