//! Per-persister worker task.
//!
//! The worker owns the reconciler and runs every load and save of one
//! persister, one at a time, in the order they were requested. Callers talk
//! to it through a [`WorkerHandle`] and wait on a oneshot reply, so two
//! overlapping saves never interleave their commands against the medium.
//!
//! Once the persister is destroyed, queued requests are answered with
//! [`PersistError::PersisterDestroyed`] and the fingerprint cache is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use stowage_engine::{
    codec, plan_load, plan_save, Content, ExternalSnapshot, Fingerprint, LoadStep, Loaded, PersistMode, Reconciler, Table,
    Target, Values,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LoadReport, PersisterStats, SaveReport, Trigger};
use crate::error::{PersistError, Result, TableFailure};
use crate::medium::MediumAdapter;
use crate::store::{ChangeOrigin, ReactiveStore};

/// Requests handled by the worker.
pub(crate) enum Request {
    Load {
        trigger: Trigger,
        reply: oneshot::Sender<Result<LoadReport>>,
    },
    Save {
        trigger: Trigger,
        reply: oneshot::Sender<Result<SaveReport>>,
    },
    /// Drop cached state and stop.
    Destroy,
}

/// State shared between the facade, the worker and the auto tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    pub id: Uuid,
    destroyed: AtomicBool,
    stats: Mutex<PersisterStats>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            destroyed: AtomicBool::new(false),
            stats: Mutex::new(PersisterStats::default()),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> PersisterStats {
        self.stats.lock().clone()
    }

    pub fn record_auto_error(&self) {
        self.stats.lock().auto_errors += 1;
    }
}

/// Cloneable sender side of a worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    sender: mpsc::Sender<Request>,
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub async fn load(&self, trigger: Trigger) -> Result<LoadReport> {
        self.request(|reply| Request::Load { trigger, reply }).await
    }

    pub async fn save(&self, trigger: Trigger) -> Result<SaveReport> {
        self.request(|reply| Request::Save { trigger, reply }).await
    }

    /// Ask the worker to drop its cache and stop. Never waits.
    pub fn destroy(&self) {
        if self.sender.try_send(Request::Destroy).is_err() {
            // Queue full: the worker sees the flag on its next request.
            debug!(persister_id = %self.shared.id, "Destroy request not queued");
        }
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        if self.shared.is_destroyed() {
            return Err(PersistError::PersisterDestroyed);
        }
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| PersistError::PersisterDestroyed)?;
        response.await.map_err(|_| PersistError::PersisterDestroyed)?
    }
}

/// A store table or the values, as decoded from one load step.
enum Read {
    Table(Table),
    Values(Values),
}

/// The worker itself. Lives on its own task.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    mode: Arc<PersistMode>,
    store: Arc<dyn ReactiveStore>,
    medium: MediumAdapter,
    reconciler: Reconciler,
    receiver: mpsc::Receiver<Request>,
}

impl Worker {
    /// Spawn a worker and return its handle.
    pub fn spawn(
        shared: Arc<Shared>,
        mode: Arc<PersistMode>,
        store: Arc<dyn ReactiveStore>,
        medium: MediumAdapter,
        capacity: usize,
    ) -> WorkerHandle {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let reconciler = match medium.driver().dialect().row_normalizer() {
            Some(normalize) => Reconciler::with_row_normalizer(normalize),
            None => Reconciler::new(),
        };
        let worker = Worker {
            shared: shared.clone(),
            mode,
            store,
            medium,
            reconciler,
            receiver,
        };
        tokio::spawn(worker.run());
        WorkerHandle { sender, shared }
    }

    async fn run(mut self) {
        debug!(persister_id = %self.shared.id, "Worker started");

        while let Some(request) = self.receiver.recv().await {
            if self.shared.is_destroyed() {
                self.reconciler.clear();
                match request {
                    Request::Load { reply, .. } => {
                        let _ = reply.send(Err(PersistError::PersisterDestroyed));
                    }
                    Request::Save { reply, .. } => {
                        let _ = reply.send(Err(PersistError::PersisterDestroyed));
                    }
                    Request::Destroy => break,
                }
                continue;
            }

            match request {
                Request::Load { trigger, reply } => {
                    let result = self.load(trigger).await;
                    let _ = reply.send(result);
                }
                Request::Save { trigger, reply } => {
                    let result = self.save(trigger).await;
                    let _ = reply.send(result);
                }
                Request::Destroy => {
                    self.reconciler.clear();
                    break;
                }
            }
        }

        debug!(persister_id = %self.shared.id, "Worker stopped");
    }

    // ========================================================================
    // Load
    // ========================================================================

    async fn load(&mut self, trigger: Trigger) -> Result<LoadReport> {
        let started = Instant::now();
        let mode = self.mode.clone();
        let result = match mode.as_ref() {
            PersistMode::Json {
                store_column_name, ..
            } => self.load_json(store_column_name, trigger).await,
            PersistMode::Tabular { .. } => self.load_tabular(&mode, trigger).await,
        };

        let mut stats = self.shared.stats.lock();
        stats.loads += 1;
        match &result {
            Ok(report) => {
                if report.applied {
                    stats.loads_applied += 1;
                }
                stats.last_load_at = Some(Utc::now());
                debug!(
                    persister_id = %self.shared.id,
                    ?trigger,
                    applied = report.applied,
                    tables = report.tables.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Load finished"
                );
            }
            Err(e) => {
                stats.failures += 1;
                debug!(persister_id = %self.shared.id, ?trigger, error = %e, "Load failed");
            }
        }
        result
    }

    async fn load_json(&mut self, store_column: &str, trigger: Trigger) -> Result<LoadReport> {
        let Some(step) = plan_load(&self.mode).into_iter().next() else {
            return Ok(LoadReport::default());
        };
        let rows = self.medium.read(&step.command).await?.unwrap_or_default();
        let Some(external) = codec::decode_json_rows(&rows, &step.db_table.row_id_column, store_column)? else {
            debug!(persister_id = %self.shared.id, table = %step.db_table.name, "No stored content yet");
            return Ok(LoadReport::default());
        };

        let fingerprint = self.reconciler.fingerprint_loaded(
            &step.db_table,
            &Loaded::Store {
                store_column,
                content: &external,
            },
        )?;
        let tables: Vec<_> = external.tables.keys().cloned().collect();

        if trigger == Trigger::Auto && self.reconciler.is_synced(&step.target, &fingerprint) {
            return Ok(LoadReport {
                applied: false,
                tables,
                warnings: Vec::new(),
            });
        }

        let applied = self.apply(ExternalSnapshot::Json(Some(external)))?;
        self.reconciler.record(step.target, fingerprint);

        Ok(LoadReport {
            applied,
            tables,
            warnings: Vec::new(),
        })
    }

    async fn load_tabular(&mut self, mode: &PersistMode, trigger: Trigger) -> Result<LoadReport> {
        let steps = plan_load(mode);
        let total = steps.len();

        let mut loaded: Vec<(LoadStep, Read, Fingerprint)> = Vec::new();
        let mut failures: Vec<(TableFailure, PersistError)> = Vec::new();
        let mut warnings = Vec::new();

        for step in steps {
            match self.read(&step, &mut warnings).await {
                Ok(Some((read, fingerprint))) => loaded.push((step, read, fingerprint)),
                Ok(None) => {
                    debug!(persister_id = %self.shared.id, table = %step.db_table.name, "Table absent, nothing to load");
                }
                Err(e) => {
                    warn!(
                        persister_id = %self.shared.id,
                        table = %step.db_table.name,
                        error = %e,
                        "Table failed to load"
                    );
                    let table_id = match &step.target {
                        Target::Table { table_id, .. } => Some(table_id.clone()),
                        _ => None,
                    };
                    failures.push((
                        TableFailure {
                            table_id,
                            db_table: step.db_table.name.clone(),
                            reason: e.to_string(),
                        },
                        e,
                    ));
                }
            }
        }

        // Every read failed on the medium itself: that is an outage, not bad data.
        if loaded.is_empty()
            && failures.len() == total
            && failures
                .iter()
                .all(|(_, e)| matches!(e, PersistError::MediumUnavailable(_)))
        {
            return Err(failures.remove(0).1);
        }

        let mut tables = Vec::new();
        let mut values = None;
        let mut table_ids = Vec::new();
        for (step, read, fingerprint) in loaded {
            if let Read::Table(_) = &read {
                if let Target::Table { table_id, .. } = &step.target {
                    table_ids.push(table_id.clone());
                }
            }
            // Unchanged since the last sync: local edits are newer.
            let unchanged = trigger == Trigger::Auto && self.reconciler.is_synced(&step.target, &fingerprint);
            self.reconciler.record(step.target.clone(), fingerprint);
            if unchanged {
                continue;
            }
            match (read, &step.target) {
                (Read::Table(table), Target::Table { table_id, .. }) => tables.push((table_id.clone(), table)),
                (Read::Values(read), _) => values = Some(read),
                _ => {}
            }
        }

        let applied = if !tables.is_empty() || values.is_some() {
            self.apply(ExternalSnapshot::Tabular { tables, values })?
        } else {
            false
        };

        if !failures.is_empty() {
            return Err(PersistError::PartialLoadFailure {
                failed: failures.into_iter().map(|(failure, _)| failure).collect(),
                applied: table_ids,
            });
        }

        Ok(LoadReport {
            applied,
            tables: table_ids,
            warnings,
        })
    }

    /// Merge `external` into the store under the store's own lock, so an edit
    /// racing the load is merged with rather than overwritten. Returns whether
    /// the store changed.
    fn apply(&self, external: ExternalSnapshot) -> Result<bool> {
        let reconciler = &self.reconciler;
        let mut external = Some(external);
        let mut outcome = Ok(false);
        self.store.update(ChangeOrigin::Load, &mut |content: &mut Content| {
            let Some(external) = external.take() else { return };
            outcome = reconciler
                .merge(external, content)
                .map(|merge| {
                    if merge.changed {
                        *content = merge.content;
                    }
                    merge.changed
                })
                .map_err(PersistError::from);
        });
        outcome
    }

    /// Read and decode one tabular step. `None` if its table does not exist.
    async fn read(&self, step: &LoadStep, warnings: &mut Vec<String>) -> Result<Option<(Read, Fingerprint)>> {
        let Some(rows) = self.medium.read(&step.command).await? else {
            return Ok(None);
        };
        let row_id_column = &step.db_table.row_id_column;

        let read = match &step.target {
            Target::Values { .. } => {
                let decoded = codec::decode_values(&rows, row_id_column)?;
                let fingerprint = self
                    .reconciler
                    .fingerprint_loaded(&step.db_table, &Loaded::Values(&decoded.content))?;
                warnings.extend(decoded.warnings.into_iter().map(|w| format!("{}: {}", step.db_table.name, w)));
                (Read::Values(decoded.content), fingerprint)
            }
            Target::Table { table_id, .. } => {
                let decoded = codec::decode_table(&rows, row_id_column)?;
                let fingerprint = self.reconciler.fingerprint_loaded(
                    &step.db_table,
                    &Loaded::Table {
                        table_id,
                        table: &decoded.content,
                    },
                )?;
                warnings.extend(decoded.warnings.into_iter().map(|w| format!("{}: {}", step.db_table.name, w)));
                (Read::Table(decoded.content), fingerprint)
            }
            Target::Store { .. } => return Ok(None),
        };
        Ok(Some(read))
    }

    // ========================================================================
    // Save
    // ========================================================================

    async fn save(&mut self, trigger: Trigger) -> Result<SaveReport> {
        let started = Instant::now();
        let result = self.write().await;

        let mut stats = self.shared.stats.lock();
        stats.saves += 1;
        match &result {
            Ok(report) if report.is_skipped() => {
                stats.saves_skipped += 1;
                debug!(persister_id = %self.shared.id, ?trigger, "Save skipped, nothing changed");
            }
            Ok(report) => {
                stats.saves_written += 1;
                stats.write_commands += report.commands as u64;
                stats.last_save_at = Some(Utc::now());
                info!(
                    persister_id = %self.shared.id,
                    ?trigger,
                    targets = report.written.len(),
                    commands = report.commands,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Saved"
                );
            }
            Err(e) => {
                stats.failures += 1;
                debug!(persister_id = %self.shared.id, ?trigger, error = %e, "Save failed");
            }
        }
        result
    }

    async fn write(&mut self) -> Result<SaveReport> {
        let content = self.store.get_content();
        let wire = codec::encode(&content, &self.mode)?;
        let pending = self.reconciler.pending(plan_save(&wire))?;

        let mut report = SaveReport::default();
        for (step, fingerprint) in pending {
            // A failed step keeps its old fingerprint, so the next save retries it.
            let commands = self.medium.write(&step).await?;
            self.reconciler.record(step.target.clone(), fingerprint);
            report.commands += commands;
            report.written.push(step.target);
        }
        Ok(report)
    }
}
