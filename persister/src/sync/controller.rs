//! Auto-load and auto-save lifecycle.
//!
//! Each direction runs as its own background task that feeds the worker.
//! Auto-save listens to the store and saves only for changes a caller made;
//! changes tagged [`ChangeOrigin::Load`] were just read from the medium and
//! writing them back would start a load/save cycle. Auto-load listens to the
//! driver's change feed, or polls when there is none.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::worker::WorkerHandle;
use super::Trigger;
use crate::config::ErrorHook;
use crate::error::PersistError;
use crate::store::{ChangeOrigin, Subscription, SubscriptionId};

/// Lifecycle state of a persister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Idle,
    AutoLoadActive,
    AutoSaveActive,
    Both,
    Destroyed,
}

/// A running auto task.
pub(crate) struct AutoTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    subscription: Option<SubscriptionId>,
}

impl AutoTask {
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Stop scheduling. An operation already handed to the worker completes.
    pub fn stop(self) {
        if self.stop.send(()).is_err() {
            trace!("Auto task already finished");
        }
        drop(self.handle);
    }
}

/// Tracks which auto tasks are running.
#[derive(Default)]
pub(crate) struct SyncController {
    auto_load: Option<AutoTask>,
    auto_save: Option<AutoTask>,
    destroyed: bool,
}

impl SyncController {
    pub fn state(&self) -> SyncState {
        match (self.destroyed, self.auto_load.is_some(), self.auto_save.is_some()) {
            (true, _, _) => SyncState::Destroyed,
            (false, true, true) => SyncState::Both,
            (false, true, false) => SyncState::AutoLoadActive,
            (false, false, true) => SyncState::AutoSaveActive,
            (false, false, false) => SyncState::Idle,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_auto_loading(&self) -> bool {
        self.auto_load.is_some()
    }

    pub fn is_auto_saving(&self) -> bool {
        self.auto_save.is_some()
    }

    pub fn set_auto_load(&mut self, task: AutoTask) {
        self.auto_load = Some(task);
    }

    pub fn set_auto_save(&mut self, task: AutoTask) {
        self.auto_save = Some(task);
    }

    pub fn take_auto_load(&mut self) -> Option<AutoTask> {
        self.auto_load.take()
    }

    pub fn take_auto_save(&mut self) -> Option<AutoTask> {
        self.auto_save.take()
    }

    /// Enter `Destroyed`, handing back whatever was running.
    pub fn destroy(&mut self) -> (Option<AutoTask>, Option<AutoTask>) {
        self.destroyed = true;
        (self.auto_load.take(), self.auto_save.take())
    }
}

/// Logs and forwards background errors.
#[derive(Clone)]
pub(crate) struct ErrorReporter {
    worker: WorkerHandle,
    hook: Option<ErrorHook>,
}

impl ErrorReporter {
    pub fn new(worker: WorkerHandle, hook: Option<ErrorHook>) -> Self {
        Self { worker, hook }
    }

    fn report(&self, task: &'static str, err: &PersistError) {
        warn!(persister_id = %self.worker.shared().id, task, error = %err, "Automatic sync failed");
        self.worker.shared().record_auto_error();
        if let Some(hook) = &self.hook {
            hook(err);
        }
    }
}

/// Start auto-load: one immediate load, then one per change notification or
/// poll tick. `ready` fires once the first load finished.
pub(crate) fn spawn_auto_load(
    worker: WorkerHandle,
    changes: Option<broadcast::Receiver<()>>,
    interval: Duration,
    reporter: ErrorReporter,
    ready: oneshot::Sender<()>,
) -> AutoTask {
    let (stop, stopped) = oneshot::channel();
    let handle = tokio::spawn(auto_load_loop(worker, changes, interval, reporter, ready, stopped));
    AutoTask {
        stop,
        handle,
        subscription: None,
    }
}

/// Start auto-save: one immediate save, then a save per burst of caller
/// changes. `ready` fires once the first save finished.
pub(crate) fn spawn_auto_save(
    worker: WorkerHandle,
    subscription: Subscription,
    debounce: Duration,
    reporter: ErrorReporter,
    ready: oneshot::Sender<()>,
) -> AutoTask {
    let (stop, stopped) = oneshot::channel();
    let id = subscription.id();
    let handle = tokio::spawn(auto_save_loop(worker, subscription, debounce, reporter, ready, stopped));
    AutoTask {
        stop,
        handle,
        subscription: Some(id),
    }
}

/// Wait for the next change notification. `false` once the feed is gone.
async fn next_change(changes: &mut Option<broadcast::Receiver<()>>) -> bool {
    match changes {
        Some(receiver) => match receiver.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        },
        None => std::future::pending().await,
    }
}

async fn auto_load_loop(
    worker: WorkerHandle,
    mut changes: Option<broadcast::Receiver<()>>,
    interval: Duration,
    reporter: ErrorReporter,
    ready: oneshot::Sender<()>,
    mut stopped: oneshot::Receiver<()>,
) {
    let interval = interval.max(Duration::from_millis(1));
    debug!(
        persister_id = %worker.shared().id,
        native = changes.is_some(),
        interval_ms = interval.as_millis() as u64,
        "Auto-load started"
    );

    if !load_once(&worker, &reporter).await {
        return;
    }
    let _ = ready.send(());

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let polling = changes.is_none();
        let notified = tokio::select! {
            biased;
            _ = &mut stopped => break,
            notified = next_change(&mut changes), if !polling => notified,
            _ = ticker.tick(), if polling => true,
        };

        if !notified {
            warn!(persister_id = %worker.shared().id, "Change feed closed, falling back to polling");
            changes = None;
            continue;
        }
        // Coalesce notifications that piled up meanwhile.
        if let Some(receiver) = changes.as_mut() {
            while receiver.try_recv().is_ok() {}
        }

        if !load_once(&worker, &reporter).await {
            break;
        }
    }

    debug!(persister_id = %worker.shared().id, "Auto-load stopped");
}

/// Run one auto load. `false` once the persister is destroyed.
async fn load_once(worker: &WorkerHandle, reporter: &ErrorReporter) -> bool {
    match worker.load(Trigger::Auto).await {
        Ok(_) => true,
        Err(PersistError::PersisterDestroyed) => false,
        Err(e) => {
            reporter.report("auto-load", &e);
            true
        }
    }
}

async fn auto_save_loop(
    worker: WorkerHandle,
    mut subscription: Subscription,
    debounce: Duration,
    reporter: ErrorReporter,
    ready: oneshot::Sender<()>,
    mut stopped: oneshot::Receiver<()>,
) {
    debug!(
        persister_id = %worker.shared().id,
        debounce_ms = debounce.as_millis() as u64,
        "Auto-save started"
    );

    if !save_once(&worker, &reporter).await {
        return;
    }
    let _ = ready.send(());

    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stopped => break,
            event = subscription.recv() => event,
        };
        // Unsubscribed.
        let Some(event) = event else { break };
        let mut by_caller = event.origin == ChangeOrigin::Caller;

        // Let the rest of a burst arrive, then take it all at once.
        if debounce.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                biased;
                _ = &mut stopped => break,
                _ = tokio::time::sleep(debounce) => {}
            }
        }
        while let Ok(event) = subscription.try_recv() {
            by_caller |= event.origin == ChangeOrigin::Caller;
        }

        if !by_caller {
            trace!(persister_id = %worker.shared().id, "Ignoring changes applied by a load");
            continue;
        }
        if !save_once(&worker, &reporter).await {
            break;
        }
    }

    debug!(persister_id = %worker.shared().id, "Auto-save stopped");
}

/// Run one auto save. `false` once the persister is destroyed.
async fn save_once(worker: &WorkerHandle, reporter: &ErrorReporter) -> bool {
    match worker.save(Trigger::Auto).await {
        Ok(_) => true,
        Err(PersistError::PersisterDestroyed) => false,
        Err(e) => {
            reporter.report("auto-save", &e);
            true
        }
    }
}
