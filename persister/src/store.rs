//! Reactive stores.
//!
//! A persister needs only a few things from a store: read its content,
//! edit it atomically, and subscribe to or unsubscribe from changes. Every
//! change event carries its [`ChangeOrigin`], which is how auto-save tells
//! edits made by callers apart from content a load just applied.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and
//! the tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use stowage_engine::{CellValue, Content, Row, Table, TableId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// Buffered events per subscription. When full, further events are dropped:
/// a subscriber that has not drained one event already knows it must look.
const SUBSCRIPTION_CAPACITY: usize = 64;

/// Subscription identifier, unique per store.
pub type SubscriptionId = u64;

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// A caller edited the store.
    Caller,
    /// A persister applied loaded content.
    Load,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    /// Tables whose content changed.
    pub tables: Vec<TableId>,
    /// Whether any value changed.
    pub values: bool,
}

/// Receiving end of a store subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, receiver: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ChangeEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// What a persister requires of a store.
pub trait ReactiveStore: Send + Sync {
    /// Snapshot of the whole content.
    fn get_content(&self) -> Content;

    /// Replace the whole content, notifying subscribers if anything changed.
    fn set_content(&self, content: Content, origin: ChangeOrigin);

    /// Edit the content in place while holding the store's write lock, then
    /// notify subscribers if anything changed. No other edit can land
    /// between what `edit` sees and what it writes.
    fn update(&self, origin: ChangeOrigin, edit: &mut dyn FnMut(&mut Content));

    fn subscribe(&self) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// An in-memory reactive store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    content: RwLock<Content>,
    listeners: DashMap<SubscriptionId, mpsc::Sender<ChangeEvent>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store wrapped in `Arc` for sharing with persisters.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_content(content: Content) -> Self {
        Self {
            content: RwLock::new(content),
            ..Self::default()
        }
    }

    pub fn get_tables(&self) -> stowage_engine::Tables {
        self.content.read().tables.clone()
    }

    pub fn get_table(&self, table_id: &str) -> Option<Table> {
        self.content.read().table(table_id).cloned()
    }

    pub fn get_row(&self, table_id: &str, row_id: &str) -> Option<Row> {
        self.content.read().row(table_id, row_id).cloned()
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<CellValue> {
        self.content.read().cell(table_id, row_id, cell_id).cloned()
    }

    pub fn get_value(&self, value_id: &str) -> Option<CellValue> {
        self.content.read().value(value_id).cloned()
    }

    pub fn set_cell(&self, table_id: &str, row_id: &str, cell_id: &str, cell: impl Into<CellValue>) {
        let cell = cell.into();
        self.transaction(|content| {
            content.set_cell(table_id, row_id, cell_id, cell);
        });
    }

    pub fn set_row(&self, table_id: &str, row_id: &str, row: Row) {
        self.transaction(|content| {
            content.set_row(table_id, row_id, row);
        });
    }

    pub fn set_table(&self, table_id: &str, table: Table) {
        self.transaction(|content| {
            content.set_table(table_id, table);
        });
    }

    pub fn set_value(&self, value_id: &str, value: impl Into<CellValue>) {
        let value = value.into();
        self.transaction(|content| {
            content.set_value(value_id, value);
        });
    }

    pub fn delete_table(&self, table_id: &str) {
        self.transaction(|content| {
            content.remove_table(table_id);
        });
    }

    pub fn delete_row(&self, table_id: &str, row_id: &str) {
        self.transaction(|content| {
            content.remove_row(table_id, row_id);
        });
    }

    pub fn delete_cell(&self, table_id: &str, row_id: &str, cell_id: &str) {
        self.transaction(|content| {
            content.remove_cell(table_id, row_id, cell_id);
        });
    }

    pub fn delete_value(&self, value_id: &str) {
        self.transaction(|content| {
            content.remove_value(value_id);
        });
    }

    /// Apply several edits as one change with a single event.
    pub fn transaction<R>(&self, edit: impl FnOnce(&mut Content) -> R) -> R {
        self.mutate(ChangeOrigin::Caller, edit)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    fn mutate<R>(&self, origin: ChangeOrigin, edit: impl FnOnce(&mut Content) -> R) -> R {
        let (result, event) = {
            let mut content = self.content.write();
            let before = content.clone();
            let result = edit(&mut *content);
            (result, diff(&before, &content, origin))
        };
        if let Some(event) = event {
            self.notify(event);
        }
        result
    }

    fn notify(&self, event: ChangeEvent) {
        let mut closed = Vec::new();
        for listener in self.listeners.iter() {
            match listener.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(subscription = *listener.key(), "Subscriber lagging, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*listener.key()),
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

impl ReactiveStore for MemoryStore {
    fn get_content(&self) -> Content {
        self.content.read().clone()
    }

    fn set_content(&self, content: Content, origin: ChangeOrigin) {
        self.mutate(origin, move |current| *current = content);
    }

    fn update(&self, origin: ChangeOrigin, edit: &mut dyn FnMut(&mut Content)) {
        self.mutate(origin, |content| edit(content));
    }

    fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.listeners.insert(id, sender);
        Subscription::new(id, receiver)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.remove(&id);
    }
}

/// The event describing `before -> after`, or `None` if nothing changed.
fn diff(before: &Content, after: &Content, origin: ChangeOrigin) -> Option<ChangeEvent> {
    let table_ids: BTreeSet<&TableId> = before.tables.keys().chain(after.tables.keys()).collect();
    let tables: Vec<TableId> = table_ids
        .into_iter()
        .filter(|id| before.tables.get(*id) != after.tables.get(*id))
        .cloned()
        .collect();
    let values = before.values != after.values;

    if tables.is_empty() && !values {
        return None;
    }
    Some(ChangeEvent {
        origin,
        tables,
        values,
    })
}
