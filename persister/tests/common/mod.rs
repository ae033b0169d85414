//! Shared helpers for persister integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stowage_engine::DbRow;
use stowage_persister::db::{Dialect, Driver, Param, SqliteDriver, Statement};
use stowage_persister::DriverError;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// An in-memory SQLite driver that counts writes, can be made to fail, and
/// optionally announces committed writes like a native change feed.
pub struct RecordingDriver {
    inner: SqliteDriver,
    writes: AtomicUsize,
    reads: AtomicUsize,
    failing: AtomicBool,
    changes: Option<broadcast::Sender<()>>,
}

impl RecordingDriver {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self::build(None).await)
    }

    pub async fn notifying() -> Arc<Self> {
        let (sender, _) = broadcast::channel(16);
        Arc::new(Self::build(Some(sender)).await)
    }

    async fn build(changes: Option<broadcast::Sender<()>>) -> Self {
        Self {
            inner: SqliteDriver::memory().await.expect("in-memory sqlite"),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            changes,
        }
    }

    /// Write directly, as another process would. Not counted.
    pub async fn external(&self, sql: &str, params: &[Param]) {
        self.inner.run(sql, params).await.expect("external write");
        if let Some(changes) = &self.changes {
            let _ = changes.send(());
        }
    }

    /// Read directly. Not counted.
    pub async fn rows(&self, table: &str) -> Vec<DbRow> {
        self.inner
            .execute(&format!("SELECT * FROM \"{}\" ORDER BY 1", table), &[])
            .await
            .expect("read rows")
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DriverError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    async fn execute(&self, sql: &str, params: &[Param]) -> Result<Vec<DbRow>, DriverError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(sql, params).await
    }

    async fn run(&self, sql: &str, params: &[Param]) -> Result<u64, DriverError> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.run(sql, params).await
    }

    async fn transaction(&self, statements: &[Statement]) -> Result<u64, DriverError> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let affected = self.inner.transaction(statements).await?;
        if let Some(changes) = &self.changes {
            let _ = changes.send(());
        }
        Ok(affected)
    }

    fn changes(&self) -> Option<broadcast::Receiver<()>> {
        self.changes.as_ref().map(|c| c.subscribe())
    }
}

/// Wait until `check` holds, failing the test after a few seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give background tasks time to do anything they were going to do.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
