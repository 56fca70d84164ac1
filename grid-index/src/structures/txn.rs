//! Transaction buffer for deferred node writes.
//!
//! A [`Txn`] pairs one native grid transaction with the set of records
//! changed and deleted during a unit of work. Nothing reaches the grid until
//! [`Txn::commit`], which fans out one persist per changed record and one
//! delete per deleted record, waits for all of them under the configured
//! timeout and only then commits the native transaction.
//!
//! Every record is flushed at most once per commit no matter how many times
//! it was marked. Marking a record deleted withdraws it from the changed set.
//!
//! Abort, rollback, a failed commit and dropping an unfinished buffer all
//! discard the in-memory edits of the buffered records.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::grid::{GridError, GridTxn, NodeId, await_pending};
use crate::structures::persistent::{Flushable, GridContext};

/// A unit of work against the grid.
pub struct Txn {
    context: GridContext,
    native: GridTxn,
    changed: HashMap<NodeId, Arc<dyn Flushable>>,
    deleted: HashMap<NodeId, Arc<dyn Flushable>>,
    finished: bool,
}

impl Txn {
    /// Begin a new native transaction and an empty buffer for it.
    #[must_use]
    pub fn begin(context: &GridContext) -> Self {
        let native = context.grid().begin_transaction();
        Self::with_native(context, native)
    }

    /// Wrap an already started native transaction.
    #[must_use]
    pub fn with_native(context: &GridContext, native: GridTxn) -> Self {
        Self {
            context: context.clone(),
            native,
            changed: HashMap::new(),
            deleted: HashMap::new(),
            finished: false,
        }
    }

    #[must_use]
    pub const fn context(&self) -> &GridContext {
        &self.context
    }

    /// The native transaction writes are staged under.
    #[must_use]
    pub const fn native(&self) -> GridTxn {
        self.native
    }

    /// Whether the transaction was committed, aborted or rolled back.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Register a record as changed. Repeated marks are idempotent.
    pub fn mark_changed(&mut self, record: Arc<dyn Flushable>) {
        self.changed.insert(record.record_id(), record);
    }

    /// Register a record as deleted, withdrawing it from the changed set.
    pub fn mark_deleted(&mut self, record: Arc<dyn Flushable>) {
        let id = record.record_id();
        self.changed.remove(&id);
        self.deleted.insert(id, record);
    }

    #[must_use]
    pub fn changed_count(&self) -> usize {
        self.changed.len()
    }

    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Flush every buffered record and commit the native transaction.
    ///
    /// Any failed or expired flush aborts the native transaction and is
    /// returned as a single error. The buffers are empty afterwards on every
    /// outcome.
    pub async fn commit(&mut self) -> Result<(), TxnError> {
        if self.finished {
            return Err(TxnError::Finished);
        }
        self.finished = true;

        let changed = std::mem::take(&mut self.changed);
        let deleted = std::mem::take(&mut self.deleted);
        let timeout = self.context.config().op_timeout;
        let native = self.native;

        let mut pending = Vec::with_capacity(changed.len() + deleted.len());
        for (id, record) in &changed {
            if !deleted.contains_key(id) {
                pending.push((*id, record.persist_async(native)));
            }
        }
        let persists = pending.len();
        for (id, record) in &deleted {
            pending.push((*id, record.delete_async(native)));
        }
        tracing::debug!(
            "Flushing transaction {}: {} persists, {} deletes",
            native.0,
            persists,
            pending.len() - persists
        );

        let results = join_all(
            pending
                .into_iter()
                .map(|(id, op)| async move { (id, await_pending(op, timeout).await) }),
        )
        .await;

        if let Some((id, source)) = results
            .into_iter()
            .find_map(|(id, result)| result.err().map(|e| (id, e)))
        {
            tracing::warn!(
                "Flush of record {id} failed in transaction {}: {source}; aborting",
                native.0
            );
            if let Err(e) = self.context.grid().abort(native) {
                tracing::warn!("Failed to abort transaction {}: {e}", native.0);
            }
            discard_all(changed, deleted);
            return Err(TxnError::Flush { id, source });
        }

        if let Err(e) = self.context.grid().commit(native) {
            tracing::warn!("Commit of transaction {} failed: {e}", native.0);
            discard_all(changed, deleted);
            return Err(TxnError::Grid(e));
        }
        Ok(())
    }

    /// Abort the native transaction and drop the buffered changes.
    pub fn abort(&mut self) -> Result<(), TxnError> {
        if self.finished {
            return Err(TxnError::Finished);
        }
        self.finish();
        self.context.grid().abort(self.native)?;
        Ok(())
    }

    /// Roll back through the grid's native rollback.
    ///
    /// Unlike `abort` this is allowed after a commit attempt, so callers can
    /// undo a unit of work whose commit already happened or failed. Records
    /// the buffer already flushed are not undone by the buffer itself.
    pub fn rollback(&mut self) -> Result<(), TxnError> {
        self.finish();
        self.context.grid().rollback(self.native)?;
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        discard_all(
            std::mem::take(&mut self.changed),
            std::mem::take(&mut self.deleted),
        );
    }
}

/// Drop the in-memory edits of every record a failed unit of work touched.
fn discard_all(
    changed: HashMap<NodeId, Arc<dyn Flushable>>,
    deleted: HashMap<NodeId, Arc<dyn Flushable>>,
) {
    for record in changed.into_values().chain(deleted.into_values()) {
        record.discard();
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.finished && !(self.changed.is_empty() && self.deleted.is_empty()) {
            tracing::warn!(
                "Transaction {} dropped with {} changed and {} deleted records never committed",
                self.native.0,
                self.changed.len(),
                self.deleted.len()
            );
            self.finish();
        }
    }
}

/// Errors that can occur during transaction operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// The transaction was already committed, aborted or rolled back.
    Finished,
    /// A record flush failed or timed out.
    Flush { id: NodeId, source: GridError },
    /// The grid rejected the native transaction operation.
    Grid(GridError),
}

impl std::fmt::Display for TxnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finished => write!(f, "transaction already finished"),
            Self::Flush { id, source } => write!(f, "failed to flush record {id}: {source}"),
            Self::Grid(e) => write!(f, "grid error: {e}"),
        }
    }
}

impl std::error::Error for TxnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Flush { source, .. } => Some(source),
            Self::Grid(e) => Some(e),
            Self::Finished => None,
        }
    }
}

impl From<GridError> for TxnError {
    fn from(e: GridError) -> Self {
        Self::Grid(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::grid::{FaultConfig, Grid, MemoryGrid, PendingOp};
    use futures::FutureExt;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every flush instead of talking to the grid.
    struct Probe {
        id: NodeId,
        grid: MemoryGrid,
        log: Arc<Mutex<Vec<(NodeId, &'static str)>>>,
    }

    impl Probe {
        fn new(id: NodeId, grid: &MemoryGrid, log: &Arc<Mutex<Vec<(NodeId, &'static str)>>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                grid: grid.clone(),
                log: Arc::clone(log),
            })
        }
    }

    impl Flushable for Probe {
        fn record_id(&self) -> NodeId {
            self.id
        }

        fn persist_async(&self, txn: GridTxn) -> PendingOp {
            self.log.lock().expect("log lock").push((self.id, "persist"));
            self.grid.set(self.id, vec![1], txn)
        }

        fn delete_async(&self, txn: GridTxn) -> PendingOp {
            self.log.lock().expect("log lock").push((self.id, "delete"));
            self.grid.delete(self.id, txn)
        }

        fn discard(&self) {
            self.log.lock().expect("log lock").push((self.id, "discard"));
        }
    }

    /// Never finishes.
    struct Stalled(NodeId);

    impl Flushable for Stalled {
        fn record_id(&self) -> NodeId {
            self.0
        }

        fn persist_async(&self, _txn: GridTxn) -> PendingOp {
            futures::future::pending().boxed()
        }

        fn delete_async(&self, _txn: GridTxn) -> PendingOp {
            futures::future::pending().boxed()
        }

        fn discard(&self) {}
    }

    fn context(grid: &MemoryGrid, timeout: Duration) -> GridContext {
        let config = IndexConfig {
            op_timeout: timeout,
            ..IndexConfig::default()
        };
        GridContext::new(Arc::new(grid.clone()), config).expect("valid config")
    }

    fn sorted(log: &Arc<Mutex<Vec<(NodeId, &'static str)>>>) -> Vec<(NodeId, &'static str)> {
        let mut entries = log.lock().expect("log lock").clone();
        entries.sort_unstable();
        entries
    }

    #[tokio::test]
    async fn test_each_record_flushed_once() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let a = grid.allocate(txn.native()).expect("allocate");
        let b = grid.allocate(txn.native()).expect("allocate");
        for _ in 0..3 {
            txn.mark_changed(Probe::new(a, &grid, &log));
        }
        txn.mark_changed(Probe::new(b, &grid, &log));
        assert_eq!(txn.changed_count(), 2);

        txn.commit().await.expect("commit");
        assert_eq!(sorted(&log), vec![(a, "persist"), (b, "persist")]);
        assert_eq!(grid.committed(a), Some(vec![1]));
        assert_eq!(txn.changed_count(), 0);
        assert!(txn.is_finished());
    }

    #[tokio::test]
    async fn test_deleted_record_is_not_persisted() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let id = grid.allocate(txn.native()).expect("allocate");
        txn.mark_changed(Probe::new(id, &grid, &log));
        txn.mark_deleted(Probe::new(id, &grid, &log));
        txn.mark_changed(Probe::new(id, &grid, &log));
        assert_eq!(txn.deleted_count(), 1);

        txn.commit().await.expect("commit");
        assert_eq!(sorted(&log), vec![(id, "delete")]);
        assert!(grid.committed(id).is_none());
    }

    #[tokio::test]
    async fn test_timeout_fails_commit_and_clears_buffers() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_millis(20));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let id = grid.allocate(txn.native()).expect("allocate");
        txn.mark_changed(Probe::new(id, &grid, &log));
        txn.mark_changed(Arc::new(Stalled(999)));

        let result = txn.commit().await;
        assert_eq!(
            result,
            Err(TxnError::Flush {
                id: 999,
                source: GridError::Timeout(Duration::from_millis(20)),
            })
        );
        assert_eq!(txn.changed_count(), 0);
        assert!(grid.committed(id).is_none());
        assert_eq!(grid.live_transactions(), 0);
        assert_eq!(sorted(&log), vec![(id, "discard"), (id, "persist")]);
        assert_eq!(txn.commit().await, Err(TxnError::Finished));
    }

    #[tokio::test]
    async fn test_grid_commit_failure() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let id = grid.allocate(txn.native()).expect("allocate");
        txn.mark_changed(Probe::new(id, &grid, &log));
        grid.set_fail_commits(true);

        assert!(matches!(txn.commit().await, Err(TxnError::Grid(GridError::InjectedFault(_)))));
        assert!(grid.committed(id).is_none());
        assert_eq!(sorted(&log), vec![(id, "discard"), (id, "persist")]);
    }

    #[tokio::test]
    async fn test_write_fault_surfaces_as_flush_error() {
        let grid = MemoryGrid::with_faults(
            FaultConfig {
                write_error_rate: 1.0,
                ..FaultConfig::no_faults()
            },
            7,
        );
        let ctx = context(&grid, Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let id = grid.allocate(txn.native()).expect("allocate");
        txn.mark_changed(Probe::new(id, &grid, &log));
        let error = txn.commit().await.expect_err("write fault");
        assert!(matches!(error, TxnError::Flush { id: failed, source: GridError::InjectedFault(_) } if failed == id));
    }

    #[tokio::test]
    async fn test_abort_discards_everything() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let id = grid.allocate(txn.native()).expect("allocate");
        txn.mark_changed(Probe::new(id, &grid, &log));
        txn.abort().expect("abort");

        assert_eq!(sorted(&log), vec![(id, "discard")]);
        assert_eq!(txn.changed_count(), 0);
        assert_eq!(txn.abort(), Err(TxnError::Finished));
        assert_eq!(grid.live_transactions(), 0);
    }

    #[tokio::test]
    async fn test_rollback_delegates_to_grid() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));

        let mut txn = Txn::begin(&ctx);
        txn.rollback().expect("rollback");
        assert_eq!(grid.stats().aborts, 1);

        // The native transaction is gone, so a second rollback reaches the
        // grid and fails there.
        assert_eq!(
            txn.rollback(),
            Err(TxnError::Grid(GridError::UnknownTransaction(txn.native())))
        );
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_buffered_records() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut txn = Txn::begin(&ctx);
        let a = grid.allocate(txn.native()).expect("allocate");
        txn.mark_changed(Probe::new(a, &grid, &log));
        txn.rollback().expect("rollback");
        assert_eq!(sorted(&log), vec![(a, "discard")]);

        let mut txn = Txn::begin(&ctx);
        let b = grid.allocate(txn.native()).expect("allocate");
        txn.mark_deleted(Probe::new(b, &grid, &log));
        drop(txn);
        assert_eq!(sorted(&log), vec![(a, "discard"), (b, "discard")]);
        assert!(grid.committed(a).is_none());
    }

    #[tokio::test]
    async fn test_empty_commit() {
        let grid = MemoryGrid::new();
        let ctx = context(&grid, Duration::from_secs(1));
        let mut txn = Txn::begin(&ctx);
        txn.commit().await.expect("commit");
        assert_eq!(grid.stats().commits, 1);
    }
}
