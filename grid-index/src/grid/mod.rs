//! Boundary to the distributed object store ("the grid").
//!
//! Everything the index persists goes through the [`Grid`] trait. The grid
//! owns identity allocation, native transactions, named roots and record
//! locking; this crate only assumes the primitives below.
//!
//! # Pending operations
//!
//! Fetches, writes and deletes return boxed `'static` futures. They are the
//! only asynchronous surface of the grid, and [`await_pending`] is the only
//! way this crate waits on them: every wait carries the configured timeout
//! and an expired wait fails the enclosing operation. Nothing is cancelled
//! on expiry.

pub mod memory;

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;

pub use memory::{FaultConfig, GridStats, MemoryGrid};

/// Identity of a record in the grid. `0` is never allocated.
pub type NodeId = u64;

/// Handle to one of the grid's native transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridTxn(pub u64);

/// A pending fetch of a record's bytes.
pub type Fetch = BoxFuture<'static, Result<Vec<u8>, GridError>>;

/// A pending write or delete.
pub type PendingOp = BoxFuture<'static, Result<(), GridError>>;

/// Result of resolving a well-known root name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootResolution {
    /// Identity of the root record.
    pub id: NodeId,
    /// `true` only for the resolution that created the root.
    pub created: bool,
}

/// Primitives the index requires from the grid.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `get` returns the last committed bytes of a record
/// - `get_for_write` gives the transaction exclusive ownership of the record
///   and sees the transaction's own staged writes
/// - writes and deletes issued under a transaction become visible to `get`
///   only once that transaction commits
/// - `resolve_root` reports `created == true` at most once per name
pub trait Grid: Send + Sync + 'static {
    /// Begin a native transaction.
    fn begin_transaction(&self) -> GridTxn;

    /// Commit a native transaction, publishing everything staged under it.
    fn commit(&self, txn: GridTxn) -> Result<(), GridError>;

    /// Abort a native transaction, discarding everything staged under it.
    fn abort(&self, txn: GridTxn) -> Result<(), GridError>;

    /// Roll back a native transaction.
    fn rollback(&self, txn: GridTxn) -> Result<(), GridError>;

    /// Reserve a fresh identity owned by `txn`.
    fn allocate(&self, txn: GridTxn) -> Result<NodeId, GridError>;

    /// Fetch the committed bytes of a record.
    fn get(&self, id: NodeId) -> Fetch;

    /// Fetch a record for writing under `txn`.
    fn get_for_write(&self, id: NodeId, txn: GridTxn) -> Fetch;

    /// Stage new bytes for a record under `txn`.
    fn set(&self, id: NodeId, bytes: Vec<u8>, txn: GridTxn) -> PendingOp;

    /// Stage the removal of a record under `txn`.
    fn delete(&self, id: NodeId, txn: GridTxn) -> PendingOp;

    /// Resolve a named root, creating it on first use.
    fn resolve_root(&self, name: &str, txn: GridTxn) -> Result<RootResolution, GridError>;
}

/// Await a pending grid operation, failing with [`GridError::Timeout`] once
/// `timeout` elapses.
pub async fn await_pending<T>(
    op: impl Future<Output = Result<T, GridError>>,
    timeout: Duration,
) -> Result<T, GridError> {
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(GridError::Timeout(timeout)),
    }
}

/// Errors reported by the grid or by waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// No committed (or staged) record with this identity.
    NotFound(NodeId),
    /// The record is owned by another live transaction.
    RecordLocked { id: NodeId, owner: GridTxn },
    /// The named root is being created by another live transaction.
    RootLocked { name: String, owner: GridTxn },
    /// The transaction is not live (never begun, committed or aborted).
    UnknownTransaction(GridTxn),
    /// A pending operation did not finish in time.
    Timeout(Duration),
    /// A record was flushed before it was ever materialized.
    NotMaterialized(NodeId),
    /// The task driving a pending fetch failed.
    TaskFailed(String),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for GridError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "record {id} not found"),
            Self::RecordLocked { id, owner } => {
                write!(f, "record {id} is locked by transaction {}", owner.0)
            }
            Self::RootLocked { name, owner } => {
                write!(f, "root '{name}' is being created by transaction {}", owner.0)
            }
            Self::UnknownTransaction(txn) => write!(f, "transaction {} is not live", txn.0),
            Self::Timeout(timeout) => write!(f, "grid operation timed out after {timeout:?}"),
            Self::NotMaterialized(id) => write!(f, "record {id} was never materialized"),
            Self::TaskFailed(msg) => write!(f, "fetch task failed: {msg}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for GridError {}
