//! Persistent handles: records materialized on demand from the grid.
//!
//! A [`Persistent`] is an identity plus the capability to load itself. Its
//! value is absent until a fetch completes, and callers must go through
//! [`Persistent::ensure_materialized`] before reading it. Mutations go through
//! [`Persistent::update`], which marks the handle dirty and registers it with
//! the transaction buffer; the bytes reach the grid only when that buffer
//! commits.
//!
//! # Loading
//!
//! - `load_for_read` starts a fetch of the committed bytes
//! - `load_for_write` starts an exclusive fetch under a transaction so the
//!   grid can lock the record
//! - `ensure_materialized` awaits whichever fetch is pending (starting a read
//!   if nothing was ever requested) with the configured timeout
//!
//! A fetched copy never replaces a dirty in-memory value. When a transaction
//! aborts or fails to commit, the buffer discards every record it touched so
//! the next access starts again from the committed bytes.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, IndexConfig};
use crate::grid::{Grid, GridError, GridTxn, NodeId, PendingOp, await_pending};
use crate::structures::codec::CodecError;
use crate::structures::txn::Txn;

/// Shared access to the grid and the index configuration.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct GridContext {
    grid: Arc<dyn Grid>,
    config: IndexConfig,
}

impl GridContext {
    /// Create a context after validating `config`.
    pub fn new(grid: Arc<dyn Grid>, config: IndexConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { grid, config })
    }

    /// The grid collaborator.
    #[must_use]
    pub fn grid(&self) -> &dyn Grid {
        self.grid.as_ref()
    }

    /// The index configuration.
    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }
}

/// A value that can be stored as a grid record.
pub trait Persistable: Sized + Send + Sync + 'static {
    /// Extra state needed to rebuild references while decoding.
    type Resolver: Send + Sync + 'static;

    /// Serialize the value.
    fn encode(&self) -> Vec<u8>;

    /// Rebuild a value from bytes produced by `encode`.
    fn decode(bytes: &[u8], resolver: &Self::Resolver) -> Result<Self, CodecError>;

    /// Exact size of `encode`'s output.
    fn encoded_len(&self) -> usize;
}

/// A record the transaction buffer can flush.
pub trait Flushable: Send + Sync {
    /// Identity of the record.
    fn record_id(&self) -> NodeId;

    /// Serialize the current value and stage it under `txn`.
    fn persist_async(&self, txn: GridTxn) -> PendingOp;

    /// Stage the record's removal under `txn`.
    fn delete_async(&self, txn: GridTxn) -> PendingOp;

    /// Drop any in-memory state of a transaction that will never commit.
    ///
    /// The next access refetches the committed bytes.
    fn discard(&self);
}

struct Slot<T> {
    value: Option<T>,
    dirty: bool,
    pending: Option<JoinHandle<Result<Vec<u8>, GridError>>>,
    /// Native transaction the record was last loaded or created for writing.
    write_txn: Option<GridTxn>,
}

/// A lazily materialized, dirty-tracked grid record.
pub struct Persistent<T: Persistable> {
    id: NodeId,
    context: GridContext,
    resolver: T::Resolver,
    slot: Mutex<Slot<T>>,
}

impl<T: Persistable> Persistent<T> {
    /// A handle to an existing record. Nothing is fetched yet.
    #[must_use]
    pub fn unloaded(id: NodeId, context: GridContext, resolver: T::Resolver) -> Arc<Self> {
        Arc::new(Self {
            id,
            context,
            resolver,
            slot: Mutex::new(Slot {
                value: None,
                dirty: false,
                pending: None,
                write_txn: None,
            }),
        })
    }

    /// Create a new record under `txn`.
    ///
    /// The grid reserves the identity immediately; the value is written when
    /// `txn` commits.
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    pub fn create(value: T, resolver: T::Resolver, txn: &mut Txn) -> Result<Arc<Self>, GridError> {
        let context = txn.context().clone();
        let id = context.grid().allocate(txn.native())?;
        let handle = Arc::new(Self {
            id,
            context,
            resolver,
            slot: Mutex::new(Slot {
                value: Some(value),
                dirty: true,
                pending: None,
                write_txn: Some(txn.native()),
            }),
        });
        let record: Arc<Self> = Arc::clone(&handle);
        txn.mark_changed(record);
        Ok(handle)
    }

    /// Identity of the record.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Whether the value has been materialized.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Whether the value has unflushed changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Start fetching the committed bytes unless a value or a fetch is
    /// already present.
    pub fn load_for_read(&self) {
        let mut slot = self.lock();
        if slot.value.is_none() && slot.pending.is_none() {
            slot.pending = Some(tokio::spawn(self.context.grid().get(self.id)));
        }
    }

    /// Start an exclusive fetch under `txn` unless the record is already
    /// held for that transaction.
    pub fn load_for_write(&self, txn: &Txn) {
        let native = txn.native();
        let mut slot = self.lock();
        if slot.write_txn == Some(native) {
            return;
        }
        slot.pending = Some(tokio::spawn(
            self.context.grid().get_for_write(self.id, native),
        ));
        slot.write_txn = Some(native);
    }

    /// Wait for the pending fetch and decode it.
    ///
    /// This is where grid latency surfaces to callers.
    pub async fn ensure_materialized(&self) -> Result<(), HandleError> {
        let pending = {
            let mut slot = self.lock();
            if slot.value.is_none() && slot.pending.is_none() {
                slot.pending = Some(tokio::spawn(self.context.grid().get(self.id)));
            }
            slot.pending.take()
        };
        let Some(handle) = pending else {
            return Ok(());
        };

        let fetched = await_pending(
            handle.map(|joined| {
                joined.unwrap_or_else(|e| Err(GridError::TaskFailed(e.to_string())))
            }),
            self.context.config().op_timeout,
        )
        .await;

        let mut slot = self.lock();
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                slot.write_txn = None;
                return Err(HandleError::Grid(e));
            }
        };
        if slot.dirty && slot.value.is_some() {
            return Ok(());
        }
        let value = T::decode(&bytes, &self.resolver).map_err(|source| HandleError::Codec {
            id: self.id,
            source,
        })?;
        slot.value = Some(value);
        slot.dirty = false;
        Ok(())
    }

    /// Read the materialized value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, HandleError> {
        let slot = self.lock();
        slot.value
            .as_ref()
            .map(f)
            .ok_or(HandleError::NotMaterialized(self.id))
    }

    /// Mutate the materialized value and register the record as changed.
    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    pub fn update<R>(
        self: &Arc<Self>,
        txn: &mut Txn,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, HandleError> {
        let result = {
            let mut slot = self.lock();
            let value = slot
                .value
                .as_mut()
                .ok_or(HandleError::NotMaterialized(self.id))?;
            let result = f(value);
            slot.dirty = true;
            result
        };
        let record: Arc<Self> = Arc::clone(self);
        txn.mark_changed(record);
        Ok(result)
    }

    /// Encoded size of the materialized value.
    pub fn encoded_len(&self) -> Result<usize, HandleError> {
        self.read(T::encoded_len)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().expect("lock poisoned")
    }
}

impl<T: Persistable> Flushable for Persistent<T> {
    fn record_id(&self) -> NodeId {
        self.id
    }

    fn persist_async(&self, txn: GridTxn) -> PendingOp {
        let bytes = {
            let mut slot = self.lock();
            let bytes = slot.value.as_ref().map(T::encode);
            if bytes.is_some() {
                slot.dirty = false;
            }
            bytes
        };
        match bytes {
            Some(bytes) => self.context.grid().set(self.id, bytes, txn),
            None => futures::future::ready(Err(GridError::NotMaterialized(self.id))).boxed(),
        }
    }

    fn delete_async(&self, txn: GridTxn) -> PendingOp {
        self.context.grid().delete(self.id, txn)
    }

    fn discard(&self) {
        let mut slot = self.lock();
        slot.value = None;
        slot.dirty = false;
        slot.pending = None;
        slot.write_txn = None;
    }
}

/// Errors that can occur when materializing or accessing a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The fetch failed or timed out.
    Grid(GridError),
    /// The fetched bytes could not be decoded.
    Codec { id: NodeId, source: CodecError },
    /// The value was accessed before `ensure_materialized`.
    NotMaterialized(NodeId),
}

impl std::fmt::Display for HandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grid(e) => write!(f, "grid error: {e}"),
            Self::Codec { id, source } => write!(f, "record {id} is corrupt: {source}"),
            Self::NotMaterialized(id) => write!(f, "record {id} accessed before materialization"),
        }
    }
}

impl std::error::Error for HandleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Grid(e) => Some(e),
            Self::Codec { source, .. } => Some(source),
            Self::NotMaterialized(_) => None,
        }
    }
}

impl From<GridError> for HandleError {
    fn from(e: GridError) -> Self {
        Self::Grid(e)
    }
}
