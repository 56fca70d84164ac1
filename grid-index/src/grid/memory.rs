//! In-memory grid for tests and the demo binary.
//!
//! This module provides an in-memory implementation of the [`Grid`] trait
//! with support for fault injection:
//! - Fetch failures
//! - Write/delete failures
//! - Commit failures (random or forced)
//! - Artificial latency on every pending operation
//!
//! # Transactions
//!
//! Writes, deletes and newly created roots are staged per native
//! transaction and published atomically by `commit`. `abort` and `rollback`
//! discard them. Every record touched by a transaction is locked to it until
//! the transaction ends.
//!
//! # Thread Safety
//!
//! All state sits behind one `Mutex`; pending operations clone the `Arc` and
//! take the lock only after their latency has elapsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::grid::{Fetch, Grid, GridError, GridTxn, NodeId, PendingOp, RootResolution};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a fetch error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write or delete error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a commit error (0.0 - 1.0).
    pub commit_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            commit_error_rate: 0.05,
        }
    }
}

/// Statistics about grid operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GridStats {
    /// Number of fetches served (committed or for-write).
    pub gets: u64,
    /// Number of staged writes.
    pub sets: u64,
    /// Number of staged deletes.
    pub deletes: u64,
    /// Number of successful commits.
    pub commits: u64,
    /// Number of aborts and rollbacks.
    pub aborts: u64,
    /// Number of injected faults.
    pub injected_faults: u64,
}

/// Work staged by one live native transaction.
#[derive(Debug, Default)]
struct Staged {
    /// `None` stages a delete.
    writes: HashMap<NodeId, Option<Vec<u8>>>,
    roots: HashMap<String, NodeId>,
}

struct GridState {
    records: HashMap<NodeId, Vec<u8>>,
    roots: HashMap<String, NodeId>,
    transactions: HashMap<GridTxn, Staged>,
    locks: HashMap<NodeId, GridTxn>,
    next_id: NodeId,
    next_txn: u64,
    fault_config: FaultConfig,
    rng: StdRng,
    fail_commits: bool,
    stats: GridStats,
}

impl GridState {
    fn should_inject(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let hit = self.rng.random::<f64>() < rate;
        if hit {
            self.stats.injected_faults += 1;
        }
        hit
    }

    fn ensure_live(&self, txn: GridTxn) -> Result<(), GridError> {
        if self.transactions.contains_key(&txn) {
            Ok(())
        } else {
            Err(GridError::UnknownTransaction(txn))
        }
    }

    /// Take the lock on `id` for `txn`, failing if another transaction owns it.
    fn lock_record(&mut self, id: NodeId, txn: GridTxn) -> Result<(), GridError> {
        match self.locks.get(&id) {
            Some(&owner) if owner != txn => Err(GridError::RecordLocked { id, owner }),
            _ => {
                self.locks.insert(id, txn);
                Ok(())
            }
        }
    }

    fn finish(&mut self, txn: GridTxn) -> Option<Staged> {
        self.locks.retain(|_, owner| *owner != txn);
        self.transactions.remove(&txn)
    }

    fn stage(&mut self, id: NodeId, bytes: Option<Vec<u8>>, txn: GridTxn) -> Result<(), GridError> {
        self.ensure_live(txn)?;
        let rate = self.fault_config.write_error_rate;
        if self.should_inject(rate) {
            return Err(GridError::InjectedFault(format!("write of record {id}")));
        }
        self.lock_record(id, txn)?;
        if bytes.is_some() {
            self.stats.sets += 1;
        } else {
            self.stats.deletes += 1;
        }
        if let Some(staged) = self.transactions.get_mut(&txn) {
            staged.writes.insert(id, bytes);
        }
        Ok(())
    }
}

/// In-memory grid implementation.
///
/// Cloning is cheap and every clone shares the same state, which lets tests
/// model several processes talking to one grid.
#[derive(Clone)]
pub struct MemoryGrid {
    state: Arc<Mutex<GridState>>,
    latency: Option<Duration>,
}

impl MemoryGrid {
    /// Create an empty grid with no faults and no latency.
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(FaultConfig::no_faults(), 0)
    }

    /// Create an empty grid that injects faults using a seeded RNG.
    #[must_use]
    pub fn with_faults(fault_config: FaultConfig, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(GridState {
                records: HashMap::new(),
                roots: HashMap::new(),
                transactions: HashMap::new(),
                locks: HashMap::new(),
                next_id: 1,
                next_txn: 1,
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                fail_commits: false,
                stats: GridStats::default(),
            })),
            latency: None,
        }
    }

    /// Delay every pending operation by `latency` before it touches the grid.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Force every subsequent commit to fail (or stop doing so).
    pub fn set_fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    /// Replace the fault rates. The RNG keeps its position.
    pub fn set_fault_config(&self, fault_config: FaultConfig) {
        self.lock().fault_config = fault_config;
    }

    /// Snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> GridStats {
        self.lock().stats.clone()
    }

    /// Committed bytes of a record, bypassing transactions.
    #[must_use]
    pub fn committed(&self, id: NodeId) -> Option<Vec<u8>> {
        self.lock().records.get(&id).cloned()
    }

    /// Number of committed records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of live native transactions.
    #[must_use]
    pub fn live_transactions(&self) -> usize {
        self.lock().transactions.len()
    }

    fn lock(&self) -> MutexGuard<'_, GridState> {
        lock_state(&self.state)
    }
}

impl Default for MemoryGrid {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
fn lock_state(state: &Mutex<GridState>) -> MutexGuard<'_, GridState> {
    state.lock().expect("lock poisoned")
}

async fn delay(latency: Option<Duration>) {
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
}

impl Grid for MemoryGrid {
    fn begin_transaction(&self) -> GridTxn {
        let mut state = self.lock();
        let txn = GridTxn(state.next_txn);
        state.next_txn += 1;
        state.transactions.insert(txn, Staged::default());
        txn
    }

    fn commit(&self, txn: GridTxn) -> Result<(), GridError> {
        let mut state = self.lock();
        state.ensure_live(txn)?;

        let rate = state.fault_config.commit_error_rate;
        if state.fail_commits || state.should_inject(rate) {
            state.finish(txn);
            state.stats.aborts += 1;
            return Err(GridError::InjectedFault(format!("commit of transaction {}", txn.0)));
        }

        let Some(staged) = state.finish(txn) else {
            return Err(GridError::UnknownTransaction(txn));
        };
        for (id, bytes) in staged.writes {
            match bytes {
                Some(bytes) => {
                    state.records.insert(id, bytes);
                }
                None => {
                    state.records.remove(&id);
                }
            }
        }
        state.roots.extend(staged.roots);
        state.stats.commits += 1;
        Ok(())
    }

    fn abort(&self, txn: GridTxn) -> Result<(), GridError> {
        let mut state = self.lock();
        state.ensure_live(txn)?;
        state.finish(txn);
        state.stats.aborts += 1;
        Ok(())
    }

    fn rollback(&self, txn: GridTxn) -> Result<(), GridError> {
        self.abort(txn)
    }

    fn allocate(&self, txn: GridTxn) -> Result<NodeId, GridError> {
        let mut state = self.lock();
        state.ensure_live(txn)?;
        let id = state.next_id;
        state.next_id += 1;
        state.locks.insert(id, txn);
        Ok(id)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for 'static futures
    fn get(&self, id: NodeId) -> Fetch {
        let state = Arc::clone(&self.state);
        let latency = self.latency;
        async move {
            delay(latency).await;
            let mut state = lock_state(&state);
            let rate = state.fault_config.read_error_rate;
            if state.should_inject(rate) {
                return Err(GridError::InjectedFault(format!("read of record {id}")));
            }
            state.stats.gets += 1;
            state.records.get(&id).cloned().ok_or(GridError::NotFound(id))
        }
        .boxed()
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for 'static futures
    fn get_for_write(&self, id: NodeId, txn: GridTxn) -> Fetch {
        let state = Arc::clone(&self.state);
        let latency = self.latency;
        async move {
            delay(latency).await;
            let mut state = lock_state(&state);
            state.ensure_live(txn)?;
            let rate = state.fault_config.read_error_rate;
            if state.should_inject(rate) {
                return Err(GridError::InjectedFault(format!("read of record {id}")));
            }
            state.lock_record(id, txn)?;
            state.stats.gets += 1;

            let staged = state
                .transactions
                .get(&txn)
                .and_then(|staged| staged.writes.get(&id))
                .cloned();
            match staged {
                Some(Some(bytes)) => Ok(bytes),
                Some(None) => Err(GridError::NotFound(id)),
                None => state.records.get(&id).cloned().ok_or(GridError::NotFound(id)),
            }
        }
        .boxed()
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for 'static futures
    fn set(&self, id: NodeId, bytes: Vec<u8>, txn: GridTxn) -> PendingOp {
        let state = Arc::clone(&self.state);
        let latency = self.latency;
        async move {
            delay(latency).await;
            lock_state(&state).stage(id, Some(bytes), txn)
        }
        .boxed()
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for 'static futures
    fn delete(&self, id: NodeId, txn: GridTxn) -> PendingOp {
        let state = Arc::clone(&self.state);
        let latency = self.latency;
        async move {
            delay(latency).await;
            lock_state(&state).stage(id, None, txn)
        }
        .boxed()
    }

    fn resolve_root(&self, name: &str, txn: GridTxn) -> Result<RootResolution, GridError> {
        let mut state = self.lock();
        state.ensure_live(txn)?;

        if let Some(&id) = state.roots.get(name) {
            return Ok(RootResolution { id, created: false });
        }

        let pending = state
            .transactions
            .iter()
            .find_map(|(owner, staged)| staged.roots.get(name).map(|&id| (*owner, id)));
        match pending {
            Some((owner, id)) if owner == txn => Ok(RootResolution { id, created: true }),
            Some((owner, _)) => Err(GridError::RootLocked {
                name: name.to_string(),
                owner,
            }),
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state.locks.insert(id, txn);
                if let Some(staged) = state.transactions.get_mut(&txn) {
                    staged.roots.insert(name.to_string(), id);
                }
                Ok(RootResolution { id, created: true })
            }
        }
    }
}
