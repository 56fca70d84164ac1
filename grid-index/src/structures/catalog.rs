//! Catalog of named indexes.
//!
//! The catalog maps index names to tree identities. Its own state hangs off
//! a well-known grid root, `CATALOG_ROOT`, whose 16-byte payload holds two
//! big-endian identities:
//!
//! - offset 0: the name-to-identity registry (`BTree<String, u64>`)
//! - offset 8: the table-to-index registry (`BTree<String, String>`)
//!
//! The first bootstrap against a grid creates the root and both registries;
//! every later one reads them back. Bootstrap runs once per `Catalog` value
//! and its result is cached. Initializers are serialized process-wide, so a
//! second catalog in the same process waits for the first and then recovers
//! its root instead of colliding with it in the grid.
//!
//! # Commit order
//!
//! The root record is written under its own native transaction, which is
//! committed before the transaction holding the registries' nodes. If the
//! second commit fails the root already points at registries that were
//! never written. That case is logged and returned as
//! [`CatalogError::Unreconciled`]; it is not repaired.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::grid::{GridError, GridTxn, NodeId, await_pending};
use crate::structures::btree::{BTree, BTreeError};
use crate::structures::codec::{CodecError, take};
use crate::structures::node::{IndexKey, IndexValue};
use crate::structures::persistent::GridContext;
use crate::structures::txn::{Txn, TxnError};

/// Name of the grid root holding the catalog.
pub const CATALOG_ROOT_NAME: &str = "CATALOG_ROOT";

/// Size of the catalog root payload.
const ROOT_PAYLOAD_LEN: usize = 16;

/// Held while any catalog in this process runs its initializer.
static BOOTSTRAP_LOCK: Mutex<()> = Mutex::const_new(());

/// Whether a bootstrap created the catalog or found an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Created,
    Recovered,
}

/// Identities resolved by a bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogRoot {
    /// The catalog root record.
    pub root_id: NodeId,
    /// Header of the name-to-identity registry.
    pub names_to_ids: NodeId,
    /// Header of the table-to-index registry.
    pub tables_to_indexes: NodeId,
    pub outcome: BootstrapOutcome,
}

impl CatalogRoot {
    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(ROOT_PAYLOAD_LEN);
        payload.extend_from_slice(&self.names_to_ids.to_be_bytes());
        payload.extend_from_slice(&self.tables_to_indexes.to_be_bytes());
        payload
    }

    fn from_payload(root_id: NodeId, payload: &[u8]) -> Result<Self, CatalogError> {
        let corrupt = |source| CatalogError::CorruptRoot {
            id: root_id,
            source,
        };
        let mut input = payload;
        let names_to_ids = u64::from_be_bytes(take(&mut input).map_err(corrupt)?);
        let tables_to_indexes = u64::from_be_bytes(take(&mut input).map_err(corrupt)?);
        Ok(Self {
            root_id,
            names_to_ids,
            tables_to_indexes,
            outcome: BootstrapOutcome::Recovered,
        })
    }
}

struct Bootstrapped {
    root: CatalogRoot,
    names: Arc<BTree<String, u64>>,
    tables: Arc<BTree<String, String>>,
}

/// Registry of named indexes stored in the grid.
pub struct Catalog {
    context: GridContext,
    state: Mutex<Option<Bootstrapped>>,
}

impl Catalog {
    #[must_use]
    pub fn new(context: &GridContext) -> Self {
        Self {
            context: context.clone(),
            state: Mutex::new(None),
        }
    }

    /// Resolve the catalog root, creating it on first use.
    ///
    /// Concurrent callers wait for the one running initializer.
    pub async fn bootstrap(&self) -> Result<CatalogRoot, CatalogError> {
        let mut state = self.state.lock().await;
        if let Some(ready) = state.as_ref() {
            return Ok(ready.root);
        }
        let ready = {
            let _initializing = BOOTSTRAP_LOCK.lock().await;
            self.initialize().await?
        };
        let root = ready.root;
        *state = Some(ready);
        Ok(root)
    }

    /// Record `name` as the index stored at `id`.
    pub async fn register(&self, name: &str, id: NodeId, txn: &mut Txn) -> Result<(), CatalogError> {
        let name = normalize(name)?;
        let names = self.names_registry().await?;
        names.put(name, Some(id), txn).await?;
        Ok(())
    }

    /// Identity registered under `name`.
    pub async fn lookup(&self, name: &str) -> Result<Option<NodeId>, CatalogError> {
        let name = normalize(name)?;
        Ok(self.names_registry().await?.get(&name).await?)
    }

    /// Remove the registration of `name`.
    pub async fn unregister(&self, name: &str, txn: &mut Txn) -> Result<(), CatalogError> {
        let name = normalize(name)?;
        self.names_registry().await?.delete(name, txn).await?;
        Ok(())
    }

    /// Every registered name, ascending.
    pub async fn names(&self) -> Result<Vec<String>, CatalogError> {
        Ok(self.names_registry().await?.keys().await?.collect().await?)
    }

    /// Open the index registered under `name`.
    pub async fn open_index<K: IndexKey, V: IndexValue>(
        &self,
        name: &str,
    ) -> Result<Option<BTree<K, V>>, CatalogError> {
        Ok(self
            .lookup(name)
            .await?
            .map(|id| BTree::open(&self.context, id)))
    }

    /// Record that `table` is indexed by the index named `index`.
    pub async fn register_table_index(
        &self,
        table: &str,
        index: &str,
        txn: &mut Txn,
    ) -> Result<(), CatalogError> {
        let (table, index) = (normalize(table)?, normalize(index)?);
        self.tables_registry().await?.put(table, Some(index), txn).await?;
        Ok(())
    }

    /// Name of the index recorded for `table`.
    pub async fn table_index(&self, table: &str) -> Result<Option<String>, CatalogError> {
        let table = normalize(table)?;
        Ok(self.tables_registry().await?.get(&table).await?)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    async fn names_registry(&self) -> Result<Arc<BTree<String, u64>>, CatalogError> {
        self.bootstrap().await?;
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|ready| Arc::clone(&ready.names))
            .ok_or(CatalogError::NotBootstrapped)
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is safe and expected
    async fn tables_registry(&self) -> Result<Arc<BTree<String, String>>, CatalogError> {
        self.bootstrap().await?;
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|ready| Arc::clone(&ready.tables))
            .ok_or(CatalogError::NotBootstrapped)
    }

    async fn initialize(&self) -> Result<Bootstrapped, CatalogError> {
        let grid = self.context.grid();
        let mut txn = Txn::begin(&self.context);
        let native = grid.begin_transaction();

        let ready = match self.resolve(&mut txn, native).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!("Catalog bootstrap failed: {e}; rolling back");
                if let Err(rb) = txn.rollback() {
                    tracing::warn!("Failed to roll back catalog transaction: {rb}");
                }
                if let Err(rb) = grid.rollback(native) {
                    tracing::warn!("Failed to roll back catalog root transaction: {rb}");
                }
                return Err(e);
            }
        };

        if let Err(e) = grid.commit(native) {
            tracing::warn!("Commit of catalog root failed: {e}");
            if let Err(rb) = txn.rollback() {
                tracing::warn!("Failed to roll back catalog transaction: {rb}");
            }
            return Err(CatalogError::Grid(e));
        }

        if let Err(e) = txn.commit().await {
            tracing::error!(
                "Catalog root {} committed but its registries were not: {e}",
                ready.root.root_id
            );
            if let Err(rb) = txn.rollback() {
                tracing::warn!("Failed to roll back catalog transaction: {rb}");
            }
            return Err(CatalogError::Unreconciled(e));
        }

        tracing::info!(
            "Catalog {:?}: root {}, names registry {}, tables registry {}",
            ready.root.outcome,
            ready.root.root_id,
            ready.root.names_to_ids,
            ready.root.tables_to_indexes
        );
        Ok(ready)
    }

    async fn resolve(&self, txn: &mut Txn, native: GridTxn) -> Result<Bootstrapped, CatalogError> {
        let grid = self.context.grid();
        let timeout = self.context.config().op_timeout;
        let resolution = grid.resolve_root(CATALOG_ROOT_NAME, native)?;

        if resolution.created {
            let names: BTree<String, u64> = BTree::create(&self.context, txn)?;
            let tables: BTree<String, String> = BTree::create(&self.context, txn)?;
            let root = CatalogRoot {
                root_id: resolution.id,
                names_to_ids: names.id(),
                tables_to_indexes: tables.id(),
                outcome: BootstrapOutcome::Created,
            };
            await_pending(grid.set(resolution.id, root.payload(), native), timeout).await?;
            return Ok(Bootstrapped {
                root,
                names: Arc::new(names),
                tables: Arc::new(tables),
            });
        }

        let payload = await_pending(grid.get(resolution.id), timeout).await?;
        let root = CatalogRoot::from_payload(resolution.id, &payload)?;
        Ok(Bootstrapped {
            root,
            names: Arc::new(BTree::open(&self.context, root.names_to_ids)),
            tables: Arc::new(BTree::open(&self.context, root.tables_to_indexes)),
        })
    }
}

/// Catalog names are case-insensitive and stored upper-cased.
fn normalize(name: &str) -> Result<String, CatalogError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CatalogError::InvalidName(name.to_string()));
    }
    Ok(name.to_uppercase())
}

/// Errors that can occur during catalog operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Resolving, reading or writing the root failed.
    Grid(GridError),
    /// A registry operation failed.
    Tree(BTreeError),
    /// The root payload cannot be decoded.
    CorruptRoot { id: NodeId, source: CodecError },
    /// The root was committed but the registries it names were not.
    Unreconciled(TxnError),
    /// Names must contain a non-whitespace character.
    InvalidName(String),
    /// The registries were used before a bootstrap succeeded.
    NotBootstrapped,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grid(e) => write!(f, "grid error: {e}"),
            Self::Tree(e) => write!(f, "registry error: {e}"),
            Self::CorruptRoot { id, source } => {
                write!(f, "catalog root {id} is corrupt: {source}")
            }
            Self::Unreconciled(e) => write!(
                f,
                "catalog root committed but registries were not: {e}"
            ),
            Self::InvalidName(name) => write!(f, "invalid catalog name '{name}'"),
            Self::NotBootstrapped => write!(f, "catalog is not bootstrapped"),
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Grid(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Unreconciled(e) => Some(e),
            Self::CorruptRoot { source, .. } => Some(source),
            Self::InvalidName(_) | Self::NotBootstrapped => None,
        }
    }
}

impl From<GridError> for CatalogError {
    fn from(e: GridError) -> Self {
        Self::Grid(e)
    }
}

impl From<BTreeError> for CatalogError {
    fn from(e: BTreeError) -> Self {
        Self::Tree(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::grid::{Fetch, Grid, MemoryGrid, PendingOp, RootResolution};
    use crate::structures::persistent::HandleError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(grid: impl Grid) -> GridContext {
        GridContext::new(Arc::new(grid), IndexConfig::default()).expect("valid config")
    }

    /// Lets the first `allowed` commits through, then fails the rest.
    struct CommitBudget {
        inner: MemoryGrid,
        allowed: usize,
        commits: AtomicUsize,
    }

    impl Grid for CommitBudget {
        fn begin_transaction(&self) -> GridTxn {
            self.inner.begin_transaction()
        }

        fn commit(&self, txn: GridTxn) -> Result<(), GridError> {
            if self.commits.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                self.inner.abort(txn)?;
                return Err(GridError::InjectedFault("commit budget exhausted".to_string()));
            }
            self.inner.commit(txn)
        }

        fn abort(&self, txn: GridTxn) -> Result<(), GridError> {
            self.inner.abort(txn)
        }

        fn rollback(&self, txn: GridTxn) -> Result<(), GridError> {
            self.inner.rollback(txn)
        }

        fn allocate(&self, txn: GridTxn) -> Result<NodeId, GridError> {
            self.inner.allocate(txn)
        }

        fn get(&self, id: NodeId) -> Fetch {
            self.inner.get(id)
        }

        fn get_for_write(&self, id: NodeId, txn: GridTxn) -> Fetch {
            self.inner.get_for_write(id, txn)
        }

        fn set(&self, id: NodeId, bytes: Vec<u8>, txn: GridTxn) -> PendingOp {
            self.inner.set(id, bytes, txn)
        }

        fn delete(&self, id: NodeId, txn: GridTxn) -> PendingOp {
            self.inner.delete(id, txn)
        }

        fn resolve_root(&self, name: &str, txn: GridTxn) -> Result<RootResolution, GridError> {
            self.inner.resolve_root(name, txn)
        }
    }

    #[tokio::test]
    async fn test_first_bootstrap_creates_root() {
        let grid = MemoryGrid::new();
        let catalog = Catalog::new(&context(grid.clone()));

        let root = catalog.bootstrap().await.expect("bootstrap");
        assert_eq!(root.outcome, BootstrapOutcome::Created);
        assert_ne!(root.names_to_ids, root.tables_to_indexes);

        let payload = grid.committed(root.root_id).expect("root committed");
        assert_eq!(payload.len(), 16);
        assert_eq!(payload[..8], root.names_to_ids.to_be_bytes());
        assert_eq!(payload[8..], root.tables_to_indexes.to_be_bytes());
        assert!(grid.committed(root.names_to_ids).is_some());
        assert!(grid.committed(root.tables_to_indexes).is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_is_cached() {
        let grid = MemoryGrid::new();
        let catalog = Catalog::new(&context(grid.clone()));

        let first = catalog.bootstrap().await.expect("bootstrap");
        let commits = grid.stats().commits;
        let second = catalog.bootstrap().await.expect("bootstrap again");
        assert_eq!(first, second);
        assert_eq!(grid.stats().commits, commits);
    }

    #[tokio::test]
    async fn test_second_catalog_recovers() {
        let grid = MemoryGrid::new();
        let created = Catalog::new(&context(grid.clone()))
            .bootstrap()
            .await
            .expect("bootstrap");
        let recovered = Catalog::new(&context(grid.clone()))
            .bootstrap()
            .await
            .expect("bootstrap");

        assert_eq!(recovered.outcome, BootstrapOutcome::Recovered);
        assert_eq!(recovered.root_id, created.root_id);
        assert_eq!(recovered.names_to_ids, created.names_to_ids);
        assert_eq!(recovered.tables_to_indexes, created.tables_to_indexes);
    }

    #[tokio::test]
    async fn test_concurrent_bootstraps_share_one_initializer() {
        let grid = MemoryGrid::new();
        let catalog = Catalog::new(&context(grid.clone()));

        let (a, b) = tokio::join!(catalog.bootstrap(), catalog.bootstrap());
        assert_eq!(a.expect("first"), b.expect("second"));
        assert_eq!(grid.stats().commits, 2);
    }

    #[tokio::test]
    async fn test_concurrent_catalogs_wait_for_one_initializer() {
        let grid = MemoryGrid::new();
        let first = Catalog::new(&context(grid.clone()));
        let second = Catalog::new(&context(grid.clone()));

        let (a, b) = tokio::join!(first.bootstrap(), second.bootstrap());
        let (a, b) = (a.expect("first"), b.expect("second"));
        let mut outcomes = [a.outcome, b.outcome];
        outcomes.sort_by_key(|outcome| *outcome == BootstrapOutcome::Recovered);
        assert_eq!(outcomes, [BootstrapOutcome::Created, BootstrapOutcome::Recovered]);
        assert_eq!(a.root_id, b.root_id);
        assert_eq!(a.names_to_ids, b.names_to_ids);
        assert_eq!(a.tables_to_indexes, b.tables_to_indexes);
    }

    #[tokio::test]
    async fn test_short_root_payload_is_corrupt() {
        let grid = MemoryGrid::new();
        let native = grid.begin_transaction();
        let resolution = grid.resolve_root(CATALOG_ROOT_NAME, native).expect("resolve");
        grid.set(resolution.id, vec![0; 12], native).await.expect("set");
        grid.commit(native).expect("commit");

        let result = Catalog::new(&context(grid.clone())).bootstrap().await;
        assert_eq!(
            result,
            Err(CatalogError::CorruptRoot {
                id: resolution.id,
                source: CodecError::Truncated {
                    needed: 8,
                    remaining: 4,
                },
            })
        );
        assert_eq!(grid.live_transactions(), 0);
    }

    #[tokio::test]
    async fn test_failed_root_commit_leaves_nothing_behind() {
        let grid = MemoryGrid::new();
        grid.set_fail_commits(true);
        let catalog = Catalog::new(&context(grid.clone()));

        assert!(matches!(
            catalog.bootstrap().await,
            Err(CatalogError::Grid(GridError::InjectedFault(_)))
        ));
        assert_eq!(grid.record_count(), 0);
        assert_eq!(grid.live_transactions(), 0);

        grid.set_fail_commits(false);
        let root = catalog.bootstrap().await.expect("retry");
        assert_eq!(root.outcome, BootstrapOutcome::Created);
    }

    #[tokio::test]
    async fn test_registry_commit_failure_is_unreconciled() {
        let grid = MemoryGrid::new();
        let budget = CommitBudget {
            inner: grid.clone(),
            allowed: 1,
            commits: AtomicUsize::new(0),
        };
        let catalog = Catalog::new(&context(budget));

        let result = catalog.bootstrap().await;
        assert!(matches!(
            result,
            Err(CatalogError::Unreconciled(TxnError::Grid(GridError::InjectedFault(_))))
        ));

        // The root survived, the registries it names did not.
        let recovered = Catalog::new(&context(grid.clone()));
        let root = recovered.bootstrap().await.expect("root is readable");
        assert_eq!(root.outcome, BootstrapOutcome::Recovered);
        assert!(grid.committed(root.names_to_ids).is_none());
        assert!(matches!(
            recovered.lookup("orders").await,
            Err(CatalogError::Tree(BTreeError::Handle(HandleError::Grid(GridError::NotFound(_)))))
        ));
    }

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let grid = MemoryGrid::new();
        let ctx = context(grid.clone());
        let catalog = Catalog::new(&ctx);

        let mut txn = Txn::begin(&ctx);
        let index: BTree<u64, String> = BTree::create(&ctx, &mut txn).expect("create index");
        catalog.register("orders", index.id(), &mut txn).await.expect("register");
        catalog.register("Users", 999, &mut txn).await.expect("register");
        txn.commit().await.expect("commit");

        assert_eq!(catalog.lookup("ORDERS").await.expect("lookup"), Some(index.id()));
        assert_eq!(catalog.lookup("missing").await.expect("lookup"), None);
        assert_eq!(
            catalog.names().await.expect("names"),
            vec!["ORDERS".to_string(), "USERS".to_string()]
        );

        let opened = catalog
            .open_index::<u64, String>("orders")
            .await
            .expect("open")
            .expect("registered");
        assert_eq!(opened.id(), index.id());

        let mut txn = Txn::begin(&ctx);
        catalog.unregister("users", &mut txn).await.expect("unregister");
        txn.commit().await.expect("commit");
        assert_eq!(catalog.lookup("users").await.expect("lookup"), None);
        assert_eq!(catalog.names().await.expect("names"), vec!["ORDERS".to_string()]);
    }

    #[tokio::test]
    async fn test_catalog_usable_after_aborted_register() {
        let grid = MemoryGrid::new();
        let ctx = context(grid.clone());
        let catalog = Catalog::new(&ctx);

        let mut txn = Txn::begin(&ctx);
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            catalog.register(name, id, &mut txn).await.expect("register");
        }
        txn.commit().await.expect("commit");

        // The fourth name splits the registry root.
        let mut txn = Txn::begin(&ctx);
        catalog.register("d", 4, &mut txn).await.expect("register");
        txn.abort().expect("abort");

        assert_eq!(catalog.lookup("a").await.expect("lookup"), Some(1));
        assert_eq!(catalog.lookup("d").await.expect("lookup"), None);

        let mut txn = Txn::begin(&ctx);
        catalog.register("e", 5, &mut txn).await.expect("register after abort");
        txn.commit().await.expect("commit");
        assert_eq!(
            catalog.names().await.expect("names"),
            vec!["A".to_string(), "B".to_string(), "C".to_string(), "E".to_string()]
        );

        let reader = Catalog::new(&context(grid));
        assert_eq!(reader.lookup("e").await.expect("lookup"), Some(5));
    }

    #[tokio::test]
    async fn test_table_index_registry() {
        let grid = MemoryGrid::new();
        let ctx = context(grid.clone());
        let catalog = Catalog::new(&ctx);

        let mut txn = Txn::begin(&ctx);
        catalog
            .register_table_index("orders", "orders_by_date", &mut txn)
            .await
            .expect("register");
        txn.commit().await.expect("commit");

        assert_eq!(
            catalog.table_index("Orders").await.expect("lookup"),
            Some("ORDERS_BY_DATE".to_string())
        );
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let grid = MemoryGrid::new();
        let ctx = context(grid.clone());
        let catalog = Catalog::new(&ctx);
        let mut txn = Txn::begin(&ctx);

        assert_eq!(
            catalog.register("   ", 1, &mut txn).await,
            Err(CatalogError::InvalidName(String::new()))
        );
        assert_eq!(txn.changed_count(), 0);
        txn.abort().expect("abort");
    }
}
