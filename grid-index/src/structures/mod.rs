//! Grid-resident index structures.
//!
//! # Layers
//!
//! - `codec`: byte encoding of keys, values and records
//! - `persistent`: lazily materialized, dirty-tracked grid records
//! - `node`: tree nodes and the per-tree handle cache
//! - `btree`: the index itself
//! - `txn`: the transaction buffer that flushes changed records
//! - `catalog`: the name-to-index registry and its bootstrap
//!
//! # Usage
//!
//! ```ignore
//! let context = GridContext::new(Arc::new(MemoryGrid::new()), IndexConfig::default())?;
//!
//! let mut txn = Txn::begin(&context);
//! let tree: BTree<u64, String> = BTree::create(&context, &mut txn)?;
//! tree.put(1, Some("one".to_string()), &mut txn).await?;
//! txn.commit().await?;
//!
//! let reopened: BTree<u64, String> = BTree::open(&context, tree.id());
//! assert_eq!(reopened.get(&1).await?, Some("one".to_string()));
//! ```

mod btree;
mod catalog;
mod codec;
pub mod node;
mod persistent;
mod txn;

pub use btree::{BTree, BTreeError, KeyCursor, RangeCursor, TreeHeader, TreeShape};
pub use catalog::{BootstrapOutcome, CATALOG_ROOT_NAME, Catalog, CatalogError, CatalogRoot};
pub use codec::{Codec, CodecError};
pub use node::{IndexKey, IndexValue, NodeError};
pub use persistent::{Flushable, GridContext, HandleError, Persistable, Persistent};
pub use txn::{Txn, TxnError};
