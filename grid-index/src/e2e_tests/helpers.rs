//! Common helpers for end-to-end tests.

use std::sync::Arc;

use crate::config::IndexConfig;
use crate::grid::MemoryGrid;
use crate::structures::{BTree, GridContext, Txn};

/// A context over `grid` with default configuration.
#[must_use]
pub fn context(grid: &MemoryGrid) -> GridContext {
    context_with(grid, IndexConfig::default())
}

/// A context over `grid` with a custom configuration.
#[must_use]
pub fn context_with(grid: &MemoryGrid, config: IndexConfig) -> GridContext {
    GridContext::new(Arc::new(grid.clone()), config).expect("valid test config")
}

/// The value stored for `key` throughout these tests.
#[must_use]
pub fn value_for(key: u64) -> String {
    format!("value_{key}")
}

/// Create a tree holding `keys` and commit it.
pub async fn committed_tree(
    ctx: &GridContext,
    keys: impl IntoIterator<Item = u64>,
) -> BTree<u64, String> {
    let mut txn = Txn::begin(ctx);
    let tree = BTree::create(ctx, &mut txn).expect("create tree");
    for key in keys {
        tree.put(key, Some(value_for(key)), &mut txn)
            .await
            .expect("put");
    }
    txn.commit().await.expect("commit");
    tree
}

/// Every live key of `tree`, in cursor order.
pub async fn all_keys(tree: &BTree<u64, String>) -> Vec<u64> {
    tree.keys()
        .await
        .expect("keys")
        .collect()
        .await
        .expect("collect keys")
}

/// A runtime for driving async code from synchronous property tests.
#[must_use]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create runtime")
}
