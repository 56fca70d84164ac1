//! Structural invariants after split-heavy workloads.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::IndexConfig;
use crate::e2e_tests::helpers::*;
use crate::grid::MemoryGrid;
use crate::structures::{BTree, Txn};

async fn shuffled_inserts(capacity: usize, count: u64, seed: u64) {
    let grid = MemoryGrid::new();
    let ctx = context_with(
        &grid,
        IndexConfig {
            node_capacity: capacity,
            ..IndexConfig::default()
        },
    );
    let mut keys: Vec<u64> = (0..count).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut txn = Txn::begin(&ctx);
    let tree: BTree<u64, String> = BTree::create(&ctx, &mut txn).expect("create tree");
    txn.commit().await.expect("commit");

    // Several commits so later puts run against reloaded paths.
    for batch in keys.chunks(25) {
        let mut txn = Txn::begin(&ctx);
        for key in batch {
            tree.put(*key, Some(value_for(*key)), &mut txn)
                .await
                .expect("put");
        }
        txn.commit().await.expect("commit");
    }

    let shape = tree.verify().await.expect("verify");
    assert_eq!(shape.entries, count as usize);
    assert!(
        shape.min_fill.is_some_and(|fill| fill >= capacity / 2),
        "capacity {capacity}: {shape:?}"
    );
    assert!(shape.max_fill < capacity, "capacity {capacity}: {shape:?}");
    assert_eq!(all_keys(&tree).await, (0..count).collect::<Vec<_>>());

    let reloaded: BTree<u64, String> = BTree::open(&context_with(&grid, *ctx.config()), tree.id());
    assert_eq!(reloaded.verify().await.expect("verify reloaded"), shape);
}

#[tokio::test]
async fn test_occupancy_capacity_4() {
    shuffled_inserts(4, 300, 1).await;
}

#[tokio::test]
async fn test_occupancy_capacity_6() {
    shuffled_inserts(6, 300, 2).await;
}

#[tokio::test]
async fn test_occupancy_capacity_16() {
    shuffled_inserts(16, 500, 3).await;
}

#[tokio::test]
async fn test_ascending_and_descending_runs() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, (0..100).chain((100..200).rev())).await;

    let shape = tree.verify().await.expect("verify");
    assert_eq!(shape.entries, 200);
    assert!(shape.min_fill.is_some_and(|fill| fill >= 2));
}
