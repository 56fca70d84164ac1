//! Range scans against a model, including bounds that land on the first
//! slot of a leaf.

use crate::e2e_tests::helpers::*;
use crate::grid::MemoryGrid;
use crate::structures::{BTree, Txn};

fn expected(keys: &[u64], from: u64, to: u64) -> Vec<String> {
    keys.iter()
        .filter(|k| (from..=to).contains(*k))
        .map(|k| value_for(*k))
        .collect()
}

async fn scan(tree: &BTree<u64, String>, from: u64, to: u64) -> Vec<String> {
    tree.range(&from, &to)
        .await
        .expect("range")
        .collect()
        .await
        .expect("collect")
}

#[tokio::test]
async fn test_every_range_of_even_keys() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let keys: Vec<u64> = (0..30).map(|k| k * 2).collect();
    let tree = committed_tree(&ctx, keys.iter().copied()).await;

    for from in 0..=62 {
        for to in from..=62 {
            assert_eq!(
                scan(&tree, from, to).await,
                expected(&keys, from, to),
                "range {from}..={to}"
            );
        }
    }
}

#[tokio::test]
async fn test_ranges_starting_at_leaf_heads() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let keys: Vec<u64> = (0..40).collect();
    let tree = committed_tree(&ctx, keys.iter().copied()).await;

    // Leaf heads are exactly the separator keys one level above the leaves.
    let dump = tree.dump().await.expect("dump");
    let heads: Vec<u64> = dump
        .lines()
        .filter(|line| line.trim_start().starts_with("leaf"))
        .filter_map(|line| line.split('[').nth(1))
        .filter_map(|entries| entries.split('=').next())
        .filter_map(|head| head.parse().ok())
        .collect();
    assert!(heads.len() > 5, "expected many leaves, got {heads:?}");

    for head in heads {
        assert_eq!(scan(&tree, head, head).await, vec![value_for(head)]);
        assert_eq!(scan(&tree, head, head + 2).await, expected(&keys, head, head + 2));
        if head > 0 {
            assert_eq!(scan(&tree, head - 1, head).await, expected(&keys, head - 1, head));
        }
    }
}

#[tokio::test]
async fn test_range_skips_tombstones_across_leaves() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..20).await;

    let mut txn = Txn::begin(&ctx);
    for key in 5..15 {
        tree.delete(key, &mut txn).await.expect("delete");
    }
    txn.commit().await.expect("commit");

    assert_eq!(
        scan(&tree, 3, 16).await,
        vec![value_for(3), value_for(4), value_for(15), value_for(16)]
    );
    assert!(scan(&tree, 5, 14).await.is_empty());
}

#[tokio::test]
async fn test_cursor_is_lazy_and_forward_only() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..50).await;

    let reloaded: BTree<u64, String> = BTree::open(&context(&grid), tree.id());
    let mut cursor = reloaded.range(&0, &49).await.expect("range");
    let gets_before = grid.stats().gets;
    assert_eq!(cursor.next().await.expect("next"), Some(value_for(0)));
    // The first leaf was fetched when the cursor was positioned.
    assert_eq!(grid.stats().gets, gets_before);

    let mut seen = 1;
    while cursor.next().await.expect("next").is_some() {
        seen += 1;
    }
    assert_eq!(seen, 50);
    assert!(grid.stats().gets > gets_before);
    assert_eq!(cursor.next().await.expect("next"), None);
}
