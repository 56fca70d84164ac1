//! Keys 0..9 mapped to "value_0".."value_9", read back before and after a
//! reload by identity.

use crate::e2e_tests::helpers::*;
use crate::grid::MemoryGrid;
use crate::structures::BTree;

#[tokio::test]
async fn test_ten_sequential_keys() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..10).await;

    assert_eq!(tree.get(&5).await.expect("get"), Some("value_5".to_string()));
    assert_eq!(tree.get(&10).await.expect("get"), None);
    assert_eq!(all_keys(&tree).await, (0..10).collect::<Vec<_>>());
    assert!(tree.height().await.expect("height") >= 2);
}

#[tokio::test]
async fn test_ten_sequential_keys_survive_reload() {
    let grid = MemoryGrid::new();
    let id = {
        let ctx = context(&grid);
        committed_tree(&ctx, 0..10).await.id()
    };

    // A fresh context shares nothing with the writer but the grid.
    let ctx = context(&grid);
    let reloaded: BTree<u64, String> = BTree::open(&ctx, id);
    for key in 0..10 {
        assert_eq!(
            reloaded.get(&key).await.expect("get"),
            Some(value_for(key)),
            "key {key} after reload"
        );
    }
    assert_eq!(all_keys(&reloaded).await, (0..10).collect::<Vec<_>>());
    reloaded.verify().await.expect("verify");
}

#[tokio::test]
async fn test_reload_sees_later_commits() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..10).await;

    let mut txn = crate::structures::Txn::begin(&ctx);
    for key in 10..20 {
        tree.put(key, Some(value_for(key)), &mut txn)
            .await
            .expect("put");
    }
    tree.delete(3, &mut txn).await.expect("delete");
    txn.commit().await.expect("commit");

    let reloaded: BTree<u64, String> = BTree::open(&context(&grid), tree.id());
    let expected: Vec<u64> = (0..20).filter(|k| *k != 3).collect();
    assert_eq!(all_keys(&reloaded).await, expected);
    assert_eq!(reloaded.count().await.expect("count"), 19);
}
