//! String keys in a capacity-4 tree, committed and reloaded.

use crate::e2e_tests::helpers::*;
use crate::grid::MemoryGrid;
use crate::structures::{BTree, Txn};

#[tokio::test]
async fn test_three_string_keys_reload() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);

    let mut txn = Txn::begin(&ctx);
    let tree: BTree<String, String> = BTree::create(&ctx, &mut txn).expect("create tree");
    for i in 1..=3 {
        tree.put(format!("key_{i}"), Some(format!("value_{i}")), &mut txn)
            .await
            .expect("put");
    }
    txn.commit().await.expect("commit");
    assert_eq!(tree.capacity().await.expect("capacity"), 4);

    let reloaded: BTree<String, String> = BTree::open(&context(&grid), tree.id());
    for i in 1..=3 {
        assert_eq!(
            reloaded.get(&format!("key_{i}")).await.expect("get"),
            Some(format!("value_{i}"))
        );
    }
    assert_eq!(reloaded.get(&"key_4".to_string()).await.expect("get"), None);
}

#[tokio::test]
async fn test_string_keys_sort_bytewise() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);

    let mut txn = Txn::begin(&ctx);
    let tree: BTree<String, u64> = BTree::create(&ctx, &mut txn).expect("create tree");
    for (i, key) in ["pear", "apple", "fig", "Banana", "apricot", "kiwi"]
        .iter()
        .enumerate()
    {
        tree.put((*key).to_string(), Some(i as u64), &mut txn)
            .await
            .expect("put");
    }
    txn.commit().await.expect("commit");

    let keys = tree.keys().await.expect("keys").collect().await.expect("collect");
    assert_eq!(keys, vec!["Banana", "apple", "apricot", "fig", "kiwi", "pear"]);

    let values = tree
        .range(&"ap".to_string(), &"b".to_string())
        .await
        .expect("range")
        .collect()
        .await
        .expect("collect");
    assert_eq!(values, vec![1, 4]);
}
