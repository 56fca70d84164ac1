//! Failed and expired commits leave the committed tree untouched.

use std::time::Duration;

use crate::config::IndexConfig;
use crate::e2e_tests::helpers::*;
use crate::grid::{GridError, MemoryGrid};
use crate::structures::{BTree, Txn, TxnError};

#[tokio::test]
async fn test_failed_commit_keeps_previous_state() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..10).await;
    let records_before = grid.record_count();

    grid.set_fail_commits(true);
    let mut txn = Txn::begin(&ctx);
    for key in 10..30 {
        tree.put(key, Some(value_for(key)), &mut txn)
            .await
            .expect("put");
    }
    tree.delete(3, &mut txn).await.expect("delete");
    assert!(txn.changed_count() > 0);

    let err = txn.commit().await.expect_err("commit should fail");
    assert!(matches!(err, TxnError::Grid(GridError::InjectedFault(_))));
    assert_eq!(txn.changed_count(), 0);
    assert_eq!(txn.deleted_count(), 0);
    assert!(txn.is_finished());
    assert_eq!(grid.record_count(), records_before);
    assert_eq!(grid.live_transactions(), 0);

    grid.set_fail_commits(false);
    assert_eq!(all_keys(&tree).await, (0..10).collect::<Vec<_>>());
    assert_eq!(tree.get(&3).await.expect("get"), Some(value_for(3)));
    assert_eq!(tree.get(&20).await.expect("get"), None);

    // The same handle accepts new work.
    let mut txn = Txn::begin(&ctx);
    tree.put(42, Some(value_for(42)), &mut txn)
        .await
        .expect("put");
    txn.commit().await.expect("commit");
    let fresh: BTree<u64, String> = BTree::open(&context(&grid), tree.id());
    assert_eq!(fresh.get(&42).await.expect("get"), Some(value_for(42)));
    assert_eq!(fresh.count().await.expect("count"), 11);
}

#[tokio::test]
async fn test_expired_flush_aborts_everything() {
    let grid = MemoryGrid::new().with_latency(Duration::from_millis(50));
    let config = IndexConfig {
        op_timeout: Duration::from_millis(10),
        ..IndexConfig::default()
    };
    let ctx = context_with(&grid, config);

    let mut txn = Txn::begin(&ctx);
    let tree: BTree<u64, String> = BTree::create(&ctx, &mut txn).expect("create");
    for key in 0..8 {
        tree.put(key, Some(value_for(key)), &mut txn)
            .await
            .expect("put");
    }

    let err = txn.commit().await.expect_err("commit should time out");
    assert!(
        matches!(
            err,
            TxnError::Flush {
                source: GridError::Timeout(_),
                ..
            }
        ),
        "unexpected error: {err}"
    );
    assert_eq!(grid.record_count(), 0);
    assert_eq!(grid.live_transactions(), 0);
    assert_eq!(grid.stats().commits, 0);
}

#[tokio::test]
async fn test_abort_discards_buffered_changes() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..6).await;

    let mut txn = Txn::begin(&ctx);
    tree.put(100, Some(value_for(100)), &mut txn)
        .await
        .expect("put");
    txn.abort().expect("abort");
    assert!(matches!(txn.commit().await, Err(TxnError::Finished)));

    assert_eq!(tree.get(&100).await.expect("get"), None);
    assert_eq!(all_keys(&tree).await, (0..6).collect::<Vec<_>>());
    tree.verify().await.expect("verify");
}

#[tokio::test]
async fn test_aborted_root_split_keeps_handle_usable() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..3).await;

    let mut txn = Txn::begin(&ctx);
    tree.put(100, Some(value_for(100)), &mut txn)
        .await
        .expect("put");
    txn.abort().expect("abort");

    assert_eq!(tree.get(&100).await.expect("get"), None);
    let mut txn = Txn::begin(&ctx);
    tree.put(1, Some(value_for(1)), &mut txn)
        .await
        .expect("put after abort");
    txn.commit().await.expect("commit");
    assert_eq!(all_keys(&tree).await, vec![0, 1, 2]);
}
