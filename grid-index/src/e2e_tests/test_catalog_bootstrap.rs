//! Catalog bootstrap across catalogs sharing one grid.

use crate::e2e_tests::helpers::*;
use crate::grid::{Grid, MemoryGrid};
use crate::structures::{BTree, BootstrapOutcome, CATALOG_ROOT_NAME, Catalog, Txn};

#[tokio::test]
async fn test_sequential_bootstraps_agree() {
    let grid = MemoryGrid::new();

    let first = Catalog::new(&context(&grid))
        .bootstrap()
        .await
        .expect("first bootstrap");
    let second = Catalog::new(&context(&grid))
        .bootstrap()
        .await
        .expect("second bootstrap");

    assert_eq!(first.outcome, BootstrapOutcome::Created);
    assert_eq!(second.outcome, BootstrapOutcome::Recovered);
    assert_eq!(
        (first.names_to_ids, first.tables_to_indexes),
        (second.names_to_ids, second.tables_to_indexes)
    );

    let native = grid.begin_transaction();
    let root = grid.resolve_root(CATALOG_ROOT_NAME, native).expect("resolve");
    assert!(!root.created);
    assert_eq!(root.id, first.root_id);
    grid.abort(native).expect("abort");
}

#[tokio::test]
async fn test_index_registered_in_one_catalog_opens_in_another() {
    let grid = MemoryGrid::new();
    let writer_ctx = context(&grid);
    let writer = Catalog::new(&writer_ctx);

    let mut txn = Txn::begin(&writer_ctx);
    let index: BTree<u64, String> = BTree::create(&writer_ctx, &mut txn).expect("create index");
    for key in 0..30 {
        index
            .put(key, Some(value_for(key)), &mut txn)
            .await
            .expect("put");
    }
    writer.register("events", index.id(), &mut txn).await.expect("register");
    txn.commit().await.expect("commit");

    let reader = Catalog::new(&context(&grid));
    assert_eq!(reader.names().await.expect("names"), vec!["EVENTS".to_string()]);
    let opened: BTree<u64, String> = reader
        .open_index("Events")
        .await
        .expect("open")
        .expect("registered");
    assert_eq!(opened.get(&17).await.expect("get"), Some(value_for(17)));
    assert_eq!(all_keys(&opened).await, (0..30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_many_registrations_split_the_registry() {
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let catalog = Catalog::new(&ctx);

    let mut txn = Txn::begin(&ctx);
    for i in 0..40u64 {
        catalog
            .register(&format!("index_{i:02}"), 1_000 + i, &mut txn)
            .await
            .expect("register");
    }
    txn.commit().await.expect("commit");

    let reader = Catalog::new(&context(&grid));
    let names = reader.names().await.expect("names");
    assert_eq!(names.len(), 40);
    assert_eq!(names[0], "INDEX_00");
    assert_eq!(reader.lookup("index_39").await.expect("lookup"), Some(1_039));
}
