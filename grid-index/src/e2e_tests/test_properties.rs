//! Property tests: any sequence of puts and deletes, committed in batches,
//! leaves a tree that agrees with a `BTreeMap`.

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::config::IndexConfig;
use crate::e2e_tests::helpers::*;
use crate::grid::MemoryGrid;
use crate::structures::{BTree, Txn};

#[derive(Debug, Clone)]
enum Op {
    Put(u16, u32),
    Delete(u16),
    Commit,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u16..256, any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0u16..256).prop_map(Op::Delete),
        1 => Just(Op::Commit),
    ]
}

async fn check(ops: Vec<Op>, capacity: usize) {
    let grid = MemoryGrid::new();
    let config = IndexConfig {
        node_capacity: capacity,
        ..IndexConfig::default()
    };
    let ctx = context_with(&grid, config);
    let mut txn = Txn::begin(&ctx);
    let tree: BTree<u16, u32> = BTree::create(&ctx, &mut txn).expect("create");
    let mut model = BTreeMap::new();

    for op in ops {
        match op {
            Op::Put(key, value) => {
                tree.put(key, Some(value), &mut txn).await.expect("put");
                model.insert(key, value);
            }
            Op::Delete(key) => {
                tree.delete(key, &mut txn).await.expect("delete");
                model.remove(&key);
            }
            Op::Commit => {
                txn.commit().await.expect("commit");
                txn = Txn::begin(&ctx);
            }
        }
    }
    txn.commit().await.expect("commit");

    let reopened: BTree<u16, u32> = BTree::open(&context_with(&grid, config), tree.id());
    let keys = reopened
        .keys()
        .await
        .expect("keys")
        .collect()
        .await
        .expect("collect");
    assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());

    let values = reopened
        .range(&64, &192)
        .await
        .expect("range")
        .collect()
        .await
        .expect("collect");
    assert_eq!(values, model.range(64..=192).map(|(_, v)| *v).collect::<Vec<_>>());

    let shape = reopened.verify().await.expect("verify");
    assert!(shape.max_fill < capacity);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_tree_agrees_with_model(
        ops in prop::collection::vec(op_strategy(), 1..200),
        capacity in prop_oneof![Just(4usize), Just(6), Just(8)],
    ) {
        runtime().block_on(check(ops, capacity));
    }
}
