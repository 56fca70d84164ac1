//! Seeded random workloads checked against a `BTreeMap` model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::*;
use crate::grid::{FaultConfig, GridStats, MemoryGrid};
use crate::structures::{BTree, GridContext, Txn};

const KEY_SPACE: u64 = 200;

/// Staged operations of one transaction; `None` deletes.
type Batch = Vec<(u64, Option<String>)>;

fn random_batch(rng: &mut StdRng, len: usize) -> Batch {
    (0..len)
        .map(|_| {
            let key = rng.random_range(0..KEY_SPACE);
            if rng.random_bool(0.7) {
                (key, Some(format!("v{}", rng.random::<u32>())))
            } else {
                (key, None)
            }
        })
        .collect()
}

fn apply(model: &mut BTreeMap<u64, String>, batch: Batch) {
    for (key, value) in batch {
        match value {
            Some(value) => model.insert(key, value),
            None => model.remove(&key),
        };
    }
}

async fn run_batch(tree: &BTree<u64, String>, ctx: &GridContext, batch: &Batch) -> bool {
    let mut txn = Txn::begin(ctx);
    for (key, value) in batch {
        if tree.put(*key, value.clone(), &mut txn).await.is_err() {
            if !txn.is_finished() {
                let _ = txn.abort();
            }
            return false;
        }
    }
    txn.commit().await.is_ok()
}

async fn assert_matches_model(tree: &BTree<u64, String>, model: &BTreeMap<u64, String>) {
    assert_eq!(all_keys(tree).await, model.keys().copied().collect::<Vec<_>>());
    for key in 0..KEY_SPACE {
        assert_eq!(tree.get(&key).await.expect("get"), model.get(&key).cloned(), "key {key}");
    }
    let values = tree
        .range(&50, &150)
        .await
        .expect("range")
        .collect()
        .await
        .expect("collect");
    assert_eq!(values, model.range(50..=150).map(|(_, v)| v.clone()).collect::<Vec<_>>());
    tree.verify().await.expect("verify");
}

async fn run_workload(seed: u64) -> (GridStats, Vec<u64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let grid = MemoryGrid::new();
    let ctx = context(&grid);
    let mut tree = committed_tree(&ctx, 0..0).await;
    let mut model = BTreeMap::new();

    for round in 0..40 {
        let len = rng.random_range(1..20);
        let batch = random_batch(&mut rng, len);
        assert!(run_batch(&tree, &ctx, &batch).await, "round {round} failed");
        apply(&mut model, batch);

        if round % 8 == 7 {
            tree = BTree::open(&context(&grid), tree.id());
            assert_matches_model(&tree, &model).await;
        }
    }
    assert_matches_model(&tree, &model).await;
    (grid.stats(), all_keys(&tree).await)
}

#[tokio::test]
async fn test_random_workload_matches_model() {
    for seed in [1, 7, 42] {
        run_workload(seed).await;
    }
}

#[tokio::test]
async fn test_same_seed_same_outcome() {
    let first = run_workload(1234).await;
    let second = run_workload(1234).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_faulty_grid_never_loses_committed_work() {
    let mut rng = StdRng::seed_from_u64(99);
    let grid = MemoryGrid::with_faults(FaultConfig::no_faults(), 99);
    let ctx = context(&grid);
    let tree = committed_tree(&ctx, 0..0).await;
    let mut model = BTreeMap::new();

    grid.set_fault_config(FaultConfig {
        read_error_rate: 0.01,
        write_error_rate: 0.01,
        commit_error_rate: 0.05,
    });

    let mut failures = 0;
    for _ in 0..150 {
        let len = rng.random_range(1..12);
        let batch = random_batch(&mut rng, len);
        if run_batch(&tree, &ctx, &batch).await {
            apply(&mut model, batch);
        } else {
            failures += 1;
        }
    }

    grid.set_fault_config(FaultConfig::no_faults());
    // The handle that saw every failure agrees with a fresh one.
    assert_matches_model(&tree, &model).await;
    let reopened: BTree<u64, String> = BTree::open(&context(&grid), tree.id());
    assert_matches_model(&reopened, &model).await;
    assert!(grid.stats().injected_faults > 0);
    assert!(failures > 0);
    assert_eq!(grid.live_transactions(), 0);
}
