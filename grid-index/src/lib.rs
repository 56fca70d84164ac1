// An ordered index whose nodes live in a distributed transactional object
// store (the grid).
//
// Life of a write:
// 1. A caller opens a `Txn` and calls `BTree::put`
// 2. The tree fetches the path from the grid, locking it for the txn
// 3. Touched nodes mark themselves changed in the txn
// 4. `Txn::commit` flushes every changed node, then commits the grid txn
//
// System components:
//  - Grid boundary and in-memory grid
//  - B-tree over persistent node handles
//  - Transaction buffer
//  - Catalog of named indexes

pub mod config;
pub mod grid;
pub mod structures;

mod e2e_tests;
