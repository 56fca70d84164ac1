//! End-to-end tests at the index level.
//!
//! Each test file covers a specific scenario against an in-memory grid,
//! using deterministic inputs or seeded randomness so failures reproduce.

#![cfg(test)]

mod helpers;

mod test_catalog_bootstrap;
mod test_commit_failures;
mod test_occupancy;
mod test_properties;
mod test_random_workload;
mod test_range;
mod test_sequential_keys;
mod test_string_keys;
