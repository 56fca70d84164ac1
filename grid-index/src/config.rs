//! Index configuration module.
//!
//! This module provides configuration loading for the index from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `GRID_INDEX_NODE_CAPACITY`: Entries per node at which a node splits (default: `4`)
//! - `GRID_INDEX_MAX_NODE_BYTES`: Serialized byte budget per node (default: `32768`)
//! - `GRID_INDEX_OP_TIMEOUT_MS`: Timeout for each pending grid operation (default: `5000`)
//!
//! # Invariants
//!
//! - `node_capacity` is even, at least 4 and at most `MAX_NODE_CAPACITY`, so a
//!   split yields two half-full nodes and the capacity fits a tree header
//! - `max_node_bytes` is at least `MIN_NODE_BYTES`
//! - `op_timeout` is non-zero

use std::time::Duration;

use crate::structures::node::NODE_OVERHEAD;

/// Index configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()` or `from_lookup()`, the config has
/// passed `validate()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Number of entries at which a node is split.
    pub node_capacity: usize,
    /// Maximum serialized size of a node in bytes.
    pub max_node_bytes: usize,
    /// Timeout applied to every fetch, persist and delete.
    pub op_timeout: Duration,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            node_capacity: Self::DEFAULT_NODE_CAPACITY,
            max_node_bytes: Self::DEFAULT_MAX_NODE_BYTES,
            op_timeout: Duration::from_millis(Self::DEFAULT_OP_TIMEOUT_MS),
        }
    }
}

impl IndexConfig {
    /// Default node capacity.
    pub const DEFAULT_NODE_CAPACITY: usize = 4;
    /// Default per-node byte budget.
    pub const DEFAULT_MAX_NODE_BYTES: usize = 32_768;
    /// Default per-operation timeout in milliseconds.
    pub const DEFAULT_OP_TIMEOUT_MS: u64 = 5_000;
    /// Smallest accepted byte budget.
    pub const MIN_NODE_BYTES: usize = 64;
    /// Largest even capacity a tree header's `u16` can record.
    pub const MAX_NODE_CAPACITY: usize = 65_534;

    const NODE_CAPACITY_VAR: &'static str = "GRID_INDEX_NODE_CAPACITY";
    const MAX_NODE_BYTES_VAR: &'static str = "GRID_INDEX_MAX_NODE_BYTES";
    const OP_TIMEOUT_VAR: &'static str = "GRID_INDEX_OP_TIMEOUT_MS";

    /// Load configuration from environment variables.
    ///
    /// Unset variables fall back to their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let node_capacity = parse_var(&lookup, Self::NODE_CAPACITY_VAR)?
            .unwrap_or(defaults.node_capacity);
        let max_node_bytes = parse_var(&lookup, Self::MAX_NODE_BYTES_VAR)?
            .unwrap_or(defaults.max_node_bytes);
        let op_timeout = parse_var::<u64>(&lookup, Self::OP_TIMEOUT_VAR)?
            .map_or(defaults.op_timeout, Duration::from_millis);

        let config = Self {
            node_capacity,
            max_node_bytes,
            op_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants listed in the module docs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_capacity < 4 || self.node_capacity % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                name: Self::NODE_CAPACITY_VAR.to_string(),
                message: format!("{} must be an even number >= 4", self.node_capacity),
            });
        }
        self.header_capacity()?;
        if self.max_node_bytes < Self::MIN_NODE_BYTES {
            return Err(ConfigError::InvalidValue {
                name: Self::MAX_NODE_BYTES_VAR.to_string(),
                message: format!(
                    "{} is below the minimum of {}",
                    self.max_node_bytes,
                    Self::MIN_NODE_BYTES
                ),
            });
        }
        if self.op_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: Self::OP_TIMEOUT_VAR.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// `node_capacity` as stored in a tree header.
    pub fn header_capacity(&self) -> Result<u16, ConfigError> {
        u16::try_from(self.node_capacity)
            .ok()
            .filter(|_| self.node_capacity <= Self::MAX_NODE_CAPACITY)
            .ok_or_else(|| ConfigError::InvalidValue {
                name: Self::NODE_CAPACITY_VAR.to_string(),
                message: format!(
                    "{} exceeds the maximum of {}",
                    self.node_capacity,
                    Self::MAX_NODE_CAPACITY
                ),
            })
    }

    /// Largest encoded entry accepted, so that a node holding `node_capacity`
    /// entries always stays within `max_node_bytes`.
    #[must_use]
    pub const fn entry_limit(&self) -> usize {
        self.max_node_bytes.saturating_sub(NODE_OVERHEAD) / self.node_capacity
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}' is not a valid number"),
            })
        })
        .transpose()
}
