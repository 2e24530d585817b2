// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Error types for PG assignment.

use thiserror::Error;

use crate::types::PoolId;

/// Result type for PG assignment operations.
pub type Result<T> = std::result::Result<T, PgMapError>;

/// Reasons a pool or global configuration is rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A pool setting is out of range or inconsistent.
    #[error("pool {pool_id}: {message}")]
    InvalidPool {
        /// The offending pool.
        pool_id: PoolId,
        /// What is wrong with it.
        message: String,
    },

    /// A placement level name is not defined cluster-wide.
    #[error("pool {pool_id}: unknown placement level '{level}'")]
    UnknownLevel {
        /// The offending pool.
        pool_id: PoolId,
        /// The level name.
        level: String,
    },

    /// The raw placement rule string could not be parsed.
    #[error("pool {pool_id}: invalid raw_placement: {message}")]
    RawPlacement {
        /// The offending pool.
        pool_id: PoolId,
        /// Parser message.
        message: String,
    },

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(pool_id: PoolId, message: impl Into<String>) -> Self {
        Self::InvalidPool { pool_id, message: message.into() }
    }
}

/// Errors raised while computing or persisting PG assignments.
#[derive(Debug, Error)]
pub enum PgMapError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No device combination satisfies the pool's placement rules.
    #[error("pool {pool_id}: no OSD combination satisfies the placement rules")]
    NoCombinations {
        /// The pool being optimized.
        pool_id: PoolId,
    },

    /// The optimizer could not produce a layout.
    #[error("pool {pool_id}: optimizer failed: {message}")]
    Optimizer {
        /// The pool being optimized.
        pool_id: PoolId,
        /// Failure description.
        message: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
