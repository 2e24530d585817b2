// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Placement group (PG) assignment for a distributed block store.
//!
//! This crate decides which OSDs hold each PG of each pool, which OSD is
//! the PG's primary, and how the new assignment is persisted with minimal
//! data movement.
//!
//! # Overview
//!
//! - PG layouts are computed per pool from a filtered OSD topology, seeded
//!   from the last clean layout so that changes move as little data as
//!   possible
//! - Primaries are chosen by a tiered policy (affinity, liveness, data
//!   positions for erasure-coded pools) with a deterministic tie-break, so
//!   independent recomputations agree
//! - New layouts are staged as optimistic store transactions guarded by
//!   the watched revision, together with a deduplicated per-PG history
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     generate_pool_pgs                     │
//! ├──────────────────────────────────────────────────────────┤
//! │  validate ─► topology filters ─► HierTree ─► Combinator   │
//! │                                                  │        │
//! │  seed (last clean │ configured) ─► rescale/pad   │        │
//! │                                      │           ▼        │
//! │                                      └──► PgOptimizer     │
//! └──────────────────────────────┬───────────────────────────┘
//!                                │ device sets
//!                                ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  PgTxnBuilder: pick_primary (PrimaryRng) + history        │
//! │  ─► compare/put/delete requests + updated PgTable         │
//! └──────────────────────────────────────────────────────────┘
//!
//!   recheck_primaries: refresh primaries only, on liveness changes
//! ```
//!
//! # Usage
//!
//! ```
//! use std::collections::BTreeSet;
//!
//! use rucket_pgmap::{pick_primary, OsdNum, OsdSet, PoolConfig, PrimaryRng};
//!
//! let pool = PoolConfig { pg_size: 3, pg_count: 1, ..Default::default() };
//! let set = OsdSet::from_raw(&[5, 0, 7]);
//! let up: BTreeSet<OsdNum> = [5, 7].into_iter().filter_map(OsdNum::new).collect();
//! let affinity: BTreeSet<OsdNum> = [7].into_iter().filter_map(OsdNum::new).collect();
//!
//! let mut rng = PrimaryRng::new();
//! let primary = pick_primary(&pool, &set, &up, &affinity, &mut rng);
//! assert_eq!(primary, OsdNum::new(7));
//! ```

#![warn(missing_docs)]

pub mod combinator;
pub mod config;
pub mod error;
pub mod generate;
pub mod hash;
pub mod optimizer;
pub mod primary;
pub mod rescale;
pub mod rng;
pub mod rules;
pub mod topology;
pub mod txn;
pub mod types;

pub use combinator::{Combinator, CombinatorKind, FlatCombinator, RuleCombinator};
pub use config::{
    validate_pool_config, GlobalConfig, ImmediateCommit, LogFormat, LoggingConfig, PlacementLevels,
    PoolConfig, Scheme,
};
pub use error::{ConfigError, PgMapError, Result};
pub use generate::{
    generate_pool_pgs, seed_layout, stage_results, ClusterState, PoolPgResult, PoolStats, StagedUpdate,
};
pub use optimizer::{GreedyOptimizer, OptimizeRequest, OptimizeResult, PgOptimizer};
pub use primary::{pick_primary, recheck_primaries};
pub use rescale::{pad_pgs, rescale_pg_count};
pub use rng::PrimaryRng;
pub use rules::{extract_pg_rules, PgRules};
pub use topology::{
    by_block_layout, by_root_node, by_tags, compute_affinity, make_hier_tree, HierTree, OsdStats,
    OsdTree,
};
pub use txn::{history_key, PgTxnBuilder, PoolUpdate, TxnOp, TxnRequest};
pub use types::{OsdNum, OsdSet, PgConfig, PgHistory, PgNum, PgTable, PoolId};
