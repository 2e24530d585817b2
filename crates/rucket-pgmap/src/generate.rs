// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Per-pool PG generation.
//!
//! For one pool:
//! 1. validate the configuration (invalid pools are skipped this cycle)
//! 2. filter the topology by root node, tags and block layout
//! 3. seed from the last clean layout, else the configured one, resized
//!    to the target PG count and padded to `pg_size`
//! 4. run the optimizer in change mode when a seed and a layout hash
//!    exist, in initial mode otherwise
//! 5. summarize the achieved redundancy and space
//!
//! Each call owns its state, so pools can be generated concurrently. The
//! results are then staged into store transactions by a single caller.

use std::collections::{BTreeMap, BTreeSet};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::combinator::CombinatorKind;
use crate::config::{validate_pool_config, GlobalConfig, PoolConfig};
use crate::error::Result;
use crate::optimizer::{log_change_stats, OptimizeRequest, PgOptimizer};
use crate::rescale::{pad_pgs, rescale_pg_count};
use crate::topology::{by_block_layout, by_root_node, by_tags, make_hier_tree, OsdStats, OsdTree};
use crate::txn::{PgTxnBuilder, PoolUpdate, TxnRequest};
use crate::types::{OsdNum, OsdSet, PgHistory, PgTable, PoolId};

/// Cluster state read from the coordination store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterState {
    /// Pool configurations.
    pub pools: BTreeMap<PoolId, PoolConfig>,
    /// Currently configured layout (`config/pgs`).
    pub config_pgs: PgTable,
    /// Last layout known to be fully clean.
    pub last_clean_pgs: PgTable,
    /// Layout parameters reported by each OSD.
    pub osd_stats: BTreeMap<OsdNum, OsdStats>,
    /// Reported topology.
    pub osd_tree: OsdTree,
    /// OSDs currently up.
    pub up_osds: BTreeSet<OsdNum>,
    /// Per-PG history, indexed by `pg_num - 1`.
    pub pg_history: BTreeMap<PoolId, Vec<PgHistory>>,
    /// Store revision the state was read at.
    pub watch_revision: u64,
}

/// Space and redundancy summary of a generated layout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Raw space usable by the pool.
    pub total_raw_tb: f64,
    /// Smallest non-zero device count across PGs, at most `pg_size`.
    pub pg_real_size: usize,
    /// Raw bytes consumed per usable byte.
    pub raw_to_usable: f64,
    /// Usable raw space over total raw space of the pool's OSDs.
    pub space_efficiency: f64,
}

impl PoolStats {
    fn new(pool: &PoolConfig, pgs: &[OsdSet], space: f64, total_space: f64) -> Self {
        let pg_real_size = pgs
            .iter()
            .map(OsdSet::real_count)
            .filter(|&n| n > 0)
            .min()
            .map_or(pool.pg_size, |n| n.min(pool.pg_size));
        let divisor = if pool.scheme.is_erasure_coded() { pool.data_size().max(1) } else { 1 };
        let total = if total_space > 0.0 { total_space } else { 1.0 };
        Self {
            total_raw_tb: space,
            pg_real_size,
            raw_to_usable: pg_real_size as f64 / divisor as f64,
            space_efficiency: space / total,
        }
    }
}

/// Generated layout of one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolPgResult {
    /// Pool the layout belongs to.
    pub pool_id: PoolId,
    /// One device set per PG, `pg_size` slots each.
    pub pgs: Vec<OsdSet>,
    /// Summary statistics.
    pub stats: PoolStats,
}

/// Picks the layout that seeds the optimizer: the last clean one if the
/// pool has any, the configured one otherwise.
#[must_use]
pub fn seed_layout(state: &ClusterState, pool_id: PoolId) -> Vec<OsdSet> {
    let pg_count = state.pools.get(&pool_id).map_or(0, |pool| pool.pg_count);
    let last_clean = state.last_clean_pgs.pool_osd_sets(pool_id, pg_count);
    if !last_clean.is_empty() {
        return last_clean;
    }
    state.config_pgs.pool_osd_sets(pool_id, pg_count)
}

/// Computes a new layout for one pool.
///
/// Returns `Ok(None)` when the pool is unknown or its configuration is
/// invalid; the pool is retried on the next cycle.
///
/// # Errors
///
/// Returns an error if the placement rules cannot be derived or the
/// optimizer fails. Dropping the future abandons the computation.
pub async fn generate_pool_pgs<O>(
    state: &ClusterState,
    global: &GlobalConfig,
    pool_id: PoolId,
    optimizer: &O,
) -> Result<Option<PoolPgResult>>
where
    O: PgOptimizer + ?Sized,
{
    let Some(pool) = state.pools.get(&pool_id) else {
        warn!(pool_id, "Pool not configured, skipping");
        counter!("rucket_pg_pools_skipped").increment(1);
        return Ok(None);
    };
    let levels = global.levels();
    if let Err(e) = validate_pool_config(pool_id, pool, &levels) {
        warn!(pool_id, pool_name = pool.display_name(), error = %e, "Invalid pool configuration, skipping");
        counter!("rucket_pg_pools_skipped").increment(1);
        return Ok(None);
    }

    let tree = by_root_node(state.osd_tree.clone(), &levels, pool.root_node.as_deref());
    let tree = by_tags(tree, &pool.osd_tags);
    let tree = by_block_layout(
        tree,
        &state.osd_stats,
        pool.effective_block_size(global),
        pool.effective_bitmap_granularity(global),
        pool.effective_immediate_commit(global),
    );
    let hier = make_hier_tree(&levels, &tree);

    let request = OptimizeRequest {
        pool_id,
        osd_weights: hier.osd_weights(),
        combinator: CombinatorKind::select(global, pool_id, pool, &levels, &hier)?,
        pg_count: pool.pg_count,
        pg_size: pool.pg_size,
        pg_minsize: pool.pg_minsize,
        ordered: pool.scheme.is_erasure_coded(),
    };

    let mut seed = seed_layout(state, pool_id);
    let result = if !seed.is_empty() && state.config_pgs.hash.is_some() {
        // The last clean layout may still have the old PG count.
        rescale_pg_count(&mut seed, pool.pg_count as usize);
        pad_pgs(&mut seed, pool.pg_size);
        optimizer.optimize_change(request, seed).await?
    } else {
        info!(pool_id, pool_name = pool.display_name(), "No usable layout, computing PGs from scratch");
        optimizer.optimize_initial(request).await?
    };
    log_change_stats(pool_id, pool.display_name(), &result);

    let mut pgs = result.int_pgs;
    pad_pgs(&mut pgs, pool.pg_size);
    let stats = PoolStats::new(pool, &pgs, result.space, result.total_space);
    Ok(Some(PoolPgResult { pool_id, pgs, stats }))
}

/// Compare/put pairs each request leaves free for the `config/pgs` write.
const CONFIG_PGS_PAIRS: usize = 1;

/// Store requests and in-memory state after staging generated layouts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StagedUpdate {
    /// Requests to commit in order. Each has room for one more compare and
    /// one more operation, used to write `pgs` under `config/pgs`.
    pub requests: Vec<TxnRequest>,
    /// Updated `config/pgs` table.
    pub pgs: PgTable,
    /// Updated per-PG history.
    pub history: BTreeMap<PoolId, Vec<PgHistory>>,
}

/// Stages generated layouts against the configured one.
///
/// Pools still present in `config/pgs` but no longer configured are
/// staged with an empty layout: their table entry is dropped and their
/// history keys are deleted.
///
/// # Errors
///
/// Returns an error if a history cannot be serialized.
pub fn stage_results(
    state: &ClusterState,
    global: &GlobalConfig,
    results: &[PoolPgResult],
) -> Result<StagedUpdate> {
    let mut builder = PgTxnBuilder::new(global.etcd_prefix.as_str(), state.watch_revision);
    let mut pgs = state.config_pgs.clone();
    let mut history = state.pg_history.clone();
    for result in results {
        let Some(pool) = state.pools.get(&result.pool_id) else {
            continue;
        };
        let prev_pgs = state.config_pgs.pool_osd_sets(result.pool_id, pool.pg_count);
        let update = PoolUpdate {
            pool_id: result.pool_id,
            pool,
            prev_pgs: &prev_pgs,
            new_pgs: &result.pgs,
        };
        builder.save_new_pgs(
            &update,
            &state.up_osds,
            &state.osd_tree,
            history.entry(result.pool_id).or_default(),
            &mut pgs,
        )?;
    }

    let removed = PoolConfig::default();
    for &pool_id in state.config_pgs.items.keys().filter(|id| !state.pools.contains_key(id)) {
        info!(pool_id, "Pool removed, deleting its PGs");
        let prev_pgs = state.config_pgs.pool_osd_sets(pool_id, 0);
        let update = PoolUpdate { pool_id, pool: &removed, prev_pgs: &prev_pgs, new_pgs: &[] };
        builder.save_new_pgs(&update, &state.up_osds, &state.osd_tree, &mut Vec::new(), &mut pgs)?;
        history.remove(&pool_id);
    }

    let requests = builder.into_requests(global.max_txn_ops, CONFIG_PGS_PAIRS);
    Ok(StagedUpdate { requests, pgs, history })
}
