// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Common builders for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use rucket_pgmap::{ClusterState, OsdNum, OsdSet, OsdTree, PoolConfig, Scheme};

/// Device number from a literal.
pub fn osd(n: u64) -> OsdNum {
    OsdNum::new(n).expect("OSD numbers are non-zero")
}

/// Set of device numbers.
pub fn osds(ids: &[u64]) -> BTreeSet<OsdNum> {
    ids.iter().copied().map(osd).collect()
}

/// `hosts` hosts named `host1..`, each with `per_host` OSDs of weight 1,
/// numbered consecutively from 1.
pub fn topology(hosts: u64, per_host: u64) -> OsdTree {
    let mut tree = OsdTree::new();
    for h in 1..=hosts {
        let host = format!("host{h}");
        tree.add_node(host.clone(), "host", None).expect("unique host");
        for i in 0..per_host {
            tree.add_osd(osd((h - 1) * per_host + i + 1), 1.0, Some(&host), &[]).expect("unique OSD");
        }
    }
    tree
}

/// Host of an OSD in [`topology`].
pub fn host_of(osd: OsdNum, per_host: u64) -> u64 {
    (osd.get() - 1) / per_host + 1
}

/// Replicated pool with a small combination budget.
pub fn replicated_pool(pg_size: usize, pg_count: u32) -> PoolConfig {
    PoolConfig {
        name: Some("replicated".to_string()),
        pg_size,
        pg_minsize: pg_size.saturating_sub(1).max(1),
        pg_count,
        max_osd_combinations: 300,
        ..Default::default()
    }
}

/// Erasure-coded pool with one parity chunk.
pub fn ec_pool(pg_size: usize, pg_count: u32) -> PoolConfig {
    PoolConfig {
        name: Some("ec".to_string()),
        scheme: Scheme::Ec,
        pg_size,
        pg_minsize: pg_size - 1,
        parity_chunks: 1,
        pg_count,
        max_osd_combinations: 300,
        ..Default::default()
    }
}

/// Cluster with every OSD of `tree` up.
pub fn cluster(tree: OsdTree, pools: Vec<(u32, PoolConfig)>) -> ClusterState {
    let up_osds = tree.osds().map(|(osd, _)| osd).collect();
    ClusterState {
        pools: pools.into_iter().collect::<BTreeMap<_, _>>(),
        osd_tree: tree,
        up_osds,
        watch_revision: 100,
        ..Default::default()
    }
}

/// Raw rows of a layout.
pub fn raw(pgs: &[OsdSet]) -> Vec<Vec<u64>> {
    pgs.iter().map(OsdSet::to_raw).collect()
}
