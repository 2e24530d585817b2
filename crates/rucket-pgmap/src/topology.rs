// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! OSD topology for placement.
//!
//! The cluster reports its topology as a flat map of nodes. Interior nodes
//! (hosts, racks, datacenters) carry a level and an optional parent; OSD
//! leaves additionally carry a weight and tags. A pool sees a filtered copy
//! of that map, turned into a [`HierTree`] for the combinators.
//!
//! ```text
//!                  ""  (implicit root)
//!          ┌────────┴────────┐
//!        rack1             rack2
//!      ┌───┴───┐         ┌───┴───┐
//!    host1   host2     host3   host4
//!    1  2    3  4      5  6    7  8      (osd)
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{ImmediateCommit, PlacementLevels, PoolConfig, OSD_LEVEL};
use crate::types::OsdNum;

/// Id of the implicit root node.
pub const ROOT_ID: &str = "";

/// Errors raised while building a topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Node id already exists.
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    /// Interior node ids must not collide with the implicit root.
    #[error("node id must not be empty")]
    EmptyNodeId,
}

/// A node of the reported topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Placement level (`osd`, `host`, `rack`, ...).
    pub level: String,
    /// Parent node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Placement weight, usually capacity in TB. OSDs only.
    #[serde(default)]
    pub size: f64,
    /// OSD tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Layout parameters reported by an OSD.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsdStats {
    /// Data block size of the OSD's store.
    pub bs_block_size: Option<u64>,
    /// Allocation bitmap granularity.
    pub bitmap_granularity: Option<u64>,
    /// Commit mode the OSD supports.
    pub immediate_commit: Option<ImmediateCommit>,
}

/// Flat topology map, keyed by node id. OSD ids are their numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OsdTree {
    nodes: BTreeMap<String, TreeNode>,
}

impl OsdTree {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interior node.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        level: impl Into<String>,
        parent: Option<&str>,
    ) -> Result<(), TopologyError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TopologyError::EmptyNodeId);
        }
        if self.nodes.contains_key(&id) {
            return Err(TopologyError::DuplicateNode(id));
        }
        let node = TreeNode {
            level: level.into(),
            parent: parent.map(str::to_string),
            size: 0.0,
            tags: Vec::new(),
        };
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Adds an OSD leaf.
    pub fn add_osd(
        &mut self,
        osd: OsdNum,
        size: f64,
        parent: Option<&str>,
        tags: &[&str],
    ) -> Result<(), TopologyError> {
        let id = osd.to_string();
        if self.nodes.contains_key(&id) {
            return Err(TopologyError::DuplicateNode(id));
        }
        let node = TreeNode {
            level: OSD_LEVEL.to_string(),
            parent: parent.map(str::to_string),
            size,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        };
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Returns a node by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Returns an OSD leaf by number.
    #[must_use]
    pub fn get_osd(&self, osd: OsdNum) -> Option<&TreeNode> {
        self.nodes.get(&osd.to_string()).filter(|n| n.level == OSD_LEVEL)
    }

    /// Iterates over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &TreeNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Iterates over OSD leaves.
    pub fn osds(&self) -> impl Iterator<Item = (OsdNum, &TreeNode)> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.level == OSD_LEVEL)
            .filter_map(|(id, node)| id.parse::<OsdNum>().ok().map(|osd| (osd, node)))
    }

    #[cfg(test)]
    pub(crate) fn osd_count(&self) -> usize {
        self.osds().count()
    }

    fn retain_osds(&mut self, mut keep: impl FnMut(OsdNum, &TreeNode) -> bool) {
        self.nodes.retain(|id, node| {
            if node.level != OSD_LEVEL {
                return true;
            }
            match id.parse::<OsdNum>() {
                Ok(osd) => keep(osd, node),
                Err(_) => false,
            }
        });
    }
}

/// Restricts a topology to the subtree under `root_node` plus the chain of
/// its ancestors. No-op when the pool has no root node.
#[must_use]
pub fn by_root_node(tree: OsdTree, levels: &PlacementLevels, root_node: Option<&str>) -> OsdTree {
    let Some(root_node) = root_node.filter(|r| !r.is_empty()) else {
        return tree;
    };
    let hier = make_hier_tree(levels, &tree);

    let mut included = BTreeSet::new();
    let mut stack = vec![root_node.to_string()];
    while let Some(id) = stack.pop() {
        if let Some(node) = hier.get(&id) {
            stack.extend(node.children.iter().cloned());
        }
        included.insert(id);
    }
    let mut cur = tree.get(root_node).and_then(|n| n.parent.clone());
    while let Some(id) = cur {
        cur = tree.get(&id).and_then(|n| n.parent.clone());
        if !included.insert(id) {
            break;
        }
    }

    let mut tree = tree;
    tree.nodes.retain(|id, _| included.contains(id));
    tree
}

/// Keeps only OSDs carrying every requested tag.
#[must_use]
pub fn by_tags(mut tree: OsdTree, tags: &[String]) -> OsdTree {
    if tags.is_empty() {
        return tree;
    }
    tree.retain_osds(|_, node| tags.iter().all(|tag| node.tags.contains(tag)));
    tree
}

/// Drops OSDs whose store layout is incompatible with the pool.
///
/// An OSD is dropped when it reports a different block size or bitmap
/// granularity, or a commit mode weaker than the pool requires. OSDs
/// without stats are kept.
#[must_use]
pub fn by_block_layout(
    mut tree: OsdTree,
    stats: &BTreeMap<OsdNum, OsdStats>,
    block_size: u64,
    bitmap_granularity: u64,
    immediate_commit: ImmediateCommit,
) -> OsdTree {
    tree.retain_osds(|osd, _| {
        let Some(stat) = stats.get(&osd) else {
            return true;
        };
        let compatible = stat.bs_block_size.map_or(true, |bs| bs == block_size)
            && stat.bitmap_granularity.map_or(true, |bg| bg == bitmap_granularity)
            && stat.immediate_commit.map_or(true, |ic| ic >= immediate_commit);
        if !compatible {
            debug!(osd = osd.get(), ?stat, "OSD layout incompatible with pool");
        }
        compatible
    });
    tree
}

/// Returns the OSDs preferred as primaries: up OSDs carrying any of the
/// pool's affinity tags, or every up OSD when the pool sets none.
#[must_use]
pub fn compute_affinity(
    pool: &PoolConfig,
    up: &BTreeSet<OsdNum>,
    tree: &OsdTree,
) -> BTreeSet<OsdNum> {
    if pool.primary_affinity_tags.is_empty() {
        return up.clone();
    }
    up.iter()
        .copied()
        .filter(|&osd| {
            tree.get_osd(osd).is_some_and(|node| {
                pool.primary_affinity_tags.iter().any(|tag| node.tags.contains(tag))
            })
        })
        .collect()
}

/// A node of the hierarchical tree.
#[derive(Debug, Clone, PartialEq)]
pub struct HierNode {
    /// Node id (`""` for the root).
    pub id: String,
    /// Placement level (`root` for the implicit root).
    pub level: String,
    /// Parent id; `None` only for the root.
    pub parent: Option<String>,
    /// Child ids, OSDs ordered numerically.
    pub children: Vec<String>,
    /// OSD weight.
    pub size: f64,
}

/// Hierarchical failure-domain tree used by the combinators.
#[derive(Debug, Clone, Default)]
pub struct HierTree {
    nodes: BTreeMap<String, HierNode>,
}

impl HierTree {
    /// Returns a node by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&HierNode> {
        self.nodes.get(id)
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> Option<&HierNode> {
        self.nodes.get(ROOT_ID)
    }

    /// Weights of all OSDs in the tree.
    #[must_use]
    pub fn osd_weights(&self) -> BTreeMap<OsdNum, f64> {
        self.nodes
            .values()
            .filter(|n| n.level == OSD_LEVEL)
            .filter_map(|n| n.id.parse::<OsdNum>().ok().map(|osd| (osd, n.size)))
            .collect()
    }

    /// All OSDs below a node, in tree order.
    #[must_use]
    pub fn osds_under(&self, id: &str) -> Vec<OsdNum> {
        let mut osds = Vec::new();
        self.collect_osds(id, &mut osds);
        osds
    }

    fn collect_osds(&self, id: &str, osds: &mut Vec<OsdNum>) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        if node.level == OSD_LEVEL {
            if let Ok(osd) = id.parse() {
                osds.push(osd);
            }
            return;
        }
        for child in &node.children {
            self.collect_osds(child, osds);
        }
    }

    /// Returns the id of the OSD's ancestor at `level`, the OSD itself for
    /// the `osd` level, or the root id if no such ancestor exists.
    #[must_use]
    pub fn ancestor_at(&self, osd: OsdNum, level: &str) -> String {
        let mut cur = osd.to_string();
        loop {
            let Some(node) = self.nodes.get(&cur) else {
                return ROOT_ID.to_string();
            };
            if node.level == level {
                return cur;
            }
            match &node.parent {
                Some(parent) => cur = parent.clone(),
                None => return ROOT_ID.to_string(),
            }
        }
    }

    /// Groups the tree's OSDs by their ancestor at `level`.
    #[must_use]
    pub fn failure_domains(&self, level: &str) -> BTreeMap<String, Vec<OsdNum>> {
        let mut domains: BTreeMap<String, Vec<OsdNum>> = BTreeMap::new();
        for osd in self.osds_under(ROOT_ID) {
            domains.entry(self.ancestor_at(osd, level)).or_default().push(osd);
        }
        domains
    }
}

fn child_order(id: &str) -> (u64, &str) {
    (id.parse::<u64>().unwrap_or(u64::MAX), id)
}

/// Builds the hierarchical tree from a (filtered) flat topology.
///
/// Nodes whose parent is missing, or whose parent does not sit above them
/// in the placement levels, hang off the implicit root. Nodes of unknown
/// levels are dropped, as are interior nodes with no OSDs below.
#[must_use]
pub fn make_hier_tree(levels: &PlacementLevels, tree: &OsdTree) -> HierTree {
    let mut parents: BTreeMap<String, String> = BTreeMap::new();
    for (id, node) in tree.nodes() {
        let Some(rank) = levels.rank(&node.level) else {
            debug!(node = id, level = %node.level, "Dropping node with unknown level");
            continue;
        };
        let parent = node
            .parent
            .as_deref()
            .filter(|p| {
                tree.get(p)
                    .and_then(|pn| levels.rank(&pn.level))
                    .is_some_and(|parent_rank| parent_rank < rank)
            })
            .unwrap_or(ROOT_ID);
        parents.insert(id.to_string(), parent.to_string());
    }

    // Keep interior nodes only if some OSD hangs below them.
    let mut populated: BTreeSet<String> = BTreeSet::new();
    for (id, node) in tree.nodes() {
        if node.level != OSD_LEVEL || !parents.contains_key(id) {
            continue;
        }
        let mut cur = id.to_string();
        while populated.insert(cur.clone()) {
            match parents.get(&cur) {
                Some(parent) => cur = parent.clone(),
                None => break,
            }
        }
    }

    let mut nodes: BTreeMap<String, HierNode> = BTreeMap::new();
    nodes.insert(
        ROOT_ID.to_string(),
        HierNode {
            id: ROOT_ID.to_string(),
            level: "root".to_string(),
            parent: None,
            children: Vec::new(),
            size: 0.0,
        },
    );
    for (id, node) in tree.nodes() {
        if !populated.contains(id) {
            continue;
        }
        let parent = parents.get(id).cloned().unwrap_or_default();
        nodes.insert(
            id.to_string(),
            HierNode {
                id: id.to_string(),
                level: node.level.clone(),
                parent: Some(parent),
                children: Vec::new(),
                size: if node.level == OSD_LEVEL { node.size } else { 0.0 },
            },
        );
    }

    let links: Vec<(String, String)> = nodes
        .values()
        .filter_map(|n| n.parent.clone().map(|p| (p, n.id.clone())))
        .collect();
    for (parent, child) in links {
        if let Some(p) = nodes.get_mut(&parent) {
            p.children.push(child);
        }
    }
    for node in nodes.values_mut() {
        node.children.sort_by(|a, b| child_order(a).cmp(&child_order(b)));
    }

    HierTree { nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;

    fn osd(n: u64) -> OsdNum {
        OsdNum::new(n).unwrap()
    }

    fn levels() -> PlacementLevels {
        let mut levels = BTreeMap::new();
        levels.insert("rack".to_string(), 50);
        GlobalConfig { placement_levels: levels, ..Default::default() }.levels()
    }

    /// Two racks, two hosts each, two OSDs per host.
    fn create_test_tree() -> OsdTree {
        let mut tree = OsdTree::new();
        tree.add_node("rack1", "rack", None).unwrap();
        tree.add_node("rack2", "rack", None).unwrap();
        for (host, rack) in [("host1", "rack1"), ("host2", "rack1"), ("host3", "rack2"), ("host4", "rack2")] {
            tree.add_node(host, "host", Some(rack)).unwrap();
        }
        for i in 1..=8u64 {
            let host = format!("host{}", (i + 1) / 2);
            let tags: &[&str] = if i % 2 == 0 { &["ssd"] } else { &["hdd"] };
            tree.add_osd(osd(i), 1.0, Some(&host), tags).unwrap();
        }
        tree
    }

    #[test]
    fn test_duplicate_node() {
        let mut tree = create_test_tree();
        assert!(matches!(tree.add_node("host1", "host", None), Err(TopologyError::DuplicateNode(_))));
        assert!(matches!(tree.add_osd(osd(1), 1.0, None, &[]), Err(TopologyError::DuplicateNode(_))));
        assert!(matches!(tree.add_node("", "host", None), Err(TopologyError::EmptyNodeId)));
    }

    #[test]
    fn test_hier_tree_structure() {
        let hier = make_hier_tree(&levels(), &create_test_tree());

        assert_eq!(hier.root().unwrap().children, vec!["rack1", "rack2"]);
        assert_eq!(hier.get("host2").unwrap().children, vec!["3", "4"]);
        assert_eq!(hier.osds_under(ROOT_ID).len(), 8);
        assert_eq!(hier.osds_under("rack2"), vec![osd(5), osd(6), osd(7), osd(8)]);
        assert_eq!(hier.ancestor_at(osd(6), "rack"), "rack2");
        assert_eq!(hier.ancestor_at(osd(6), "host"), "host3");
        assert_eq!(hier.ancestor_at(osd(6), "osd"), "6");
        assert_eq!(hier.osd_weights().len(), 8);
    }

    #[test]
    fn test_hier_tree_orders_osds_numerically() {
        let mut tree = OsdTree::new();
        tree.add_node("h", "host", None).unwrap();
        for i in [10u64, 9, 2] {
            tree.add_osd(osd(i), 1.0, Some("h"), &[]).unwrap();
        }
        let hier = make_hier_tree(&levels(), &tree);
        assert_eq!(hier.get("h").unwrap().children, vec!["2", "9", "10"]);
    }

    #[test]
    fn test_hier_tree_reattaches_bad_parents_and_drops_empty_nodes() {
        let mut tree = OsdTree::new();
        tree.add_node("host1", "host", None).unwrap();
        tree.add_node("empty", "host", None).unwrap();
        tree.add_node("weird", "galaxy", None).unwrap();
        // A host cannot sit below another host.
        tree.add_node("host2", "host", Some("host1")).unwrap();
        tree.add_osd(osd(1), 1.0, Some("host1"), &[]).unwrap();
        tree.add_osd(osd(2), 1.0, Some("host2"), &[]).unwrap();
        tree.add_osd(osd(3), 1.0, Some("missing"), &[]).unwrap();

        let hier = make_hier_tree(&levels(), &tree);
        let root = hier.root().unwrap();
        assert_eq!(root.children, vec!["3", "host1", "host2"]);
        assert!(hier.get("empty").is_none());
        assert!(hier.get("weird").is_none());
    }

    #[test]
    fn test_failure_domains() {
        let hier = make_hier_tree(&levels(), &create_test_tree());
        let hosts = hier.failure_domains("host");
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts["host4"], vec![osd(7), osd(8)]);

        let racks = hier.failure_domains("rack");
        assert_eq!(racks.len(), 2);
    }

    #[test]
    fn test_by_root_node() {
        let tree = by_root_node(create_test_tree(), &levels(), Some("rack2"));
        let osds: Vec<_> = tree.osds().map(|(o, _)| o).collect();
        assert_eq!(osds, vec![osd(5), osd(6), osd(7), osd(8)]);
        assert!(tree.get("rack2").is_some());
        assert!(tree.get("rack1").is_none());

        // Ancestors of the root node are kept
        let tree = by_root_node(create_test_tree(), &levels(), Some("host1"));
        assert!(tree.get("rack1").is_some());
        assert_eq!(tree.osd_count(), 2);

        let tree = by_root_node(create_test_tree(), &levels(), None);
        assert_eq!(tree.osd_count(), 8);

        let tree = by_root_node(create_test_tree(), &levels(), Some("nowhere"));
        assert_eq!(tree.osd_count(), 0);
    }

    #[test]
    fn test_by_tags() {
        let tree = by_tags(create_test_tree(), &["ssd".to_string()]);
        let osds: Vec<_> = tree.osds().map(|(o, _)| o.get()).collect();
        assert_eq!(osds, vec![2, 4, 6, 8]);
        // Interior nodes are untouched
        assert!(tree.get("host1").is_some());

        let tree = by_tags(create_test_tree(), &["ssd".to_string(), "hdd".to_string()]);
        assert_eq!(tree.osd_count(), 0);

        let tree = by_tags(create_test_tree(), &[]);
        assert_eq!(tree.osd_count(), 8);
    }

    #[test]
    fn test_by_block_layout() {
        let mut stats = BTreeMap::new();
        stats.insert(osd(1), OsdStats { bs_block_size: Some(4096), ..Default::default() });
        stats.insert(osd(2), OsdStats { bitmap_granularity: Some(512), ..Default::default() });
        stats.insert(
            osd(3),
            OsdStats { immediate_commit: Some(ImmediateCommit::Small), ..Default::default() },
        );
        stats.insert(
            osd(4),
            OsdStats {
                bs_block_size: Some(131_072),
                bitmap_granularity: Some(4096),
                immediate_commit: Some(ImmediateCommit::All),
            },
        );

        let tree = by_block_layout(create_test_tree(), &stats, 131_072, 4096, ImmediateCommit::All);
        let osds: Vec<_> = tree.osds().map(|(o, _)| o.get()).collect();
        assert_eq!(osds, vec![4, 5, 6, 7, 8]);

        // A "small" OSD is fine for pools that only need small-write commits
        let tree =
            by_block_layout(create_test_tree(), &stats, 131_072, 4096, ImmediateCommit::Small);
        assert!(tree.get_osd(osd(3)).is_some());
    }

    #[test]
    fn test_compute_affinity() {
        let tree = create_test_tree();
        let up: BTreeSet<_> = [1, 2, 3, 4].into_iter().map(osd).collect();

        let pool = PoolConfig::default();
        assert_eq!(compute_affinity(&pool, &up, &tree), up);

        let pool = PoolConfig { primary_affinity_tags: vec!["ssd".to_string()], ..Default::default() };
        let aff: Vec<_> = compute_affinity(&pool, &up, &tree).into_iter().map(|o| o.get()).collect();
        assert_eq!(aff, vec![2, 4]);
    }

    #[test]
    fn test_tree_json_round_trip_shape() {
        let json = r#"{"host1":{"level":"host"},"1":{"level":"osd","parent":"host1","size":2.5,"tags":["ssd"]}}"#;
        let tree: OsdTree = serde_json::from_str(json).unwrap();
        assert_eq!(tree.osd_count(), 1);
        assert_eq!(tree.get_osd(osd(1)).unwrap().size, 2.5);
    }
}
