// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Candidate device-set generation.
//!
//! A combinator proposes the device sets the optimizer may assign to PGs.
//! Two strategies share the [`Combinator`] contract:
//!
//! - [`RuleCombinator`] honours per-slot placement rules (failure domain,
//!   level placement or raw placement).
//! - [`FlatCombinator`] flattens the tree into failure domains and picks
//!   one OSD from each of `pg_size` distinct domains.
//!
//! Both draw with weighted straw2 selection keyed by the attempt number, so
//! the candidate list is a pure function of the topology and the pool.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::config::{GlobalConfig, PlacementLevels, PoolConfig};
use crate::error::ConfigError;
use crate::hash::{placement_hash2, placement_hash_str, straw2_select};
use crate::rules::{extract_pg_rules, PgRules, RuleOp};
use crate::topology::HierTree;
use crate::types::{OsdNum, OsdSet, PoolId};

/// Source of candidate device sets.
pub trait Combinator: Send + Sync {
    /// Returns distinct candidate sets of `pg_size` slots. A slot is empty
    /// when the topology cannot satisfy it.
    fn propose(&self) -> Vec<OsdSet>;

    /// Slots per candidate.
    fn pg_size(&self) -> usize;

    /// Returns true if `set` satisfies the placement constraints, with
    /// empty slots left unchecked. Used to decide whether an existing
    /// layout may be kept.
    fn accepts(&self, set: &OsdSet) -> bool;
}

fn push_distinct(set: OsdSet, seen: &mut HashSet<OsdSet>, out: &mut Vec<OsdSet>) {
    if set.has_real() && seen.insert(set.clone()) {
        out.push(set);
    }
}

/// Rule-driven combinator.
#[derive(Debug, Clone)]
pub struct RuleCombinator {
    rules: PgRules,
    max_combinations: usize,
    weights: BTreeMap<OsdNum, f64>,
    /// `level -> osd -> ancestor id`, for every level the rules mention.
    ancestors: HashMap<String, HashMap<OsdNum, String>>,
}

impl RuleCombinator {
    /// Creates a combinator over `tree`.
    #[must_use]
    pub fn new(tree: &HierTree, rules: PgRules, max_combinations: usize) -> Self {
        let weights = tree.osd_weights();
        let mut ancestors: HashMap<String, HashMap<OsdNum, String>> = HashMap::new();
        for slot in 0..rules.len() {
            for constraint in rules.slot(slot) {
                ancestors.entry(constraint.level.clone()).or_insert_with(|| {
                    weights.keys().map(|&osd| (osd, tree.ancestor_at(osd, &constraint.level))).collect()
                });
            }
        }
        Self { rules, max_combinations, weights, ancestors }
    }

    fn ancestor(&self, level: &str, osd: OsdNum) -> Option<&str> {
        self.ancestors.get(level).and_then(|m| m.get(&osd)).map(String::as_str)
    }

    fn satisfies(&self, slot: usize, osd: OsdNum, chosen: &[Option<OsdNum>]) -> bool {
        self.rules.slot(slot).iter().all(|constraint| {
            // Constraints against an unfilled slot cannot be checked.
            let Some(Some(other)) = chosen.get(constraint.slot) else {
                return true;
            };
            let same = self.ancestor(&constraint.level, osd) == self.ancestor(&constraint.level, *other);
            match constraint.op {
                RuleOp::Eq => same,
                RuleOp::Ne => !same,
            }
        })
    }

    fn draw(&self, attempt: u64) -> OsdSet {
        let mut chosen: Vec<Option<OsdNum>> = Vec::with_capacity(self.rules.len());
        for slot in 0..self.rules.len() {
            let eligible = self
                .weights
                .iter()
                .filter(|(osd, _)| !chosen.contains(&Some(**osd)))
                .filter(|(osd, _)| self.satisfies(slot, **osd, &chosen))
                .map(|(&osd, &weight)| (osd, osd.get(), weight));
            let pick = straw2_select(eligible, attempt, slot as u64);
            chosen.push(pick);
        }
        OsdSet::new(chosen)
    }
}

impl Combinator for RuleCombinator {
    fn propose(&self) -> Vec<OsdSet> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for attempt in 0..self.max_combinations as u64 {
            push_distinct(self.draw(attempt), &mut seen, &mut out);
        }
        debug!(candidates = out.len(), attempts = self.max_combinations, "Rule combinator done");
        out
    }

    fn pg_size(&self) -> usize {
        self.rules.len()
    }

    fn accepts(&self, set: &OsdSet) -> bool {
        let slots = set.slots();
        slots.len() == self.rules.len()
            && slots.iter().enumerate().all(|(slot, osd)| match osd {
                None => true,
                Some(osd) => {
                    self.weights.contains_key(osd)
                        && !slots[..slot].contains(&Some(*osd))
                        && self.satisfies(slot, *osd, &slots[..slot])
                }
            })
    }
}

/// Flat failure-domain combinator.
#[derive(Debug, Clone)]
pub struct FlatCombinator {
    /// `(domain id hash, total weight, [(osd, weight)])`.
    domains: Vec<(u64, f64, Vec<(OsdNum, f64)>)>,
    pg_size: usize,
    max_combinations: usize,
}

impl FlatCombinator {
    /// Groups the tree's OSDs by their ancestor at `failure_domain`.
    #[must_use]
    pub fn new(tree: &HierTree, failure_domain: &str, pg_size: usize, max_combinations: usize) -> Self {
        let weights = tree.osd_weights();
        let domains = tree
            .failure_domains(failure_domain)
            .into_iter()
            .map(|(id, osds)| {
                let osds: Vec<(OsdNum, f64)> = osds
                    .into_iter()
                    .map(|osd| (osd, weights.get(&osd).copied().unwrap_or(0.0)))
                    .collect();
                let total: f64 = osds.iter().map(|(_, w)| w).sum();
                (placement_hash_str(&id), total, osds)
            })
            .collect();
        Self { domains, pg_size, max_combinations }
    }

    fn draw(&self, attempt: u64) -> OsdSet {
        let mut used_domains: Vec<usize> = Vec::with_capacity(self.pg_size);
        let mut chosen = Vec::with_capacity(self.pg_size);
        for slot in 0..self.pg_size as u64 {
            let eligible = self
                .domains
                .iter()
                .enumerate()
                .filter(|(idx, _)| !used_domains.contains(idx))
                .map(|(idx, (id, total, _))| (idx, *id, *total));
            let Some(idx) = straw2_select(eligible, attempt, slot) else {
                chosen.push(None);
                continue;
            };
            used_domains.push(idx);
            let (domain_id, _, osds) = &self.domains[idx];
            let r = placement_hash2(slot, *domain_id);
            chosen.push(straw2_select(osds.iter().map(|&(osd, w)| (osd, osd.get(), w)), attempt, r));
        }
        OsdSet::new(chosen)
    }
}

impl Combinator for FlatCombinator {
    fn propose(&self) -> Vec<OsdSet> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for attempt in 0..self.max_combinations as u64 {
            push_distinct(self.draw(attempt), &mut seen, &mut out);
        }
        debug!(candidates = out.len(), domains = self.domains.len(), "Flat combinator done");
        out
    }

    fn pg_size(&self) -> usize {
        self.pg_size
    }

    fn accepts(&self, set: &OsdSet) -> bool {
        if set.len() != self.pg_size {
            return false;
        }
        let mut used_domains: Vec<usize> = Vec::with_capacity(self.pg_size);
        set.devices().all(|osd| {
            let domain = self.domains.iter().position(|(_, _, osds)| osds.iter().any(|&(o, _)| o == osd));
            match domain {
                Some(idx) if !used_domains.contains(&idx) => {
                    used_domains.push(idx);
                    true
                }
                _ => false,
            }
        })
    }
}

/// Combinator chosen for a pool.
#[derive(Debug, Clone)]
pub enum CombinatorKind {
    /// Rule-driven strategy.
    Rule(RuleCombinator),
    /// Flat failure-domain strategy.
    Flat(FlatCombinator),
}

impl CombinatorKind {
    /// Picks the strategy for a pool. The flat combinator is used only when
    /// the cluster asks for it and the pool has no explicit placement.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool's rules cannot be derived.
    pub fn select(
        global: &GlobalConfig,
        pool_id: PoolId,
        pool: &PoolConfig,
        levels: &PlacementLevels,
        tree: &HierTree,
    ) -> Result<Self, ConfigError> {
        let explicit = !pool.level_placement.is_empty() || pool.raw_placement.is_some();
        if global.use_old_pg_combinator && !explicit {
            return Ok(Self::Flat(FlatCombinator::new(
                tree,
                &pool.failure_domain,
                pool.pg_size,
                pool.max_osd_combinations,
            )));
        }
        let rules = extract_pg_rules(pool_id, pool, levels)?;
        Ok(Self::Rule(RuleCombinator::new(tree, rules, pool.max_osd_combinations)))
    }
}

impl Combinator for CombinatorKind {
    fn propose(&self) -> Vec<OsdSet> {
        match self {
            Self::Rule(c) => c.propose(),
            Self::Flat(c) => c.propose(),
        }
    }

    fn pg_size(&self) -> usize {
        match self {
            Self::Rule(c) => c.pg_size(),
            Self::Flat(c) => c.pg_size(),
        }
    }

    fn accepts(&self, set: &OsdSet) -> bool {
        match self {
            Self::Rule(c) => c.accepts(set),
            Self::Flat(c) => c.accepts(set),
        }
    }
}
