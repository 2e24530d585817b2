// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Optimizer contract and the greedy reference optimizer.
//!
//! The optimizer turns candidate device sets into a full PG layout. It runs
//! in two modes:
//! - **initial**: no usable prior layout, spread PGs by weight
//! - **change**: start from the previous layout and move as little as
//!   possible
//!
//! Optimization may be long-running, so the contract is async. Callers that
//! lose interest simply drop the future; there is no cancellation signal.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tracing::info;

use crate::combinator::{Combinator, CombinatorKind};
use crate::error::{PgMapError, Result};
use crate::types::{OsdNum, OsdSet, PoolId};

/// Input shared by both optimizer modes.
#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    /// Pool being optimized, for diagnostics.
    pub pool_id: PoolId,
    /// Weight of every eligible OSD.
    pub osd_weights: BTreeMap<OsdNum, f64>,
    /// Candidate source.
    pub combinator: CombinatorKind,
    /// Target PG count.
    pub pg_count: u32,
    /// Slots per PG.
    pub pg_size: usize,
    /// Minimum live slots per PG.
    pub pg_minsize: usize,
    /// Slot positions are meaningful (erasure-coded pools).
    pub ordered: bool,
}

/// Optimized layout and its space statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeResult {
    /// One device set per PG, `pg_size` slots each.
    pub int_pgs: Vec<OsdSet>,
    /// Raw space usable before the fullest OSD fills up.
    pub space: f64,
    /// Sum of all OSD weights.
    pub total_space: f64,
    /// PGs whose device set changed relative to the seed layout.
    pub moved_pgs: usize,
    /// Slots whose device changed relative to the seed layout.
    pub moved_slots: usize,
}

/// Computes PG layouts.
#[async_trait]
pub trait PgOptimizer: Send + Sync {
    /// Computes a layout from scratch.
    async fn optimize_initial(&self, request: OptimizeRequest) -> Result<OptimizeResult>;

    /// Computes a layout that stays close to `prev_pgs`. `prev_pgs` has
    /// exactly `pg_count` rows of `pg_size` slots.
    async fn optimize_change(
        &self,
        request: OptimizeRequest,
        prev_pgs: Vec<OsdSet>,
    ) -> Result<OptimizeResult>;
}

/// Logs how much a new layout moves relative to its seed.
pub fn log_change_stats(pool_id: PoolId, pool_name: &str, result: &OptimizeResult) {
    let efficiency =
        if result.total_space > 0.0 { result.space / result.total_space * 100.0 } else { 0.0 };
    info!(
        pool_id,
        pool_name,
        pgs = result.int_pgs.len(),
        moved_pgs = result.moved_pgs,
        moved_slots = result.moved_slots,
        usable_raw = result.space,
        total_raw = result.total_space,
        efficiency_pct = efficiency,
        "PG layout computed"
    );
}

/// Greedy optimizer.
///
/// Each PG takes the candidate with the lowest weighted load; in change mode
/// candidates sharing more devices with the PG's previous set win first.
/// It does not search globally, so balance is good but not optimal.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyOptimizer;

impl GreedyOptimizer {
    /// Creates the optimizer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PgOptimizer for GreedyOptimizer {
    async fn optimize_initial(&self, request: OptimizeRequest) -> Result<OptimizeResult> {
        let pool_id = request.pool_id;
        tokio::task::spawn_blocking(move || Layout::new(request)?.initial())
            .await
            .map_err(|e| PgMapError::Optimizer { pool_id, message: e.to_string() })?
    }

    async fn optimize_change(
        &self,
        request: OptimizeRequest,
        prev_pgs: Vec<OsdSet>,
    ) -> Result<OptimizeResult> {
        let pool_id = request.pool_id;
        tokio::task::spawn_blocking(move || Layout::new(request)?.change(&prev_pgs))
            .await
            .map_err(|e| PgMapError::Optimizer { pool_id, message: e.to_string() })?
    }
}

/// Working state of one optimization run.
struct Layout {
    request: OptimizeRequest,
    candidates: Vec<OsdSet>,
    load: HashMap<OsdNum, u64>,
}

impl Layout {
    fn new(request: OptimizeRequest) -> Result<Self> {
        let mut candidates: Vec<OsdSet> = request
            .combinator
            .propose()
            .into_iter()
            .filter(|set| set.devices().all(|osd| request.osd_weights.contains_key(&osd)))
            .collect();
        // Prefer the fullest sets the topology allows.
        let best = candidates.iter().map(OsdSet::real_count).max().unwrap_or(0);
        candidates.retain(|set| set.real_count() == best);
        if candidates.is_empty() {
            return Err(PgMapError::NoCombinations { pool_id: request.pool_id });
        }
        for set in &mut candidates {
            set.pad_to(request.pg_size);
        }
        Ok(Self { request, candidates, load: HashMap::new() })
    }

    fn weight(&self, osd: OsdNum) -> f64 {
        self.request.osd_weights.get(&osd).copied().unwrap_or(0.0)
    }

    /// Weighted load of `set` if one more PG were placed on it.
    fn cost(&self, set: &OsdSet) -> f64 {
        set.devices()
            .map(|osd| {
                let load = self.load.get(&osd).copied().unwrap_or(0) as f64 + 1.0;
                let weight = self.weight(osd);
                if weight > 0.0 {
                    load / weight
                } else {
                    f64::INFINITY
                }
            })
            .sum()
    }

    fn assign(&mut self, set: &OsdSet) {
        for osd in set.devices() {
            *self.load.entry(osd).or_insert(0) += 1;
        }
    }

    fn cheapest<'a>(&self, candidates: impl Iterator<Item = &'a OsdSet>) -> Option<&'a OsdSet> {
        let mut best: Option<(&OsdSet, f64)> = None;
        for set in candidates {
            let cost = self.cost(set);
            if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                best = Some((set, cost));
            }
        }
        best.map(|(set, _)| set)
    }

    fn initial(mut self) -> Result<OptimizeResult> {
        let mut pgs = Vec::with_capacity(self.request.pg_count as usize);
        for _ in 0..self.request.pg_count {
            let set = self
                .cheapest(self.candidates.iter())
                .cloned()
                .ok_or(PgMapError::NoCombinations { pool_id: self.request.pool_id })?;
            self.assign(&set);
            pgs.push(set);
        }
        // Everything counts as moved when starting from scratch.
        let moved_pgs = pgs.len();
        let moved_slots = pgs.iter().map(OsdSet::real_count).sum();
        Ok(self.finish(pgs, moved_pgs, moved_slots))
    }

    fn change(mut self, prev_pgs: &[OsdSet]) -> Result<OptimizeResult> {
        let full = self.candidates.first().map_or(0, OsdSet::real_count);
        let mut pgs = Vec::with_capacity(prev_pgs.len());
        for prev in prev_pgs {
            let kept = self.kept_slots(prev);
            // Topology or rule changes can leave a full set misplaced.
            let set = if kept.real_count() >= full && self.request.combinator.accepts(&kept) {
                kept
            } else {
                self.refill(&kept)?
            };
            self.assign(&set);
            pgs.push(set);
        }

        let mut moved_pgs = 0;
        let mut moved_slots = 0;
        for (new, old) in pgs.iter().zip(prev_pgs) {
            let diff = new.slots().iter().zip(old.slots()).filter(|(a, b)| a != b).count();
            if diff > 0 {
                moved_pgs += 1;
                moved_slots += diff;
            }
        }
        Ok(self.finish(pgs, moved_pgs, moved_slots))
    }

    /// Previous set with devices that left the pool's tree removed.
    fn kept_slots(&self, prev: &OsdSet) -> OsdSet {
        let mut slots: Vec<Option<OsdNum>> = Vec::with_capacity(self.request.pg_size);
        for slot in prev.slots().iter().take(self.request.pg_size) {
            let keep = slot
                .filter(|osd| self.request.osd_weights.contains_key(osd) && !slots.contains(&Some(*osd)));
            slots.push(keep);
        }
        let mut set = OsdSet::new(slots);
        set.pad_to(self.request.pg_size);
        set
    }

    /// Picks the candidate sharing the most devices with `kept` and merges
    /// it in: kept devices stay in their slots, the candidate's other
    /// devices take the slot they were drawn for when it is free, otherwise
    /// the first free one. If the merge breaks the placement rules the
    /// candidate is used as drawn.
    ///
    /// Ordered pools count only devices already in the same slot.
    fn refill(&self, kept: &OsdSet) -> Result<OsdSet> {
        let ordered = self.request.ordered;
        let overlap = |set: &OsdSet| {
            if ordered {
                set.slots().iter().zip(kept.slots()).filter(|(a, b)| a.is_some() && a == b).count()
            } else {
                set.devices().filter(|osd| kept.contains(*osd)).count()
            }
        };
        let best_overlap = self.candidates.iter().map(overlap).max().unwrap_or(0);
        let candidate = self
            .cheapest(self.candidates.iter().filter(|&set| overlap(set) == best_overlap))
            .ok_or(PgMapError::NoCombinations { pool_id: self.request.pool_id })?;

        let mut slots: Vec<Option<OsdNum>> = kept
            .slots()
            .iter()
            .map(|slot| slot.filter(|osd| candidate.contains(*osd)))
            .collect();
        let mut pending = Vec::new();
        for (i, slot) in candidate.slots().iter().enumerate() {
            let Some(osd) = slot else { continue };
            if slots.contains(&Some(*osd)) {
                continue;
            }
            if slots[i].is_none() {
                slots[i] = Some(*osd);
            } else {
                pending.push(*osd);
            }
        }
        for osd in pending {
            if let Some(free) = slots.iter_mut().find(|s| s.is_none()) {
                *free = Some(osd);
            }
        }

        let merged = OsdSet::new(slots);
        if self.request.combinator.accepts(&merged) {
            Ok(merged)
        } else {
            Ok(candidate.clone())
        }
    }

    fn finish(self, pgs: Vec<OsdSet>, moved_pgs: usize, moved_slots: usize) -> OptimizeResult {
        let total_space: f64 = self.request.osd_weights.values().sum();
        let total_slots: u64 = self.load.values().sum();
        let per_slot = self
            .load
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&osd, &count)| self.weight(osd) / count as f64)
            .fold(f64::INFINITY, f64::min);
        let space = if per_slot.is_finite() { per_slot * total_slots as f64 } else { 0.0 };
        OptimizeResult { int_pgs: pgs, space, total_space, moved_pgs, moved_slots }
    }
}
