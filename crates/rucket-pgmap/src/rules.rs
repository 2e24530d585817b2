// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Per-slot placement rules.
//!
//! A pool's rules say, for every slot of a PG, how the device in that slot
//! must relate to devices in earlier slots at each placement level. Rules
//! come from one of three sources, in priority order:
//! 1. `raw_placement`: explicit per-slot constraints
//! 2. `level_placement`: slot grouping patterns per level
//! 3. `failure_domain`: every slot in a different failure domain

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{PlacementLevels, PoolConfig};
use crate::error::ConfigError;
use crate::types::PoolId;

/// Relation between two slots at a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOp {
    /// Both devices are under the same node of the level.
    Eq,
    /// The devices are under different nodes of the level.
    Ne,
}

/// One constraint on a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConstraint {
    /// Placement level the constraint applies to.
    pub level: String,
    /// Required relation.
    pub op: RuleOp,
    /// Earlier slot (0-based) the constraint refers to.
    pub slot: usize,
}

impl SlotConstraint {
    fn new(level: impl Into<String>, op: RuleOp, slot: usize) -> Self {
        Self { level: level.into(), op, slot }
    }
}

impl fmt::Display for SlotConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            RuleOp::Eq => "=",
            RuleOp::Ne => "!=",
        };
        write!(f, "{}{}{}", self.level, op, self.slot + 1)
    }
}

/// Constraints for every slot of a PG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgRules {
    slots: Vec<Vec<SlotConstraint>>,
}

impl PgRules {
    /// Creates rules from per-slot constraint lists.
    #[must_use]
    pub fn new(slots: Vec<Vec<SlotConstraint>>) -> Self {
        Self { slots }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if there are no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Constraints of one slot.
    #[must_use]
    pub fn slot(&self, index: usize) -> &[SlotConstraint] {
        self.slots.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every slot must differ from all earlier slots at `level`.
    #[must_use]
    pub fn distinct_at(level: &str, pg_size: usize) -> Self {
        let slots = (0..pg_size)
            .map(|i| (0..i).map(|j| SlotConstraint::new(level, RuleOp::Ne, j)).collect())
            .collect();
        Self { slots }
    }

    /// Builds rules from `level -> pattern` strings. Slots sharing a pattern
    /// character share a node at that level; different characters mean
    /// different nodes.
    #[must_use]
    pub fn from_level_placement(patterns: &BTreeMap<String, String>, pg_size: usize) -> Self {
        let mut slots: Vec<Vec<SlotConstraint>> = vec![Vec::new(); pg_size];
        for (level, pattern) in patterns {
            let chars: Vec<char> = pattern.chars().collect();
            // First slot at which each character appears.
            let mut first_seen: Vec<(char, usize)> = Vec::new();
            for (i, rule) in slots.iter_mut().enumerate() {
                let Some(&c) = chars.get(i) else {
                    break;
                };
                for &(other, j) in &first_seen {
                    let op = if other == c { RuleOp::Eq } else { RuleOp::Ne };
                    rule.push(SlotConstraint::new(level.as_str(), op, j));
                }
                if !first_seen.iter().any(|&(other, _)| other == c) {
                    first_seen.push((c, i));
                }
            }
        }
        Self { slots }
    }
}

/// Parses the raw placement syntax.
///
/// Slots are comma-separated. Each slot is `any` or a space-separated list
/// of `level=N` / `level!=N`, where `N` is the 1-based number of an earlier
/// slot. Example: `any, host!=1, dc=1 host!=1 host!=2`.
pub fn parse_raw_placement(raw: &str, levels: &PlacementLevels) -> Result<PgRules, String> {
    let mut slots = Vec::new();
    for (i, slot) in raw.split(',').enumerate() {
        let slot = slot.trim();
        let mut constraints = Vec::new();
        if slot.is_empty() {
            return Err(format!("slot {} is empty", i + 1));
        }
        if slot != "any" {
            for term in slot.split_whitespace() {
                let (level, op, target) = if let Some((level, target)) = term.split_once("!=") {
                    (level, RuleOp::Ne, target)
                } else if let Some((level, target)) = term.split_once('=') {
                    (level, RuleOp::Eq, target)
                } else {
                    return Err(format!("slot {}: cannot parse '{term}'", i + 1));
                };
                if !levels.contains(level) {
                    return Err(format!("slot {}: unknown level '{level}'", i + 1));
                }
                let target: usize = target
                    .parse()
                    .map_err(|_| format!("slot {}: bad slot reference '{target}'", i + 1))?;
                if target < 1 || target > i {
                    return Err(format!(
                        "slot {}: reference {target} must point to an earlier slot",
                        i + 1
                    ));
                }
                constraints.push(SlotConstraint::new(level, op, target - 1));
            }
        }
        slots.push(constraints);
    }
    Ok(PgRules { slots })
}

/// Derives the placement rules of a pool.
///
/// # Errors
///
/// Returns an error if `raw_placement` does not parse.
pub fn extract_pg_rules(
    pool_id: PoolId,
    cfg: &PoolConfig,
    levels: &PlacementLevels,
) -> Result<PgRules, ConfigError> {
    if let Some(raw) = &cfg.raw_placement {
        return parse_raw_placement(raw, levels)
            .map_err(|message| ConfigError::RawPlacement { pool_id, message });
    }
    if !cfg.level_placement.is_empty() {
        return Ok(PgRules::from_level_placement(&cfg.level_placement, cfg.pg_size));
    }
    Ok(PgRules::distinct_at(&cfg.failure_domain, cfg.pg_size))
}
