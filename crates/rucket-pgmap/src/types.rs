// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Core identifiers and PG layout types.
//!
//! Device ids are non-zero. An empty slot in a PG's device set and the
//! "no primary" state are both `None`; on the wire they are written as `0`
//! so that the stored layout stays readable by other cluster components.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Storage device (OSD) number. Never zero.
pub type OsdNum = NonZeroU64;

/// Pool identifier.
pub type PoolId = u32;

/// Placement group number within a pool, starting from 1.
pub type PgNum = u32;

/// Converts a raw wire value into an optional device number.
#[inline]
#[must_use]
pub fn osd_from_raw(raw: u64) -> Option<OsdNum> {
    NonZeroU64::new(raw)
}

/// Converts an optional device number into its wire value.
#[inline]
#[must_use]
pub fn osd_to_raw(osd: Option<OsdNum>) -> u64 {
    osd.map_or(0, NonZeroU64::get)
}

/// Ordered device set of a placement group.
///
/// Position matters for erasure-coded pools: the first
/// `pg_size - parity_chunks` slots hold data chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OsdSet(Vec<Option<OsdNum>>);

impl OsdSet {
    /// Creates a device set from slots.
    #[must_use]
    pub fn new(slots: Vec<Option<OsdNum>>) -> Self {
        Self(slots)
    }

    /// Creates a device set from raw wire values, `0` meaning an empty slot.
    #[must_use]
    pub fn from_raw(raw: &[u64]) -> Self {
        Self(raw.iter().copied().map(osd_from_raw).collect())
    }

    /// Returns the raw wire values.
    #[must_use]
    pub fn to_raw(&self) -> Vec<u64> {
        self.0.iter().copied().map(osd_to_raw).collect()
    }

    /// Number of slots, including empty ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Slots in order.
    #[must_use]
    pub fn slots(&self) -> &[Option<OsdNum>] {
        &self.0
    }

    /// Iterates over occupied slots in order.
    pub fn devices(&self) -> impl Iterator<Item = OsdNum> + '_ {
        self.0.iter().flatten().copied()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn real_count(&self) -> usize {
        self.devices().count()
    }

    /// Returns true if at least one slot holds a device.
    #[must_use]
    pub fn has_real(&self) -> bool {
        self.0.iter().any(Option::is_some)
    }

    /// Returns true if the device occupies one of the slots.
    #[must_use]
    pub fn contains(&self, osd: OsdNum) -> bool {
        self.0.contains(&Some(osd))
    }

    /// Appends empty slots until the set has `size` slots.
    pub fn pad_to(&mut self, size: usize) {
        if self.0.len() < size {
            self.0.resize(size, None);
        }
    }
}

impl From<Vec<Option<OsdNum>>> for OsdSet {
    fn from(slots: Vec<Option<OsdNum>>) -> Self {
        Self(slots)
    }
}

impl fmt::Display for OsdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for slot in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}", osd_to_raw(*slot))?;
        }
        Ok(())
    }
}

impl Serialize for OsdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OsdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<u64>::deserialize(deserializer)?;
        Ok(Self::from_raw(&raw))
    }
}

/// Serde adapter writing `Option<OsdNum>` as a plain number, `0` for `None`.
pub mod raw_osd {
    use super::{osd_from_raw, osd_to_raw, OsdNum};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes an optional device number.
    pub fn serialize<S: Serializer>(osd: &Option<OsdNum>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(osd_to_raw(*osd))
    }

    /// Deserializes an optional device number.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<OsdNum>, D::Error> {
        Ok(osd_from_raw(u64::deserialize(deserializer)?))
    }
}

/// Committed assignment of a single placement group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgConfig {
    /// Devices holding the PG, one per slot.
    pub osd_set: OsdSet,
    /// Device serving client I/O, if any device is eligible.
    #[serde(with = "raw_osd", default)]
    pub primary: Option<OsdNum>,
}

/// Per-pool PG assignments, as stored under `config/pgs` or
/// `history/last_clean_pgs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgTable {
    /// `pool -> pg number -> assignment`.
    pub items: BTreeMap<PoolId, BTreeMap<PgNum, PgConfig>>,
    /// Layout hash; absent when PGs must be reshuffled from scratch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl PgTable {
    /// Returns the assignment of one PG.
    #[must_use]
    pub fn get(&self, pool_id: PoolId, pg_num: PgNum) -> Option<&PgConfig> {
        self.items.get(&pool_id).and_then(|pgs| pgs.get(&pg_num))
    }

    /// Returns the device sets of a pool as a dense list indexed by
    /// `pg_num - 1`. Missing PGs become empty sets.
    ///
    /// The list is at most `max(pg_count, stored PGs)` long; PG numbers
    /// beyond that are ignored.
    #[must_use]
    pub fn pool_osd_sets(&self, pool_id: PoolId, pg_count: u32) -> Vec<OsdSet> {
        let Some(pgs) = self.items.get(&pool_id) else {
            return Vec::new();
        };
        let limit = (pg_count as usize).max(pgs.len());
        let count = pgs
            .keys()
            .map(|&pg_num| pg_num as usize)
            .filter(|&pg_num| pg_num <= limit)
            .max()
            .unwrap_or(0);
        if count == 0 {
            return Vec::new();
        }
        let mut sets = vec![OsdSet::default(); count];
        for (&pg_num, pg) in pgs.range(1..=count as PgNum) {
            sets[pg_num as usize - 1] = pg.osd_set.clone();
        }
        sets
    }
}

/// Distinct device sets a PG has previously been assigned to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgHistory {
    /// Prior device sets, pairwise distinct.
    pub osd_sets: Vec<OsdSet>,
}

impl PgHistory {
    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.osd_sets.is_empty()
    }

    /// Records a prior device set.
    pub fn push(&mut self, osd_set: OsdSet) {
        self.osd_sets.push(osd_set);
    }

    /// Keeps the first occurrence of every distinct set, in order.
    pub fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::with_capacity(self.osd_sets.len());
        self.osd_sets.retain(|set| seen.insert(set.clone()));
    }
}
