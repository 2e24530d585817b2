// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Hash functions for combination sampling.
//!
//! The combinators draw candidate device sets pseudo-randomly, but every
//! monitor must draw the same candidates from the same topology. The hash
//! must be:
//! - Deterministic: same input always produces same output
//! - Uniform: output is uniformly distributed
//! - Fast: evaluated for every device in every draw

use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

/// Fixed key shared by all nodes.
const PLACEMENT_HASH_KEY: (u64, u64) = (0x0706_0504_0302_0100, 0x0f0e_0d0c_0b0a_0908);

/// Hash two inputs.
#[inline]
#[must_use]
pub fn placement_hash2(a: u64, b: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(PLACEMENT_HASH_KEY.0, PLACEMENT_HASH_KEY.1);
    a.hash(&mut hasher);
    b.hash(&mut hasher);
    hasher.finish()
}

/// Hash three inputs.
#[inline]
#[must_use]
pub fn placement_hash3(a: u64, b: u64, c: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(PLACEMENT_HASH_KEY.0, PLACEMENT_HASH_KEY.1);
    a.hash(&mut hasher);
    b.hash(&mut hasher);
    c.hash(&mut hasher);
    hasher.finish()
}

/// Hash a string, for items identified by name.
#[inline]
#[must_use]
pub fn placement_hash_str(s: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(PLACEMENT_HASH_KEY.0, PLACEMENT_HASH_KEY.1);
    s.hash(&mut hasher);
    hasher.finish()
}

/// Straw2 draw for one item.
///
/// Each item gets a straw whose length depends on a hash of
/// `(x, r, item)` and on the item's weight; the longest straw wins. This
/// gives selection frequency proportional to weight, and adding or removing
/// an item only moves the draws that item wins or loses.
#[must_use]
pub fn straw2_draw(x: u64, r: u64, item: u64, weight: f64) -> f64 {
    if weight <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let hash = placement_hash3(x, r, item);
    // Map into (0, 1]; zero would make ln() blow up.
    let u = ((hash >> 11) as f64 + 1.0) / ((1u64 << 53) as f64);
    weight / -u.ln()
}

/// Picks the item with the longest straw. Returns `None` if every item has
/// zero weight or there are no items.
#[must_use]
pub fn straw2_select<T: Copy>(
    items: impl IntoIterator<Item = (T, u64, f64)>,
    x: u64,
    r: u64,
) -> Option<T> {
    let mut best: Option<(T, f64)> = None;
    for (item, id, weight) in items {
        let draw = straw2_draw(x, r, id, weight);
        if !draw.is_finite() && draw < 0.0 {
            continue;
        }
        if best.map_or(true, |(_, best_draw)| draw > best_draw) {
            best = Some((item, draw));
        }
    }
    best.map(|(item, _)| item)
}
