// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Reconciling a stored layout with a changed PG count.
//!
//! A pool's PG count may change between recomputations, and the last clean
//! layout may still have the old count. Before it can seed the optimizer
//! the layout is resized and every row is padded to `pg_size` slots.

use crate::types::OsdSet;

/// Resizes `pgs` to `target` rows.
///
/// Growing appends copies of existing rows in round-robin order, so new PG
/// `i` starts from the layout of old PG `i % old_count`; when the count
/// doubles this is exactly the PG that splits into it. Shrinking drops the
/// trailing rows. An empty layout is left empty.
pub fn rescale_pg_count(pgs: &mut Vec<OsdSet>, target: usize) {
    let old = pgs.len();
    if old == 0 || old == target {
        return;
    }
    if target < old {
        pgs.truncate(target);
        return;
    }
    pgs.reserve(target - old);
    for i in old..target {
        let row = pgs[i % old].clone();
        pgs.push(row);
    }
}

/// Pads every row with empty slots up to `pg_size`.
pub fn pad_pgs(pgs: &mut [OsdSet], pg_size: usize) {
    for pg in pgs {
        pg.pad_to(pg_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(rows: &[&[u64]]) -> Vec<OsdSet> {
        rows.iter().map(|r| OsdSet::from_raw(r)).collect()
    }

    fn raw(pgs: &[OsdSet]) -> Vec<Vec<u64>> {
        pgs.iter().map(OsdSet::to_raw).collect()
    }

    #[test]
    fn test_grow_multiple() {
        let mut pgs = layout(&[&[1, 2], &[3, 4]]);
        rescale_pg_count(&mut pgs, 4);
        assert_eq!(raw(&pgs), vec![vec![1, 2], vec![3, 4], vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_grow_non_multiple() {
        let mut pgs = layout(&[&[1], &[2], &[3]]);
        rescale_pg_count(&mut pgs, 5);
        assert_eq!(raw(&pgs), vec![vec![1], vec![2], vec![3], vec![1], vec![2]]);
    }

    #[test]
    fn test_shrink() {
        let mut pgs = layout(&[&[1], &[2], &[3], &[4]]);
        rescale_pg_count(&mut pgs, 2);
        assert_eq!(raw(&pgs), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_empty_stays_empty() {
        let mut pgs = Vec::new();
        rescale_pg_count(&mut pgs, 8);
        assert!(pgs.is_empty());
    }

    #[test]
    fn test_pad() {
        let mut pgs = layout(&[&[1], &[2, 3, 4], &[]]);
        pad_pgs(&mut pgs, 3);
        assert_eq!(raw(&pgs), vec![vec![1, 0, 0], vec![2, 3, 4], vec![0, 0, 0]]);
    }
}
