// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Primary selection.
//!
//! The primary serves client I/O for a PG. Candidates are taken in tiers
//! and the first non-empty tier wins; a [`PrimaryRng`] draw breaks ties
//! inside it.
//!
//! Replicated pools:
//! 1. members preferred by affinity
//! 2. live members
//!
//! Erasure-coded pools prefer data positions, which can serve reads
//! without reconstruction:
//! 1. data positions preferred by affinity
//! 2. any position preferred by affinity
//! 3. live data positions
//! 4. any live position

use std::collections::{BTreeMap, BTreeSet};

use metrics::counter;
use tracing::{debug, info};

use crate::config::{validate_pool_config, PlacementLevels, PoolConfig};
use crate::rng::PrimaryRng;
use crate::topology::{compute_affinity, OsdTree};
use crate::types::{osd_to_raw, OsdNum, OsdSet, PgTable, PoolId};

fn members_in<'a>(
    slots: &'a [Option<OsdNum>],
    eligible: &'a BTreeSet<OsdNum>,
) -> impl Iterator<Item = OsdNum> + 'a {
    slots.iter().flatten().copied().filter(move |osd| eligible.contains(osd))
}

/// Picks the primary of one PG.
///
/// Returns `None` when no member is eligible; that is a valid degraded
/// state, not an error. `rng` advances only when a candidate is drawn.
pub fn pick_primary(
    pool: &PoolConfig,
    osd_set: &OsdSet,
    up: &BTreeSet<OsdNum>,
    affinity: &BTreeSet<OsdNum>,
    rng: &mut PrimaryRng,
) -> Option<OsdNum> {
    let all = osd_set.slots();
    let candidates: Vec<OsdNum> = if pool.scheme.is_erasure_coded() {
        let data = &all[..pool.data_size().min(all.len())];
        let tiers = [(data, affinity), (all, affinity), (data, up), (all, up)];
        tiers
            .into_iter()
            .map(|(slots, eligible)| members_in(slots, eligible).collect::<Vec<_>>())
            .find(|tier| !tier.is_empty())
            .unwrap_or_default()
    } else {
        let preferred: Vec<OsdNum> = members_in(all, affinity).collect();
        if preferred.is_empty() {
            members_in(all, up).collect()
        } else {
            preferred
        }
    };
    if candidates.is_empty() {
        return None;
    }
    Some(candidates[rng.pick(candidates.len())])
}

/// Recomputes the primary of every PG and returns the updated table, or
/// `None` when no primary changes.
///
/// Pools failing validation are skipped. Each pool gets a freshly reset
/// generator and its PGs are visited in ascending order, so two monitors
/// looking at the same state pick the same primaries. `pgs` is never
/// modified; it is cloned on the first change.
pub fn recheck_primaries(
    pools: &BTreeMap<PoolId, PoolConfig>,
    levels: &PlacementLevels,
    pgs: &PgTable,
    up: &BTreeSet<OsdNum>,
    tree: &OsdTree,
) -> Option<PgTable> {
    let mut updated: Option<PgTable> = None;
    let mut rng = PrimaryRng::new();
    for (&pool_id, pool) in pools {
        if let Err(e) = validate_pool_config(pool_id, pool, levels) {
            debug!(pool_id, error = %e, "Skipping invalid pool in primary recheck");
            continue;
        }
        let Some(pool_pgs) = pgs.items.get(&pool_id) else {
            continue;
        };
        let affinity = compute_affinity(pool, up, tree);
        rng.reset();
        for pg_num in 1..=pool.pg_count {
            let Some(pg) = pool_pgs.get(&pg_num) else {
                continue;
            };
            let primary = pick_primary(pool, &pg.osd_set, up, &affinity, &mut rng);
            if primary == pg.primary {
                continue;
            }
            info!(
                pool_id,
                pool_name = pool.display_name(),
                pg_num,
                old_primary = osd_to_raw(pg.primary),
                new_primary = osd_to_raw(primary),
                "Moving PG primary"
            );
            counter!("rucket_pg_primary_moves").increment(1);
            let table = updated.get_or_insert_with(|| pgs.clone());
            if let Some(entry) = table.items.get_mut(&pool_id).and_then(|p| p.get_mut(&pg_num)) {
                entry.primary = primary;
            }
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, Scheme};
    use crate::types::PgConfig;
    use proptest::prelude::*;

    fn osd(n: u64) -> OsdNum {
        OsdNum::new(n).unwrap()
    }

    fn osds(ids: &[u64]) -> BTreeSet<OsdNum> {
        ids.iter().copied().map(osd).collect()
    }

    fn replicated() -> PoolConfig {
        PoolConfig { pg_size: 3, pg_minsize: 2, pg_count: 1, ..Default::default() }
    }

    fn ec_4_1() -> PoolConfig {
        PoolConfig {
            scheme: Scheme::Ec,
            pg_size: 4,
            pg_minsize: 3,
            parity_chunks: 1,
            pg_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_replicated_prefers_affinity() {
        let set = OsdSet::from_raw(&[5, 0, 7]);
        let primary = pick_primary(&replicated(), &set, &osds(&[5, 7]), &osds(&[7]), &mut PrimaryRng::new());
        assert_eq!(primary, Some(osd(7)));
    }

    #[test]
    fn test_replicated_falls_back_to_live_members() {
        let set = OsdSet::from_raw(&[5, 0, 7]);
        let primary = pick_primary(&replicated(), &set, &osds(&[5, 7]), &osds(&[]), &mut PrimaryRng::new());
        // First draw after reset is 1199982054, even, so index 0.
        assert_eq!(primary, Some(osd(5)));
    }

    #[test]
    fn test_ec_prefers_parity_with_affinity_over_live_data() {
        let set = OsdSet::from_raw(&[1, 2, 3, 9]);
        let primary =
            pick_primary(&ec_4_1(), &set, &osds(&[1, 2, 3, 9]), &osds(&[9]), &mut PrimaryRng::new());
        assert_eq!(primary, Some(osd(9)));
    }

    #[test]
    fn test_ec_prefers_live_data_positions() {
        let set = OsdSet::from_raw(&[0, 2, 0, 9]);
        for _ in 0..10 {
            let primary =
                pick_primary(&ec_4_1(), &set, &osds(&[2, 9]), &osds(&[]), &mut PrimaryRng::new());
            assert_eq!(primary, Some(osd(2)));
        }
        // Only parity alive
        let primary = pick_primary(&ec_4_1(), &set, &osds(&[9]), &osds(&[]), &mut PrimaryRng::new());
        assert_eq!(primary, Some(osd(9)));
    }

    #[test]
    fn test_no_candidate() {
        let mut rng = PrimaryRng::new();
        let absent = OsdSet::from_raw(&[0, 0, 0]);
        assert_eq!(pick_primary(&replicated(), &absent, &osds(&[1, 2]), &osds(&[1]), &mut rng), None);

        let dead = OsdSet::from_raw(&[1, 2, 3]);
        assert_eq!(pick_primary(&replicated(), &dead, &osds(&[]), &osds(&[]), &mut rng), None);
        assert_eq!(pick_primary(&ec_4_1(), &dead, &osds(&[]), &osds(&[]), &mut rng), None);

        // No draw was consumed
        assert_eq!(rng.next(), PrimaryRng::new().next());
    }

    fn table(pool_id: PoolId, rows: &[&[u64]], primaries: &[u64]) -> PgTable {
        let mut table = PgTable::default();
        let pgs = table.items.entry(pool_id).or_default();
        for (i, (set, primary)) in rows.iter().zip(primaries).enumerate() {
            pgs.insert(
                i as u32 + 1,
                PgConfig { osd_set: OsdSet::from_raw(set), primary: OsdNum::new(*primary) },
            );
        }
        table
    }

    #[test]
    fn test_recheck_no_change() {
        let mut pools = BTreeMap::new();
        pools.insert(1, PoolConfig { pg_count: 2, ..replicated() });
        let pgs = table(1, &[&[1, 2, 3], &[4, 5, 6]], &[1, 5]);
        let up = osds(&[1, 2, 3, 4, 5, 6]);
        // Only the current primaries are preferred.
        let mut tree = OsdTree::new();
        for n in 1..=6 {
            let tags: &[&str] = if n == 1 || n == 5 { &["local"] } else { &[] };
            tree.add_osd(osd(n), 1.0, None, tags).unwrap();
        }
        pools.get_mut(&1).unwrap().primary_affinity_tags = vec!["local".to_string()];

        let levels = GlobalConfig::default().levels();
        assert_eq!(recheck_primaries(&pools, &levels, &pgs, &up, &tree), None);
    }

    #[test]
    fn test_recheck_copy_on_write() {
        let mut pools = BTreeMap::new();
        pools.insert(1, PoolConfig { pg_count: 3, ..replicated() });
        pools.insert(2, PoolConfig { pg_count: 1, pg_size: 0, ..replicated() });
        let mut pgs = table(1, &[&[1, 2, 3], &[4, 5, 6], &[7, 8, 9]], &[1, 4, 7]);
        pgs.items.extend(table(2, &[&[1, 4, 7]], &[9]).items);
        let original = pgs.clone();

        // OSD 4 went down, the rest are up and equally preferred.
        let up = osds(&[1, 2, 3, 5, 6, 7, 8, 9]);
        let levels = GlobalConfig::default().levels();
        let updated = recheck_primaries(&pools, &levels, &pgs, &up, &OsdTree::new()).unwrap();

        assert_eq!(pgs, original);
        let new_primary = updated.get(1, 2).unwrap().primary.unwrap();
        assert!(new_primary == osd(5) || new_primary == osd(6));
        // Invalid pool 2 is left alone
        assert_eq!(updated.get(2, 1), original.get(2, 1));
        for pg_num in [1, 3] {
            let pg = updated.get(1, pg_num).unwrap();
            assert!(pg.osd_set.contains(pg.primary.unwrap()));
        }
    }

    proptest! {
        #[test]
        fn prop_primary_is_deterministic(
            raw in proptest::collection::vec(0u64..12, 3),
            up_mask in 0u16..4096,
            aff_mask in 0u16..4096,
        ) {
            let up: BTreeSet<OsdNum> = (1..12u64).filter(|n| up_mask & (1 << n) != 0).map(osd).collect();
            let aff: BTreeSet<OsdNum> = up.iter().copied().filter(|n| aff_mask & (1 << n.get()) != 0).collect();
            let set = OsdSet::from_raw(&raw);

            let a = pick_primary(&replicated(), &set, &up, &aff, &mut PrimaryRng::new());
            let b = pick_primary(&replicated(), &set, &up, &aff, &mut PrimaryRng::new());
            prop_assert_eq!(a, b);

            if let Some(primary) = a {
                prop_assert!(set.contains(primary));
                prop_assert!(up.contains(&primary));
                if set.devices().any(|d| aff.contains(&d)) {
                    prop_assert!(aff.contains(&primary));
                }
            }
        }

        #[test]
        fn prop_ec_primary_prefers_data_positions(
            raw in proptest::collection::vec(0u64..12, 4),
            up_mask in 0u16..4096,
        ) {
            let up: BTreeSet<OsdNum> = (1..12u64).filter(|n| up_mask & (1 << n) != 0).map(osd).collect();
            let set = OsdSet::from_raw(&raw);
            let primary = pick_primary(&ec_4_1(), &set, &up, &up, &mut PrimaryRng::new());

            let data: Vec<OsdNum> = set.slots()[..3].iter().flatten().copied().filter(|d| up.contains(d)).collect();
            if !data.is_empty() {
                prop_assert!(primary.is_some_and(|p| data.contains(&p)));
            }
        }
    }
}
