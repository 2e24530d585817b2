// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Staging new PG assignments as coordination store transactions.
//!
//! Every PG of a pool gets one history key, `<prefix>/pg/history/<pool>/<pg>`.
//! For each key the builder stages a compare (the key has not been modified
//! since the watched revision) and an operation (write the history, or
//! delete the key when the history is empty). Nothing is committed here:
//! the store applies the staged requests atomically, and a failed compare
//! means the caller must re-read state and regenerate.
//!
//! Keys and values are base64 encoded as the store's JSON gateway expects.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::primary::pick_primary;
use crate::rng::PrimaryRng;
use crate::topology::{compute_affinity, OsdTree};
use crate::types::{OsdNum, OsdSet, PgConfig, PgHistory, PgNum, PgTable, PoolId};

/// Unencoded history key of one PG.
#[must_use]
pub fn history_key(prefix: &str, pool_id: PoolId, pg_num: PgNum) -> String {
    format!("{prefix}/pg/history/{pool_id}/{pg_num}")
}

fn b64(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s)
}

/// What a compare inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompareTarget {
    /// Last modification revision of the key.
    Mod,
}

/// Required relation between the key's value and the compare operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompareResult {
    /// Strictly less than the operand.
    Less,
}

/// Compare predicate of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compare {
    /// Base64-encoded key.
    pub key: String,
    /// Inspected attribute.
    pub target: CompareTarget,
    /// Revision operand, as a decimal string.
    pub mod_revision: String,
    /// Required relation.
    pub result: CompareResult,
}

/// Operation applied when every compare holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxnOp {
    /// Writes a key.
    RequestPut {
        /// Base64-encoded key.
        key: String,
        /// Base64-encoded value.
        value: String,
    },
    /// Deletes a key.
    RequestDeleteRange {
        /// Base64-encoded key.
        key: String,
    },
}

/// One store transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    /// Predicates that must all hold.
    pub compare: Vec<Compare>,
    /// Operations applied when they do.
    pub success: Vec<TxnOp>,
}

impl TxnRequest {
    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compare.is_empty() && self.success.is_empty()
    }
}

/// New layout of one pool, ready to be staged.
#[derive(Debug, Clone)]
pub struct PoolUpdate<'a> {
    /// Pool being updated.
    pub pool_id: PoolId,
    /// Its configuration.
    pub pool: &'a PoolConfig,
    /// Committed device sets, indexed by `pg_num - 1`.
    pub prev_pgs: &'a [OsdSet],
    /// Newly computed device sets, indexed by `pg_num - 1`.
    pub new_pgs: &'a [OsdSet],
}

/// Accumulates history updates of one or more pools.
///
/// Pools are staged one after another through `&mut self`, so a single
/// coordinator owns the pending transaction.
#[derive(Debug, Clone)]
pub struct PgTxnBuilder {
    prefix: String,
    watch_revision: u64,
    staged: Vec<(Compare, TxnOp)>,
}

impl PgTxnBuilder {
    /// Creates a builder guarding every key with `watch_revision`.
    pub fn new(prefix: impl Into<String>, watch_revision: u64) -> Self {
        Self { prefix: prefix.into(), watch_revision, staged: Vec::new() }
    }

    /// Number of staged compare/operation pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stages the history of every PG of `update` and writes the new
    /// assignments with their primaries into `table`.
    ///
    /// `history` is indexed by `pg_num - 1` and grows as needed. The
    /// previous device set is recorded when it differs from the new one and
    /// held at least one device.
    ///
    /// # Errors
    ///
    /// Returns an error if a history cannot be serialized.
    pub fn save_new_pgs(
        &mut self,
        update: &PoolUpdate<'_>,
        up: &BTreeSet<OsdNum>,
        tree: &OsdTree,
        history: &mut Vec<PgHistory>,
        table: &mut PgTable,
    ) -> Result<()> {
        let PoolUpdate { pool_id, pool, prev_pgs, new_pgs } = *update;
        let affinity = compute_affinity(pool, up, tree);
        let touched = new_pgs.len().max(prev_pgs.len());
        if history.len() < touched {
            history.resize_with(touched, PgHistory::default);
        }

        let mut rng = PrimaryRng::new();
        let mut items = BTreeMap::new();
        for (i, osd_set) in new_pgs.iter().enumerate() {
            let pg_num = i as PgNum + 1;
            let primary = pick_primary(pool, osd_set, up, &affinity, &mut rng);
            items.insert(pg_num, PgConfig { osd_set: osd_set.clone(), primary });

            if let Some(prev) = prev_pgs.get(i) {
                if prev != osd_set && prev.has_real() {
                    debug!(pool_id, pg_num, prev = %prev, new = %osd_set, "Recording PG history");
                    history[i].push(prev.clone());
                    counter!("rucket_pg_history_appends").increment(1);
                }
            }
            history[i].dedup();
        }

        for (i, pg_history) in history.iter().enumerate().take(touched) {
            let key = b64(&history_key(&self.prefix, pool_id, i as PgNum + 1));
            let compare = Compare {
                key: key.clone(),
                target: CompareTarget::Mod,
                mod_revision: self.watch_revision.to_string(),
                result: CompareResult::Less,
            };
            let op = if pg_history.is_empty() {
                TxnOp::RequestDeleteRange { key }
            } else {
                TxnOp::RequestPut { key, value: b64(&serde_json::to_string(pg_history)?) }
            };
            self.staged.push((compare, op));
        }

        if new_pgs.is_empty() {
            table.items.remove(&pool_id);
        } else {
            table.items.insert(pool_id, items);
        }
        Ok(())
    }

    /// Splits the staged pairs into requests of at most
    /// `max_txn_ops - reserved` compares and operations each, keeping every
    /// compare in the same request as its operation. `reserved` leaves room
    /// in each request for the caller's own `config/pgs` compare and put,
    /// so the whole store transaction stays within `max_txn_ops`. The
    /// requests are independent: a caller committing them in order must
    /// restart from scratch if any fails.
    #[must_use]
    pub fn into_requests(self, max_txn_ops: usize, reserved: usize) -> Vec<TxnRequest> {
        let chunk = max_txn_ops.saturating_sub(reserved).max(1);
        self.staged
            .chunks(chunk)
            .map(|pairs| {
                let (compare, success) = pairs.iter().cloned().unzip();
                TxnRequest { compare, success }
            })
            .collect()
    }
}
