// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Cluster-wide and per-pool placement configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PgMapError};
use crate::rules::parse_raw_placement;
use crate::types::PoolId;

/// Default data block size when neither pool nor cluster sets one.
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;

/// Default bitmap granularity when neither pool nor cluster sets one.
pub const DEFAULT_BITMAP_GRANULARITY: u64 = 4096;

/// Default cap on device combinations explored per pool.
pub const DEFAULT_MAX_OSD_COMBINATIONS: usize = 10_000;

/// Smallest accepted `max_osd_combinations`.
pub const MIN_OSD_COMBINATIONS: usize = 100;

/// Level name of leaf devices.
pub const OSD_LEVEL: &str = "osd";

/// Level name of hosts.
pub const HOST_LEVEL: &str = "host";

/// Cluster-wide configuration consumed by PG generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Placement level names and their ranks (lower = closer to the root).
    /// `host` and `osd` are always defined.
    pub placement_levels: BTreeMap<String, u32>,
    /// Cluster default data block size.
    pub block_size: Option<u64>,
    /// Cluster default bitmap granularity.
    pub bitmap_granularity: Option<u64>,
    /// Cluster default commit mode.
    pub immediate_commit: Option<ImmediateCommit>,
    /// Use the flat failure-domain combinator for pools without explicit
    /// level or raw placement.
    pub use_old_pg_combinator: bool,
    /// Key prefix in the coordination store.
    pub etcd_prefix: String,
    /// Maximum operations per store transaction.
    pub max_txn_ops: usize,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            placement_levels: BTreeMap::new(),
            block_size: None,
            bitmap_granularity: None,
            immediate_commit: None,
            use_old_pg_combinator: false,
            etcd_prefix: "/vitastor".to_string(),
            max_txn_ops: 128,
            logging: LoggingConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(PgMapError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }

    /// Returns the effective placement levels, including the built-in
    /// `host` and `osd` levels.
    #[must_use]
    pub fn levels(&self) -> PlacementLevels {
        let mut levels = self.placement_levels.clone();
        levels.entry(HOST_LEVEL.to_string()).or_insert(100);
        levels.entry(OSD_LEVEL.to_string()).or_insert(101);
        PlacementLevels(levels)
    }
}

/// Placement level name to rank mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementLevels(BTreeMap<String, u32>);

impl PlacementLevels {
    /// Returns true if the level is defined.
    #[must_use]
    pub fn contains(&self, level: &str) -> bool {
        self.0.contains_key(level)
    }

    /// Returns the rank of a level.
    #[must_use]
    pub fn rank(&self, level: &str) -> Option<u32> {
        self.0.get(level).copied()
    }
}

impl From<BTreeMap<String, u32>> for PlacementLevels {
    fn from(levels: BTreeMap<String, u32>) -> Self {
        Self(levels)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Redundancy scheme of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Full copies on every device.
    #[default]
    Replicated,
    /// Single XOR parity chunk.
    Xor,
    /// Reed-Solomon erasure coding.
    #[serde(alias = "jerasure", alias = "isa-l")]
    Ec,
}

impl Scheme {
    /// Returns true for erasure-coded schemes.
    #[must_use]
    pub fn is_erasure_coded(self) -> bool {
        !matches!(self, Self::Replicated)
    }
}

/// Write acknowledgement mode reported by OSDs and required by pools.
///
/// Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImmediateCommit {
    /// Writes need an explicit sync.
    #[default]
    None,
    /// Small writes are committed immediately.
    Small,
    /// All writes are committed immediately.
    All,
}

/// Configuration of a single pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Human-readable pool name.
    pub name: Option<String>,
    /// Redundancy scheme.
    pub scheme: Scheme,
    /// Total device slots per PG.
    pub pg_size: usize,
    /// Minimum live slots for the PG to accept writes.
    pub pg_minsize: usize,
    /// Parity chunks (erasure-coded schemes only).
    pub parity_chunks: usize,
    /// Target number of PGs.
    pub pg_count: u32,
    /// Level whose nodes must not hold two slots of the same PG.
    pub failure_domain: String,
    /// Topology node the pool is restricted to.
    pub root_node: Option<String>,
    /// Tags an OSD must carry to hold this pool's data.
    pub osd_tags: Vec<String>,
    /// Tags marking OSDs preferred as primaries.
    pub primary_affinity_tags: Vec<String>,
    /// Per-level slot grouping patterns, e.g. `dc = "112233"`.
    pub level_placement: BTreeMap<String, String>,
    /// Explicit per-slot placement rules.
    pub raw_placement: Option<String>,
    /// Cap on device combinations explored by the optimizer.
    pub max_osd_combinations: usize,
    /// Pool-specific data block size.
    pub block_size: Option<u64>,
    /// Pool-specific bitmap granularity.
    pub bitmap_granularity: Option<u64>,
    /// Pool-specific commit mode.
    pub immediate_commit: Option<ImmediateCommit>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: None,
            scheme: Scheme::Replicated,
            pg_size: 3,
            pg_minsize: 2,
            parity_chunks: 0,
            pg_count: 0,
            failure_domain: HOST_LEVEL.to_string(),
            root_node: None,
            osd_tags: Vec::new(),
            primary_affinity_tags: Vec::new(),
            level_placement: BTreeMap::new(),
            raw_placement: None,
            max_osd_combinations: DEFAULT_MAX_OSD_COMBINATIONS,
            block_size: None,
            bitmap_granularity: None,
            immediate_commit: None,
        }
    }
}

impl PoolConfig {
    /// Pool name for log messages.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    /// Number of data slots. Equals `pg_size` for replicated pools.
    #[must_use]
    pub fn data_size(&self) -> usize {
        if self.scheme.is_erasure_coded() {
            self.pg_size.saturating_sub(self.parity_chunks)
        } else {
            self.pg_size
        }
    }

    /// Block size: pool value, else cluster default, else built-in.
    #[must_use]
    pub fn effective_block_size(&self, global: &GlobalConfig) -> u64 {
        self.block_size.or(global.block_size).unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    /// Bitmap granularity: pool value, else cluster default, else built-in.
    #[must_use]
    pub fn effective_bitmap_granularity(&self, global: &GlobalConfig) -> u64 {
        self.bitmap_granularity.or(global.bitmap_granularity).unwrap_or(DEFAULT_BITMAP_GRANULARITY)
    }

    /// Commit mode: pool value, else cluster default, else `none`.
    #[must_use]
    pub fn effective_immediate_commit(&self, global: &GlobalConfig) -> ImmediateCommit {
        self.immediate_commit.or(global.immediate_commit).unwrap_or_default()
    }
}

/// Checks a pool configuration against the cluster placement levels.
///
/// # Errors
///
/// Returns the first problem found. Callers skip the pool for this cycle.
pub fn validate_pool_config(
    pool_id: PoolId,
    cfg: &PoolConfig,
    levels: &PlacementLevels,
) -> Result<(), ConfigError> {
    if pool_id == 0 {
        return Err(ConfigError::invalid(pool_id, "pool id must be non-zero"));
    }
    if cfg.pg_size < 1 {
        return Err(ConfigError::invalid(pool_id, "pg_size must be at least 1"));
    }
    if cfg.pg_minsize < 1 || cfg.pg_minsize > cfg.pg_size {
        return Err(ConfigError::invalid(
            pool_id,
            format!("pg_minsize must be in 1..={}, got {}", cfg.pg_size, cfg.pg_minsize),
        ));
    }
    if cfg.pg_count < 1 {
        return Err(ConfigError::invalid(pool_id, "pg_count must be at least 1"));
    }
    if cfg.scheme.is_erasure_coded() {
        if cfg.parity_chunks < 1 || cfg.parity_chunks >= cfg.pg_size {
            return Err(ConfigError::invalid(
                pool_id,
                format!(
                    "parity_chunks must be in 1..{}, got {}",
                    cfg.pg_size, cfg.parity_chunks
                ),
            ));
        }
        if cfg.scheme == Scheme::Xor && cfg.parity_chunks != 1 {
            return Err(ConfigError::invalid(pool_id, "xor pools have exactly 1 parity chunk"));
        }
        if cfg.pg_minsize < cfg.data_size() {
            return Err(ConfigError::invalid(
                pool_id,
                format!("pg_minsize must be at least {} for EC pools", cfg.data_size()),
            ));
        }
    }
    if !levels.contains(&cfg.failure_domain) {
        return Err(ConfigError::UnknownLevel { pool_id, level: cfg.failure_domain.clone() });
    }
    for (level, pattern) in &cfg.level_placement {
        if !levels.contains(level) {
            return Err(ConfigError::UnknownLevel { pool_id, level: level.clone() });
        }
        if pattern.chars().count() != cfg.pg_size {
            return Err(ConfigError::invalid(
                pool_id,
                format!("level_placement for '{level}' must have {} characters", cfg.pg_size),
            ));
        }
    }
    if let Some(raw) = &cfg.raw_placement {
        let rules = parse_raw_placement(raw, levels)
            .map_err(|message| ConfigError::RawPlacement { pool_id, message })?;
        if rules.len() != cfg.pg_size {
            return Err(ConfigError::RawPlacement {
                pool_id,
                message: format!("expected {} slots, got {}", cfg.pg_size, rules.len()),
            });
        }
    }
    if cfg.max_osd_combinations < MIN_OSD_COMBINATIONS {
        return Err(ConfigError::invalid(
            pool_id,
            format!("max_osd_combinations must be at least {MIN_OSD_COMBINATIONS}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PoolConfig {
        PoolConfig { pg_count: 16, ..Default::default() }
    }

    #[test]
    fn test_global_defaults() {
        let config = GlobalConfig::default();
        assert_eq!(config.max_txn_ops, 128);
        assert_eq!(config.etcd_prefix, "/vitastor");
        assert!(!config.use_old_pg_combinator);

        let levels = config.levels();
        assert_eq!(levels.rank("host"), Some(100));
        assert_eq!(levels.rank("osd"), Some(101));
        assert!(!levels.contains("rack"));
    }

    #[test]
    fn test_parse_toml() {
        let config = GlobalConfig::parse(
            r#"
            etcd_prefix = "/cluster"
            block_size = 1048576
            immediate_commit = "all"

            [placement_levels]
            dc = 10
            rack = 50

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.etcd_prefix, "/cluster");
        assert_eq!(config.block_size, Some(1_048_576));
        assert_eq!(config.immediate_commit, Some(ImmediateCommit::All));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.levels().contains("rack"));
        assert!(config.levels().contains("host"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(GlobalConfig::parse("max_txn_ops = \"many\"").is_err());
    }

    #[test]
    fn test_effective_layout_fallbacks() {
        let global = GlobalConfig { block_size: Some(65536), ..Default::default() };
        let mut cfg = pool();
        assert_eq!(cfg.effective_block_size(&global), 65536);
        assert_eq!(cfg.effective_bitmap_granularity(&global), DEFAULT_BITMAP_GRANULARITY);
        assert_eq!(cfg.effective_immediate_commit(&global), ImmediateCommit::None);

        cfg.block_size = Some(4096);
        cfg.immediate_commit = Some(ImmediateCommit::Small);
        assert_eq!(cfg.effective_block_size(&global), 4096);
        assert_eq!(cfg.effective_immediate_commit(&global), ImmediateCommit::Small);
    }

    #[test]
    fn test_scheme_parsing() {
        let cfg: PoolConfig =
            serde_json::from_str(r#"{"scheme":"jerasure","pg_size":6,"parity_chunks":2}"#).unwrap();
        assert_eq!(cfg.scheme, Scheme::Ec);
        assert_eq!(cfg.data_size(), 4);
        assert_eq!(pool().data_size(), 3);
    }

    #[test]
    fn test_validate_ok() {
        let levels = GlobalConfig::default().levels();
        assert!(validate_pool_config(1, &pool(), &levels).is_ok());

        let ec = PoolConfig {
            scheme: Scheme::Ec,
            pg_size: 4,
            pg_minsize: 3,
            parity_chunks: 1,
            pg_count: 8,
            ..Default::default()
        };
        assert!(validate_pool_config(2, &ec, &levels).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let levels = GlobalConfig::default().levels();

        let cfg = PoolConfig { pg_minsize: 4, ..pool() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());

        let cfg = PoolConfig { pg_count: 0, ..pool() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());

        assert!(validate_pool_config(0, &pool(), &levels).is_err());

        let cfg = PoolConfig { max_osd_combinations: 10, ..pool() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ec() {
        let levels = GlobalConfig::default().levels();
        let base = PoolConfig {
            scheme: Scheme::Ec,
            pg_size: 4,
            pg_minsize: 3,
            parity_chunks: 1,
            pg_count: 8,
            ..Default::default()
        };

        let cfg = PoolConfig { parity_chunks: 0, ..base.clone() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());

        let cfg = PoolConfig { parity_chunks: 4, ..base.clone() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());

        let cfg = PoolConfig { pg_minsize: 2, ..base.clone() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());

        let cfg = PoolConfig { scheme: Scheme::Xor, parity_chunks: 2, pg_minsize: 2, ..base };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());
    }

    #[test]
    fn test_validate_levels() {
        let levels = GlobalConfig::default().levels();

        let cfg = PoolConfig { failure_domain: "rack".to_string(), ..pool() };
        assert!(matches!(
            validate_pool_config(1, &cfg, &levels),
            Err(ConfigError::UnknownLevel { level, .. }) if level == "rack"
        ));

        let mut cfg = pool();
        cfg.level_placement.insert("host".to_string(), "12".to_string());
        assert!(validate_pool_config(1, &cfg, &levels).is_err());

        cfg.level_placement.insert("host".to_string(), "123".to_string());
        assert!(validate_pool_config(1, &cfg, &levels).is_ok());
    }

    #[test]
    fn test_validate_raw_placement() {
        let levels = GlobalConfig::default().levels();

        let cfg = PoolConfig { raw_placement: Some("any, host!=1, host!=1".to_string()), ..pool() };
        assert!(validate_pool_config(1, &cfg, &levels).is_ok());

        let cfg = PoolConfig { raw_placement: Some("any, host!=1".to_string()), ..pool() };
        assert!(matches!(
            validate_pool_config(1, &cfg, &levels),
            Err(ConfigError::RawPlacement { .. })
        ));

        let cfg = PoolConfig { raw_placement: Some("any, rack!=1, any".to_string()), ..pool() };
        assert!(validate_pool_config(1, &cfg, &levels).is_err());
    }
}
