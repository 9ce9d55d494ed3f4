use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-run tunables (§4.5, §6 "Configurable options"). Defaults match the
/// values the spec states explicitly.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub enable_load_balancing: bool,
    pub max_concurrent_adds: u32,
    pub max_concurrent_removals: u32,
    pub max_concurrent_leader_moves: u32,
    /// System-wide, not per-table: a proxy for network/disk bandwidth (§5).
    pub max_concurrent_remote_bootstraps: u32,
    pub max_over_replicated_tablets: u32,
    pub min_load_variance_to_balance: i64,
    pub min_leader_load_variance_to_balance: i64,
    /// 0 means "optimal equalization": raised at runtime to
    /// `ceil(total_leaders / num_servers)` if configured below that (§4.5
    /// step 5).
    pub leader_balance_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub leader_balance_unresponsive_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub min_leader_stepdown_retry_interval: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enable_load_balancing: true,
            max_concurrent_adds: 1,
            max_concurrent_removals: 1,
            max_concurrent_leader_moves: 1,
            max_concurrent_remote_bootstraps: 2,
            max_over_replicated_tablets: 1,
            min_load_variance_to_balance: 2,
            min_leader_load_variance_to_balance: 2,
            leader_balance_threshold: 0,
            leader_balance_unresponsive_timeout: Duration::from_secs(60),
            min_leader_stepdown_retry_interval: Duration::from_secs(20),
        }
    }
}
