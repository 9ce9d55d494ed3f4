use std::time::Duration;

use cm_balancer::BalancerConfig;
use serde::{Deserialize, Serialize};

/// Telemetry opt-out and cadence (§6 `callhome_*`). Transport itself is out
/// of scope; only the switch and interval are carried (see `CallHomeCollector`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallHomeConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CallHomeConfig {
    fn default() -> Self {
        Self { enabled: true, interval: Duration::from_secs(3600 * 24) }
    }
}

/// Every item in §6 "Configurable options," with defaults matching the
/// spec's stated defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// 0 = default, resolved by `cm-cdc` to its own built-in tablet count.
    pub cdc_state_table_num_tablets: u32,
    #[serde(with = "humantime_serde")]
    pub cdc_wal_retention_time: Duration,

    pub balancer: BalancerConfig,
    #[serde(with = "humantime_serde")]
    pub balancer_run_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub gc_run_interval: Duration,

    pub callhome: CallHomeConfig,

    /// Test-only fault-injection gate; never true in production.
    #[serde(rename = "TEST_allow_skewed_clock_in_ysql")]
    pub test_allow_skewed_clock_in_ysql: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cdc_state_table_num_tablets: 0,
            cdc_wal_retention_time: Duration::from_secs(14400),
            balancer: BalancerConfig::default(),
            balancer_run_interval: Duration::from_secs(10),
            gc_run_interval: Duration::from_secs(60),
            callhome: CallHomeConfig::default(),
            test_allow_skewed_clock_in_ysql: false,
        }
    }
}

/// Resolves `cdc_state_table_num_tablets = 0` to the built-in default used
/// when a deployment has not overridden it.
pub const DEFAULT_CDC_STATE_TABLE_NUM_TABLETS: u32 = 8;

impl MasterConfig {
    pub fn effective_cdc_state_table_num_tablets(&self) -> u32 {
        if self.cdc_state_table_num_tablets == 0 {
            DEFAULT_CDC_STATE_TABLE_NUM_TABLETS
        } else {
            self.cdc_state_table_num_tablets
        }
    }
}
