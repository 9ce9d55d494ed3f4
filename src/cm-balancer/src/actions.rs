use std::collections::BTreeMap;
use std::time::Instant;

use cm_types::TabletId;
use cm_types::TsId;

/// An action the balancer has decided to take this run. Applying one is the
/// caller's responsibility (via the narrow `TabletServerAgent` interface);
/// the balancer itself only plans (§4.5, §6 `ChangeConfig`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BalancerAction {
    AddReplica { tablet_id: TabletId, target: TsId },
    RemoveReplica { tablet_id: TabletId, target: TsId },
    MoveLeader { tablet_id: TabletId, from: TsId, to: TsId },
}

/// Counts of outstanding change requests the Catalog Manager has already
/// issued, which the balancer must treat as already-applied when computing
/// load and budgets (§4.5 step 3, §5 "Pending task counters").
#[derive(Clone, Debug, Default)]
pub struct InFlightTasks {
    pub pending_adds: BTreeMap<TabletId, u32>,
    pub pending_removes: BTreeMap<TabletId, u32>,
    pub pending_leader_steps: BTreeMap<TabletId, u32>,
    pub cluster_wide_remote_bootstraps: u32,
    /// Tracks the last failed step-down attempt to a given (tablet, target)
    /// pair, to back off repeated retries (§4.5 "Skip pairs where a recent
    /// step-down attempt... failed within a backoff window").
    pub recent_stepdown_failures: BTreeMap<(TabletId, TsId), Instant>,
}

impl InFlightTasks {
    pub fn total_pending_adds(&self) -> u32 {
        self.pending_adds.values().sum()
    }

    pub fn total_pending_removes(&self) -> u32 {
        self.pending_removes.values().sum()
    }

    pub fn total_pending_leader_steps(&self) -> u32 {
        self.pending_leader_steps.values().sum()
    }
}

/// The remaining per-run budgets after subtracting in-flight tasks (§4.5
/// step 3). Each `take_*` call consumes one unit of budget and returns
/// whether it was available.
#[derive(Clone, Debug, Default)]
pub struct RunBudgets {
    pub adds: u32,
    pub removals: u32,
    pub leader_moves: u32,
    pub remote_bootstraps: u32,
    pub over_replicated: u32,
}

impl RunBudgets {
    pub fn from_config_and_in_flight(
        config: &super::config::BalancerConfig,
        in_flight: &InFlightTasks,
    ) -> Self {
        let sat_sub = |budget: u32, used: u32| budget.saturating_sub(used);
        Self {
            adds: sat_sub(config.max_concurrent_adds, in_flight.total_pending_adds()),
            removals: sat_sub(config.max_concurrent_removals, in_flight.total_pending_removes()),
            leader_moves: sat_sub(
                config.max_concurrent_leader_moves,
                in_flight.total_pending_leader_steps(),
            ),
            remote_bootstraps: sat_sub(
                config.max_concurrent_remote_bootstraps,
                in_flight.cluster_wide_remote_bootstraps,
            ),
            over_replicated: config.max_over_replicated_tablets,
        }
    }

    pub fn take_add(&mut self) -> bool {
        self.take_remote_bootstrap() && take(&mut self.adds)
    }

    pub fn take_removal(&mut self) -> bool {
        take(&mut self.removals)
    }

    pub fn take_leader_move(&mut self) -> bool {
        take(&mut self.leader_moves)
    }

    pub fn take_remote_bootstrap(&mut self) -> bool {
        take(&mut self.remote_bootstraps)
    }

    pub fn take_over_replicated(&mut self) -> bool {
        take(&mut self.over_replicated)
    }
}

fn take(counter: &mut u32) -> bool {
    if *counter == 0 {
        false
    } else {
        *counter -= 1;
        true
    }
}
