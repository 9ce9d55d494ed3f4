use std::collections::{BTreeMap, BTreeSet};

use cm_placement::server_satisfies_block;
use cm_ts_manager::TsDescriptor;
use cm_types::{MemberType, ReplicaRole, ReplicationInfo, TabletId, TsId};

use crate::actions::{InFlightTasks, RunBudgets};
use crate::config::BalancerConfig;

/// A read-only view of one tablet's current replica placement, decoupled
/// from `cm-catalog`'s locked entities so the analysis phase is a pure
/// function and therefore easy to test (§4.5 `AnalyzeTablets`).
#[derive(Clone, Debug)]
pub struct TabletView {
    pub id: TabletId,
    pub replicas: BTreeMap<TsId, ReplicaView>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaView {
    pub role: ReplicaRole,
    pub member_type: MemberType,
    pub running: bool,
}

impl TabletView {
    pub fn leader(&self) -> Option<&TsId> {
        self.replicas
            .iter()
            .find(|(_, r)| r.role == ReplicaRole::Leader)
            .map(|(ts, _)| ts)
    }

    pub fn num_voters(&self) -> u32 {
        self.replicas
            .values()
            .filter(|r| r.member_type == MemberType::Voter)
            .count() as u32
    }

    /// A replica is mid-transition if it's a `PreVoter`: the balancer must
    /// never remove while a VOTER→PRE_VOTER transition is in flight on the
    /// same tablet (§4.5).
    pub fn has_in_flight_member_change(&self) -> bool {
        self.replicas.values().any(|r| r.member_type == MemberType::PreVoter)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TabletClass {
    UnderReplicated,
    OverReplicated,
    WrongPlacement,
    Balanced,
}

fn replica_is_misplaced(server: Option<&TsDescriptor>, policy: &ReplicationInfo, blacklisted: bool) -> bool {
    if blacklisted {
        return true;
    }
    let Some(server) = server else {
        // Server no longer live/known: treat its replica as misplaced so the
        // balancer works to relocate it rather than stalling.
        return true;
    };
    if policy.live_replicas.placement_blocks.is_empty() {
        return false;
    }
    !policy
        .live_replicas
        .placement_blocks
        .iter()
        .any(|b| server_satisfies_block(server, b))
}

pub fn classify_tablet(
    tablet: &TabletView,
    policy: &ReplicationInfo,
    live_by_id: &BTreeMap<TsId, &TsDescriptor>,
    blacklist: &BTreeSet<TsId>,
) -> TabletClass {
    let target = policy.live_replicas.num_replicas;
    let voters = tablet.num_voters();
    if voters < target {
        return TabletClass::UnderReplicated;
    }
    if voters > target {
        return TabletClass::OverReplicated;
    }
    let any_misplaced = tablet.replicas.keys().any(|ts| {
        replica_is_misplaced(live_by_id.get(ts).copied(), policy, blacklist.contains(ts))
    });
    if any_misplaced {
        TabletClass::WrongPlacement
    } else {
        TabletClass::Balanced
    }
}

#[derive(Clone, Debug, Default)]
pub struct PerTsMeta {
    pub running: BTreeSet<TabletId>,
    pub starting: BTreeSet<TabletId>,
    pub leaders: BTreeSet<TabletId>,
}

impl PerTsMeta {
    /// Tablets/server load: a tablet counts toward a server's load whether
    /// it's fully `RUNNING` or still starting up (`NOT_STARTED`/
    /// `BOOTSTRAPPING`) (§4.5 per-run preparation, step 4).
    pub fn load(&self) -> i64 {
        (self.running.len() + self.starting.len()) as i64
    }

    pub fn leader_load(&self) -> i64 {
        self.leaders.len() as i64
    }
}

pub struct AnalyzeResult {
    pub per_ts_meta: BTreeMap<TsId, PerTsMeta>,
    pub under_replicated: Vec<TabletId>,
    pub over_replicated: Vec<TabletId>,
    pub wrong_placement: Vec<TabletId>,
    pub balanced: Vec<TabletId>,
    /// Ascending by load.
    pub sorted_by_load: Vec<TsId>,
    /// Ascending by leader load, with leader-blacklisted servers demoted to
    /// the end regardless of load (§4.5 step 4).
    pub sorted_by_leader_load: Vec<TsId>,
    pub leader_balance_threshold: u32,
    pub budgets: RunBudgets,
}

#[allow(clippy::too_many_arguments)]
pub fn analyze_tablets(
    tablets: &[TabletView],
    policy: &ReplicationInfo,
    live_servers: &[TsDescriptor],
    blacklist: &BTreeSet<TsId>,
    leader_blacklist: &BTreeSet<TsId>,
    in_flight: &InFlightTasks,
    config: &BalancerConfig,
) -> AnalyzeResult {
    let live_by_id: BTreeMap<TsId, &TsDescriptor> = live_servers
        .iter()
        .map(|s| (s.instance.permanent_uuid.clone(), s))
        .collect();

    let mut per_ts_meta: BTreeMap<TsId, PerTsMeta> = live_servers
        .iter()
        .map(|s| (s.instance.permanent_uuid.clone(), PerTsMeta::default()))
        .collect();

    let mut under_replicated = Vec::new();
    let mut over_replicated = Vec::new();
    let mut wrong_placement = Vec::new();
    let mut balanced = Vec::new();

    for tablet in tablets {
        for (ts, replica) in &tablet.replicas {
            if let Some(meta) = per_ts_meta.get_mut(ts) {
                if replica.running {
                    meta.running.insert(tablet.id.clone());
                } else {
                    meta.starting.insert(tablet.id.clone());
                }
                if replica.role == ReplicaRole::Leader {
                    meta.leaders.insert(tablet.id.clone());
                }
            }
        }

        match classify_tablet(tablet, policy, &live_by_id, blacklist) {
            TabletClass::UnderReplicated => under_replicated.push(tablet.id.clone()),
            TabletClass::OverReplicated => over_replicated.push(tablet.id.clone()),
            TabletClass::WrongPlacement => wrong_placement.push(tablet.id.clone()),
            TabletClass::Balanced => balanced.push(tablet.id.clone()),
        }
    }

    let mut sorted_by_load: Vec<TsId> = per_ts_meta.keys().cloned().collect();
    sorted_by_load.sort_by_key(|ts| (per_ts_meta[ts].load(), ts.clone()));

    let mut sorted_by_leader_load: Vec<TsId> = per_ts_meta.keys().cloned().collect();
    sorted_by_leader_load.sort_by_key(|ts| {
        (
            leader_blacklist.contains(ts),
            per_ts_meta[ts].leader_load(),
            ts.clone(),
        )
    });

    let num_servers = (per_ts_meta.len() as u32).max(1);
    let optimal = (tablets.len() as u32).div_ceil(num_servers);
    let leader_balance_threshold = config.leader_balance_threshold.max(optimal);

    let budgets = RunBudgets::from_config_and_in_flight(config, in_flight);

    AnalyzeResult {
        per_ts_meta,
        under_replicated,
        over_replicated,
        wrong_placement,
        balanced,
        sorted_by_load,
        sorted_by_leader_load,
        leader_balance_threshold,
        budgets,
    }
}
