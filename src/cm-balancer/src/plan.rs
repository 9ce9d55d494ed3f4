use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use cm_placement::server_satisfies_block;
use cm_ts_manager::TsDescriptor;
use cm_types::{MemberType, ReplicaRole, ReplicationInfo, TabletId, TsId};
use rand::Rng;

use crate::actions::{BalancerAction, InFlightTasks};
use crate::analyze::{AnalyzeResult, TabletView};
use crate::config::BalancerConfig;

struct PlanCtx<'a> {
    tablets_by_id: BTreeMap<TabletId, &'a TabletView>,
    live_by_id: BTreeMap<TsId, &'a TsDescriptor>,
    loads: BTreeMap<TsId, i64>,
    leader_loads: BTreeMap<TsId, i64>,
    blacklist: &'a BTreeSet<TsId>,
    leader_blacklist: &'a BTreeSet<TsId>,
    policy: &'a ReplicationInfo,
}

impl<'a> PlanCtx<'a> {
    fn candidates_for(&self, exclude: &BTreeSet<TsId>) -> Vec<TsId> {
        let mut out: Vec<TsId> = self
            .live_by_id
            .keys()
            .filter(|ts| !exclude.contains(*ts) && !self.blacklist.contains(*ts))
            .cloned()
            .collect();
        out.sort_by_key(|ts| (self.loads.get(ts).copied().unwrap_or(0), ts.clone()));
        out
    }

    fn satisfies_policy(&self, ts: &TsId) -> bool {
        if self.policy.live_replicas.placement_blocks.is_empty() {
            return true;
        }
        let Some(server) = self.live_by_id.get(ts) else {
            return false;
        };
        self.policy
            .live_replicas
            .placement_blocks
            .iter()
            .any(|b| server_satisfies_block(server, b))
    }

    fn unmet_block(&self, tablet: &TabletView) -> Option<&'a cm_types::PlacementBlock> {
        for block in &self.policy.live_replicas.placement_blocks {
            let have = tablet
                .replicas
                .keys()
                .filter(|ts| {
                    self.live_by_id
                        .get(*ts)
                        .map(|s| server_satisfies_block(s, block))
                        .unwrap_or(false)
                })
                .count() as u32;
            if have < block.min_num_replicas {
                return Some(block);
            }
        }
        None
    }

    fn bump_load(&mut self, ts: &TsId, delta: i64) {
        *self.loads.entry(ts.clone()).or_insert(0) += delta;
    }
}

/// Runs the add/remove/leader-move phases of §4.5, consuming the analysis'
/// budgets and returning the actions decided this run. Each committed
/// action is idempotent on retry: applying the same `BalancerAction` twice
/// has no additional effect once the underlying `ChangeConfig` call is
/// itself idempotent, which is the caller's (tablet-server RPC layer's)
/// responsibility.
pub fn plan_actions(
    tablets: &[TabletView],
    policy: &ReplicationInfo,
    live_servers: &[TsDescriptor],
    blacklist: &BTreeSet<TsId>,
    leader_blacklist: &BTreeSet<TsId>,
    analysis: &mut AnalyzeResult,
    in_flight: &InFlightTasks,
    config: &BalancerConfig,
    rng: &mut impl Rng,
) -> Vec<BalancerAction> {
    let mut ctx = PlanCtx {
        tablets_by_id: tablets.iter().map(|t| (t.id.clone(), t)).collect(),
        live_by_id: live_servers
            .iter()
            .map(|s| (s.instance.permanent_uuid.clone(), s))
            .collect(),
        loads: analysis
            .per_ts_meta
            .iter()
            .map(|(ts, m)| (ts.clone(), m.load()))
            .collect(),
        leader_loads: analysis
            .per_ts_meta
            .iter()
            .map(|(ts, m)| (ts.clone(), m.leader_load()))
            .collect(),
        blacklist,
        leader_blacklist,
        policy,
    };

    let mut actions = Vec::new();

    plan_add_missing_placement(&mut ctx, analysis, &mut actions, rng);
    plan_add_wrong_placement_relocate(&mut ctx, analysis, &mut actions);
    plan_add_load_equalization(&mut ctx, analysis, &mut actions);

    plan_remove_wrong_placement(&mut ctx, analysis, &mut actions);
    plan_remove_over_replicated(&mut ctx, analysis, &mut actions);

    plan_leader_moves(&mut ctx, analysis, in_flight, config, &mut actions);

    actions
}

fn plan_add_missing_placement(
    ctx: &mut PlanCtx<'_>,
    analysis: &mut AnalyzeResult,
    actions: &mut Vec<BalancerAction>,
    rng: &mut impl Rng,
) {
    for tablet_id in analysis.under_replicated.clone() {
        let Some(tablet) = ctx.tablets_by_id.get(&tablet_id).copied() else {
            continue;
        };
        let hosting: BTreeSet<TsId> = tablet.replicas.keys().cloned().collect();

        let target = if let Some(block) = ctx.unmet_block(tablet) {
            let mut choices: Vec<TsId> = ctx
                .live_by_id
                .keys()
                .filter(|ts| !hosting.contains(*ts) && !ctx.blacklist.contains(*ts))
                .filter(|ts| {
                    ctx.live_by_id
                        .get(*ts)
                        .map(|s| server_satisfies_block(s, block))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            choices.sort_by_key(|ts| (ctx.loads.get(ts).copied().unwrap_or(0), ts.clone()));
            pick_among_lowest_load(ctx, &choices, rng)
        } else {
            let choices = ctx.candidates_for(&hosting);
            pick_among_lowest_load(ctx, &choices, rng)
        };

        // Budget is consumed only once we've confirmed there's an actual
        // addition to make; a tablet with no eligible target this run must
        // not starve a later tablet's budget (§4.5 step 3).
        if let Some(target) = target {
            if !analysis.budgets.take_add() {
                return;
            }
            ctx.bump_load(&target, 1);
            actions.push(BalancerAction::AddReplica {
                tablet_id: tablet_id.clone(),
                target,
            });
        }
    }
}

fn plan_add_wrong_placement_relocate(
    ctx: &mut PlanCtx<'_>,
    analysis: &mut AnalyzeResult,
    actions: &mut Vec<BalancerAction>,
) {
    for tablet_id in analysis.wrong_placement.clone() {
        let Some(tablet) = ctx.tablets_by_id.get(&tablet_id).copied() else {
            continue;
        };
        let hosting: BTreeSet<TsId> = tablet.replicas.keys().cloned().collect();
        let choices = ctx.candidates_for(&hosting);
        let target = choices.into_iter().find(|ts| ctx.satisfies_policy(ts));
        if let Some(target) = target {
            if !analysis.budgets.take_add() {
                return;
            }
            ctx.bump_load(&target, 1);
            actions.push(BalancerAction::AddReplica {
                tablet_id: tablet_id.clone(),
                target,
            });
        }
    }
}

fn pick_among_lowest_load(ctx: &PlanCtx<'_>, choices: &[TsId], rng: &mut impl Rng) -> Option<TsId> {
    if choices.is_empty() {
        return None;
    }
    let lowest = ctx.loads.get(&choices[0]).copied().unwrap_or(0);
    let tied: Vec<&TsId> = choices
        .iter()
        .take_while(|ts| ctx.loads.get(*ts).copied().unwrap_or(0) == lowest)
        .collect();
    let idx = rng.gen_range(0..tied.len());
    Some(tied[idx].clone())
}

fn plan_add_load_equalization(
    ctx: &mut PlanCtx<'_>,
    analysis: &mut AnalyzeResult,
    actions: &mut Vec<BalancerAction>,
) {
    let balanced_tablets_by_server: BTreeMap<TsId, Vec<TabletId>> = {
        let mut m: BTreeMap<TsId, Vec<TabletId>> = BTreeMap::new();
        for tablet_id in &analysis.balanced {
            if let Some(tablet) = ctx.tablets_by_id.get(tablet_id) {
                for ts in tablet.replicas.keys() {
                    m.entry(ts.clone()).or_default().push(tablet_id.clone());
                }
            }
        }
        m
    };

    loop {
        if analysis.budgets.adds == 0 {
            return;
        }
        let mut servers: Vec<TsId> = ctx.live_by_id.keys().cloned().collect();
        servers.sort_by_key(|ts| (ctx.loads.get(ts).copied().unwrap_or(0), ts.clone()));
        if servers.len() < 2 {
            return;
        }
        let low = servers.first().unwrap().clone();
        let high = servers.last().unwrap().clone();
        let load_low = ctx.loads.get(&low).copied().unwrap_or(0);
        let load_high = ctx.loads.get(&high).copied().unwrap_or(0);
        if load_high - load_low < 2 {
            return;
        }

        let rf = ctx.policy.live_replicas.num_replicas;
        let empty = Vec::new();
        let candidates = balanced_tablets_by_server.get(&high).unwrap_or(&empty);
        let chosen = candidates.iter().find(|tablet_id| {
            let Some(tablet) = ctx.tablets_by_id.get(*tablet_id) else {
                return false;
            };
            if tablet.replicas.contains_key(&low) {
                return false;
            }
            if !ctx.satisfies_policy(&low) {
                return false;
            }
            let leader_is_high = tablet.leader().map(|l| *l == high).unwrap_or(false);
            rf == 1 || !leader_is_high
        });

        let Some(tablet_id) = chosen.cloned() else {
            // No movable tablet found on the busiest server; nothing more
            // this equalization pass can do.
            return;
        };

        if !analysis.budgets.take_add() {
            return;
        }
        ctx.bump_load(&high, -1);
        ctx.bump_load(&low, 1);
        actions.push(BalancerAction::AddReplica {
            tablet_id,
            target: low,
        });
    }
}

fn plan_remove_wrong_placement(
    ctx: &mut PlanCtx<'_>,
    analysis: &mut AnalyzeResult,
    actions: &mut Vec<BalancerAction>,
) {
    for tablet_id in analysis.over_replicated.clone() {
        let Some(tablet) = ctx.tablets_by_id.get(&tablet_id).copied() else {
            continue;
        };
        if tablet.has_in_flight_member_change() {
            continue;
        }
        if tablet.num_voters() as i64 <= ctx.policy.live_replicas.num_replicas as i64 {
            continue;
        }
        // Prefer a blacklisted replica, then any replica that fails every
        // placement block.
        let mut blacklisted: Vec<&TsId> =
            tablet.replicas.keys().filter(|ts| ctx.blacklist.contains(*ts)).collect();
        let mut misplaced: Vec<&TsId> = tablet
            .replicas
            .keys()
            .filter(|ts| !ctx.blacklist.contains(*ts) && !ctx.satisfies_policy(ts))
            .collect();
        let victim = blacklisted.pop().or_else(|| misplaced.pop());
        // As in the add phases, the budget is only spent once we've found a
        // replica actually worth removing this run.
        if let Some(victim) = victim.cloned() {
            if !analysis.budgets.take_removal() {
                return;
            }
            ctx.bump_load(&victim, -1);
            actions.push(BalancerAction::RemoveReplica {
                tablet_id: tablet_id.clone(),
                target: victim,
            });
        }
    }
}

fn plan_remove_over_replicated(
    ctx: &mut PlanCtx<'_>,
    analysis: &mut AnalyzeResult,
    actions: &mut Vec<BalancerAction>,
) {
    let already_handled: BTreeSet<TabletId> = actions
        .iter()
        .filter_map(|a| match a {
            BalancerAction::RemoveReplica { tablet_id, .. } => Some(tablet_id.clone()),
            _ => None,
        })
        .collect();

    for tablet_id in analysis.over_replicated.clone() {
        if already_handled.contains(&tablet_id) {
            continue;
        }
        let Some(tablet) = ctx.tablets_by_id.get(&tablet_id).copied() else {
            continue;
        };
        if tablet.has_in_flight_member_change() {
            continue;
        }
        if tablet.num_voters() as i64 <= ctx.policy.live_replicas.num_replicas as i64 {
            continue;
        }

        let mut candidates: Vec<&TsId> = tablet.replicas.keys().collect();
        candidates.sort_by_key(|ts| std::cmp::Reverse(ctx.loads.get(*ts).copied().unwrap_or(0)));

        let rf = ctx.policy.live_replicas.num_replicas;
        let leader = tablet.leader().cloned();
        let non_leader_candidate = candidates.iter().find(|ts| Some((**ts).clone()) != leader).copied();
        let victim = if rf == 1 {
            candidates.first().copied()
        } else {
            non_leader_candidate.or_else(|| candidates.first().copied())
        };

        if let Some(victim) = victim.cloned() {
            if !analysis.budgets.take_over_replicated() {
                return;
            }
            if !analysis.budgets.take_removal() {
                return;
            }
            ctx.bump_load(&victim, -1);
            actions.push(BalancerAction::RemoveReplica {
                tablet_id: tablet_id.clone(),
                target: victim,
            });
        }
    }
}

fn plan_leader_moves(
    ctx: &mut PlanCtx<'_>,
    analysis: &mut AnalyzeResult,
    in_flight: &InFlightTasks,
    config: &BalancerConfig,
    actions: &mut Vec<BalancerAction>,
) {
    let now = Instant::now();
    loop {
        if analysis.budgets.leader_moves == 0 {
            return;
        }
        let mut servers: Vec<TsId> = ctx.leader_loads.keys().cloned().collect();
        servers.sort_by_key(|ts| {
            (
                ctx.leader_blacklist.contains(ts),
                ctx.leader_loads.get(ts).copied().unwrap_or(0),
                ts.clone(),
            )
        });
        if servers.len() < 2 {
            return;
        }
        let low = servers.first().unwrap().clone();
        let high = servers
            .iter()
            .rev()
            .find(|ts| !ctx.leader_blacklist.contains(*ts))
            .cloned();
        let Some(high) = high else { return };
        if high == low {
            return;
        }

        let load_low = ctx.leader_loads.get(&low).copied().unwrap_or(0);
        let load_high = ctx.leader_loads.get(&high).copied().unwrap_or(0);
        if load_high - load_low < config.min_leader_load_variance_to_balance {
            return;
        }
        if load_high <= analysis.leader_balance_threshold as i64 {
            return;
        }

        let leader_tablets = analysis
            .per_ts_meta
            .get(&high)
            .map(|m| m.leaders.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();

        let chosen = leader_tablets.into_iter().find(|tablet_id| {
            if let Some(fail_at) = in_flight.recent_stepdown_failures.get(&(tablet_id.clone(), low.clone())) {
                if now.saturating_duration_since(*fail_at) < config.min_leader_stepdown_retry_interval {
                    return false;
                }
            }
            ctx.tablets_by_id
                .get(tablet_id)
                .map(|t| {
                    t.replicas
                        .get(&low)
                        .map(|r| r.running)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        });

        let Some(tablet_id) = chosen else { return };
        analysis.budgets.take_leader_move();
        *ctx.leader_loads.entry(high.clone()).or_insert(0) -= 1;
        *ctx.leader_loads.entry(low.clone()).or_insert(0) += 1;
        if let Some(meta) = analysis.per_ts_meta.get_mut(&high) {
            meta.leaders.remove(&tablet_id);
        }
        if let Some(meta) = analysis.per_ts_meta.get_mut(&low) {
            meta.leaders.insert(tablet_id.clone());
        }
        actions.push(BalancerAction::MoveLeader {
            tablet_id,
            from: high,
            to: low,
        });
    }
}
