//! The Load Balancer (§4.5): the hardest control-plane component. Runs on
//! an interval, per table, converging tablet replica placement toward the
//! configured policy subject to concurrency, blacklist, and correctness
//! constraints.

mod actions;
mod analyze;
mod config;
mod plan;

pub use actions::{BalancerAction, InFlightTasks, RunBudgets};
pub use analyze::{analyze_tablets, AnalyzeResult, PerTsMeta, ReplicaView, TabletClass, TabletView};
pub use config::BalancerConfig;
pub use plan::plan_actions;

use std::collections::BTreeSet;

use cm_catalog::{CatalogError, EntityRegistry, ReplicaPeerState};
use cm_types::{MemberType, ReplicaRole, ReplicationInfo, TableId, TsId};
use cm_ts_manager::TsManager;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Resolves a table's effective placement policy: its own `replication_info`
/// overrides the cluster-wide default (§3 Table invariant).
pub fn effective_policy(table_override: Option<ReplicationInfo>, cluster_default: ReplicationInfo) -> ReplicationInfo {
    table_override.unwrap_or(cluster_default)
}

/// Drives one balancer run for one table: reads a consistent snapshot of
/// live servers and the table's tablets, analyzes them, and plans actions.
/// The balancer only plans; applying a `BalancerAction` (via `apply_action`
/// here, or a real `ChangeConfig` RPC in production) is a separate step so
/// decisions stay deterministic and replayable (§4.5 invariants, §8
/// property 8: the balancer never reduces the number of live,
/// correctly-placed replicas).
pub struct Balancer {
    pub config: BalancerConfig,
    rng: Mutex<ChaCha8Rng>,
}

impl Balancer {
    pub fn new(config: BalancerConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    #[instrument(skip_all, fields(table = %table_id))]
    pub async fn run_once(
        &self,
        registry: &EntityRegistry,
        ts_manager: &TsManager,
        table_id: &TableId,
        policy: &ReplicationInfo,
        blacklist: &BTreeSet<TsId>,
        leader_blacklist: &BTreeSet<TsId>,
        in_flight: &InFlightTasks,
    ) -> Result<Vec<BalancerAction>, BalancerError> {
        if !self.config.enable_load_balancing {
            return Ok(Vec::new());
        }

        let live_servers = ts_manager.get_all_live(&policy.live_replicas.placement_uuid).await;
        let tablets = registry.tablets_of_table(table_id).await;

        let mut views = Vec::with_capacity(tablets.len());
        for locked in &tablets {
            let tablet = locked.read().await;
            let replicas = tablet
                .replica_locations
                .iter()
                .map(|(ts, loc)| {
                    (
                        ts.clone(),
                        ReplicaView {
                            role: loc.role,
                            member_type: loc.member_type,
                            running: loc.state == ReplicaPeerState::Running,
                        },
                    )
                })
                .collect();
            views.push(TabletView {
                id: tablet.id.clone(),
                replicas,
            });
        }

        let mut analysis = analyze_tablets(
            &views,
            policy,
            &live_servers,
            blacklist,
            leader_blacklist,
            in_flight,
            &self.config,
        );

        let mut rng = self.rng.lock().await;
        let planned = plan_actions(
            &views,
            policy,
            &live_servers,
            blacklist,
            leader_blacklist,
            &mut analysis,
            in_flight,
            &self.config,
            &mut *rng,
        );
        drop(rng);

        info!(
            actions = planned.len(),
            under_replicated = analysis.under_replicated.len(),
            over_replicated = analysis.over_replicated.len(),
            wrong_placement = analysis.wrong_placement.len(),
            "balancer run complete"
        );

        Ok(planned)
    }

    /// Applies a planned action directly to the in-memory catalog, for
    /// tests and for a deployment where tablet consensus changes are driven
    /// synchronously. A production caller instead dispatches the
    /// corresponding `ChangeConfig` RPC and applies this once the tablet
    /// leader confirms the change.
    pub async fn apply_action(registry: &EntityRegistry, action: &BalancerAction) -> Result<(), CatalogError> {
        match action {
            BalancerAction::AddReplica { tablet_id, target } => {
                let locked = registry.get_tablet(tablet_id).await?;
                let mut guard = locked.begin_mutation().await;
                guard.dirty.replica_locations.insert(
                    target.clone(),
                    cm_catalog::ReplicaLocation {
                        role: ReplicaRole::Follower,
                        member_type: MemberType::Voter,
                        state: ReplicaPeerState::Running,
                    },
                );
                guard.commit().await;
            }
            BalancerAction::RemoveReplica { tablet_id, target } => {
                let locked = registry.get_tablet(tablet_id).await?;
                let mut guard = locked.begin_mutation().await;
                guard.dirty.replica_locations.remove(target);
                guard.commit().await;
            }
            BalancerAction::MoveLeader { tablet_id, from, to } => {
                let locked = registry.get_tablet(tablet_id).await?;
                let mut guard = locked.begin_mutation().await;
                if let Some(loc) = guard.dirty.replica_locations.get_mut(from) {
                    loc.role = ReplicaRole::Follower;
                }
                if let Some(loc) = guard.dirty.replica_locations.get_mut(to) {
                    loc.role = ReplicaRole::Leader;
                }
                guard.dirty.committed_consensus_state.leader = Some(to.clone());
                guard.commit().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_catalog::{ConsensusState, Partition, Tablet};
    use cm_ts_manager::{ManualClock, Registration, TsInstance};
    use cm_types::{PlacementInfo, TabletId, TabletState};
    use std::sync::Arc;
    use std::time::Duration;

    async fn register(ts_manager: &TsManager, uuid: &str) {
        ts_manager
            .register(
                TsInstance {
                    permanent_uuid: TsId(uuid.to_string()),
                    instance_seqno: 1,
                },
                Registration::default(),
            )
            .await;
    }

    fn tablet(id: &str, table_id: &TableId, replicas: &[(&str, ReplicaRole)]) -> Tablet {
        let mut locations = std::collections::BTreeMap::new();
        for (ts, role) in replicas {
            locations.insert(
                TsId(ts.to_string()),
                cm_catalog::ReplicaLocation {
                    role: *role,
                    member_type: MemberType::Voter,
                    state: ReplicaPeerState::Running,
                },
            );
        }
        let leader = replicas
            .iter()
            .find(|(_, r)| *r == ReplicaRole::Leader)
            .map(|(ts, _)| TsId(ts.to_string()));
        Tablet {
            id: TabletId(id.to_string()),
            table_id: table_id.clone(),
            partition: Partition::default(),
            committed_consensus_state: ConsensusState {
                current_term: 1,
                leader,
            },
            replica_locations: locations,
            state: TabletState::Running,
        }
    }

    #[tokio::test]
    async fn over_replicated_tablet_loses_its_extra_replica() {
        let registry = EntityRegistry::new();
        let ts_manager = TsManager::new(Arc::new(ManualClock::default()), Duration::from_secs(30));
        for uuid in ["a", "b", "c", "d"] {
            register(&ts_manager, uuid).await;
        }

        let table_id = TableId::generate();
        let t = tablet(
            "t1",
            &table_id,
            &[
                ("a", ReplicaRole::Leader),
                ("b", ReplicaRole::Follower),
                ("c", ReplicaRole::Follower),
                ("d", ReplicaRole::Follower),
            ],
        );
        registry.insert_tablet(t.id.clone(), t).await.unwrap();

        let policy = ReplicationInfo {
            live_replicas: PlacementInfo {
                num_replicas: 3,
                placement_blocks: vec![],
                placement_uuid: String::new(),
            },
            read_replicas: vec![],
        };

        let balancer = Balancer::new(BalancerConfig::default(), 7);
        let actions = balancer
            .run_once(
                &registry,
                &ts_manager,
                &table_id,
                &policy,
                &Default::default(),
                &Default::default(),
                &InFlightTasks::default(),
            )
            .await
            .unwrap();

        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], BalancerAction::RemoveReplica { .. }));

        for action in &actions {
            Balancer::apply_action(&registry, action).await.unwrap();
        }
        let tablet = registry.get_tablet(&TabletId("t1".into())).await.unwrap();
        assert_eq!(tablet.read().await.num_replicas(), 3);
    }

    #[tokio::test]
    async fn blacklisted_replica_is_removed_in_preference_to_others() {
        let registry = EntityRegistry::new();
        let ts_manager = TsManager::new(Arc::new(ManualClock::default()), Duration::from_secs(30));
        for uuid in ["a", "b", "c", "d"] {
            register(&ts_manager, uuid).await;
        }
        let table_id = TableId::generate();
        let t = tablet(
            "t1",
            &table_id,
            &[
                ("a", ReplicaRole::Leader),
                ("b", ReplicaRole::Follower),
                ("c", ReplicaRole::Follower),
                ("d", ReplicaRole::Follower),
            ],
        );
        registry.insert_tablet(t.id.clone(), t).await.unwrap();

        let policy = ReplicationInfo {
            live_replicas: PlacementInfo {
                num_replicas: 3,
                placement_blocks: vec![],
                placement_uuid: String::new(),
            },
            read_replicas: vec![],
        };

        let mut blacklist = BTreeSet::new();
        blacklist.insert(TsId("d".into()));

        let balancer = Balancer::new(BalancerConfig::default(), 7);
        let actions = balancer
            .run_once(
                &registry,
                &ts_manager,
                &table_id,
                &policy,
                &blacklist,
                &Default::default(),
                &InFlightTasks::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            actions,
            vec![BalancerAction::RemoveReplica {
                tablet_id: TabletId("t1".into()),
                target: TsId("d".into()),
            }]
        );
    }

    #[tokio::test]
    async fn under_replicated_tablet_gains_a_replica_on_a_live_server() {
        let registry = EntityRegistry::new();
        let ts_manager = TsManager::new(Arc::new(ManualClock::default()), Duration::from_secs(30));
        for uuid in ["a", "b", "c"] {
            register(&ts_manager, uuid).await;
        }
        let table_id = TableId::generate();
        let t = tablet(
            "t1",
            &table_id,
            &[("a", ReplicaRole::Leader), ("b", ReplicaRole::Follower)],
        );
        registry.insert_tablet(t.id.clone(), t).await.unwrap();

        let policy = ReplicationInfo {
            live_replicas: PlacementInfo {
                num_replicas: 3,
                placement_blocks: vec![],
                placement_uuid: String::new(),
            },
            read_replicas: vec![],
        };

        let balancer = Balancer::new(BalancerConfig::default(), 1);
        let actions = balancer
            .run_once(
                &registry,
                &ts_manager,
                &table_id,
                &policy,
                &Default::default(),
                &Default::default(),
                &InFlightTasks::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            actions,
            vec![BalancerAction::AddReplica {
                tablet_id: TabletId("t1".into()),
                target: TsId("c".into()),
            }]
        );
    }
}
