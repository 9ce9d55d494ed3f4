//! `MasterService` (§9 "Global mutable leader state" lives here): the
//! facade a transport layer calls into for every RPC in §6, and the owner
//! of the balancer/GC/callhome background loops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cm_balancer::{Balancer, InFlightTasks};
use cm_catalog::{CdcStream, CdcStreamOptions, EntityRegistry, Snapshot, UniverseReplication};
use cm_cdc::ProducerClient;
use cm_gc::GcService;
use cm_snapshot::{SnapshotAgent, SnapshotOpStatus, SnapshotOrchestrator};
use cm_syscatalog::SysCatalogStore;
use cm_ts_manager::{Clock, TsManager};
use cm_types::{LeaderTerm, NamespaceId, SnapshotId, StreamId, TableId, TabletId, UniverseId};
use tracing::{info, instrument, warn};

use crate::callhome::CallHomeCollector;
use crate::config::MasterConfig;
use crate::error::MasterError;
use crate::heartbeat::{handle_heartbeat, EncryptionAckTracker, HeartbeatRequest, HeartbeatResponse};
use crate::leadership::LeaderReadyState;

/// Everything a running master process owns: the in-memory registry, the
/// sys-catalog log, the sub-crate services wired against them, and this
/// process's leader-readiness state (§9).
pub struct MasterService {
    pub config: MasterConfig,
    pub registry: Arc<EntityRegistry>,
    pub store: Arc<dyn SysCatalogStore>,
    pub ts_manager: Arc<TsManager>,
    pub snapshots: Arc<SnapshotOrchestrator>,
    pub gc: Arc<GcService>,
    pub balancer: Arc<Balancer>,
    pub producer_client: Arc<dyn ProducerClient>,
    pub callhome: Arc<dyn CallHomeCollector>,
    encryption_acks: EncryptionAckTracker,
    leadership: LeaderReadyState,
    in_flight: InFlightTasks,
}

impl MasterService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MasterConfig,
        registry: Arc<EntityRegistry>,
        store: Arc<dyn SysCatalogStore>,
        clock: Arc<dyn Clock>,
        liveness_window: std::time::Duration,
        snapshot_agent: Arc<dyn SnapshotAgent>,
        producer_client: Arc<dyn ProducerClient>,
        callhome: Arc<dyn CallHomeCollector>,
        balancer_seed: u64,
    ) -> Self {
        let ts_manager = Arc::new(TsManager::new(clock, liveness_window));
        let snapshots = Arc::new(SnapshotOrchestrator::new(registry.clone(), snapshot_agent));
        let gc = Arc::new(GcService::new(registry.clone(), cm_gc_state_cleaner(), cm_gc_safe_time_source()));
        let balancer = Arc::new(Balancer::new(config.balancer.clone(), balancer_seed));
        Self {
            config,
            registry,
            store,
            ts_manager,
            snapshots,
            gc,
            balancer,
            producer_client,
            callhome,
            encryption_acks: EncryptionAckTracker::default(),
            leadership: LeaderReadyState::default(),
            in_flight: InFlightTasks::default(),
        }
    }

    fn term(&self) -> LeaderTerm {
        self.store.current_term()
    }

    fn require_ready(&self) -> Result<(), MasterError> {
        self.leadership.require_ready(self.store.as_ref())
    }

    /// Replays the sys-catalog and resumes in-flight operations; called
    /// once on becoming leader (§4.2, §8 scenario F).
    pub async fn become_leader(&self) -> Result<(), MasterError> {
        let term = self.term();
        self.leadership
            .become_leader(&self.registry, self.store.as_ref(), &self.snapshots, term)
            .await
    }

    pub fn step_down(&self) {
        self.leadership.step_down();
    }

    // ---- Snapshot RPCs (§6) ----

    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, tables: Vec<TableId>) -> Result<SnapshotId, MasterError> {
        self.require_ready()?;
        Ok(self.snapshots.create(self.store.as_ref(), self.term(), &tables).await?)
    }

    #[instrument(skip(self))]
    pub async fn is_snapshot_op_done(&self, snapshot_id: &SnapshotId) -> Result<SnapshotOpStatus, MasterError> {
        Ok(self.snapshots.is_op_done(snapshot_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn list_snapshots(&self, snapshot_id: Option<&SnapshotId>) -> Vec<Arc<Snapshot>> {
        self.snapshots.list(snapshot_id).await
    }

    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), MasterError> {
        self.require_ready()?;
        Ok(self.snapshots.restore(self.store.as_ref(), self.term(), snapshot_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), MasterError> {
        self.require_ready()?;
        Ok(self.snapshots.delete(self.store.as_ref(), self.term(), snapshot_id).await?)
    }

    #[instrument(skip(self, entries))]
    pub async fn import_snapshot_meta(
        &self,
        entries: &[cm_catalog::SnapshotEntry],
    ) -> Result<BTreeMap<TabletId, TabletId>, MasterError> {
        self.require_ready()?;
        Ok(cm_snapshot::import(&self.registry, self.store.as_ref(), self.term(), entries).await?)
    }

    // ---- CDC stream RPCs (§6) ----

    #[instrument(skip(self))]
    pub async fn create_cdc_stream(&self, table_id: &TableId, options: CdcStreamOptions) -> Result<StreamId, MasterError> {
        self.require_ready()?;
        Ok(cm_cdc::create_stream(
            &self.registry,
            self.store.as_ref(),
            self.term(),
            table_id,
            options,
            self.config.cdc_wal_retention_time.as_secs(),
            self.config.effective_cdc_state_table_num_tablets(),
        )
        .await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_cdc_stream(&self, stream_ids: &[StreamId]) -> Result<(), MasterError> {
        self.require_ready()?;
        Ok(cm_cdc::delete_streams(&self.registry, self.store.as_ref(), self.term(), stream_ids).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_cdc_stream(&self, stream_id: &StreamId) -> Result<CdcStream, MasterError> {
        Ok(cm_cdc::get_stream(&self.registry, stream_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn list_cdc_streams(&self, table_id: Option<&TableId>) -> Vec<CdcStream> {
        cm_cdc::list_streams(&self.registry, table_id).await
    }

    // ---- Universe replication RPCs (§6) ----

    #[instrument(skip(self))]
    pub async fn setup_universe_replication(
        &self,
        producer_id: UniverseId,
        producer_master_addresses: Vec<String>,
        producer_table_ids: Vec<String>,
        producer_bootstrap_ids: Option<BTreeMap<String, String>>,
    ) -> Result<(), MasterError> {
        self.require_ready()?;
        Ok(cm_cdc::setup_replication(
            &self.registry,
            self.store.as_ref(),
            self.term(),
            self.producer_client.as_ref(),
            producer_id,
            producer_master_addresses,
            producer_table_ids,
            producer_bootstrap_ids,
        )
        .await?)
    }

    #[instrument(skip(self))]
    pub async fn set_universe_replication_enabled(&self, producer_id: &UniverseId, is_enabled: bool) -> Result<(), MasterError> {
        self.require_ready()?;
        Ok(cm_cdc::set_enabled(&self.registry, self.store.as_ref(), self.term(), producer_id, is_enabled).await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_universe_replication(&self, producer_id: &UniverseId) -> Result<(), MasterError> {
        self.require_ready()?;
        Ok(cm_cdc::delete_replication(&self.registry, self.store.as_ref(), self.term(), self.producer_client.as_ref(), producer_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_universe_replication(&self, producer_id: &UniverseId) -> Result<UniverseReplication, MasterError> {
        let locked = self.registry.get_universe(producer_id).await?;
        Ok((*locked.read().await).clone())
    }

    // ---- Heartbeat & encryption RPCs (§6) ----

    #[instrument(skip(self, request))]
    pub async fn ts_heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse, MasterError> {
        Ok(handle_heartbeat(&self.ts_manager, &self.registry, &self.encryption_acks, request).await?)
    }

    #[instrument(skip(self))]
    pub async fn change_encryption_info(&self, enabled: bool, universe_key_registry_version: u64) -> Result<(), MasterError> {
        self.require_ready()?;
        let cluster_config = self.registry.cluster_config();
        let mut guard = cluster_config.begin_mutation().await;
        guard.dirty.encryption_info.enabled = enabled;
        guard.dirty.encryption_info.universe_key_registry_version = universe_key_registry_version;
        guard.dirty.bump_version();
        let payload = serde_json::to_value(&guard.dirty).map_err(|e| MasterError::Internal(e.to_string()))?;
        persist_cluster_config(self.store.as_ref(), self.term(), payload).await?;
        guard.commit().await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn is_encryption_enabled(&self) -> bool {
        self.registry.cluster_config().read().await.encryption_info.enabled
    }

    // ---- Background loops ----

    /// Runs one balancer pass over every table (§4.5). A production loop
    /// calls this on `config.balancer_run_interval`; kept as a plain method
    /// so tests can drive individual iterations deterministically.
    #[instrument(skip(self))]
    pub async fn run_balancer_once(&self) -> Result<usize, MasterError> {
        if self.require_ready().is_err() {
            return Ok(0);
        }
        let cluster_config = self.registry.cluster_config().read().await;
        let Some(cluster_default) = cluster_config.replication_info.clone() else {
            return Ok(0);
        };
        let blacklist: BTreeSet<_> = cluster_config.server_blacklist.iter().cloned().collect();
        let leader_blacklist: BTreeSet<_> = cluster_config.leader_blacklist.iter().cloned().collect();

        let mut total_actions = 0;
        for locked_table in self.registry.list_tables().await {
            let (table_id, policy) = {
                let table = locked_table.read().await;
                (table.id.clone(), cm_balancer::effective_policy(table.replication_info.clone(), cluster_default.clone()))
            };
            let actions = self
                .balancer
                .run_once(&self.registry, &self.ts_manager, &table_id, &policy, &blacklist, &leader_blacklist, &self.in_flight)
                .await?;
            for action in &actions {
                Balancer::apply_action(&self.registry, action).await?;
            }
            total_actions += actions.len();
        }
        Ok(total_actions)
    }

    /// Runs one GC pass: purges `DELETING` CDC streams and recomputes
    /// per-namespace XCluster safe-time (§4.8).
    #[instrument(skip(self))]
    pub async fn run_gc_once(&self) -> Result<(), MasterError> {
        if self.require_ready().is_err() {
            return Ok(());
        }
        let report = self.gc.run_once(self.store.as_ref(), self.term()).await?;
        info!(
            streams_purged = report.streams_purged,
            namespaces_recomputed = report.safe_time.namespaces_recomputed,
            "gc pass complete"
        );
        Ok(())
    }

    pub async fn namespace_safe_time(&self, namespace_id: &NamespaceId) -> Option<cm_types::HybridTime> {
        self.gc.namespace_safe_time(namespace_id).await
    }

    #[instrument(skip(self))]
    pub async fn run_callhome_once(&self) {
        if self.config.callhome.enabled {
            self.callhome.collect_and_send().await;
        }
    }
}

async fn persist_cluster_config(
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    payload: serde_json::Value,
) -> Result<(), MasterError> {
    use cm_syscatalog::{EntityKind, SysCatalogKey};
    let key = SysCatalogKey::new(EntityKind::ClusterConfig, "singleton");
    match store.update_item(key.clone(), payload.clone(), term).await {
        Ok(()) => Ok(()),
        Err(cm_syscatalog::SysCatalogError::NotFound(..)) => Ok(store.add_item(key, payload, term).await?),
        Err(e) => Err(e.into()),
    }
}

/// Placeholder sources for `GcService`'s two injectable collaborators until
/// a transport-backed implementation exists; both are wired here rather
/// than in `GcService` itself since the master is what knows how to reach
/// tablet servers and producer clusters (§1 transport is out of scope).
fn cm_gc_state_cleaner() -> Arc<dyn cm_gc::CdcStateCleaner> {
    Arc::new(NoopCdcStateCleaner)
}

fn cm_gc_safe_time_source() -> Arc<dyn cm_gc::SafeTimeSource> {
    Arc::new(ZeroSafeTimeSource)
}

struct NoopCdcStateCleaner;

#[async_trait::async_trait]
impl cm_gc::CdcStateCleaner for NoopCdcStateCleaner {
    async fn delete_rows(&self, _tablet_id: &TabletId, _stream_id: &StreamId) -> bool {
        warn!("no CDC state table RPC client wired; treating row delete as a no-op success");
        true
    }
}

struct ZeroSafeTimeSource;

#[async_trait::async_trait]
impl cm_gc::SafeTimeSource for ZeroSafeTimeSource {
    async fn producer_tablet_safe_time(&self, _producer_tablet_id: &str) -> Option<cm_types::HybridTime> {
        None
    }

    async fn system_namespace_safe_time(&self) -> cm_types::HybridTime {
        cm_types::HybridTime::MIN
    }
}
