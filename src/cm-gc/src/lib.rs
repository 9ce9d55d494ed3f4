//! Periodic background cleanup (§4.8): purges `DELETING` CDC streams and
//! recomputes XCluster safe-time.

mod cleaner;
mod error;
mod safe_time;
mod traits;

pub use error::GcError;
pub use safe_time::SafeTimeReport;
pub use traits::{CdcStateCleaner, SafeTimeSource};

use std::sync::Arc;

use cm_catalog::EntityRegistry;
use cm_syscatalog::SysCatalogStore;
use cm_types::{HybridTime, LeaderTerm, NamespaceId};
use tracing::instrument;

pub struct GcReport {
    pub streams_purged: usize,
    pub safe_time: SafeTimeReport,
}

/// Drives one pass of background cleanup. Intended to be called on a
/// timer by `cm-master` while the calling node holds leadership.
pub struct GcService {
    registry: Arc<EntityRegistry>,
    cdc_cleaner: Arc<dyn CdcStateCleaner>,
    safe_time_source: Arc<dyn SafeTimeSource>,
    safe_time: safe_time::SafeTimeService,
}

impl GcService {
    pub fn new(
        registry: Arc<EntityRegistry>,
        cdc_cleaner: Arc<dyn CdcStateCleaner>,
        safe_time_source: Arc<dyn SafeTimeSource>,
    ) -> Self {
        Self {
            registry,
            cdc_cleaner,
            safe_time_source,
            safe_time: safe_time::SafeTimeService::new(),
        }
    }

    #[instrument(skip(self, store))]
    pub async fn run_once(&self, store: &dyn SysCatalogStore, term: LeaderTerm) -> Result<GcReport, GcError> {
        let streams_purged =
            cleaner::purge_deleting_streams(&self.registry, store, term, self.cdc_cleaner.as_ref()).await?;
        let safe_time = self.safe_time.recompute(&self.registry, self.safe_time_source.as_ref()).await;
        Ok(GcReport { streams_purged, safe_time })
    }

    pub async fn namespace_safe_time(&self, namespace_id: &NamespaceId) -> Option<HybridTime> {
        self.safe_time.namespace_safe_time(namespace_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use cm_catalog::{
        CdcStream, CdcStreamOptions, ColumnDef, ConsensusState, EntityRegistry, Namespace, NamespaceKind,
        Partition, PartitionSchema, ProducerRegistryEntry, Table, TableSchema, TableStreamMap, Tablet,
    };
    use cm_syscatalog::InMemorySysCatalog;
    use cm_types::{
        CdcStreamState, HybridTime, LeaderTerm, NamespaceId, NamespaceState, StreamId, TableId, TableState,
        TabletId, TabletState, UniverseId,
    };
    use tokio::sync::Mutex;

    use super::*;

    struct FakeCleaner {
        fail_tablets: std::collections::BTreeSet<TabletId>,
    }

    #[async_trait]
    impl CdcStateCleaner for FakeCleaner {
        async fn delete_rows(&self, tablet_id: &TabletId, _stream_id: &StreamId) -> bool {
            !self.fail_tablets.contains(tablet_id)
        }
    }

    struct FakeSafeTimeSource {
        readings: Mutex<BTreeMap<String, HybridTime>>,
        ceiling: HybridTime,
    }

    #[async_trait]
    impl SafeTimeSource for FakeSafeTimeSource {
        async fn producer_tablet_safe_time(&self, producer_tablet_id: &str) -> Option<HybridTime> {
            self.readings.lock().await.get(producer_tablet_id).copied()
        }

        async fn system_namespace_safe_time(&self) -> HybridTime {
            self.ceiling
        }
    }

    async fn seed_table(registry: &EntityRegistry, namespace: &str, num_tablets: usize) -> (NamespaceId, TableId, Vec<TabletId>) {
        let ns_id = NamespaceId::generate();
        registry
            .insert_namespace(
                ns_id.clone(),
                Namespace { id: ns_id.clone(), name: namespace.into(), kind: NamespaceKind::Sql, state: NamespaceState::Created },
            )
            .await
            .unwrap();

        let table_id = TableId::generate();
        registry
            .insert_table(
                table_id.clone(),
                Table {
                    id: table_id.clone(),
                    name: "events".into(),
                    namespace_id: ns_id.clone(),
                    schema: TableSchema {
                        columns: vec![ColumnDef { id: 0, name: "id".into(), type_name: "int8".into(), is_key: true }],
                    },
                    partition_schema: PartitionSchema::default(),
                    replication_info: None,
                    index_info: None,
                    state: TableState::Running,
                    wal_retention_secs: 900,
                },
            )
            .await
            .unwrap();

        let mut tablet_ids = Vec::new();
        for i in 0..num_tablets {
            let tablet_id = TabletId::generate();
            let start = if i == 0 { vec![] } else { vec![i as u8] };
            let end = if i + 1 == num_tablets { vec![] } else { vec![(i + 1) as u8] };
            registry
                .insert_tablet(
                    tablet_id.clone(),
                    Tablet {
                        id: tablet_id.clone(),
                        table_id: table_id.clone(),
                        partition: Partition { start_key: start, end_key: end },
                        committed_consensus_state: ConsensusState::default(),
                        replica_locations: BTreeMap::new(),
                        state: TabletState::Running,
                    },
                )
                .await
                .unwrap();
            tablet_ids.push(tablet_id);
        }

        (ns_id, table_id, tablet_ids)
    }

    #[tokio::test]
    async fn purges_deleting_stream_once_all_rows_clear() {
        let registry = Arc::new(EntityRegistry::new());
        let (_, table_id, _tablets) = seed_table(&registry, "app", 2).await;
        let stream_id = StreamId::generate();
        registry
            .insert_cdc_stream(
                stream_id.clone(),
                CdcStream { id: stream_id.clone(), table_id, options: CdcStreamOptions::default(), state: CdcStreamState::Deleting },
            )
            .await
            .unwrap();

        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();
        let cleaner: Arc<dyn CdcStateCleaner> = Arc::new(FakeCleaner { fail_tablets: Default::default() });
        let safe_time_source: Arc<dyn SafeTimeSource> =
            Arc::new(FakeSafeTimeSource { readings: Mutex::new(BTreeMap::new()), ceiling: HybridTime(100) });
        let gc = GcService::new(registry.clone(), cleaner, safe_time_source);

        let report = gc.run_once(&store, term).await.unwrap();
        assert_eq!(report.streams_purged, 1);
        assert!(registry.get_cdc_stream(&stream_id).await.is_err());
    }

    #[tokio::test]
    async fn leaves_stream_deleting_on_partial_failure() {
        let registry = Arc::new(EntityRegistry::new());
        let (_, table_id, tablets) = seed_table(&registry, "app", 2).await;
        let stream_id = StreamId::generate();
        registry
            .insert_cdc_stream(
                stream_id.clone(),
                CdcStream { id: stream_id.clone(), table_id, options: CdcStreamOptions::default(), state: CdcStreamState::Deleting },
            )
            .await
            .unwrap();

        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();
        let mut fail = std::collections::BTreeSet::new();
        fail.insert(tablets[0].clone());
        let cleaner: Arc<dyn CdcStateCleaner> = Arc::new(FakeCleaner { fail_tablets: fail });
        let safe_time_source: Arc<dyn SafeTimeSource> =
            Arc::new(FakeSafeTimeSource { readings: Mutex::new(BTreeMap::new()), ceiling: HybridTime(100) });
        let gc = GcService::new(registry.clone(), cleaner, safe_time_source);

        let report = gc.run_once(&store, term).await.unwrap();
        assert_eq!(report.streams_purged, 0);
        let stream = registry.get_cdc_stream(&stream_id).await.unwrap();
        assert_eq!(stream.read().await.state, CdcStreamState::Deleting);
    }

    #[tokio::test]
    async fn safe_time_is_minimum_clamped_and_monotonic() {
        let registry = Arc::new(EntityRegistry::new());
        let (ns_id, table_id, tablets) = seed_table(&registry, "app", 2).await;

        let producer_id = UniverseId::generate();
        let mut map = BTreeMap::new();
        map.insert("p-tablet-0".to_string(), tablets[0].clone());
        map.insert("p-tablet-1".to_string(), tablets[1].clone());
        {
            let cluster_config = registry.cluster_config();
            let mut guard = cluster_config.begin_mutation().await;
            guard.dirty.consumer_registry.producer_universes.insert(
                producer_id.clone(),
                ProducerRegistryEntry {
                    disable_stream: false,
                    producer_master_addresses: vec!["host:7100".into()],
                    table_stream_maps: {
                        let mut m = BTreeMap::new();
                        m.insert(
                            "p-events".to_string(),
                            TableStreamMap {
                                stream_id: StreamId::generate(),
                                consumer_table_id: table_id,
                                producer_tablet_to_consumer_tablet: map,
                            },
                        );
                        m
                    },
                },
            );
            guard.commit().await;
        }

        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();
        let cleaner: Arc<dyn CdcStateCleaner> = Arc::new(FakeCleaner { fail_tablets: Default::default() });
        let mut readings = BTreeMap::new();
        readings.insert("p-tablet-0".to_string(), HybridTime(50));
        readings.insert("p-tablet-1".to_string(), HybridTime(80));
        let concrete_source = Arc::new(FakeSafeTimeSource { readings: Mutex::new(readings), ceiling: HybridTime(200) });
        let safe_time_source: Arc<dyn SafeTimeSource> = concrete_source.clone();
        let gc = GcService::new(registry.clone(), cleaner.clone(), safe_time_source);

        let report = gc.run_once(&store, term).await.unwrap();
        assert_eq!(report.safe_time.namespaces_recomputed, 1);
        assert_eq!(gc.namespace_safe_time(&ns_id).await, Some(HybridTime(50)));

        // a second run with lower readings must not regress the stored value.
        {
            let mut readings = concrete_source.readings.lock().await;
            readings.insert("p-tablet-0".to_string(), HybridTime(10));
            readings.insert("p-tablet-1".to_string(), HybridTime(20));
        }
        gc.run_once(&store, term).await.unwrap();
        assert_eq!(gc.namespace_safe_time(&ns_id).await, Some(HybridTime(50)));
    }
}
