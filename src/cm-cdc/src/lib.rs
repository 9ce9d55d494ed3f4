//! CDC stream lifecycle (§4.7) and cross-cluster universe replication setup,
//! enable/disable, and teardown (§4.7).

mod error;
mod producer;
mod streams;
mod xcluster;

pub use error::CdcError;
pub use producer::{ProducerClient, ProducerTableInfo, ProducerTabletInfo};
pub use streams::{create_stream, delete_streams, get_stream, list_streams};
pub use xcluster::{delete_replication, set_enabled, setup_replication};

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use cm_catalog::{
        ColumnDef, ConsensusState, EntityRegistry, Namespace, NamespaceKind, Partition,
        PartitionSchema, Table, TableSchema, Tablet,
    };
    use cm_syscatalog::{EntityKind, InMemorySysCatalog, SysCatalogKey, SysCatalogStore};
    use cm_types::{
        LeaderTerm, NamespaceId, NamespaceState, TableId, TableState, TabletId, TabletState,
        UniverseId, UniverseReplicationState,
    };
    use tokio::sync::Mutex;

    use super::*;

    async fn seed_table(registry: &EntityRegistry, namespace: &str, name: &str, num_tablets: usize) -> TableId {
        let ns_id = NamespaceId::generate();
        registry
            .insert_namespace(
                ns_id.clone(),
                Namespace {
                    id: ns_id.clone(),
                    name: namespace.into(),
                    kind: NamespaceKind::Sql,
                    state: NamespaceState::Created,
                },
            )
            .await
            .unwrap();

        let table_id = TableId::generate();
        let schema = TableSchema {
            columns: vec![ColumnDef { id: 0, name: "id".into(), type_name: "int8".into(), is_key: true }],
        };
        registry
            .insert_table(
                table_id.clone(),
                Table {
                    id: table_id.clone(),
                    name: name.into(),
                    namespace_id: ns_id,
                    schema: schema.clone(),
                    partition_schema: PartitionSchema::default(),
                    replication_info: None,
                    index_info: None,
                    state: TableState::Running,
                    wal_retention_secs: 900,
                },
            )
            .await
            .unwrap();

        for i in 0..num_tablets {
            let tablet_id = TabletId::generate();
            let start = if i == 0 { vec![] } else { vec![i as u8] };
            let end = if i + 1 == num_tablets { vec![] } else { vec![(i + 1) as u8] };
            registry
                .insert_tablet(
                    tablet_id.clone(),
                    Tablet {
                        id: tablet_id,
                        table_id: table_id.clone(),
                        partition: Partition { start_key: start, end_key: end },
                        committed_consensus_state: ConsensusState::default(),
                        replica_locations: BTreeMap::new(),
                        state: TabletState::Running,
                    },
                )
                .await
                .unwrap();
        }

        table_id
    }

    #[tokio::test]
    async fn create_stream_lazily_creates_state_table_and_bumps_retention() {
        let registry = EntityRegistry::new();
        let table_id = seed_table(&registry, "app", "events", 1).await;
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();

        let stream_id = create_stream(&registry, &store, term, &table_id, Default::default(), 3600, 4)
            .await
            .unwrap();

        let stream = get_stream(&registry, &stream_id).await.unwrap();
        assert_eq!(stream.table_id, table_id);

        let table = registry.get_table(&table_id).await.unwrap();
        assert_eq!(table.read().await.wal_retention_secs, 3600);

        let state_table_id = TableId("tbl-cdc_state".into());
        assert!(registry.get_table(&state_table_id).await.is_ok());

        // idempotent: a second stream on the same table reuses the state table.
        let stream_id_2 = create_stream(&registry, &store, term, &table_id, Default::default(), 3600, 4)
            .await
            .unwrap();
        assert_ne!(stream_id, stream_id_2);
        assert_eq!(list_streams(&registry, Some(&table_id)).await.len(), 2);
    }

    #[tokio::test]
    async fn create_stream_rejects_non_running_table() {
        let registry = EntityRegistry::new();
        let table_id = seed_table(&registry, "app", "events", 1).await;
        {
            let table = registry.get_table(&table_id).await.unwrap();
            let mut guard = table.begin_mutation().await;
            guard.dirty.state = TableState::Preparing;
            guard.commit().await;
        }
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();

        let err = create_stream(&registry, &store, term, &table_id, Default::default(), 3600, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::TableNotRunning(_)));
    }

    #[tokio::test]
    async fn delete_streams_marks_deleting_not_gone() {
        let registry = EntityRegistry::new();
        let table_id = seed_table(&registry, "app", "events", 1).await;
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();
        let stream_id = create_stream(&registry, &store, term, &table_id, Default::default(), 3600, 4)
            .await
            .unwrap();

        delete_streams(&registry, &store, term, &[stream_id.clone()]).await.unwrap();

        let stream = get_stream(&registry, &stream_id).await.unwrap();
        assert_eq!(stream.state, cm_types::CdcStreamState::Deleting);
    }

    /// A fake producer cluster backed by one table and a configurable set of
    /// tablets, used to exercise the four-stage setup protocol end to end.
    struct FakeProducer {
        table: ProducerTableInfo,
        tablets: Vec<ProducerTabletInfo>,
        created_streams: Mutex<Vec<String>>,
        deleted_streams: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProducerClient for FakeProducer {
        async fn fetch_table_schema(&self, producer_table_id: &str) -> Option<ProducerTableInfo> {
            (producer_table_id == "p-events").then(|| self.table.clone())
        }

        async fn list_tablets(&self, producer_table_id: &str) -> Vec<ProducerTabletInfo> {
            if producer_table_id == "p-events" {
                self.tablets.clone()
            } else {
                Vec::new()
            }
        }

        async fn create_stream(&self, producer_table_id: &str) -> Option<String> {
            let id = format!("pstream-{producer_table_id}");
            self.created_streams.lock().await.push(id.clone());
            Some(id)
        }

        async fn verify_bootstrap_id(&self, _bootstrap_id: &str, _producer_table_id: &str) -> bool {
            true
        }

        async fn delete_stream(&self, stream_id: &str) -> bool {
            self.deleted_streams.lock().await.push(stream_id.to_string());
            true
        }
    }

    #[tokio::test]
    async fn setup_universe_replication_installs_consumer_registry() {
        let registry = EntityRegistry::new();
        let table_id = seed_table(&registry, "app", "events", 2).await;
        let local_schema = registry.get_table(&table_id).await.unwrap().read().await.schema.clone();
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();

        let producer = FakeProducer {
            table: ProducerTableInfo { namespace: "app".into(), name: "events".into(), schema: local_schema },
            tablets: vec![
                ProducerTabletInfo { id: "p-tablet-0".into(), partition: Partition { start_key: vec![], end_key: vec![1] } },
                ProducerTabletInfo { id: "p-tablet-1".into(), partition: Partition { start_key: vec![1], end_key: vec![] } },
            ],
            created_streams: Mutex::new(Vec::new()),
            deleted_streams: Mutex::new(Vec::new()),
        };

        let producer_id = UniverseId::generate();
        setup_replication(
            &registry,
            &store,
            term,
            &producer,
            producer_id.clone(),
            vec!["producer-host:7100".into()],
            vec!["p-events".into()],
            None,
        )
        .await
        .unwrap();

        let universe = registry.get_universe(&producer_id).await.unwrap();
        let universe = universe.read().await;
        assert_eq!(universe.state, UniverseReplicationState::Active);
        assert_eq!(universe.validated_tables.get("p-events"), Some(&table_id));
        assert!(universe.table_streams.contains_key("p-events"));

        let cluster_config = registry.cluster_config();
        let entry = cluster_config
            .read()
            .await
            .consumer_registry
            .producer_universes
            .get(&producer_id)
            .cloned()
            .unwrap();
        assert!(!entry.disable_stream);
        let map = entry.table_stream_maps.get("p-events").unwrap();
        assert_eq!(map.producer_tablet_to_consumer_tablet.len(), 2);

        set_enabled(&registry, &store, term, &producer_id, false).await.unwrap();
        let universe = registry.get_universe(&producer_id).await.unwrap();
        assert_eq!(universe.read().await.state, UniverseReplicationState::Disabled);
        let cluster_config = registry.cluster_config();
        assert!(
            cluster_config
                .read()
                .await
                .consumer_registry
                .producer_universes
                .get(&producer_id)
                .unwrap()
                .disable_stream
        );

        delete_replication(&registry, &store, term, &producer, &producer_id).await.unwrap();
        assert!(registry.get_universe(&producer_id).await.is_err());
        assert!(
            !registry
                .cluster_config()
                .read()
                .await
                .consumer_registry
                .producer_universes
                .contains_key(&producer_id)
        );
        assert!(!producer.deleted_streams.lock().await.is_empty());

        let _ = SysCatalogKey::new(EntityKind::UniverseReplication, producer_id.0.clone());
    }

    #[tokio::test]
    async fn setup_universe_replication_fails_on_schema_mismatch() {
        let registry = EntityRegistry::new();
        seed_table(&registry, "app", "events", 1).await;
        let store = InMemorySysCatalog::new(LeaderTerm(1));
        let term = store.current_term();

        let producer = FakeProducer {
            table: ProducerTableInfo {
                namespace: "app".into(),
                name: "events".into(),
                schema: TableSchema {
                    columns: vec![ColumnDef { id: 0, name: "other".into(), type_name: "text".into(), is_key: true }],
                },
            },
            tablets: Vec::new(),
            created_streams: Mutex::new(Vec::new()),
            deleted_streams: Mutex::new(Vec::new()),
        };

        let producer_id = UniverseId::generate();
        let err = setup_replication(
            &registry,
            &store,
            term,
            &producer,
            producer_id.clone(),
            vec!["producer-host:7100".into()],
            vec!["p-events".into()],
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CdcError::SchemaMismatch { .. }));

        let universe = registry.get_universe(&producer_id).await.unwrap();
        assert_eq!(universe.read().await.state, UniverseReplicationState::Failed);
    }
}
