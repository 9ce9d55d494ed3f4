//! `SetupUniverseReplication`'s four-stage protocol, enable/disable, and
//! deletion (§4.7).

use std::collections::BTreeMap;

use cm_catalog::{EntityRegistry, Partition, ProducerRegistryEntry, TableStreamMap, UniverseReplication};
use cm_syscatalog::{EntityKind, SysCatalogError, SysCatalogKey, SysCatalogStore};
use cm_types::{LeaderTerm, StreamId, TableId, UniverseId, UniverseReplicationState};
use tracing::{info, warn};

use crate::error::CdcError;
use crate::producer::ProducerClient;

async fn persist_universe(
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    universe: &UniverseReplication,
) -> Result<(), CdcError> {
    store
        .update_item(
            SysCatalogKey::new(EntityKind::UniverseReplication, universe.producer_id.0.clone()),
            serde_json::to_value(universe)?,
            term,
        )
        .await?;
    Ok(())
}

/// Persists `ClusterConfig`, a singleton row: `update_item` if it already
/// exists, `add_item` the first time (§4.2 treats it as any other
/// sys-catalog-backed entity, just with at most one row).
async fn persist_cluster_config(
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    config: &cm_catalog::ClusterConfig,
) -> Result<(), CdcError> {
    let key = SysCatalogKey::new(EntityKind::ClusterConfig, "singleton");
    let payload = serde_json::to_value(config)?;
    match store.update_item(key.clone(), payload.clone(), term).await {
        Ok(()) => Ok(()),
        Err(SysCatalogError::NotFound(..)) => {
            store.add_item(key, payload, term).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn transition(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    producer_id: &UniverseId,
    new_state: UniverseReplicationState,
) -> Result<(), CdcError> {
    let locked = registry
        .get_universe(producer_id)
        .await
        .map_err(|_| CdcError::UniverseNotFound(producer_id.clone()))?;
    let mut guard = locked.begin_mutation().await;
    guard.dirty.state = new_state;
    persist_universe(store, term, &guard.dirty).await?;
    guard.commit().await;
    Ok(())
}

/// Stage 1: persist a universe entry in `INITIALIZING`, recording the
/// producer's masters and the set of producer table ids to replicate.
pub async fn setup_replication(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    client: &dyn ProducerClient,
    producer_id: UniverseId,
    producer_master_addresses: Vec<String>,
    tables: Vec<String>,
    bootstrap_ids: Option<BTreeMap<String, String>>,
) -> Result<(), CdcError> {
    let universe = UniverseReplication {
        producer_id: producer_id.clone(),
        producer_master_addresses,
        tables: tables.clone(),
        validated_tables: BTreeMap::new(),
        table_streams: BTreeMap::new(),
        state: UniverseReplicationState::Initializing,
    };
    store
        .add_item(
            SysCatalogKey::new(EntityKind::UniverseReplication, producer_id.0.clone()),
            serde_json::to_value(&universe)?,
            term,
        )
        .await?;
    registry.insert_universe(producer_id.clone(), universe).await?;

    validate_schemas(registry, store, term, client, &producer_id, &tables).await?;
    bind_streams(registry, store, term, client, &producer_id, &tables, bootstrap_ids).await?;
    install_consumer_registry(registry, store, term, client, &producer_id).await?;

    info!(universe = %producer_id, "universe replication active");
    Ok(())
}

/// Stage 2: for each producer table, fetch its schema and match it against
/// a local table with the same (namespace, name); any mismatch fails the
/// whole universe.
async fn validate_schemas(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    client: &dyn ProducerClient,
    producer_id: &UniverseId,
    tables: &[String],
) -> Result<(), CdcError> {
    let mut validated = BTreeMap::new();

    for producer_table_id in tables {
        let info = client.fetch_table_schema(producer_table_id).await;
        let Some(info) = info else {
            transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
            return Err(CdcError::NoMatchingLocalTable(producer_table_id.clone()));
        };

        let mut namespace_id = None;
        for ns in registry.list_namespaces().await {
            let ns = ns.read().await;
            if ns.name == info.namespace {
                namespace_id = Some(ns.id.clone());
                break;
            }
        }
        let Some(namespace_id) = namespace_id else {
            transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
            return Err(CdcError::NoMatchingLocalTable(producer_table_id.clone()));
        };

        let mut local_table_id = None;
        for t in registry.list_tables().await {
            let t = t.read().await;
            if t.namespace_id == namespace_id && t.name == info.name {
                local_table_id = Some(t.id.clone());
                break;
            }
        }
        let Some(local_table_id) = local_table_id else {
            transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
            return Err(CdcError::NoMatchingLocalTable(producer_table_id.clone()));
        };

        let local_table = registry.get_table(&local_table_id).await?;
        if local_table.read().await.schema != info.schema {
            transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
            return Err(CdcError::SchemaMismatch {
                producer_table_id: producer_table_id.clone(),
                local_table_id,
            });
        }

        validated.insert(producer_table_id.clone(), local_table_id);
    }

    let locked = registry
        .get_universe(producer_id)
        .await
        .map_err(|_| CdcError::UniverseNotFound(producer_id.clone()))?;
    let mut guard = locked.begin_mutation().await;
    guard.dirty.validated_tables = validated;
    guard.dirty.state = UniverseReplicationState::Validated;
    persist_universe(store, term, &guard.dirty).await?;
    guard.commit().await;
    Ok(())
}

/// Stage 3: for each table, bind to a bootstrapped stream or create a new
/// one on the producer.
async fn bind_streams(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    client: &dyn ProducerClient,
    producer_id: &UniverseId,
    tables: &[String],
    bootstrap_ids: Option<BTreeMap<String, String>>,
) -> Result<(), CdcError> {
    let mut table_streams = BTreeMap::new();

    for producer_table_id in tables {
        let stream_id = if let Some(bootstrap_id) = bootstrap_ids.as_ref().and_then(|m| m.get(producer_table_id)) {
            if !client.verify_bootstrap_id(bootstrap_id, producer_table_id).await {
                transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
                return Err(CdcError::BootstrapTableMismatch {
                    bootstrap_id: bootstrap_id.clone(),
                    producer_table_id: producer_table_id.clone(),
                });
            }
            StreamId(bootstrap_id.clone())
        } else {
            let Some(stream_id) = client.create_stream(producer_table_id).await else {
                transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
                return Err(CdcError::InvalidRequest(format!(
                    "producer refused to create a stream for table {producer_table_id:?}"
                )));
            };
            StreamId(stream_id)
        };
        table_streams.insert(producer_table_id.clone(), stream_id);
    }

    let locked = registry
        .get_universe(producer_id)
        .await
        .map_err(|_| CdcError::UniverseNotFound(producer_id.clone()))?;
    let mut guard = locked.begin_mutation().await;
    guard.dirty.table_streams = table_streams;
    persist_universe(store, term, &guard.dirty).await?;
    guard.commit().await;
    Ok(())
}

async fn find_matching_tablet(registry: &EntityRegistry, table_id: &TableId, partition: &Partition) -> Option<cm_types::TabletId> {
    for t in registry.tablets_of_table(table_id).await {
        let t = t.read().await;
        if t.partition == *partition {
            return Some(t.id.clone());
        }
    }
    None
}

/// Stage 4: resolve consumer tablet locations for each table's stream,
/// install the producer→consumer tablet map into `ClusterConfig`, bump its
/// version, and transition the universe to `ACTIVE`.
async fn install_consumer_registry(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    client: &dyn ProducerClient,
    producer_id: &UniverseId,
) -> Result<(), CdcError> {
    let (producer_master_addresses, table_streams, validated_tables) = {
        let locked = registry
            .get_universe(producer_id)
            .await
            .map_err(|_| CdcError::UniverseNotFound(producer_id.clone()))?;
        let universe = locked.read().await;
        (
            universe.producer_master_addresses.clone(),
            universe.table_streams.clone(),
            universe.validated_tables.clone(),
        )
    };

    let mut table_stream_maps = BTreeMap::new();
    for (producer_table_id, stream_id) in &table_streams {
        let Some(consumer_table_id) = validated_tables.get(producer_table_id) else {
            continue;
        };
        let producer_tablets = client.list_tablets(producer_table_id).await;
        let mut producer_tablet_to_consumer_tablet = BTreeMap::new();
        for pt in producer_tablets {
            let Some(consumer_tablet_id) = find_matching_tablet(registry, consumer_table_id, &pt.partition).await else {
                transition(registry, store, term, producer_id, UniverseReplicationState::Failed).await?;
                return Err(CdcError::NoMatchingTablet(pt.id));
            };
            producer_tablet_to_consumer_tablet.insert(pt.id, consumer_tablet_id);
        }
        table_stream_maps.insert(
            producer_table_id.clone(),
            TableStreamMap {
                stream_id: stream_id.clone(),
                consumer_table_id: consumer_table_id.clone(),
                producer_tablet_to_consumer_tablet,
            },
        );
    }

    let cluster_config = registry.cluster_config();
    let mut guard = cluster_config.begin_mutation().await;
    guard.dirty.consumer_registry.producer_universes.insert(
        producer_id.clone(),
        ProducerRegistryEntry {
            disable_stream: false,
            producer_master_addresses,
            table_stream_maps,
        },
    );
    guard.dirty.bump_version();
    persist_cluster_config(store, term, &guard.dirty).await?;
    guard.commit().await;

    transition(registry, store, term, producer_id, UniverseReplicationState::Active).await
}

/// `SetUniverseReplicationEnabled`: toggles `ACTIVE` ↔ `DISABLED`.
pub async fn set_enabled(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    producer_id: &UniverseId,
    is_enabled: bool,
) -> Result<(), CdcError> {
    let cluster_config = registry.cluster_config();
    let mut guard = cluster_config.begin_mutation().await;
    let entry = guard
        .dirty
        .consumer_registry
        .producer_universes
        .get_mut(producer_id)
        .ok_or_else(|| CdcError::UniverseNotFound(producer_id.clone()))?;
    entry.disable_stream = !is_enabled;
    guard.dirty.bump_version();
    persist_cluster_config(store, term, &guard.dirty).await?;
    guard.commit().await;

    transition(
        registry,
        store,
        term,
        producer_id,
        if is_enabled {
            UniverseReplicationState::Active
        } else {
            UniverseReplicationState::Disabled
        },
    )
    .await
}

/// `DeleteUniverseReplication`: marks the entry deleted, removes it from
/// the consumer registry, best-effort deletes producer-side streams, then
/// drops the local universe entry.
pub async fn delete_replication(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    client: &dyn ProducerClient,
    producer_id: &UniverseId,
) -> Result<(), CdcError> {
    transition(registry, store, term, producer_id, UniverseReplicationState::Deleted).await?;

    let cluster_config = registry.cluster_config();
    let mut guard = cluster_config.begin_mutation().await;
    guard.dirty.consumer_registry.producer_universes.remove(producer_id);
    guard.dirty.bump_version();
    persist_cluster_config(store, term, &guard.dirty).await?;
    guard.commit().await;

    let table_streams = {
        let locked = registry
            .get_universe(producer_id)
            .await
            .map_err(|_| CdcError::UniverseNotFound(producer_id.clone()))?;
        locked.read().await.table_streams.clone()
    };
    for stream_id in table_streams.values() {
        if !client.delete_stream(&stream_id.0).await {
            warn!(stream = %stream_id, "best-effort producer-side stream delete failed");
        }
    }

    store
        .delete_item(SysCatalogKey::new(EntityKind::UniverseReplication, producer_id.0.clone()), term)
        .await?;
    registry.remove_universe(producer_id).await?;
    info!(universe = %producer_id, "universe replication deleted");
    Ok(())
}
