//! Cross-cluster import (§4.7 stage 3 "bootstrap consumer-side tables"):
//! idempotent replay of a producer snapshot's entries against the local
//! registry, producing a producer-tablet → consumer-tablet id mapping the
//! caller installs into the universe's `TableStreamMap`.
//!
//! Three passes, each keyed off the previous pass's id remap, mirroring the
//! dependency order entries are emitted in (§9 "Tagged-variant entries" are
//! dispatched totally, never partially).

use std::collections::BTreeMap;

use cm_catalog::{EntityRegistry, Namespace, SnapshotEntry, Table};
use cm_syscatalog::{EntityKind, SysCatalogKey, SysCatalogStore};
use cm_types::{LeaderTerm, NamespaceId, NamespaceState, TableId, TableState, TabletId};
use tracing::info;

use crate::error::SnapshotError;

/// The producer→consumer tablet id map a caller installs into the owning
/// universe's stream map once import completes.
pub type TabletIdMap = BTreeMap<TabletId, TabletId>;

async fn persist_namespace(
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    namespace: &Namespace,
) -> Result<(), SnapshotError> {
    store
        .add_item(
            SysCatalogKey::new(EntityKind::Namespace, namespace.id.0.clone()),
            serde_json::to_value(namespace)?,
            term,
        )
        .await?;
    Ok(())
}

async fn persist_table(
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    table: &Table,
) -> Result<(), SnapshotError> {
    store
        .add_item(
            SysCatalogKey::new(EntityKind::Table, table.id.0.clone()),
            serde_json::to_value(table)?,
            term,
        )
        .await?;
    Ok(())
}

async fn persist_tablet(
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    tablet: &cm_catalog::Tablet,
) -> Result<(), SnapshotError> {
    store
        .add_item(
            SysCatalogKey::new(EntityKind::Tablet, tablet.id.0.clone()),
            serde_json::to_value(tablet)?,
            term,
        )
        .await?;
    Ok(())
}

/// Replays `entries` (a producer-side snapshot's entry list) against
/// `registry`, creating any namespace/table/tablet that does not already
/// exist on the consumer side and reusing what does. Returns the
/// producer-tablet → consumer-tablet id map for the caller to install.
pub async fn import(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    entries: &[SnapshotEntry],
) -> Result<TabletIdMap, SnapshotError> {
    let mut namespace_id_map: BTreeMap<NamespaceId, NamespaceId> = BTreeMap::new();

    // Pass 1: namespace lookup-or-create.
    for entry in entries {
        let SnapshotEntry::Namespace { id, metadata } = entry else {
            continue;
        };
        let producer: Namespace = serde_json::from_value(metadata.clone())?;

        let mut existing_id = None;
        for n in registry.list_namespaces().await {
            let n_read = n.read().await;
            if n_read.name == producer.name {
                existing_id = Some(n_read.id.clone());
                break;
            }
        }

        let consumer_id = if let Some(existing_id) = existing_id {
            existing_id
        } else {
            let new_id = NamespaceId::generate();
            let namespace = Namespace {
                id: new_id.clone(),
                name: producer.name.clone(),
                kind: producer.kind,
                state: NamespaceState::Created,
            };
            persist_namespace(store, term, &namespace).await?;
            registry.insert_namespace(new_id.clone(), namespace).await?;
            info!(namespace = %new_id, name = %producer.name, "import created namespace");
            new_id
        };
        namespace_id_map.insert(id.clone(), consumer_id);
    }

    let mut table_id_map: BTreeMap<TableId, TableId> = BTreeMap::new();
    let mut reused_tables: BTreeMap<TableId, bool> = BTreeMap::new();

    // Pass 2: table reuse-if-unchanged, else create-with-cleared-column-ids.
    for entry in entries {
        let SnapshotEntry::Table { id, metadata } = entry else {
            continue;
        };
        let producer: Table = serde_json::from_value(metadata.clone())?;
        let Some(consumer_namespace_id) = namespace_id_map.get(&producer.namespace_id).cloned() else {
            return Err(SnapshotError::RestoreTargetMissing(format!(
                "namespace {} referenced by imported table {}",
                producer.namespace_id, producer.name
            )));
        };

        let existing = {
            let mut found = None;
            for t in registry.list_tables().await {
                let t_read = t.read().await;
                if t_read.namespace_id == consumer_namespace_id
                    && t_read.name == producer.name
                    && t_read.state == TableState::Running
                {
                    found = Some(t_read.id.clone());
                    break;
                }
            }
            found
        };

        let (consumer_id, reused) = if let Some(existing_id) = existing {
            (existing_id, true)
        } else {
            let new_id = TableId::generate();
            let mut schema = producer.schema.clone();
            for (idx, column) in schema.columns.iter_mut().enumerate() {
                column.id = idx as i32;
            }
            let table = Table {
                id: new_id.clone(),
                name: producer.name.clone(),
                namespace_id: consumer_namespace_id,
                schema,
                partition_schema: producer.partition_schema.clone(),
                replication_info: None,
                index_info: None,
                state: TableState::Running,
                wal_retention_secs: producer.wal_retention_secs,
            };
            persist_table(store, term, &table).await?;
            registry.insert_table(new_id.clone(), table).await?;
            info!(table = %new_id, name = %producer.name, "import created table");
            (new_id, false)
        };
        table_id_map.insert(id.clone(), consumer_id.clone());
        reused_tables.insert(consumer_id, reused);
    }

    let mut tablet_id_map: TabletIdMap = BTreeMap::new();

    // Pass 3: tablet resolution by partition key-range match.
    for entry in entries {
        let SnapshotEntry::Tablet {
            id,
            table_id,
            partition,
            metadata,
        } = entry
        else {
            continue;
        };
        let Some(consumer_table_id) = table_id_map.get(table_id).cloned() else {
            return Err(SnapshotError::RestoreTargetMissing(format!(
                "table {table_id} referenced by imported tablet {id}"
            )));
        };
        let was_reused = reused_tables.get(&consumer_table_id).copied().unwrap_or(false);

        let existing_match = {
            let mut found = None;
            for t in registry.tablets_of_table(&consumer_table_id).await {
                let t_read = t.read().await;
                if t_read.partition == *partition {
                    found = Some(t_read.id.clone());
                    break;
                }
            }
            found
        };

        let consumer_tablet_id = match existing_match {
            Some(matched) => matched,
            None if was_reused => return Err(SnapshotError::NoMatchingTablet),
            None => {
                let producer: cm_catalog::Tablet = serde_json::from_value(metadata.clone())?;
                let new_id = TabletId::generate();
                let tablet = cm_catalog::Tablet {
                    id: new_id.clone(),
                    table_id: consumer_table_id,
                    partition: partition.clone(),
                    committed_consensus_state: Default::default(),
                    replica_locations: BTreeMap::new(),
                    state: producer.state,
                };
                persist_tablet(store, term, &tablet).await?;
                registry.insert_tablet(new_id.clone(), tablet).await?;
                new_id
            }
        };
        tablet_id_map.insert(id.clone(), consumer_tablet_id);
    }

    Ok(tablet_id_map)
}
