//! The Entity Registry (§4.2): indexed in-memory maps of every persisted
//! entity kind, each insertion/removal serialized by one global catalog
//! lock (§3 "Global catalog lock", §5).
//!
//! Long-running work must never happen while this lock is held; callers
//! take a short write-lock to insert/remove an id, then release it before
//! doing anything that blocks (persisting, RPCs).

use std::collections::BTreeMap;
use std::sync::Arc;

use cm_syscatalog::{EntityKind, SysCatalogStore};
use cm_types::{CdcStreamState, NamespaceId, SnapshotId, StreamId, TableId, TabletId, UniverseId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::entities::{CdcStream, ClusterConfig, Namespace, Snapshot, Table, Tablet, UniverseReplication};
use crate::error::CatalogError;
use crate::lock::LockedEntity;

macro_rules! entity_map {
    ($field:ident, $id_ty:ty, $entity_ty:ty, $kind_name:literal, $insert_fn:ident, $get_fn:ident, $remove_fn:ident, $list_fn:ident) => {
        pub async fn $insert_fn(
            &self,
            id: $id_ty,
            entity: $entity_ty,
        ) -> Result<Arc<LockedEntity<$entity_ty>>, CatalogError> {
            let mut maps = self.maps.write().await;
            if maps.$field.contains_key(&id) {
                return Err(CatalogError::AlreadyPresent {
                    kind: $kind_name,
                    id: id.to_string(),
                });
            }
            let locked = Arc::new(LockedEntity::new(entity));
            maps.$field.insert(id, locked.clone());
            Ok(locked)
        }

        pub async fn $get_fn(
            &self,
            id: &$id_ty,
        ) -> Result<Arc<LockedEntity<$entity_ty>>, CatalogError> {
            let maps = self.maps.read().await;
            maps.$field
                .get(id)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound {
                    kind: $kind_name,
                    id: id.to_string(),
                })
        }

        pub async fn $remove_fn(&self, id: &$id_ty) -> Result<(), CatalogError> {
            let mut maps = self.maps.write().await;
            maps.$field
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| CatalogError::NotFound {
                    kind: $kind_name,
                    id: id.to_string(),
                })
        }

        pub async fn $list_fn(&self) -> Vec<Arc<LockedEntity<$entity_ty>>> {
            let maps = self.maps.read().await;
            maps.$field.values().cloned().collect()
        }
    };
}

#[derive(Default)]
struct CatalogMaps {
    namespaces: BTreeMap<NamespaceId, Arc<LockedEntity<Namespace>>>,
    tables: BTreeMap<TableId, Arc<LockedEntity<Table>>>,
    tablets: BTreeMap<TabletId, Arc<LockedEntity<Tablet>>>,
    snapshots: BTreeMap<SnapshotId, Arc<LockedEntity<Snapshot>>>,
    cdc_streams: BTreeMap<StreamId, Arc<LockedEntity<CdcStream>>>,
    universes: BTreeMap<UniverseId, Arc<LockedEntity<UniverseReplication>>>,
}

/// The in-memory indexed registry of every catalog entity kind (§4.2).
/// `cluster_config` is a singleton and so is kept outside the map set, but
/// still follows the same locked-write discipline as every other entity.
pub struct EntityRegistry {
    maps: RwLock<CatalogMaps>,
    cluster_config: Arc<LockedEntity<ClusterConfig>>,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(CatalogMaps::default()),
            cluster_config: Arc::new(LockedEntity::new(ClusterConfig::default())),
        }
    }

    pub fn cluster_config(&self) -> Arc<LockedEntity<ClusterConfig>> {
        self.cluster_config.clone()
    }

    entity_map!(namespaces, NamespaceId, Namespace, "namespace", insert_namespace, get_namespace, remove_namespace, list_namespaces);
    entity_map!(tables, TableId, Table, "table", insert_table, get_table, remove_table, list_tables);
    entity_map!(tablets, TabletId, Tablet, "tablet", insert_tablet, get_tablet, remove_tablet, list_tablets);
    entity_map!(snapshots, SnapshotId, Snapshot, "snapshot", insert_snapshot, get_snapshot, remove_snapshot, list_snapshots);
    entity_map!(cdc_streams, StreamId, CdcStream, "cdc_stream", insert_cdc_stream, get_cdc_stream, remove_cdc_stream, list_cdc_streams);
    entity_map!(universes, UniverseId, UniverseReplication, "universe_replication", insert_universe, get_universe, remove_universe, list_universes);

    pub async fn tablets_of_table(&self, table_id: &TableId) -> Vec<Arc<LockedEntity<Tablet>>> {
        let maps = self.maps.read().await;
        let mut out = Vec::new();
        for (_, t) in maps.tablets.iter() {
            if t.read().await.table_id == *table_id {
                out.push(t.clone());
            }
        }
        out
    }

    /// Clears all maps and replays persisted entities in dependency order
    /// (§4.2): namespaces, tables, tablets, cluster config, snapshots, CDC
    /// streams, universe replication. Tablet servers are deliberately not
    /// replayed here — they are rebuilt from heartbeats by the Tablet
    /// Server Manager, not from sys-catalog (§4.2).
    pub async fn reload_from_sys_catalog(
        &self,
        store: &dyn SysCatalogStore,
    ) -> Result<(), CatalogError> {
        {
            let mut maps = self.maps.write().await;
            *maps = CatalogMaps::default();
        }

        self.visit_namespaces(store).await?;
        self.visit_tables(store).await?;
        self.visit_tablets(store).await?;
        self.visit_cluster_config(store).await?;
        self.visit_snapshots(store).await?;
        self.visit_cdc_streams(store).await?;
        self.visit_universes(store).await?;
        Ok(())
    }

    async fn visit_namespaces(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::Namespace, &mut |_id, payload| rows.push(payload))
            .await?;
        let mut maps = self.maps.write().await;
        for payload in rows {
            match serde_json::from_value::<Namespace>(payload) {
                Ok(ns) => {
                    maps.namespaces.insert(ns.id.clone(), Arc::new(LockedEntity::new(ns)));
                }
                Err(e) => warn!(error = %e, "failed to deserialize namespace row during replay"),
            }
        }
        Ok(())
    }

    async fn visit_tables(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::Table, &mut |_id, payload| rows.push(payload))
            .await?;
        let mut maps = self.maps.write().await;
        for payload in rows {
            match serde_json::from_value::<Table>(payload) {
                Ok(t) => {
                    maps.tables.insert(t.id.clone(), Arc::new(LockedEntity::new(t)));
                }
                Err(e) => warn!(error = %e, "failed to deserialize table row during replay"),
            }
        }
        Ok(())
    }

    async fn visit_tablets(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::Tablet, &mut |_id, payload| rows.push(payload))
            .await?;
        let mut maps = self.maps.write().await;
        for payload in rows {
            match serde_json::from_value::<Tablet>(payload) {
                Ok(t) => {
                    maps.tablets.insert(t.id.clone(), Arc::new(LockedEntity::new(t)));
                }
                Err(e) => warn!(error = %e, "failed to deserialize tablet row during replay"),
            }
        }
        Ok(())
    }

    async fn visit_cluster_config(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::ClusterConfig, &mut |_id, payload| rows.push(payload))
            .await?;
        if let Some(payload) = rows.into_iter().next() {
            match serde_json::from_value::<ClusterConfig>(payload) {
                Ok(cfg) => {
                    let guard_holder = &self.cluster_config;
                    let mut guard = guard_holder.begin_mutation().await;
                    guard.dirty = cfg;
                    guard.commit().await;
                }
                Err(e) => warn!(error = %e, "failed to deserialize cluster config during replay"),
            }
        }
        Ok(())
    }

    async fn visit_snapshots(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::Snapshot, &mut |_id, payload| rows.push(payload))
            .await?;
        let mut maps = self.maps.write().await;
        for payload in rows {
            match serde_json::from_value::<Snapshot>(payload) {
                Ok(s) => {
                    maps.snapshots.insert(s.id.clone(), Arc::new(LockedEntity::new(s)));
                }
                Err(e) => warn!(error = %e, "failed to deserialize snapshot row during replay"),
            }
        }
        Ok(())
    }

    /// Replays CDC streams, then adjusts derived state: a stream whose table
    /// is itself `DELETING`/absent is forced into `DELETING` too, per the
    /// example in §4.2 ("it may adjust derived state").
    async fn visit_cdc_streams(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::CdcStream, &mut |_id, payload| rows.push(payload))
            .await?;
        let mut streams = Vec::new();
        for payload in rows {
            match serde_json::from_value::<CdcStream>(payload) {
                Ok(s) => streams.push(s),
                Err(e) => warn!(error = %e, "failed to deserialize cdc stream row during replay"),
            }
        }
        let maps = self.maps.read().await;
        let table_ids: std::collections::BTreeSet<_> = maps.tables.keys().cloned().collect();
        drop(maps);
        let mut maps = self.maps.write().await;
        for mut s in streams {
            if !table_ids.contains(&s.table_id) && s.state == CdcStreamState::Active {
                debug!(stream = %s.id, "table missing on replay, marking stream DELETING");
                s.state = CdcStreamState::Deleting;
            }
            maps.cdc_streams.insert(s.id.clone(), Arc::new(LockedEntity::new(s)));
        }
        Ok(())
    }

    async fn visit_universes(&self, store: &dyn SysCatalogStore) -> Result<(), CatalogError> {
        let mut rows = Vec::new();
        store
            .visit(EntityKind::UniverseReplication, &mut |_id, payload| rows.push(payload))
            .await?;
        let mut maps = self.maps.write().await;
        for payload in rows {
            match serde_json::from_value::<UniverseReplication>(payload) {
                Ok(u) => {
                    maps.universes.insert(u.producer_id.clone(), Arc::new(LockedEntity::new(u)));
                }
                Err(e) => warn!(error = %e, "failed to deserialize universe replication row during replay"),
            }
        }
        Ok(())
    }
}
