//! Create/Restore/Delete (§4.6). Import lives in `import.rs` since it does
//! not participate in the `current_snapshot_id` interlock.

use std::sync::Arc;

use cm_catalog::{EntityRegistry, Snapshot, SnapshotEntry};
use cm_syscatalog::{EntityKind, SysCatalogKey, SysCatalogStore};
use cm_types::{LeaderTerm, SnapshotId, SnapshotState, TableId, TabletId, TabletSnapshotState};
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::agent::SnapshotAgent;
use crate::error::SnapshotError;

/// The result of polling `IsSnapshotOpDone` (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOpStatus {
    InProgress,
    Done,
    Failed,
    Cancelled,
}

/// Owns the single in-flight `current_snapshot_id` slot (§9 "Global mutable
/// leader state") and dispatches the narrow tablet-server RPCs a snapshot
/// operation needs.
pub struct SnapshotOrchestrator {
    registry: Arc<EntityRegistry>,
    agent: Arc<dyn SnapshotAgent>,
    current_snapshot_id: RwLock<Option<SnapshotId>>,
}

impl SnapshotOrchestrator {
    pub fn new(registry: Arc<EntityRegistry>, agent: Arc<dyn SnapshotAgent>) -> Self {
        Self {
            registry,
            agent,
            current_snapshot_id: RwLock::new(None),
        }
    }

    pub async fn current_snapshot_id(&self) -> Option<SnapshotId> {
        self.current_snapshot_id.read().await.clone()
    }

    async fn persist(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        snapshot: &Snapshot,
        is_new: bool,
    ) -> Result<(), SnapshotError> {
        let key = SysCatalogKey::new(EntityKind::Snapshot, snapshot.id.0.clone());
        let payload = serde_json::to_value(snapshot)?;
        if is_new {
            store.add_item(key, payload, term).await?;
        } else {
            store.update_item(key, payload, term).await?;
        }
        Ok(())
    }

    /// §4.6 `Create`.
    pub async fn create(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        table_ids: &[TableId],
    ) -> Result<SnapshotId, SnapshotError> {
        let mut current = self.current_snapshot_id.write().await;
        if current.is_some() {
            return Err(SnapshotError::ParallelSnapshotOperation);
        }

        let id = SnapshotId::generate();
        let mut entries = Vec::new();
        let mut tablet_states = std::collections::BTreeMap::new();

        for table_id in table_ids {
            let table_locked = self.registry.get_table(table_id).await?;
            let table = table_locked.read().await;
            let namespace_locked = self.registry.get_namespace(&table.namespace_id).await?;
            let namespace = namespace_locked.read().await;

            entries.push(SnapshotEntry::Namespace {
                id: namespace.id.clone(),
                metadata: serde_json::to_value(&*namespace)?,
            });
            entries.push(SnapshotEntry::Table {
                id: table.id.clone(),
                metadata: serde_json::to_value(&*table)?,
            });

            for tablet_locked in self.registry.tablets_of_table(table_id).await {
                let tablet = tablet_locked.read().await;
                entries.push(SnapshotEntry::Tablet {
                    id: tablet.id.clone(),
                    table_id: tablet.table_id.clone(),
                    partition: tablet.partition.clone(),
                    metadata: serde_json::to_value(&*tablet)?,
                });
                tablet_states.insert(tablet.id.clone(), TabletSnapshotState::Creating);
            }
        }

        let snapshot = Snapshot {
            id: id.clone(),
            state: SnapshotState::Creating,
            entries,
            tablet_states,
        };

        self.persist(store, term, &snapshot, true).await?;
        self.registry.insert_snapshot(id.clone(), snapshot).await?;
        *current = Some(id.clone());
        drop(current);

        info!(snapshot = %id, "snapshot create dispatched");
        self.dispatch_create(store, term, &id).await?;
        Ok(id)
    }

    async fn dispatch_create(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        id: &SnapshotId,
    ) -> Result<(), SnapshotError> {
        let tablet_ids: Vec<TabletId> = {
            let snap = self.registry.get_snapshot(id).await?;
            let snap = snap.read().await;
            snap.tablet_states.keys().cloned().collect()
        };

        let results = join_all(tablet_ids.iter().map(|tid| {
            let agent = self.agent.clone();
            let id = id.clone();
            let tid = tid.clone();
            async move { (tid, agent.create_tablet_snapshot(&tid, &id).await) }
        }))
        .await;

        self.apply_tablet_results(store, term, id, results).await
    }

    /// Re-dispatches RPCs for a snapshot left `CREATING`/`RESTORING` by a
    /// prior leader term, after `reload_from_sys_catalog` repopulated the
    /// registry (§8 scenario F "leader failover during snapshot create").
    pub async fn resume_pending(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
    ) -> Result<(), SnapshotError> {
        for locked in self.registry.list_snapshots().await {
            let state = locked.read().await.state;
            let id = locked.read().await.id.clone();
            match state {
                SnapshotState::Creating => {
                    *self.current_snapshot_id.write().await = Some(id.clone());
                    self.dispatch_create(store, term, &id).await?;
                }
                SnapshotState::Restoring => {
                    *self.current_snapshot_id.write().await = Some(id.clone());
                    self.dispatch_restore(store, term, &id).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn apply_tablet_results(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        id: &SnapshotId,
        results: Vec<(TabletId, bool)>,
    ) -> Result<(), SnapshotError> {
        let locked = self.registry.get_snapshot(id).await?;
        let mut guard = locked.begin_mutation().await;

        for (tablet_id, success) in results {
            if let Some(state) = guard.dirty.tablet_states.get_mut(&tablet_id) {
                *state = if success {
                    TabletSnapshotState::Complete
                } else {
                    TabletSnapshotState::Failed
                };
            }
        }

        if guard.dirty.any_tablet_failed() {
            guard.dirty.state = SnapshotState::Failed;
        } else if guard.dirty.all_tablets_complete() {
            guard.dirty.state = SnapshotState::Complete;
        }

        let terminal = guard.dirty.state.is_terminal_control_state();
        self.persist(store, term, &guard.dirty, false).await?;
        guard.commit().await;

        if terminal {
            *self.current_snapshot_id.write().await = None;
        }
        Ok(())
    }

    /// §4.6 `Restore`.
    pub async fn restore(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        snapshot_id: &SnapshotId,
    ) -> Result<(), SnapshotError> {
        let mut current = self.current_snapshot_id.write().await;
        if current.is_some() {
            return Err(SnapshotError::ParallelSnapshotOperation);
        }

        let locked = self
            .registry
            .get_snapshot(snapshot_id)
            .await
            .map_err(|_| SnapshotError::SnapshotNotFound(snapshot_id.clone()))?;

        {
            let snap = locked.read().await;
            if snap.state != SnapshotState::Complete {
                return Err(SnapshotError::SnapshotNotReady(snapshot_id.clone(), snap.state));
            }
            for entry in &snap.entries {
                match entry {
                    SnapshotEntry::Namespace { id, .. } => {
                        if self.registry.get_namespace(id).await.is_err() {
                            return Err(SnapshotError::RestoreTargetMissing(format!("namespace {id}")));
                        }
                    }
                    SnapshotEntry::Table { id, .. } => {
                        if self.registry.get_table(id).await.is_err() {
                            return Err(SnapshotError::RestoreTargetMissing(format!("table {id}")));
                        }
                    }
                    SnapshotEntry::Tablet { .. } => {}
                }
            }
        }

        let mut guard = locked.begin_mutation().await;
        guard.dirty.state = SnapshotState::Restoring;
        for state in guard.dirty.tablet_states.values_mut() {
            *state = TabletSnapshotState::Restoring;
        }
        self.persist(store, term, &guard.dirty, false).await?;
        guard.commit().await;

        *current = Some(snapshot_id.clone());
        drop(current);

        info!(snapshot = %snapshot_id, "snapshot restore dispatched");
        self.dispatch_restore(store, term, snapshot_id).await
    }

    async fn dispatch_restore(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        snapshot_id: &SnapshotId,
    ) -> Result<(), SnapshotError> {
        let tablet_entries: Vec<TabletId> = {
            let snap = self.registry.get_snapshot(snapshot_id).await?;
            let snap = snap.read().await;
            snap.entries
                .iter()
                .filter_map(|e| match e {
                    SnapshotEntry::Tablet { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect()
        };

        let mut dispatchable = Vec::new();
        for tablet_id in tablet_entries {
            if self.registry.get_tablet(&tablet_id).await.is_ok() {
                dispatchable.push(tablet_id);
            } else {
                warn!(tablet = %tablet_id, "restore target tablet no longer exists, skipping");
            }
        }

        let results = join_all(dispatchable.iter().map(|tid| {
            let agent = self.agent.clone();
            let id = snapshot_id.clone();
            let tid = tid.clone();
            async move { (tid, agent.restore_tablet_snapshot(&tid, &id).await) }
        }))
        .await;

        self.apply_tablet_results(store, term, snapshot_id, results).await
    }

    /// §4.6 `Delete`. Unlike create/restore, delete does not hold the
    /// interlock for its duration — it only refuses to start while another
    /// operation is in flight (§8 scenario B).
    pub async fn delete(
        &self,
        store: &dyn SysCatalogStore,
        term: LeaderTerm,
        snapshot_id: &SnapshotId,
    ) -> Result<(), SnapshotError> {
        if self.current_snapshot_id.read().await.is_some() {
            return Err(SnapshotError::ParallelSnapshotOperation);
        }

        let locked = self
            .registry
            .get_snapshot(snapshot_id)
            .await
            .map_err(|_| SnapshotError::SnapshotNotFound(snapshot_id.clone()))?;

        let mut guard = locked.begin_mutation().await;
        guard.dirty.state = SnapshotState::Deleting;
        for state in guard.dirty.tablet_states.values_mut() {
            *state = TabletSnapshotState::Deleting;
        }
        self.persist(store, term, &guard.dirty, false).await?;
        guard.commit().await;

        let tablet_ids: Vec<TabletId> = locked.read().await.tablet_states.keys().cloned().collect();
        let results = join_all(tablet_ids.iter().map(|tid| {
            let agent = self.agent.clone();
            let id = snapshot_id.clone();
            let tid = tid.clone();
            async move { (tid, agent.delete_tablet_snapshot(&tid, &id).await) }
        }))
        .await;

        let mut guard = locked.begin_mutation().await;
        for (tablet_id, success) in results {
            if let Some(state) = guard.dirty.tablet_states.get_mut(&tablet_id) {
                *state = if success {
                    TabletSnapshotState::Complete
                } else {
                    TabletSnapshotState::Failed
                };
            }
        }
        let all_non_deleting = guard
            .dirty
            .tablet_states
            .values()
            .all(|s| !matches!(s, TabletSnapshotState::Deleting));
        self.persist(store, term, &guard.dirty, false).await?;
        guard.commit().await;

        if all_non_deleting {
            store
                .delete_item(SysCatalogKey::new(EntityKind::Snapshot, snapshot_id.0.clone()), term)
                .await?;
            self.registry.remove_snapshot(snapshot_id).await?;
            info!(snapshot = %snapshot_id, "snapshot deleted");
        }
        Ok(())
    }

    /// §6 `IsSnapshotOpDone`.
    pub async fn is_op_done(&self, snapshot_id: &SnapshotId) -> Result<SnapshotOpStatus, SnapshotError> {
        let locked = self
            .registry
            .get_snapshot(snapshot_id)
            .await
            .map_err(|_| SnapshotError::SnapshotNotFound(snapshot_id.clone()))?;
        let snap = locked.read().await;
        Ok(match snap.state {
            SnapshotState::Complete | SnapshotState::Deleted => SnapshotOpStatus::Done,
            SnapshotState::Failed => SnapshotOpStatus::Failed,
            SnapshotState::Cancelled => SnapshotOpStatus::Cancelled,
            SnapshotState::Creating | SnapshotState::Restoring | SnapshotState::Deleting => {
                SnapshotOpStatus::InProgress
            }
        })
    }

    /// §6 `ListSnapshots`.
    pub async fn list(&self, snapshot_id: Option<&SnapshotId>) -> Vec<Arc<Snapshot>> {
        let mut out = Vec::new();
        match snapshot_id {
            Some(id) => {
                if let Ok(locked) = self.registry.get_snapshot(id).await {
                    out.push(locked.read().await);
                }
            }
            None => {
                for locked in self.registry.list_snapshots().await {
                    out.push(locked.read().await);
                }
            }
        }
        out
    }
}
