//! The persistent, leader-authoritative registry of catalog entities (§3,
//! §4.2): their structs, lifecycle state machines, the two-phase
//! locked-write protocol every mutation follows, and the indexed in-memory
//! maps serialized by the global catalog lock.

pub mod entities;
mod error;
mod lock;
mod registry;

pub use entities::*;
pub use error::CatalogError;
pub use lock::{DirtyGuard, LockedEntity};
pub use registry::EntityRegistry;

use cm_types::NamespaceState;

impl EntityRegistry {
    /// Enforces the invariant that `(name, type)` is unique among
    /// non-deleted namespaces (§3).
    pub async fn namespace_name_available(
        &self,
        name: &str,
        kind: NamespaceKind,
    ) -> Result<(), CatalogError> {
        for ns in self.list_namespaces().await {
            let ns = ns.read().await;
            if ns.name == name && ns.kind == kind && !matches!(ns.state, NamespaceState::Deleted) {
                return Err(CatalogError::NamespaceNameInUse {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_types::{NamespaceId, NamespaceState};

    fn namespace(name: &str) -> Namespace {
        Namespace {
            id: NamespaceId::generate(),
            name: name.to_string(),
            kind: NamespaceKind::Sql,
            state: NamespaceState::Created,
        }
    }

    #[tokio::test]
    async fn namespace_name_uniqueness_is_enforced() {
        let registry = EntityRegistry::new();
        let ns = namespace("billing");
        registry.insert_namespace(ns.id.clone(), ns.clone()).await.unwrap();

        let conflict = registry
            .namespace_name_available("billing", NamespaceKind::Sql)
            .await;
        assert!(conflict.is_err());

        // A different type with the same name is fine.
        assert!(registry
            .namespace_name_available("billing", NamespaceKind::NoSql)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn deleted_namespace_frees_up_the_name() {
        let registry = EntityRegistry::new();
        let ns = namespace("scratch");
        let locked = registry.insert_namespace(ns.id.clone(), ns).await.unwrap();

        let mut guard = locked.begin_mutation().await;
        guard.dirty.state = NamespaceState::Deleted;
        guard.commit().await;

        assert!(registry
            .namespace_name_available("scratch", NamespaceKind::Sql)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn insert_table_then_lookup_tablets() {
        use cm_types::{TableId, TabletId, TableState, TabletState};

        let registry = EntityRegistry::new();
        let ns = namespace("app");
        registry.insert_namespace(ns.id.clone(), ns.clone()).await.unwrap();

        let table_id = TableId::generate();
        let table = Table {
            id: table_id.clone(),
            name: "events".into(),
            namespace_id: ns.id.clone(),
            schema: TableSchema::default(),
            partition_schema: PartitionSchema::default(),
            replication_info: None,
            index_info: None,
            state: TableState::Running,
            wal_retention_secs: 900,
        };
        registry.insert_table(table_id.clone(), table).await.unwrap();

        let tablet_id = TabletId::generate();
        let tablet = Tablet {
            id: tablet_id.clone(),
            table_id: table_id.clone(),
            partition: Partition::default(),
            committed_consensus_state: ConsensusState::default(),
            replica_locations: Default::default(),
            state: TabletState::Running,
        };
        registry.insert_tablet(tablet_id, tablet).await.unwrap();

        let tablets = registry.tablets_of_table(&table_id).await;
        assert_eq!(tablets.len(), 1);
    }
}
