//! `CreateCDCStream` / `DeleteCDCStream` / `GetCDCStream` / `ListCDCStreams`
//! (§4.7).

use cm_catalog::{CdcStream, CdcStreamOptions, ColumnDef, EntityRegistry, Namespace, NamespaceKind, PartitionSchema, Table, TableSchema};
use cm_syscatalog::{EntityKind, SysCatalogKey, SysCatalogStore};
use cm_types::{CdcStreamState, LeaderTerm, NamespaceId, NamespaceState, StreamId, TableId, TableState};
use tracing::info;

use crate::error::CdcError;

const SYSTEM_NAMESPACE_NAME: &str = "system";
const CDC_STATE_TABLE_NAME: &str = "cdc_state";

fn system_namespace_id() -> NamespaceId {
    NamespaceId(format!("ns-{SYSTEM_NAMESPACE_NAME}"))
}

fn cdc_state_table_id() -> TableId {
    TableId(format!("tbl-{CDC_STATE_TABLE_NAME}"))
}

async fn persist_namespace(store: &dyn SysCatalogStore, term: LeaderTerm, ns: &Namespace) -> Result<(), CdcError> {
    store
        .add_item(SysCatalogKey::new(EntityKind::Namespace, ns.id.0.clone()), serde_json::to_value(ns)?, term)
        .await?;
    Ok(())
}

async fn persist_table(store: &dyn SysCatalogStore, term: LeaderTerm, table: &Table) -> Result<(), CdcError> {
    store
        .add_item(SysCatalogKey::new(EntityKind::Table, table.id.0.clone()), serde_json::to_value(table)?, term)
        .await?;
    Ok(())
}

/// Lazily creates the `system.cdc_state` table described in §6's persisted
/// state layout. Idempotent: a concurrent creator's `AlreadyPresent` is
/// swallowed, matching §4.7's "idempotent — `AlreadyPresent` is ignored".
async fn ensure_cdc_state_table(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    num_tablets: u32,
) -> Result<TableId, CdcError> {
    let ns_id = system_namespace_id();
    let namespace = Namespace {
        id: ns_id.clone(),
        name: SYSTEM_NAMESPACE_NAME.to_string(),
        kind: NamespaceKind::Sql,
        state: NamespaceState::Created,
    };
    persist_namespace(store, term, &namespace).await?;
    match registry.insert_namespace(ns_id.clone(), namespace).await {
        Ok(_) | Err(cm_catalog::CatalogError::AlreadyPresent { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let table_id = cdc_state_table_id();
    let table = Table {
        id: table_id.clone(),
        name: CDC_STATE_TABLE_NAME.to_string(),
        namespace_id: ns_id,
        schema: TableSchema {
            columns: vec![
                ColumnDef { id: 0, name: "tablet_id".into(), type_name: "STRING".into(), is_key: true },
                ColumnDef { id: 1, name: "stream_id".into(), type_name: "STRING".into(), is_key: true },
                ColumnDef { id: 2, name: "checkpoint".into(), type_name: "STRING".into(), is_key: false },
                ColumnDef { id: 3, name: "data".into(), type_name: "MAP<STRING, STRING>".into(), is_key: false },
                ColumnDef { id: 4, name: "last_replication_time".into(), type_name: "TIMESTAMP".into(), is_key: false },
            ],
        },
        partition_schema: PartitionSchema {
            kind: cm_catalog::PartitionSchemaKind::Hash,
            num_tablets,
        },
        replication_info: None,
        index_info: None,
        state: TableState::Running,
        wal_retention_secs: 0,
    };
    persist_table(store, term, &table).await?;
    match registry.insert_table(table_id.clone(), table).await {
        Ok(_) | Err(cm_catalog::CatalogError::AlreadyPresent { .. }) => Ok(table_id),
        Err(e) => Err(e.into()),
    }
}

/// `CreateCDCStream(table_id, options)` (§4.7).
pub async fn create_stream(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    table_id: &TableId,
    options: CdcStreamOptions,
    cdc_wal_retention_time_secs: u64,
    cdc_state_table_num_tablets: u32,
) -> Result<StreamId, CdcError> {
    let table_locked = registry
        .get_table(table_id)
        .await
        .map_err(|_| CdcError::TableNotFound(table_id.clone()))?;

    {
        let table = table_locked.read().await;
        if table.state != TableState::Running {
            return Err(CdcError::TableNotRunning(table_id.clone()));
        }
    }

    ensure_cdc_state_table(registry, store, term, cdc_state_table_num_tablets).await?;

    {
        let mut guard = table_locked.begin_mutation().await;
        if guard.dirty.wal_retention_secs < cdc_wal_retention_time_secs {
            guard.dirty.wal_retention_secs = cdc_wal_retention_time_secs;
            persist_table(store, term, &guard.dirty).await?;
            guard.commit().await;
        }
    }

    let stream_id = StreamId::generate();
    let stream = CdcStream {
        id: stream_id.clone(),
        table_id: table_id.clone(),
        options,
        state: CdcStreamState::Active,
    };
    store
        .add_item(SysCatalogKey::new(EntityKind::CdcStream, stream_id.0.clone()), serde_json::to_value(&stream)?, term)
        .await?;
    registry.insert_cdc_stream(stream_id.clone(), stream).await?;
    info!(stream = %stream_id, table = %table_id, "created CDC stream");
    Ok(stream_id)
}

/// `DeleteCDCStream(stream_id[])`: marks streams `DELETING`; the actual
/// purge happens in the background cleaner (§4.8).
pub async fn delete_streams(
    registry: &EntityRegistry,
    store: &dyn SysCatalogStore,
    term: LeaderTerm,
    stream_ids: &[StreamId],
) -> Result<(), CdcError> {
    for stream_id in stream_ids {
        let locked = registry
            .get_cdc_stream(stream_id)
            .await
            .map_err(|_| CdcError::StreamNotFound(stream_id.clone()))?;
        let mut guard = locked.begin_mutation().await;
        guard.dirty.state = CdcStreamState::Deleting;
        store
            .update_item(
                SysCatalogKey::new(EntityKind::CdcStream, stream_id.0.clone()),
                serde_json::to_value(&guard.dirty)?,
                term,
            )
            .await?;
        guard.commit().await;
    }
    Ok(())
}

/// `GetCDCStream`.
pub async fn get_stream(registry: &EntityRegistry, stream_id: &StreamId) -> Result<CdcStream, CdcError> {
    let locked = registry
        .get_cdc_stream(stream_id)
        .await
        .map_err(|_| CdcError::StreamNotFound(stream_id.clone()))?;
    Ok((*locked.read().await).clone())
}

/// `ListCDCStreams`, optionally filtered by owning table. Streams already
/// marked `DELETING` are omitted immediately, ahead of the background
/// purge that actually removes them (§8 scenario D).
pub async fn list_streams(registry: &EntityRegistry, table_id: Option<&TableId>) -> Vec<CdcStream> {
    let mut out = Vec::new();
    for locked in registry.list_cdc_streams().await {
        let stream = locked.read().await;
        if stream.state == CdcStreamState::Deleting {
            continue;
        }
        let matches = match table_id {
            Some(t) => stream.table_id == *t,
            None => true,
        };
        if matches {
            out.push((*stream).clone());
        }
    }
    out
}
