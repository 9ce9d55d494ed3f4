use cm_catalog::CatalogError;
use cm_syscatalog::SysCatalogError;
use cm_types::{StreamId, TableId, UniverseId};
use thiserror::Error;

/// Errors raised by CDC stream and universe replication operations (§4.7,
/// §6 RPC error codes).
#[derive(Debug, Error)]
pub enum CdcError {
    #[error("table {0} not found")]
    TableNotFound(TableId),

    #[error("table {0} is not RUNNING")]
    TableNotRunning(TableId),

    #[error("CDC stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("universe replication entry {0} not found")]
    UniverseNotFound(UniverseId),

    #[error("schema mismatch for producer table {producer_table_id:?} against local table {local_table_id}")]
    SchemaMismatch {
        producer_table_id: String,
        local_table_id: TableId,
    },

    #[error("bootstrap id {bootstrap_id:?} does not match producer table {producer_table_id:?}")]
    BootstrapTableMismatch {
        bootstrap_id: String,
        producer_table_id: String,
    },

    #[error("no local table matches producer table {0:?} by (namespace, name)")]
    NoMatchingLocalTable(String),

    #[error("no local tablet matches the partition range of producer tablet {0:?}")]
    NoMatchingTablet(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed entry metadata: {0}")]
    MalformedEntry(#[from] serde_json::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Persistence(#[from] SysCatalogError),
}
