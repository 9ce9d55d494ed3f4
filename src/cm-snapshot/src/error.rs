use cm_catalog::CatalogError;
use cm_syscatalog::SysCatalogError;
use cm_types::{SnapshotId, SnapshotState};
use thiserror::Error;

/// Errors raised by the snapshot orchestrator (§4.6, §6 RPC error codes).
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("a snapshot operation is already in progress")]
    ParallelSnapshotOperation,

    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    #[error("snapshot {0} is not ready to restore: state is {1:?}")]
    SnapshotNotReady(SnapshotId, SnapshotState),

    #[error("snapshot target {0} no longer exists; restore is unsupported in this case")]
    RestoreTargetMissing(String),

    #[error("no local tablet matches the partition range of an imported tablet entry")]
    NoMatchingTablet,

    #[error("malformed entry metadata: {0}")]
    MalformedEntry(#[from] serde_json::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Persistence(#[from] SysCatalogError),
}
