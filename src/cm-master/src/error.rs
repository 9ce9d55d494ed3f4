use cm_catalog::CatalogError;
use cm_cdc::CdcError;
use cm_gc::GcError;
use cm_snapshot::SnapshotError;
use cm_syscatalog::SysCatalogError;
use cm_ts_manager::TsManagerError;
use cm_types::LeaderTerm;
use thiserror::Error;

/// The error taxonomy of §7, rolled up across every sub-crate into one
/// surface the RPC handlers return.
#[derive(Debug, Error)]
pub enum MasterError {
    /// Invalid request, already-present, object-not-found, schema
    /// mismatch: synchronous, no catalog state changes.
    #[error("{0}")]
    Precondition(String),

    /// Parallel-snapshot-operation, configuration conflict: the caller
    /// retries after the in-flight operation completes.
    #[error("{0}")]
    Conflict(String),

    /// Surfaced specially: any in-flight dirty state is discarded and the
    /// client must retry against the new leader.
    #[error("no longer leader: submitted at {submitted}, current term is {current}")]
    NotLeader {
        submitted: LeaderTerm,
        current: LeaderTerm,
    },

    /// Sys-Catalog unavailable or Raft aborted: the mutation never
    /// happened.
    #[error(transparent)]
    Persistence(SysCatalogError),

    /// Tablet-server or producer-cluster RPC failure that exhausted its
    /// retry budget without reaching a terminal state.
    #[error("{0}")]
    TabletServer(String),

    /// Invariant violation; halts the operation with diagnostics.
    #[error("{0}")]
    Internal(String),
}

impl From<CatalogError> for MasterError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Persistence(SysCatalogError::NoLongerLeader { submitted, current }) => {
                MasterError::NotLeader { submitted, current }
            }
            CatalogError::Persistence(inner) => MasterError::Persistence(inner),
            CatalogError::NotFound { .. } | CatalogError::AlreadyPresent { .. } | CatalogError::NamespaceNameInUse { .. } => {
                MasterError::Precondition(e.to_string())
            }
        }
    }
}

impl From<SnapshotError> for MasterError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::ParallelSnapshotOperation => MasterError::Conflict(e.to_string()),
            SnapshotError::SnapshotNotFound(_)
            | SnapshotError::SnapshotNotReady(..)
            | SnapshotError::RestoreTargetMissing(_)
            | SnapshotError::NoMatchingTablet => MasterError::Precondition(e.to_string()),
            SnapshotError::MalformedEntry(_) => MasterError::Internal(e.to_string()),
            SnapshotError::Catalog(inner) => inner.into(),
            SnapshotError::Persistence(inner) => inner.into(),
        }
    }
}

impl From<CdcError> for MasterError {
    fn from(e: CdcError) -> Self {
        match e {
            CdcError::TableNotFound(_)
            | CdcError::TableNotRunning(_)
            | CdcError::StreamNotFound(_)
            | CdcError::UniverseNotFound(_)
            | CdcError::SchemaMismatch { .. }
            | CdcError::BootstrapTableMismatch { .. }
            | CdcError::NoMatchingLocalTable(_)
            | CdcError::NoMatchingTablet(_)
            | CdcError::InvalidRequest(_) => MasterError::Precondition(e.to_string()),
            CdcError::MalformedEntry(_) => MasterError::Internal(e.to_string()),
            CdcError::Catalog(inner) => inner.into(),
            CdcError::Persistence(inner) => inner.into(),
        }
    }
}

impl From<GcError> for MasterError {
    fn from(e: GcError) -> Self {
        match e {
            GcError::Catalog(inner) => inner.into(),
            GcError::Persistence(inner) => inner.into(),
        }
    }
}

impl From<TsManagerError> for MasterError {
    fn from(e: TsManagerError) -> Self {
        MasterError::Precondition(e.to_string())
    }
}

impl From<SysCatalogError> for MasterError {
    fn from(e: SysCatalogError) -> Self {
        match e {
            SysCatalogError::NoLongerLeader { submitted, current } => MasterError::NotLeader { submitted, current },
            other => MasterError::Persistence(other),
        }
    }
}
