use cm_syscatalog::SysCatalogError;
use thiserror::Error;

/// Errors raised by entity registry operations (§7 taxonomy: preconditions
/// and persistence failures relevant to this crate).
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already present")]
    AlreadyPresent { kind: &'static str, id: String },

    #[error("namespace name {name:?} already in use for a non-deleted namespace")]
    NamespaceNameInUse { name: String },

    #[error(transparent)]
    Persistence(#[from] SysCatalogError),
}

impl CatalogError {
    /// True for the class of errors §7 calls "leadership loss": surfaced
    /// specially, with any in-flight dirty state discarded.
    pub fn is_no_longer_leader(&self) -> bool {
        matches!(
            self,
            CatalogError::Persistence(SysCatalogError::NoLongerLeader { .. })
        )
    }
}
