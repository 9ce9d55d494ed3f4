use cm_catalog::CatalogError;
use cm_syscatalog::SysCatalogError;
use thiserror::Error;

/// Errors raised while running a background cleanup pass (§4.8).
#[derive(Debug, Error)]
pub enum GcError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Persistence(#[from] SysCatalogError),
}
