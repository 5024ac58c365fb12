use crate::catalog::Catalog;
use crate::error::StoreError;

/// The persistence contract: a sink and source for whole catalogs.
///
/// `store` must be atomic — after a crash, `load` returns either the
/// previous catalog or the new one, never a mixture. The engine calls
/// `store` before publishing a snapshot, so a failed store leaves the
/// published state untouched.
pub trait Store: Send + Sync {
    fn load(&self) -> Result<Catalog, StoreError>;
    fn store(&self, catalog: &Catalog) -> Result<(), StoreError>;
}
