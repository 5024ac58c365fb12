use std::sync::Mutex;

use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::store::Store;

/// A store that keeps the catalog as an in-process value. The catalog's
/// structural sharing makes both directions cheap.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Catalog>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Catalog, StoreError> {
        Ok(self.data.lock().unwrap().clone())
    }

    fn store(&self, catalog: &Catalog) -> Result<(), StoreError> {
        *self.data.lock().unwrap() = catalog.clone();
        Ok(())
    }
}
