mod catalog;
mod error;
mod file;
mod memory;
mod payload;
mod store;

pub use catalog::{Catalog, Namespace};
pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use payload::{CatalogPayload, IndexPayload, NamespacePayload};
pub use store::Store;
