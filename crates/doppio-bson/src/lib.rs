mod error;
pub mod lists;
pub mod order;
pub mod path;
mod set;

use std::sync::Arc;

pub use bson::{Bson, Document};
pub use error::PathError;
pub use set::Set;

/// A shared, immutable document. Identity (not content) distinguishes two
/// documents with equal fields.
pub type Doc = Arc<Document>;

/// An ordered list of shared documents.
pub type List = Vec<Doc>;

/// The pointer identity of a shared document.
pub fn identity(doc: &Doc) -> usize {
    Arc::as_ptr(doc) as usize
}

/// Deep-copy a document into a fresh allocation.
pub fn clone_doc(doc: &Doc) -> Doc {
    Arc::new(Document::clone(doc))
}

/// Deep-copy every document in a list.
pub fn clone_list(list: &List) -> List {
    list.iter().map(clone_doc).collect()
}
