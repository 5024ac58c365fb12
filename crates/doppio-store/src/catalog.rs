//! The catalog: every namespace with its documents and indexes.
//!
//! A catalog value is one immutable snapshot. Cloning is cheap — the
//! namespace map shares structure and namespaces live behind `Arc` — so
//! a write transaction clones the catalog, replaces the namespaces it
//! touches with private copies, and publishes the result as the next
//! snapshot.

use std::sync::Arc;

use imbl::OrdMap;

use doppio_bson::{Doc, Set};
use doppio_query::{Index, IndexConfig};

/// Name of the derived unique `_id` index every namespace carries.
pub const PRIMARY_INDEX: &str = "_id_";

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub namespaces: OrdMap<String, Arc<Namespace>>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Namespace>> {
        self.namespaces.get(name)
    }
}

/// A `database.collection` pair with its ordered document set, its
/// secondary indexes, and the derived primary index.
#[derive(Debug, Clone)]
pub struct Namespace {
    name: String,
    documents: Set,
    indexes: Vec<Index>,
    primary: Index,
}

impl Namespace {
    pub fn new(name: &str) -> Namespace {
        Namespace {
            name: name.to_string(),
            documents: Set::new(),
            indexes: Vec::new(),
            primary: Index::new(primary_config()),
        }
    }

    /// Rebuild a namespace from loaded parts: documents in stored order
    /// plus index configurations. Index state is reconstructed with the
    /// non-enforcing insert — the stored data is trusted.
    pub fn prepare(name: String, documents: Vec<Doc>, configs: Vec<IndexConfig>) -> Namespace {
        let mut ns = Namespace {
            name,
            documents: Set::new(),
            indexes: configs.into_iter().map(Index::new).collect(),
            primary: Index::new(primary_config()),
        };
        for doc in documents {
            ns.primary.add(&doc);
            for index in &mut ns.indexes {
                index.add(&doc);
            }
            ns.documents.push(doc);
        }
        ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn documents(&self) -> &Set {
        &self.documents
    }

    pub fn documents_mut(&mut self) -> &mut Set {
        &mut self.documents
    }

    pub fn primary(&self) -> &Index {
        &self.primary
    }

    pub fn primary_mut(&mut self) -> &mut Index {
        &mut self.primary
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn indexes_mut(&mut self) -> &mut [Index] {
        &mut self.indexes
    }

    pub fn push_index(&mut self, index: Index) {
        self.indexes.push(index);
    }

    /// Drop a secondary index by name. Returns false when absent.
    pub fn remove_index(&mut self, name: &str) -> bool {
        let before = self.indexes.len();
        self.indexes.retain(|index| index.config().name != name);
        self.indexes.len() != before
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|index| index.config().name == name)
    }
}

fn primary_config() -> IndexConfig {
    IndexConfig {
        name: PRIMARY_INDEX.to_string(),
        keys: vec![("_id".to_string(), 1)],
        unique: true,
        partial_filter: None,
        expire_after_secs: None,
    }
}
