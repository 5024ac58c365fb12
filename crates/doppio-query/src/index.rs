//! Ordered multi-column secondary indexes with optional uniqueness,
//! partial filters and TTL metadata.
//!
//! The index is a persistent sorted map from composite key to the
//! documents holding that key. Keys order by the BSON total order with
//! the column direction applied at compare time, so equal-by-value
//! numerics of different widths land on the same key — exactly what
//! uniqueness needs.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use bson::{Bson, Document};
use imbl::OrdMap;

use doppio_bson::order::compare;
use doppio_bson::{path, Doc, List};

use crate::error::QueryError;
use crate::matcher;

/// Declarative shape of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub name: String,
    /// Column paths with direction `1` or `-1`, in declared order.
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
    pub partial_filter: Option<Document>,
    pub expire_after_secs: Option<i64>,
}

impl IndexConfig {
    /// Parse a key specification document like `{ "a": 1, "b": -1 }`.
    pub fn from_keys(keys: &Document) -> Result<IndexConfig, QueryError> {
        if keys.is_empty() {
            return Err(QueryError::BadValue("index keys must not be empty".into()));
        }
        let mut columns = Vec::with_capacity(keys.len());
        for (field, dir) in keys.iter() {
            let dir = match dir {
                Bson::Int32(1) | Bson::Int64(1) => 1,
                Bson::Int32(-1) | Bson::Int64(-1) => -1,
                Bson::Double(d) if *d == 1.0 => 1,
                Bson::Double(d) if *d == -1.0 => -1,
                _ => {
                    return Err(QueryError::BadValue(format!(
                        "index direction for '{field}' must be 1 or -1"
                    )))
                }
            };
            columns.push((field.clone(), dir));
        }
        let mut config = IndexConfig {
            name: String::new(),
            keys: columns,
            unique: false,
            partial_filter: None,
            expire_after_secs: None,
        };
        config.name = config.default_name();
        Ok(config)
    }

    /// The conventional name: column paths joined with their directions.
    pub fn default_name(&self) -> String {
        self.keys
            .iter()
            .map(|(field, dir)| format!("{field}_{dir}"))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Render the columns back into a key specification document.
    pub fn keys_document(&self) -> Document {
        let mut doc = Document::new();
        for (field, dir) in &self.keys {
            doc.insert(field.clone(), Bson::Int32(*dir));
        }
        doc
    }

    /// Reject malformed partial filters up front, so that membership
    /// checks during writes cannot fail.
    pub fn validate(&self) -> Result<(), QueryError> {
        if let Some(filter) = &self.partial_filter {
            matcher::match_doc(&Document::new(), filter)?;
        }
        Ok(())
    }
}

/// A composite key: the column values of one document. Direction is
/// applied when keys compare, not when they are built.
#[derive(Debug, Clone)]
pub struct IndexKey {
    directions: Arc<[bool]>,
    values: Vec<Bson>,
}

impl IndexKey {
    fn compare(&self, other: &IndexKey) -> Ordering {
        for (pos, (a, b)) in self.values.iter().zip(other.values.iter()).enumerate() {
            let ascending = self.directions.get(pos).copied().unwrap_or(true);
            let mut ord = compare(a, b);
            if !ascending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.values.len().cmp(&other.values.len())
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &IndexKey) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &IndexKey) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &IndexKey) -> Ordering {
        self.compare(other)
    }
}

/// An ordered multi-column index. Cloning shares the underlying map
/// structurally; documents are shared by pointer.
#[derive(Debug, Clone)]
pub struct Index {
    config: IndexConfig,
    directions: Arc<[bool]>,
    map: OrdMap<IndexKey, List>,
}

impl Index {
    pub fn new(config: IndexConfig) -> Index {
        let directions: Arc<[bool]> = config.keys.iter().map(|(_, dir)| *dir == 1).collect();
        Index {
            config,
            directions,
            map: OrdMap::new(),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The composite key of a document, or `None` when a partial filter
    /// excludes it from the index.
    pub fn key_of(&self, doc: &Doc) -> Option<IndexKey> {
        if let Some(filter) = &self.config.partial_filter {
            // filters are validated at creation; a failure means no match
            if !matcher::match_doc(doc, filter).unwrap_or(false) {
                return None;
            }
        }
        let values = self
            .config
            .keys
            .iter()
            .map(|(field, _)| path::get(doc, field).cloned().unwrap_or(Bson::Null))
            .collect();
        Some(IndexKey {
            directions: Arc::clone(&self.directions),
            values,
        })
    }

    /// Insert without enforcing uniqueness. Used while rebuilding from a
    /// loaded document set. Returns true when the document is a member
    /// afterwards.
    pub fn add(&mut self, doc: &Doc) -> bool {
        let key = match self.key_of(doc) {
            Some(key) => key,
            None => return true,
        };
        self.insert_member(key, doc);
        true
    }

    /// Insert enforcing uniqueness: returns false when a *different*
    /// document already holds an equal key on a unique index.
    pub fn set(&mut self, doc: &Doc) -> bool {
        let key = match self.key_of(doc) {
            Some(key) => key,
            None => return true,
        };
        if self.config.unique {
            if let Some(bucket) = self.map.get(&key) {
                if bucket.iter().any(|member| !Arc::ptr_eq(member, doc)) {
                    return false;
                }
            }
        }
        self.insert_member(key, doc);
        true
    }

    fn insert_member(&mut self, key: IndexKey, doc: &Doc) {
        match self.map.get_mut(&key) {
            Some(bucket) => {
                if !bucket.iter().any(|member| Arc::ptr_eq(member, doc)) {
                    bucket.push(doc.clone());
                }
            }
            None => {
                self.map.insert(key, vec![doc.clone()]);
            }
        }
    }

    /// Is this exact document (by key and identity) a member?
    pub fn has(&self, doc: &Doc) -> bool {
        match self.key_of(doc) {
            Some(key) => self
                .map
                .get(&key)
                .map(|bucket| bucket.iter().any(|member| Arc::ptr_eq(member, doc)))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Remove a document by key and identity.
    pub fn delete(&mut self, doc: &Doc) -> bool {
        let key = match self.key_of(doc) {
            Some(key) => key,
            None => return false,
        };
        let removed = match self.map.get_mut(&key) {
            Some(bucket) => {
                let before = bucket.len();
                bucket.retain(|member| !Arc::ptr_eq(member, doc));
                bucket.len() != before
            }
            None => return false,
        };
        if self.map.get(&key).map(|b| b.is_empty()).unwrap_or(false) {
            self.map.remove(&key);
        }
        removed
    }

    /// Range scan in key order. `limit` 0 means unbounded.
    pub fn list(
        &self,
        lo: Option<Vec<Bson>>,
        hi: Option<Vec<Bson>>,
        reverse: bool,
        limit: usize,
    ) -> List {
        let lower = match lo {
            Some(values) => Bound::Included(self.bound_key(values)),
            None => Bound::Unbounded,
        };
        let upper = match hi {
            Some(values) => Bound::Included(self.bound_key(values)),
            None => Bound::Unbounded,
        };

        let mut out = Vec::new();
        let mut push = |bucket: &List| {
            for doc in bucket {
                if limit > 0 && out.len() >= limit {
                    return false;
                }
                out.push(doc.clone());
            }
            true
        };
        if reverse {
            for (_, bucket) in self.map.range((lower, upper)).rev() {
                if !push(bucket) {
                    break;
                }
            }
        } else {
            for (_, bucket) in self.map.range((lower, upper)) {
                if !push(bucket) {
                    break;
                }
            }
        }
        out
    }

    fn bound_key(&self, values: Vec<Bson>) -> IndexKey {
        IndexKey {
            directions: Arc::clone(&self.directions),
            values,
        }
    }

    /// Identity of the first conflicting member for an equal key, used
    /// to report duplicate-key errors.
    pub fn conflict_with(&self, doc: &Doc) -> Option<Doc> {
        let key = self.key_of(doc)?;
        self.map
            .get(&key)
            .and_then(|bucket| bucket.iter().find(|member| !Arc::ptr_eq(member, doc)))
            .cloned()
    }
}
