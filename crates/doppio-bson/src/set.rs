//! An ordered set of shared documents keyed by pointer identity.

use std::collections::HashMap;

use crate::{identity, Doc, List};

/// Insertion-ordered document set. Membership is by identity: two
/// documents with equal content are distinct members.
#[derive(Debug, Clone, Default)]
pub struct Set {
    list: List,
    index: HashMap<usize, usize>,
}

impl Set {
    pub fn new() -> Set {
        Set::default()
    }

    /// Build a set from a list, dropping identity duplicates.
    pub fn from_list(list: List) -> Set {
        let mut set = Set::default();
        for doc in list {
            set.push(doc);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn list(&self) -> &List {
        &self.list
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Doc> {
        self.list.iter()
    }

    pub fn contains(&self, doc: &Doc) -> bool {
        self.index.contains_key(&identity(doc))
    }

    /// The position of a member, by identity.
    pub fn position(&self, doc: &Doc) -> Option<usize> {
        self.index.get(&identity(doc)).copied()
    }

    /// Append a document. Returns false if it is already a member.
    pub fn push(&mut self, doc: Doc) -> bool {
        let id = identity(&doc);
        if self.index.contains_key(&id) {
            return false;
        }
        self.index.insert(id, self.list.len());
        self.list.push(doc);
        true
    }

    /// Replace the member at `pos` with another document, keeping order.
    pub fn replace(&mut self, pos: usize, doc: Doc) {
        let old = identity(&self.list[pos]);
        self.index.remove(&old);
        self.index.insert(identity(&doc), pos);
        self.list[pos] = doc;
    }

    /// Remove a member by identity. Positions after it shift down.
    pub fn remove(&mut self, doc: &Doc) -> bool {
        let pos = match self.index.remove(&identity(doc)) {
            Some(pos) => pos,
            None => return false,
        };
        self.list.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        true
    }

    /// Remove several members at once, rebuilding positions a single time.
    pub fn remove_all(&mut self, docs: &List) {
        let drop: std::collections::HashSet<usize> = docs.iter().map(identity).collect();
        self.list.retain(|doc| !drop.contains(&identity(doc)));
        self.index.clear();
        for (pos, doc) in self.list.iter().enumerate() {
            self.index.insert(identity(doc), pos);
        }
    }
}
