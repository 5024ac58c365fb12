//! Committed-change events and resume tokens.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use bson::{Bson, Document, Timestamp};

use doppio_bson::Doc;

use crate::handle::Handle;

/// An opaque, totally ordered position in the oplog. Tokens compare by
/// cluster time alone; the namespace and document key ride along so a
/// token can be rendered for callers.
#[derive(Debug, Clone)]
pub struct ResumeToken {
    pub time: u32,
    pub counter: u32,
    pub namespace: String,
    pub document_key: Option<Document>,
}

impl ResumeToken {
    fn position(&self) -> (u32, u32) {
        (self.time, self.counter)
    }

    pub fn cluster_time(&self) -> Timestamp {
        Timestamp {
            time: self.time,
            increment: self.counter,
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("ts", Bson::Timestamp(self.cluster_time()));
        doc.insert("ns", self.namespace.clone());
        match &self.document_key {
            Some(key) => doc.insert("documentKey", key.clone()),
            None => doc.insert("documentKey", Bson::Null),
        };
        doc
    }
}

impl PartialEq for ResumeToken {
    fn eq(&self, other: &ResumeToken) -> bool {
        self.position() == other.position()
    }
}

impl Eq for ResumeToken {}

impl PartialOrd for ResumeToken {
    fn partial_cmp(&self, other: &ResumeToken) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResumeToken {
    fn cmp(&self, other: &ResumeToken) -> Ordering {
        self.position().cmp(&other.position())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    DropDatabase,
    Invalidate,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
        }
    }
}

/// `updateDescription` of an update event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

/// One committed mutation, as delivered to change-stream subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub token: ResumeToken,
    pub namespace: Handle,
    pub operation: OperationType,
    pub document_key: Option<Document>,
    pub full_document: Option<Doc>,
    pub update_description: Option<UpdateDescription>,
}

impl Event {
    /// Render the event in the driver-facing change document shape.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("_id", self.token.to_document());
        doc.insert("operationType", self.operation.as_str());
        doc.insert("clusterTime", Bson::Timestamp(self.token.cluster_time()));
        let mut ns = Document::new();
        ns.insert("db", self.namespace.database.clone());
        if !self.namespace.collection.is_empty() {
            ns.insert("coll", self.namespace.collection.clone());
        }
        doc.insert("ns", ns);
        if let Some(key) = &self.document_key {
            doc.insert("documentKey", key.clone());
        }
        if let Some(full) = &self.full_document {
            doc.insert("fullDocument", Document::clone(full));
        }
        if let Some(desc) = &self.update_description {
            let mut d = Document::new();
            d.insert("updatedFields", desc.updated_fields.clone());
            d.insert(
                "removedFields",
                Bson::Array(desc.removed_fields.iter().map(|p| Bson::String(p.clone())).collect()),
            );
            doc.insert("updateDescription", d);
        }
        doc
    }
}

/// A staged event awaiting its commit-time token.
#[derive(Debug, Clone)]
pub(crate) struct EventDraft {
    pub namespace: Handle,
    pub operation: OperationType,
    pub document_key: Option<Document>,
    pub full_document: Option<Doc>,
    pub update_description: Option<UpdateDescription>,
}

impl EventDraft {
    pub(crate) fn into_event(self, time: u32, counter: u32) -> Event {
        Event {
            token: ResumeToken {
                time,
                counter,
                namespace: self.namespace.namespace(),
                document_key: self.document_key.clone(),
            },
            namespace: self.namespace,
            operation: self.operation,
            document_key: self.document_key,
            full_document: self.full_document,
            update_description: self.update_description,
        }
    }
}

/// Mints strictly increasing `(seconds, counter)` pairs under the
/// commit path's lock.
#[derive(Debug, Default)]
pub(crate) struct TokenClock {
    time: u32,
    counter: u32,
}

impl TokenClock {
    pub(crate) fn next(&mut self) -> (u32, u32) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        if now > self.time {
            self.time = now;
            self.counter = 0;
        }
        self.counter += 1;
        (self.time, self.counter)
    }
}
