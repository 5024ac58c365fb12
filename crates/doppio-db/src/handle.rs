use std::fmt;

use crate::error::EngineError;

/// An operation target: a `(database, collection)` pair. An empty
/// collection addresses the whole database; both empty address the
/// cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub database: String,
    pub collection: String,
}

impl Handle {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Handle {
        Handle {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(database: impl Into<String>) -> Handle {
        Handle {
            database: database.into(),
            collection: String::new(),
        }
    }

    pub fn cluster() -> Handle {
        Handle {
            database: String::new(),
            collection: String::new(),
        }
    }

    pub fn is_collection(&self) -> bool {
        !self.database.is_empty() && !self.collection.is_empty()
    }

    pub fn is_database(&self) -> bool {
        !self.database.is_empty() && self.collection.is_empty()
    }

    pub fn is_cluster(&self) -> bool {
        self.database.is_empty() && self.collection.is_empty()
    }

    /// The `database.collection` namespace name.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// Parse a `database.collection` name back into a handle.
    pub fn from_namespace(ns: &str) -> Handle {
        match ns.split_once('.') {
            Some((db, coll)) => Handle::new(db, coll),
            None => Handle::database(ns),
        }
    }

    /// Does this handle's scope contain events from `other`?
    pub fn contains(&self, other: &Handle) -> bool {
        if self.is_cluster() {
            return true;
        }
        if self.is_database() {
            return self.database == other.database;
        }
        self == other
    }

    pub(crate) fn require_collection(&self) -> Result<(), EngineError> {
        if self.is_collection() {
            Ok(())
        } else {
            Err(EngineError::BadValue(format!(
                "operation requires a collection handle, got '{self}'"
            )))
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cluster() {
            write!(f, "*")
        } else if self.is_database() {
            write!(f, "{}", self.database)
        } else {
            write!(f, "{}.{}", self.database, self.collection)
        }
    }
}
