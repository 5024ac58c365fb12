use std::fmt;

use doppio_query::QueryError;
use doppio_store::StoreError;

/// Engine errors, tagged by kind. Validation errors never mutate the
/// catalog; store errors abort the transaction with the published
/// snapshot unchanged.
#[derive(Debug)]
pub enum EngineError {
    NamespaceNotFound(String),
    DuplicateKey { index: String, key: String },
    PathConflict(String),
    BadValue(String),
    TypeMismatch(String),
    Cancelled,
    ChangeStreamHistoryLost,
    AssertionFailed(String),
    /// Reserved for a future optimistic write path.
    WriteConflict,
    Store(StoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NamespaceNotFound(ns) => write!(f, "namespace not found: {ns}"),
            EngineError::DuplicateKey { index, key } => {
                write!(f, "duplicate key in index '{index}': {key}")
            }
            EngineError::PathConflict(path) => write!(f, "path conflict at '{path}'"),
            EngineError::BadValue(msg) => write!(f, "bad value: {msg}"),
            EngineError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            EngineError::Cancelled => write!(f, "operation cancelled"),
            EngineError::ChangeStreamHistoryLost => write!(f, "change stream history lost"),
            EngineError::AssertionFailed(msg) => write!(f, "assertion failed: {msg}"),
            EngineError::WriteConflict => write!(f, "write conflict"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<QueryError> for EngineError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::UnknownOperator(name) => {
                EngineError::BadValue(format!("unknown operator: {name}"))
            }
            QueryError::BadValue(msg) => EngineError::BadValue(msg),
            QueryError::TypeMismatch(msg) => EngineError::TypeMismatch(msg),
            QueryError::Path(e) => EngineError::PathConflict(e.to_string()),
        }
    }
}
