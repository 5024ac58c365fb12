use doppio_bson::{Doc, List};

use crate::error::EngineError;

/// The outcome of one engine operation.
#[derive(Debug, Default)]
pub struct OpResult {
    /// Documents the filter selected, in visit order.
    pub matched: List,
    /// Documents written: inserted, replaced or updated images.
    pub modified: List,
    /// The document created by an upsert, if any.
    pub upserted: Option<Doc>,
    /// Per-operation error (bulk writes report errors without aborting).
    pub error: Option<EngineError>,
    /// Human-readable context for `error`.
    pub reason: Option<String>,
}

impl OpResult {
    pub(crate) fn failed(error: EngineError) -> OpResult {
        OpResult {
            reason: Some(error.to_string()),
            error: Some(error),
            ..OpResult::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
