mod cancel;
mod engine;
mod error;
mod handle;
mod oplog;
mod result;
mod stream;
mod txn;

pub use bson::{Bson, Document};
pub use cancel::CancelToken;
pub use doppio_bson::{Doc, List};
pub use doppio_query::IndexConfig;
pub use doppio_store::{FileStore, MemoryStore, Store};
pub use engine::Engine;
pub use error::EngineError;
pub use handle::Handle;
pub use oplog::{Event, OperationType, ResumeToken, UpdateDescription};
pub use result::OpResult;
pub use stream::{ChangeStream, WatchOptions};
pub use txn::{Opcode, Operation, Transaction};
