//! The engine: a published catalog snapshot, a single-writer mutex, and
//! the change stream hub.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::debug;

use doppio_store::{Catalog, Store};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::handle::Handle;
use crate::oplog::TokenClock;
use crate::stream::{ChangeStream, Hub, WatchOptions};
use crate::txn::Transaction;

/// Retained oplog slice for change stream resumption.
const OPLOG_RETAIN: usize = 4096;

/// An embedded document database engine.
///
/// Readers capture the current snapshot without blocking; writers
/// serialize on an internal mutex, stage changes on a private clone and
/// publish it atomically on commit. Cloning the engine shares state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Box<dyn Store>,
    pub(crate) current: ArcSwap<Catalog>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) hub: Hub,
    pub(crate) clock: Mutex<TokenClock>,
}

impl Engine {
    /// Load the catalog from the store and start the engine.
    pub fn open(store: impl Store + 'static) -> Result<Engine, EngineError> {
        let catalog = store.load()?;
        debug!(namespaces = catalog.namespaces.len(), "engine opened");
        Ok(Engine {
            inner: Arc::new(EngineInner {
                store: Box::new(store),
                current: ArcSwap::from_pointee(catalog),
                write_lock: Mutex::new(()),
                hub: Hub::new(OPLOG_RETAIN),
                clock: Mutex::new(TokenClock::default()),
            }),
        })
    }

    /// Begin a transaction. A write transaction holds the engine's write
    /// mutex until commit or abort; a read transaction captures the
    /// current snapshot without locking.
    pub fn begin(&self, write: bool) -> Transaction<'_> {
        self.begin_with(write, CancelToken::new())
    }

    /// [`begin`](Engine::begin) with an external cancellation token.
    pub fn begin_with(&self, write: bool, cancel: CancelToken) -> Transaction<'_> {
        let guard = if write {
            Some(
                self.inner
                    .write_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            )
        } else {
            None
        };
        Transaction::new(self, guard, self.inner.current.load_full(), cancel)
    }

    /// Open a change stream over a collection, database or the cluster.
    pub fn watch(&self, handle: Handle, options: WatchOptions) -> Result<ChangeStream, EngineError> {
        self.inner.hub.subscribe(handle, options)
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.inner.current.load_full()
    }

    /// Close every change stream subscriber.
    pub fn shutdown(&self) {
        self.inner.hub.shutdown();
    }
}
