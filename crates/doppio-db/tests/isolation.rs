mod common;
use common::*;

use std::sync::atomic::{AtomicBool, Ordering};

use bson::doc;
use doppio_db::{
    CancelToken, Doc, Engine, EngineError, FileStore, MemoryStore, Store,
};
use doppio_store::{Catalog, StoreError};

// ── Snapshot isolation ──────────────────────────────────────────

#[test]
fn readers_observe_their_snapshot_until_release() {
    let engine = engine();
    let reader = engine.begin(false);

    let mut writer = engine.begin(true);
    ok(writer
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 1 })], true)
        .unwrap());
    writer.commit().unwrap();

    // the old reader still sees the empty snapshot
    assert_eq!(reader.count_documents(&accounts()).unwrap(), 0);

    // a fresh reader sees the committed write
    let fresh = engine.begin(false);
    assert_eq!(fresh.count_documents(&accounts()).unwrap(), 1);
}

#[test]
fn writes_invisible_until_commit_and_abort_discards() {
    let engine = engine();

    let mut writer = engine.begin(true);
    ok(writer
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 1 })], true)
        .unwrap());
    // the writer reads its own staged state
    assert_eq!(writer.count_documents(&accounts()).unwrap(), 1);
    writer.abort();

    let reader = engine.begin(false);
    assert_eq!(reader.count_documents(&accounts()).unwrap(), 0);
}

#[test]
fn resume_tokens_strictly_increase_across_commits() {
    let engine = engine();
    let stream = engine
        .watch(accounts(), doppio_db::WatchOptions::default())
        .unwrap();

    for id in 0..10 {
        let mut txn = engine.begin(true);
        ok(txn
            .insert(&accounts(), vec![Doc::new(doc! { "_id": id })], true)
            .unwrap());
        txn.commit().unwrap();
    }

    let mut last = None;
    while let Some(event) = stream.try_next().unwrap() {
        if let Some(prev) = &last {
            assert!(event.token > *prev);
        }
        last = Some(event.token);
    }
    assert!(last.is_some());
}

// ── Store failures ──────────────────────────────────────────────

struct FailingStore {
    inner: MemoryStore,
    fail: std::sync::Arc<AtomicBool>,
}

impl Store for FailingStore {
    fn load(&self) -> Result<Catalog, StoreError> {
        self.inner.load()
    }

    fn store(&self, catalog: &Catalog) -> Result<(), StoreError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(StoreError::Io("disk full".into()));
        }
        self.inner.store(catalog)
    }
}

#[test]
fn failed_persistence_leaves_snapshot_unchanged() {
    let fail = std::sync::Arc::new(AtomicBool::new(false));
    let engine = Engine::open(FailingStore {
        inner: MemoryStore::new(),
        fail: fail.clone(),
    })
    .unwrap();

    let mut txn = engine.begin(true);
    ok(txn
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 1 })], true)
        .unwrap());
    txn.commit().unwrap();

    fail.store(true, Ordering::Relaxed);

    let mut txn = engine.begin(true);
    ok(txn
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 2 })], true)
        .unwrap());
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));

    let reader = engine.begin(false);
    assert_eq!(reader.count_documents(&accounts()).unwrap(), 1);
}

// ── Durability through the file store ───────────────────────────

#[test]
fn committed_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog.bson");

    {
        let engine = Engine::open(FileStore::new(&path)).unwrap();
        let mut txn = engine.begin(true);
        ok(txn
            .insert(
                &accounts(),
                vec![Doc::new(doc! { "_id": 1, "name": "persisted" })],
                true,
            )
            .unwrap());
        txn.commit().unwrap();
    }

    let engine = Engine::open(FileStore::new(&path)).unwrap();
    let txn = engine.begin(false);
    let found = txn.find(&accounts(), &doc! { "_id": 1 }, None, 0, 0).unwrap();
    assert_eq!(found.matched[0].get_str("name").unwrap(), "persisted");

    // the rebuilt primary index still enforces uniqueness
    let mut txn = engine.begin(true);
    let result = txn
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 1 })], true)
        .unwrap();
    assert!(matches!(
        result.error,
        Some(EngineError::DuplicateKey { .. })
    ));
}

// ── Cancellation ────────────────────────────────────────────────

#[test]
fn cancelled_operations_return_cancelled() {
    let engine = engine();
    seed(&engine);

    let token = CancelToken::new();
    let txn = engine.begin_with(false, token.clone());
    token.cancel();
    let err = txn.find(&accounts(), &doc! {}, None, 0, 0).unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
}

#[test]
fn cancelled_writer_can_abort_and_release_the_engine() {
    let engine = engine();
    let token = CancelToken::new();
    let mut txn = engine.begin_with(true, token.clone());
    token.cancel();
    let err = txn
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 1 })], true)
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    txn.abort();

    // the write mutex is free again
    let mut txn = engine.begin(true);
    ok(txn
        .insert(&accounts(), vec![Doc::new(doc! { "_id": 1 })], true)
        .unwrap());
    txn.commit().unwrap();
}
