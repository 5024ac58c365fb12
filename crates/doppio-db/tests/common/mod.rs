use bson::doc;
use doppio_db::{Doc, Engine, Handle, MemoryStore, OpResult};

pub const DB: &str = "app";
pub const COLLECTION: &str = "accounts";

pub fn engine() -> Engine {
    Engine::open(MemoryStore::new()).unwrap()
}

pub fn accounts() -> Handle {
    Handle::new(DB, COLLECTION)
}

pub fn ok(result: OpResult) -> OpResult {
    if let Some(error) = &result.error {
        panic!("operation failed: {error}");
    }
    result
}

/// Insert 5 seed accounts in one committed transaction.
pub fn seed(engine: &Engine) {
    let mut txn = engine.begin(true);
    ok(txn
        .insert(
            &accounts(),
            vec![
                Doc::new(doc! { "_id": "acct-1", "name": "Acme Corp", "revenue": 50000.0, "status": "active" }),
                Doc::new(doc! { "_id": "acct-2", "name": "Globex", "revenue": 80000.0, "status": "snoozed" }),
                Doc::new(doc! { "_id": "acct-3", "name": "Initech", "revenue": 12000.0, "status": "rejected" }),
                Doc::new(doc! { "_id": "acct-4", "name": "Umbrella", "revenue": 95000.0, "status": "active" }),
                Doc::new(doc! { "_id": "acct-5", "name": "Stark", "revenue": 200000.0, "status": "active" }),
            ],
            true,
        )
        .unwrap());
    txn.commit().unwrap();
}
