//! Transactions: snapshot reads, staged writes, and operation dispatch.

use std::collections::HashSet;
use std::sync::{Arc, MutexGuard};

use bson::{Bson, Document};
use tracing::debug;

use doppio_bson::order::equal;
use doppio_bson::{lists, path, Doc, List};
use doppio_query::{extract, matcher, project, sort, update, Index, IndexConfig};
use doppio_store::{Catalog, Namespace, NamespacePayload};

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::handle::Handle;
use crate::oplog::{Event, EventDraft, OperationType, UpdateDescription};
use crate::result::OpResult;

/// Opcode of one bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Insert,
    Replace,
    Update,
    Delete,
}

/// One entry of a bulk write.
#[derive(Debug, Clone)]
pub struct Operation {
    pub opcode: Opcode,
    /// The document to insert, the replacement, or the update document.
    pub document: Option<Document>,
    pub filter: Option<Document>,
    pub upsert: bool,
    /// 0 means every match.
    pub limit: usize,
    pub array_filters: Vec<Document>,
}

/// A transaction over one engine.
///
/// Readers observe the snapshot captured at `begin` for their whole
/// lifetime. Writers hold the engine's write mutex; the catalog is
/// cloned lazily on the first mutation and every touched namespace gets
/// a private copy. Nothing is visible to others until `commit` returns.
pub struct Transaction<'e> {
    engine: &'e Engine,
    guard: Option<MutexGuard<'e, ()>>,
    base: Arc<Catalog>,
    staged: Option<Catalog>,
    /// Namespaces already privately cloned in this transaction.
    cloned: HashSet<String>,
    events: Vec<EventDraft>,
    cancel: CancelToken,
}

impl<'e> Transaction<'e> {
    pub(crate) fn new(
        engine: &'e Engine,
        guard: Option<MutexGuard<'e, ()>>,
        base: Arc<Catalog>,
        cancel: CancelToken,
    ) -> Transaction<'e> {
        Transaction {
            engine,
            guard,
            base,
            staged: None,
            cloned: HashSet::new(),
            events: Vec::new(),
            cancel,
        }
    }

    pub fn is_write(&self) -> bool {
        self.guard.is_some()
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Find matching documents: filter, then sort, then skip, then
    /// limit (0 = unbounded). `$natural` sorts in insertion order.
    pub fn find(
        &self,
        handle: &Handle,
        query: &Document,
        sort_doc: Option<&Document>,
        skip: usize,
        limit: usize,
    ) -> Result<OpResult, EngineError> {
        handle.require_collection()?;
        let ns = match self.catalog().get(&handle.namespace()) {
            Some(ns) => ns,
            None => return Ok(OpResult::default()),
        };

        let mut matched = Vec::new();
        for doc in ns.documents().iter() {
            self.cancel.check()?;
            if matcher::match_doc(doc, query)? {
                matched.push(doc.clone());
            }
        }
        order_list(&mut matched, sort_doc)?;
        let matched = cut(matched, skip, limit);

        Ok(OpResult {
            matched,
            ..OpResult::default()
        })
    }

    /// Project every matched document; the query resolves positional
    /// projection operators.
    pub fn project(
        &self,
        list: &List,
        projection: &Document,
        query: Option<&Document>,
    ) -> Result<List, EngineError> {
        let mut out = Vec::with_capacity(list.len());
        for doc in list {
            self.cancel.check()?;
            out.push(Doc::new(project::apply(doc, projection, query)?));
        }
        Ok(out)
    }

    /// Total document count of a namespace, without filtering.
    pub fn count_documents(&self, handle: &Handle) -> Result<usize, EngineError> {
        handle.require_collection()?;
        Ok(self
            .catalog()
            .get(&handle.namespace())
            .map(|ns| ns.documents().len())
            .unwrap_or(0))
    }

    /// Distinct values at `path` over the matching documents. Array
    /// values contribute their elements. The result is sorted under the
    /// total order.
    pub fn distinct(
        &self,
        handle: &Handle,
        field: &str,
        query: &Document,
    ) -> Result<Vec<Bson>, EngineError> {
        let matched = self.find(handle, query, None, 0, 0)?.matched;
        let mut values = lists::pick(&matched, field, true);
        values.sort_by(doppio_bson::order::compare);
        values.dedup_by(|a, b| equal(a, b));
        Ok(values)
    }

    /// Databases visible in this snapshot, filtered by `query`. Rows are
    /// `{ name, sizeOnDisk, empty }`; `sizeOnDisk` is the serialized
    /// byte length of the database's namespaces in this snapshot.
    pub fn list_databases(&self, query: &Document) -> Result<List, EngineError> {
        let catalog = self.catalog();
        let mut rows: Vec<(String, u64, bool)> = Vec::new();
        for (name, ns) in catalog.namespaces.iter() {
            self.cancel.check()?;
            let db = name.split('.').next().unwrap_or(name).to_string();
            let size = NamespacePayload::from_namespace(ns).serialized_len();
            let empty = ns.documents().is_empty();
            match rows.iter_mut().find(|(row, _, _)| *row == db) {
                Some(row) => {
                    row.1 += size;
                    row.2 = row.2 && empty;
                }
                None => rows.push((db, size, empty)),
            }
        }

        let mut out = Vec::with_capacity(rows.len());
        for (name, size, empty) in rows {
            let mut doc = Document::new();
            doc.insert("name", name);
            doc.insert("sizeOnDisk", Bson::Int64(size as i64));
            doc.insert("empty", empty);
            if matcher::match_doc(&doc, query)? {
                out.push(Doc::new(doc));
            }
        }
        Ok(out)
    }

    /// Collections of `db`, filtered by `query`.
    pub fn list_collections(&self, db: &str, query: &Document) -> Result<List, EngineError> {
        let prefix = format!("{db}.");
        let mut out = Vec::new();
        for (name, _) in self.catalog().namespaces.iter() {
            self.cancel.check()?;
            let coll = match name.strip_prefix(&prefix) {
                Some(coll) => coll,
                None => continue,
            };
            let mut doc = Document::new();
            doc.insert("name", coll);
            doc.insert("type", "collection");
            doc.insert("options", Document::new());
            let mut info = Document::new();
            info.insert("readOnly", false);
            doc.insert("info", info);
            if matcher::match_doc(&doc, query)? {
                out.push(Doc::new(doc));
            }
        }
        Ok(out)
    }

    /// Index specifications of a namespace, primary first.
    pub fn list_indexes(&self, handle: &Handle) -> Result<List, EngineError> {
        handle.require_collection()?;
        let ns = self
            .catalog()
            .get(&handle.namespace())
            .ok_or_else(|| EngineError::NamespaceNotFound(handle.namespace()))?;

        let mut out = Vec::with_capacity(1 + ns.indexes().len());
        out.push(Doc::new(index_row(ns.primary())));
        for index in ns.indexes() {
            out.push(Doc::new(index_row(index)));
        }
        Ok(out)
    }

    // ── Writes ──────────────────────────────────────────────────

    /// Insert documents. Every document must carry `_id`. With
    /// `ordered`, processing halts at the first error; otherwise the
    /// remaining documents are still attempted and the first error is
    /// reported.
    pub fn insert(
        &mut self,
        handle: &Handle,
        docs: List,
        ordered: bool,
    ) -> Result<OpResult, EngineError> {
        self.require_write()?;
        handle.require_collection()?;

        let mut result = OpResult::default();
        for doc in docs {
            self.cancel.check()?;
            match self.stage_insert(handle, &doc) {
                Ok(()) => result.modified.push(doc),
                Err(e) => {
                    if result.error.is_none() {
                        result.reason = Some(e.to_string());
                        result.error = Some(e);
                    }
                    if ordered {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Replace the first matching document. The replacement's `_id`
    /// must equal the matched document's or be absent (it is inherited).
    pub fn replace(
        &mut self,
        handle: &Handle,
        query: &Document,
        sort_doc: Option<&Document>,
        replacement: Document,
        upsert: bool,
    ) -> Result<OpResult, EngineError> {
        self.require_write()?;
        handle.require_collection()?;
        if let Some(key) = replacement.keys().find(|k| k.starts_with('$')) {
            return Err(EngineError::BadValue(format!(
                "replacement document must not contain operators, found '{key}'"
            )));
        }

        let matched = self.find(handle, query, sort_doc, 0, 1)?.matched;
        let old = match matched.into_iter().next() {
            Some(old) => old,
            None => {
                if upsert {
                    return self.upsert_replace(handle, query, replacement);
                }
                return Ok(OpResult::default());
            }
        };

        let mut fresh = replacement;
        let old_id = path::get(&old, "_id").cloned().expect("stored documents carry _id");
        match fresh.get("_id") {
            None => path::put(&mut fresh, "_id", old_id.clone(), true)
                .map_err(doppio_query::QueryError::Path)?,
            Some(id) if equal(id, &old_id) => {}
            Some(_) => {
                return Err(EngineError::BadValue(
                    "the _id field of a replacement cannot differ from the matched document"
                        .into(),
                ))
            }
        }

        let fresh = Doc::new(fresh);
        self.stage_replace(handle, &old, &fresh)?;
        self.events.push(EventDraft {
            namespace: handle.clone(),
            operation: OperationType::Replace,
            document_key: Some(key_of(&old_id)),
            full_document: Some(fresh.clone()),
            update_description: None,
        });

        Ok(OpResult {
            matched: vec![old],
            modified: vec![fresh],
            ..OpResult::default()
        })
    }

    /// Apply an update document to the matching documents. With
    /// `upsert`, a miss synthesizes a document from the query's equality
    /// constraints and the update.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        handle: &Handle,
        query: &Document,
        sort_doc: Option<&Document>,
        update_doc: &Document,
        skip: usize,
        limit: usize,
        upsert: bool,
        array_filters: &[Document],
    ) -> Result<OpResult, EngineError> {
        self.require_write()?;
        handle.require_collection()?;

        let matched = self.find(handle, query, sort_doc, skip, limit)?.matched;
        if matched.is_empty() {
            if upsert {
                return self.upsert_update(handle, query, update_doc, array_filters);
            }
            return Ok(OpResult::default());
        }

        let mut result = OpResult {
            matched: matched.clone(),
            ..OpResult::default()
        };
        for old in &matched {
            self.cancel.check()?;
            let mut fresh = Document::clone(old);
            let applied = update::apply(&mut fresh, update_doc, false, array_filters, Some(query))?;
            if !applied.changed {
                continue;
            }

            let old_id = path::get(old, "_id").cloned().expect("stored documents carry _id");
            match fresh.get("_id") {
                Some(id) if equal(id, &old_id) => {}
                _ => {
                    return Err(EngineError::BadValue(
                        "an update cannot change the _id field".into(),
                    ))
                }
            }

            let fresh = Doc::new(fresh);
            self.stage_replace(handle, old, &fresh)?;
            self.events.push(EventDraft {
                namespace: handle.clone(),
                operation: OperationType::Update,
                document_key: Some(key_of(&old_id)),
                full_document: Some(fresh.clone()),
                update_description: Some(UpdateDescription {
                    updated_fields: applied.updated_fields,
                    removed_fields: applied.removed_fields,
                }),
            });
            result.modified.push(fresh);
        }
        Ok(result)
    }

    /// Delete the matching documents.
    pub fn delete(
        &mut self,
        handle: &Handle,
        query: &Document,
        sort_doc: Option<&Document>,
        skip: usize,
        limit: usize,
    ) -> Result<OpResult, EngineError> {
        self.require_write()?;
        handle.require_collection()?;

        let matched = self.find(handle, query, sort_doc, skip, limit)?.matched;
        if matched.is_empty() {
            return Ok(OpResult::default());
        }

        let name = handle.namespace();
        {
            let ns = self.namespace_mut(&name, false)?.ok_or_else(|| {
                EngineError::NamespaceNotFound(name.clone())
            })?;
            for doc in &matched {
                ns.primary_mut().delete(doc);
                for index in ns.indexes_mut().iter_mut() {
                    index.delete(doc);
                }
            }
            ns.documents_mut().remove_all(&matched);
        }

        for doc in &matched {
            let id = path::get(doc, "_id").cloned().expect("stored documents carry _id");
            self.events.push(EventDraft {
                namespace: handle.clone(),
                operation: OperationType::Delete,
                document_key: Some(key_of(&id)),
                full_document: None,
                update_description: None,
            });
        }

        Ok(OpResult {
            matched,
            ..OpResult::default()
        })
    }

    /// Run a batch of operations. With `ordered`, processing stops
    /// after the first failing operation; its result is still included.
    /// Per-operation errors do not abort the transaction — the caller
    /// decides whether to commit partial success.
    pub fn bulk(
        &mut self,
        handle: &Handle,
        ops: Vec<Operation>,
        ordered: bool,
    ) -> Result<Vec<OpResult>, EngineError> {
        self.require_write()?;
        handle.require_collection()?;

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            self.cancel.check()?;
            let result = match self.bulk_one(handle, op) {
                Ok(result) => result,
                Err(e) => OpResult::failed(e),
            };
            let failed = result.error.is_some();
            results.push(result);
            if failed && ordered {
                break;
            }
        }
        Ok(results)
    }

    fn bulk_one(&mut self, handle: &Handle, op: Operation) -> Result<OpResult, EngineError> {
        match op.opcode {
            Opcode::Insert => {
                let doc = op.document.ok_or_else(|| {
                    EngineError::BadValue("insert operation requires a document".into())
                })?;
                self.insert(handle, vec![Doc::new(doc)], true)
            }
            Opcode::Replace => {
                let doc = op.document.ok_or_else(|| {
                    EngineError::BadValue("replace operation requires a document".into())
                })?;
                let filter = op.filter.ok_or_else(|| {
                    EngineError::BadValue("replace operation requires a filter".into())
                })?;
                self.replace(handle, &filter, None, doc, op.upsert)
            }
            Opcode::Update => {
                let doc = op.document.ok_or_else(|| {
                    EngineError::BadValue("update operation requires a document".into())
                })?;
                let filter = op.filter.ok_or_else(|| {
                    EngineError::BadValue("update operation requires a filter".into())
                })?;
                self.update(
                    handle,
                    &filter,
                    None,
                    &doc,
                    0,
                    op.limit,
                    op.upsert,
                    &op.array_filters,
                )
            }
            Opcode::Delete => {
                let filter = op.filter.ok_or_else(|| {
                    EngineError::BadValue("delete operation requires a filter".into())
                })?;
                self.delete(handle, &filter, None, 0, op.limit)
            }
        }
    }

    /// Drop a collection, or a whole database when the handle has no
    /// collection component. Dropping something absent is a no-op.
    pub fn drop(&mut self, handle: &Handle) -> Result<(), EngineError> {
        self.require_write()?;
        if handle.is_cluster() {
            return Err(EngineError::BadValue("cannot drop the cluster".into()));
        }

        if handle.is_collection() {
            let name = handle.namespace();
            if self.catalog().get(&name).is_none() {
                return Ok(());
            }
            self.staged_mut().namespaces.remove(&name);
            self.cloned.remove(&name);
            self.events.push(EventDraft {
                namespace: handle.clone(),
                operation: OperationType::Drop,
                document_key: None,
                full_document: None,
                update_description: None,
            });
            return Ok(());
        }

        // database drop: every namespace under the prefix
        let prefix = format!("{}.", handle.database);
        let names: Vec<String> = self
            .catalog()
            .namespaces
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        if names.is_empty() {
            return Ok(());
        }
        for name in &names {
            self.staged_mut().namespaces.remove(name);
            self.cloned.remove(name);
            self.events.push(EventDraft {
                namespace: Handle::from_namespace(name),
                operation: OperationType::Drop,
                document_key: None,
                full_document: None,
                update_description: None,
            });
        }
        self.events.push(EventDraft {
            namespace: Handle::database(handle.database.clone()),
            operation: OperationType::DropDatabase,
            document_key: None,
            full_document: None,
            update_description: None,
        });
        Ok(())
    }

    /// Create a secondary index and backfill it, enforcing uniqueness
    /// over the existing documents. Returns the index name. Recreating
    /// an identical index is a no-op.
    pub fn create_index(
        &mut self,
        handle: &Handle,
        mut config: IndexConfig,
    ) -> Result<String, EngineError> {
        self.require_write()?;
        handle.require_collection()?;
        config.validate()?;
        if config.name.is_empty() {
            config.name = config.default_name();
        }

        let name = handle.namespace();
        if let Some(ns) = self.catalog().get(&name) {
            if let Some(existing) = ns.index(&config.name) {
                if existing.config().keys == config.keys {
                    return Ok(config.name);
                }
                return Err(EngineError::BadValue(format!(
                    "an index named '{}' already exists with different keys",
                    config.name
                )));
            }
        }

        let docs: List = self
            .catalog()
            .get(&name)
            .map(|ns| ns.documents().list().clone())
            .unwrap_or_default();

        let index_name = config.name.clone();
        let mut index = Index::new(config);
        for doc in &docs {
            self.cancel.check()?;
            if !index.set(doc) {
                return Err(duplicate_key(&index, doc));
            }
        }

        let ns = self.namespace_mut(&name, true)?.ok_or_else(|| {
            EngineError::AssertionFailed("namespace vanished while indexing".into())
        })?;
        ns.push_index(index);
        Ok(index_name)
    }

    /// Drop a secondary index by name. The primary index cannot be
    /// dropped.
    pub fn drop_index(&mut self, handle: &Handle, index: &str) -> Result<(), EngineError> {
        self.require_write()?;
        handle.require_collection()?;
        if index == "_id_" {
            return Err(EngineError::BadValue("cannot drop the _id index".into()));
        }

        let name = handle.namespace();
        let ns = self
            .namespace_mut(&name, false)?
            .ok_or_else(|| EngineError::NamespaceNotFound(name.clone()))?;
        if !ns.remove_index(index) {
            return Err(EngineError::BadValue(format!("index not found: {index}")));
        }
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Persist and publish the staged catalog, then hand the buffered
    /// events to the stream hub. On store failure nothing is published.
    pub fn commit(mut self) -> Result<(), EngineError> {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => return Ok(()), // read-only or no-op
        };

        let inner = &self.engine.inner;
        inner.store.store(&staged)?;

        let drafts = std::mem::take(&mut self.events);
        let events: Vec<Event> = {
            let mut clock = inner.clock.lock().unwrap();
            drafts
                .into_iter()
                .map(|draft| {
                    let (time, counter) = clock.next();
                    draft.into_event(time, counter)
                })
                .collect()
        };

        // events first: a reader that observes the new snapshot must
        // find every event of this commit already on the oplog
        inner.hub.publish(&events);
        inner.current.store(Arc::new(staged));

        debug!(events = events.len(), "transaction committed");
        Ok(())
    }

    /// Discard the staged catalog and release the write mutex.
    pub fn abort(self) {
        debug!(staged = self.staged.is_some(), "transaction aborted");
    }

    // ── Staging internals ───────────────────────────────────────

    fn catalog(&self) -> &Catalog {
        self.staged.as_ref().unwrap_or(&self.base)
    }

    fn require_write(&self) -> Result<(), EngineError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(EngineError::AssertionFailed(
                "write operation in a read transaction".into(),
            ))
        }
    }

    fn staged_mut(&mut self) -> &mut Catalog {
        if self.staged.is_none() {
            self.staged = Some(Catalog::clone(&self.base));
        }
        self.staged.as_mut().expect("staged just ensured")
    }

    /// A mutable handle on a namespace in the staged catalog. The first
    /// touch in a transaction replaces the shared namespace with a
    /// private clone.
    fn namespace_mut(
        &mut self,
        name: &str,
        create: bool,
    ) -> Result<Option<&mut Namespace>, EngineError> {
        let cloned = self.cloned.contains(name);
        if self.staged.is_none() {
            self.staged = Some(Catalog::clone(&self.base));
        }
        let catalog = self.staged.as_mut().expect("staged just ensured");

        if catalog.namespaces.get(name).is_none() {
            if !create {
                return Ok(None);
            }
            catalog
                .namespaces
                .insert(name.to_string(), Arc::new(Namespace::new(name)));
            self.cloned.insert(name.to_string());
        } else if !cloned {
            let fresh = Namespace::clone(catalog.namespaces.get(name).expect("checked above"));
            catalog.namespaces.insert(name.to_string(), Arc::new(fresh));
            self.cloned.insert(name.to_string());
        }

        let arc = self
            .staged
            .as_mut()
            .expect("staged ensured above")
            .namespaces
            .get_mut(name)
            .expect("namespace ensured above");
        match Arc::get_mut(arc) {
            Some(ns) => Ok(Some(ns)),
            None => Err(EngineError::AssertionFailed(
                "staged namespace unexpectedly shared".into(),
            )),
        }
    }

    /// Stage one insert: primary and secondary uniqueness, then the
    /// document set. A uniqueness conflict rolls the document back out
    /// of every index it reached.
    fn stage_insert(&mut self, handle: &Handle, doc: &Doc) -> Result<(), EngineError> {
        let id = match path::get(doc, "_id") {
            Some(id) => id.clone(),
            None => {
                return Err(EngineError::BadValue(
                    "document is missing the _id field".into(),
                ))
            }
        };

        let name = handle.namespace();
        {
            let ns = self.namespace_mut(&name, true)?.ok_or_else(|| {
                EngineError::AssertionFailed("namespace vanished while inserting".into())
            })?;

            if !ns.primary_mut().set(doc) {
                return Err(duplicate_key(ns.primary(), doc));
            }
            let mut conflict: Option<usize> = None;
            for (pos, index) in ns.indexes_mut().iter_mut().enumerate() {
                if !index.set(doc) {
                    conflict = Some(pos);
                    break;
                }
            }
            if let Some(pos) = conflict {
                for index in ns.indexes_mut()[..pos].iter_mut() {
                    index.delete(doc);
                }
                ns.primary_mut().delete(doc);
                let err = duplicate_key(&ns.indexes()[pos], doc);
                return Err(err);
            }
            ns.documents_mut().push(doc.clone());
        }

        self.events.push(EventDraft {
            namespace: handle.clone(),
            operation: OperationType::Insert,
            document_key: Some(key_of(&id)),
            full_document: Some(doc.clone()),
            update_description: None,
        });
        Ok(())
    }

    /// Stage replacing `old` with `fresh` at the same position. Index
    /// conflicts restore the old document.
    fn stage_replace(
        &mut self,
        handle: &Handle,
        old: &Doc,
        fresh: &Doc,
    ) -> Result<(), EngineError> {
        let name = handle.namespace();
        let ns = self
            .namespace_mut(&name, false)?
            .ok_or_else(|| EngineError::NamespaceNotFound(name.clone()))?;
        let pos = ns
            .documents()
            .position(old)
            .ok_or_else(|| EngineError::AssertionFailed("matched document left the set".into()))?;

        ns.primary_mut().delete(old);
        for index in ns.indexes_mut().iter_mut() {
            index.delete(old);
        }

        let restore = |ns: &mut Namespace, upto: Option<usize>, fresh: &Doc| {
            if let Some(upto) = upto {
                for index in ns.indexes_mut()[..upto].iter_mut() {
                    index.delete(fresh);
                }
                ns.primary_mut().delete(fresh);
            }
            ns.primary_mut().add(old);
            for index in ns.indexes_mut().iter_mut() {
                index.add(old);
            }
        };

        if !ns.primary_mut().set(fresh) {
            let err = duplicate_key(ns.primary(), fresh);
            restore(ns, None, fresh);
            return Err(err);
        }
        let mut conflict: Option<usize> = None;
        for (at, index) in ns.indexes_mut().iter_mut().enumerate() {
            if !index.set(fresh) {
                conflict = Some(at);
                break;
            }
        }
        if let Some(upto) = conflict {
            let err = duplicate_key(&ns.indexes()[upto], fresh);
            restore(ns, Some(upto), fresh);
            return Err(err);
        }

        ns.documents_mut().replace(pos, fresh.clone());
        Ok(())
    }

    // ── Upserts ─────────────────────────────────────────────────

    fn upsert_update(
        &mut self,
        handle: &Handle,
        query: &Document,
        update_doc: &Document,
        array_filters: &[Document],
    ) -> Result<OpResult, EngineError> {
        let mut seed = extract::extract(query)?;
        update::apply(&mut seed, update_doc, true, array_filters, Some(query))?;
        ensure_id(&mut seed)?;
        let doc = Doc::new(seed);
        self.stage_insert(handle, &doc)?;
        Ok(OpResult {
            upserted: Some(doc),
            ..OpResult::default()
        })
    }

    fn upsert_replace(
        &mut self,
        handle: &Handle,
        query: &Document,
        replacement: Document,
    ) -> Result<OpResult, EngineError> {
        let mut fresh = replacement;
        if fresh.get("_id").is_none() {
            let defaults = extract::extract(query)?;
            match defaults.get("_id") {
                Some(id) => path::put(&mut fresh, "_id", id.clone(), true)
                    .map_err(doppio_query::QueryError::Path)?,
                None => ensure_id(&mut fresh)?,
            }
        }
        let doc = Doc::new(fresh);
        self.stage_insert(handle, &doc)?;
        Ok(OpResult {
            upserted: Some(doc),
            ..OpResult::default()
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────

fn ensure_id(doc: &mut Document) -> Result<(), EngineError> {
    if doc.get("_id").is_none() {
        path::put(doc, "_id", Bson::ObjectId(bson::oid::ObjectId::new()), true)
            .map_err(doppio_query::QueryError::Path)?;
    }
    Ok(())
}

fn key_of(id: &Bson) -> Document {
    let mut key = Document::new();
    key.insert("_id", id.clone());
    key
}

fn duplicate_key(index: &Index, doc: &Doc) -> EngineError {
    let rendered = index
        .config()
        .keys
        .iter()
        .map(|(field, _)| {
            let value = path::get(doc, field)
                .cloned()
                .unwrap_or(Bson::Null);
            format!("{field}: {value}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    EngineError::DuplicateKey {
        index: index.config().name.clone(),
        key: format!("{{ {rendered} }}"),
    }
}

fn index_row(index: &Index) -> Document {
    let config = index.config();
    let mut row = Document::new();
    row.insert("v", Bson::Int32(2));
    row.insert("key", config.keys_document());
    row.insert("name", config.name.clone());
    if config.unique {
        row.insert("unique", true);
    }
    if let Some(filter) = &config.partial_filter {
        row.insert("partialFilterExpression", filter.clone());
    }
    if let Some(secs) = config.expire_after_secs {
        row.insert("expireAfterSeconds", Bson::Int64(secs));
    }
    row
}

/// Sort `list` in place. `$natural` must stand alone and names the
/// insertion order.
fn order_list(list: &mut List, sort_doc: Option<&Document>) -> Result<(), EngineError> {
    let sort_doc = match sort_doc {
        Some(doc) if !doc.is_empty() => doc,
        _ => return Ok(()),
    };
    if let Some(direction) = sort_doc.get("$natural") {
        if sort_doc.len() != 1 {
            return Err(EngineError::BadValue(
                "$natural cannot combine with other sort keys".into(),
            ));
        }
        match direction {
            Bson::Int32(1) | Bson::Int64(1) => {}
            Bson::Int32(-1) | Bson::Int64(-1) => list.reverse(),
            _ => {
                return Err(EngineError::BadValue(
                    "$natural direction must be 1 or -1".into(),
                ))
            }
        }
        return Ok(());
    }
    sort::sort_list(list, sort_doc)?;
    Ok(())
}

fn cut(list: List, skip: usize, limit: usize) -> List {
    let iter = list.into_iter().skip(skip);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}
