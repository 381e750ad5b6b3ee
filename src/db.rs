//! The top-level `Database` type: a
//! collection registry, the change bus, and an optional sync engine wired
//! together behind one handle.
//!
//! A single struct holds the embedder-facing API plus a command channel to
//! background machinery: many named `CollectionStore`s sharing one
//! `sled::Db`, one `ChangeBus`, and one optional `SyncEngine`.

use crate::boundary::{CryptoProvider, EncryptionContext};
use crate::change::{ChangeBus, ChangeEvent, EmitterId};
use crate::collection::CollectionDef;
use crate::crdt::CrdtState;
use crate::error::{Error, Result};
use crate::id::{PeerId, RecordId};
use crate::keys::WrappedDek;
use crate::record::Record;
use crate::store::{BulkOutcome, BulkResult, CollectionStore, Filter, PutOptions, QueryOptions, QueryResult};
use crate::sync::{
    ApplyRemoteFn, DecryptFn, InboundRecord, OutboundRecord, SyncConfig, SyncEngine, SyncResult,
    SyncTransport,
};
use futures::channel::mpsc;
use futures::Stream;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Tunables that apply across every collection.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// How long a tombstone survives, once acknowledged, before `reap`
    /// removes it for good.
    pub tombstone_grace_period_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            tombstone_grace_period_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// An open database: a `sled::Db`, a registry of named `CollectionStore`s,
/// a change bus every write fans out through, and optionally a sync engine
/// plus the crypto collaborator it needs to decrypt/encrypt envelopes.
pub struct Database {
    backend: sled::Db,
    config: DatabaseConfig,
    collections: RwLock<HashMap<String, Arc<CollectionStore>>>,
    change_bus: Arc<ChangeBus>,
    next_emitter: AtomicU64,
    sync: RwLock<Option<SyncHandle>>,
    /// This replica's actor id, used to mint CRDT dots for local writes in
    /// every collection opened through this handle.
    local_peer: PeerId,
}

struct SyncHandle {
    engine: Arc<SyncEngine>,
    crypto: Arc<dyn CryptoProvider>,
}

impl Database {
    /// Opens a database over `backend`, with no collections registered yet.
    /// Mints a fresh `PeerId` for this replica.
    pub fn open(backend: sled::Db, config: DatabaseConfig) -> Self {
        Self {
            backend,
            config,
            collections: RwLock::new(HashMap::new()),
            change_bus: ChangeBus::new(),
            next_emitter: AtomicU64::new(1),
            sync: RwLock::new(None),
            local_peer: PeerId::generate(),
        }
    }

    /// This replica's actor id.
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Mints a fresh `EmitterId` for a caller (e.g. one browser tab, one
    /// in-process writer) to tag its own writes with, so it can exclude
    /// them from its own `observe` subscription.
    pub fn new_emitter(&self) -> EmitterId {
        EmitterId(self.next_emitter.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `def`, opening its backing `sled::Tree` and loading any
    /// persisted records.
    pub fn register_collection(&self, def: CollectionDef) -> Result<()> {
        let name = def.name.clone();
        let tree = self.backend.open_tree(name.as_bytes())?;
        let store = CollectionStore::open(def, tree, self.local_peer)?;
        self.collections.write().insert(name, Arc::new(store));
        Ok(())
    }

    /// Enables sync against `transport`, decrypting/encrypting through
    /// `crypto`.
    pub fn enable_sync(
        &self,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
        crypto: Arc<dyn CryptoProvider>,
    ) {
        *self.sync.write() = Some(SyncHandle {
            engine: Arc::new(SyncEngine::new(transport, config)),
            crypto,
        });
    }

    /// Registers a progress callback on the sync engine, if sync is enabled.
    pub fn on_sync_progress(&self, cb: impl Fn(crate::sync::SyncProgress) + Send + Sync + 'static) {
        if let Some(handle) = self.sync.read().as_ref() {
            handle.engine.on_progress(cb);
        }
    }

    fn collection(&self, name: &str) -> Result<Arc<CollectionStore>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownField {
                collection: name.to_string(),
                field: "<collection>".into(),
            })
    }

    /// Inserts or replaces a record, emitting a `Put` change event.
    pub fn put(&self, collection: &str, emitter: EmitterId, data: Value, opts: PutOptions) -> Result<Record> {
        let store = self.collection(collection)?;
        let record = store.put(data, opts)?;
        self.change_bus.emit(
            emitter,
            ChangeEvent::Put {
                collection: collection.to_string(),
                id: record.id.clone(),
                data: record.data.clone(),
            },
        );
        Ok(record)
    }

    /// Merges `fields` into an existing record.
    pub fn patch(
        &self,
        collection: &str,
        emitter: EmitterId,
        id: &RecordId,
        fields: Value,
        meta: Option<Value>,
    ) -> Result<Record> {
        let store = self.collection(collection)?;
        let record = store.patch(id, fields, meta)?;
        self.change_bus.emit(
            emitter,
            ChangeEvent::Put {
                collection: collection.to_string(),
                id: record.id.clone(),
                data: record.data.clone(),
            },
        );
        Ok(record)
    }

    /// Tombstones a record.
    pub fn delete(&self, collection: &str, emitter: EmitterId, id: &RecordId, meta: Option<Value>) -> Result<bool> {
        let store = self.collection(collection)?;
        let deleted = store.delete(id, meta)?;
        if deleted {
            self.change_bus.emit(
                emitter,
                ChangeEvent::Delete {
                    collection: collection.to_string(),
                    id: id.clone(),
                },
            );
        }
        Ok(deleted)
    }

    /// Puts every item in `items`, continuing past per-item failures, and
    /// emits one `Bulk` change event naming every id that actually landed.
    pub fn bulk_put(
        &self,
        collection: &str,
        emitter: EmitterId,
        items: Vec<(Value, PutOptions)>,
    ) -> Result<BulkResult<Record>> {
        let store = self.collection(collection)?;
        let result = store.bulk_put(items);
        let ids: Vec<RecordId> = result
            .outcomes
            .iter()
            .filter_map(|o| match o {
                BulkOutcome::Ok(record) => Some(record.id.clone()),
                BulkOutcome::Err(_) => None,
            })
            .collect();
        if !ids.is_empty() {
            self.change_bus.emit(
                emitter,
                ChangeEvent::Bulk {
                    collection: collection.to_string(),
                    ids,
                },
            );
        }
        Ok(result)
    }

    /// Tombstones every id in `ids`, continuing past per-item failures, and
    /// emits one `Bulk` change event naming every id that was actually
    /// deleted.
    pub fn bulk_delete(
        &self,
        collection: &str,
        emitter: EmitterId,
        ids: &[RecordId],
        meta: Option<Value>,
    ) -> Result<BulkResult<bool>> {
        let store = self.collection(collection)?;
        let result = store.bulk_delete(ids, meta);
        let deleted_ids: Vec<RecordId> = ids
            .iter()
            .zip(result.outcomes.iter())
            .filter_map(|(id, o)| match o {
                BulkOutcome::Ok(true) => Some(id.clone()),
                _ => None,
            })
            .collect();
        if !deleted_ids.is_empty() {
            self.change_bus.emit(
                emitter,
                ChangeEvent::Bulk {
                    collection: collection.to_string(),
                    ids: deleted_ids,
                },
            );
        }
        Ok(result)
    }

    /// Reads a record. `migrate` controls whether a record stored under an
    /// older schema version is upgraded (and persisted back) on this read,
    /// or returned as-is.
    pub fn get(&self, collection: &str, id: &RecordId, include_deleted: bool, migrate: bool) -> Result<Option<Record>> {
        self.collection(collection)?.get(id, include_deleted, migrate)
    }

    /// Filters, sorts and paginates.
    pub fn query(&self, collection: &str, opts: QueryOptions) -> Result<QueryResult> {
        self.collection(collection)?.query(opts)
    }

    /// Counts matching records.
    pub fn count(&self, collection: &str, filter: Option<Filter>) -> Result<usize> {
        self.collection(collection)?.count(filter)
    }

    /// Subscribes to every raw change event, optionally scoped to one
    /// collection and excluding one emitter's own writes. For a
    /// materialized view of a single record or a query, see `observe`/
    /// `observe_query` below.
    pub fn on_change(
        &self,
        collection: Option<String>,
        suppress_emitter: Option<EmitterId>,
    ) -> futures::channel::mpsc::UnboundedReceiver<ChangeEvent> {
        self.change_bus.observe(collection, suppress_emitter)
    }

    /// Subscribes to one record's value. The first item the stream yields is
    /// the record's current value (`None` if it doesn't exist or is
    /// tombstoned); every later item reflects a subsequent put/patch/delete/
    /// bulk/remote-merge touching this id. Dropping — or calling
    /// `RecordObserver::cancel` on — the returned observer unsubscribes,
    /// synchronously and safely more than once.
    pub fn observe(&self, collection: &str, id: &RecordId) -> Result<RecordObserver> {
        let store = self.collection(collection)?;
        let initial = store.get(id, false, true)?;
        let events = self.change_bus.observe(Some(collection.to_string()), None);
        Ok(RecordObserver {
            store,
            id: id.clone(),
            initial: Some(initial),
            events,
        })
    }

    /// Subscribes to a query's materialized `{records, total}` result. The
    /// first item is the query run against the current state; every later
    /// item is the query re-run after a change lands in `collection`.
    pub fn observe_query(&self, collection: &str, opts: QueryOptions) -> Result<QueryObserver> {
        let store = self.collection(collection)?;
        let initial = store.query(opts.clone())?;
        let events = self.change_bus.observe(Some(collection.to_string()), None);
        Ok(QueryObserver {
            store,
            opts,
            initial: Some(initial),
            events,
        })
    }

    /// Flushes every registered collection's pending writes to the durable
    /// backend.
    pub fn flush(&self) -> Result<()> {
        for store in self.collections.read().values() {
            store.flush()?;
        }
        Ok(())
    }

    /// Reaps eligible tombstones in every registered collection, returning the total number reaped.
    pub fn reap_tombstones(&self) -> Result<usize> {
        let mut total = 0;
        for store in self.collections.read().values() {
            total += store.reap_tombstones(self.config.tombstone_grace_period_ms)?;
        }
        Ok(total)
    }

    /// Runs one pull-then-push sync cycle for `collection`.
    /// Returns an error if sync has not been enabled via `enable_sync`.
    pub async fn sync_collection(&self, collection: &str) -> Result<SyncResult> {
        let store = self.collection(collection)?;
        let handle = self
            .sync
            .read()
            .as_ref()
            .map(|h| (h.engine.clone(), h.crypto.clone()))
            .ok_or_else(|| Error::Other(anyhow::anyhow!("sync is not enabled on this database")))?;
        let (engine, crypto) = handle;

        let space_id = None; // single-space databases bind no AAD context beyond the record id.
        let dirty = store
            .dirty()
            .into_iter()
            .map(|record| {
                let ctx = EncryptionContext {
                    space_id: space_id.clone(),
                    record_id: Some(record.id.clone()),
                };
                let plaintext = serde_json::to_vec(&record.data).unwrap_or_default();
                let (blob, wrapped_dek) = crypto.encrypt_record(&ctx, &plaintext)?;
                let outbound = OutboundRecord {
                    id: record.id.clone(),
                    version: record.version,
                    ciphertext: blob.to_bytes(),
                    crdt: record.crdt.to_bytes(),
                    edit_chain: record.edit_chain.clone(),
                    wrapped_dek: wrapped_dek.to_bytes(),
                };
                Ok((record.id.clone(), record.sync_snapshot(), outbound))
            })
            .collect::<Result<Vec<_>>>()?;

        let crypto_for_decrypt = crypto.clone();
        let decrypt: &DecryptFn = &move |inbound: &InboundRecord| decrypt_inbound(&crypto_for_decrypt, inbound);

        let apply_remote: &ApplyRemoteFn = &move |id: &RecordId, data: Value, crdt: Option<CrdtState>, sequence: u64, deleted: bool, version: u32, strategy| {
            store
                .apply_remote(id, data, crdt, sequence, deleted, version, strategy)
                .map(|_| ())
        };

        let store_for_mark = self.collection(collection)?;
        let mark_synced = move |id: &RecordId, sequence: u64, snapshot: crate::record::SyncSnapshot| {
            store_for_mark.mark_synced(id, sequence, snapshot)
        };

        Ok(engine
            .sync_collection(collection, dirty, decrypt, apply_remote, &mark_synced)
            .await)
    }

    /// Unquarantines every record in `collection`.
    pub fn retry_quarantined_sync(&self, collection: &str) -> Result<()> {
        let handle = self.sync.read();
        let engine = handle
            .as_ref()
            .map(|h| h.engine.clone())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("sync is not enabled on this database")))?;
        engine.retry_quarantined(collection);
        Ok(())
    }
}

/// A live view of one record, returned by `Database::observe`.
pub struct RecordObserver {
    store: Arc<CollectionStore>,
    id: RecordId,
    initial: Option<Option<Record>>,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl RecordObserver {
    /// Unsubscribes. Synchronous, and safe to call more than once.
    pub fn cancel(&mut self) {
        self.events.close();
    }
}

impl Stream for RecordObserver {
    type Item = Option<Record>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(initial) = self.initial.take() {
            return Poll::Ready(Some(initial));
        }
        loop {
            match Pin::new(&mut self.events).poll_next(cx) {
                Poll::Ready(Some(event)) => {
                    if event.touches(&self.id) {
                        let current = self.store.get(&self.id, false, true).unwrap_or(None);
                        return Poll::Ready(Some(current));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// A live view of one query's materialized result, returned by
/// `Database::observe_query`.
pub struct QueryObserver {
    store: Arc<CollectionStore>,
    opts: QueryOptions,
    initial: Option<QueryResult>,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl QueryObserver {
    /// Unsubscribes. Synchronous, and safe to call more than once.
    pub fn cancel(&mut self) {
        self.events.close();
    }
}

impl Stream for QueryObserver {
    type Item = QueryResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(initial) = self.initial.take() {
            return Poll::Ready(Some(initial));
        }
        match Pin::new(&mut self.events).poll_next(cx) {
            Poll::Ready(Some(_)) => {
                let result = self.store.query(self.opts.clone()).unwrap_or_default();
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn decrypt_inbound(
    crypto: &Arc<dyn CryptoProvider>,
    inbound: &InboundRecord,
) -> Result<(Value, Option<CrdtState>)> {
    let blob = crate::envelope::EncryptedBlob::from_bytes(&inbound.ciphertext)?;
    let wrapped = WrappedDek::from_bytes(&inbound.wrapped_dek)?;
    let ctx = EncryptionContext {
        space_id: None,
        record_id: Some(inbound.id.clone()),
    };
    let plaintext = crypto.decrypt_record(&ctx, &blob, &wrapped)?;
    let data: Value = serde_json::from_slice(&plaintext).map_err(|e| Error::Other(e.into()))?;
    let crdt = inbound.crdt.as_deref().and_then(CrdtState::from_bytes);
    Ok((data, crdt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionBuilder;
    use crate::schema::Schema;
    use serde_json::json;

    fn open_db() -> Database {
        let backend = sled::Config::new().temporary(true).open().unwrap();
        Database::open(backend, DatabaseConfig::default())
    }

    #[test]
    fn put_get_delete_roundtrip_emits_change_events() {
        let db = open_db();
        let def = CollectionBuilder::new("notes")
            .unwrap()
            .v1(Schema::Object(vec![("title".into(), Schema::String)]))
            .build()
            .unwrap();
        db.register_collection(def).unwrap();

        let mut events = db.on_change(Some("notes".into()), None);
        let emitter = db.new_emitter();
        let record = db
            .put("notes", emitter, json!({"title": "hello"}), PutOptions::default())
            .unwrap();

        let fetched = db.get("notes", &record.id, false, true).unwrap().unwrap();
        assert_eq!(fetched.data["title"], json!("hello"));

        assert!(db.delete("notes", emitter, &record.id, None).unwrap());
        assert!(db.get("notes", &record.id, false, true).unwrap().is_none());

        use futures::StreamExt;
        let event = futures::executor::block_on(events.next()).unwrap();
        assert!(matches!(event, ChangeEvent::Put { .. }));
    }

    #[test]
    fn unregistered_collection_is_an_unknown_field_error() {
        let db = open_db();
        let err = db.get("ghost", &RecordId::generate(), false, true).unwrap_err();
        assert!(matches!(err, Error::UnknownField { .. }));
    }

    #[test]
    fn observe_delivers_current_value_first_then_updates_on_change() {
        let db = open_db();
        let def = CollectionBuilder::new("notes")
            .unwrap()
            .v1(Schema::Object(vec![("title".into(), Schema::String)]))
            .build()
            .unwrap();
        db.register_collection(def).unwrap();
        let emitter = db.new_emitter();
        let record = db
            .put("notes", emitter, json!({"title": "hello"}), PutOptions::default())
            .unwrap();

        use futures::StreamExt;
        let mut observer = db.observe("notes", &record.id).unwrap();
        let first = futures::executor::block_on(observer.next()).unwrap();
        assert_eq!(first.unwrap().data["title"], json!("hello"));

        db.patch("notes", emitter, &record.id, json!({"title": "world"}), None)
            .unwrap();
        let second = futures::executor::block_on(observer.next()).unwrap();
        assert_eq!(second.unwrap().data["title"], json!("world"));

        observer.cancel();
        observer.cancel();
    }

    #[test]
    fn observe_query_materializes_the_current_result_then_refreshes() {
        let db = open_db();
        let def = CollectionBuilder::new("notes")
            .unwrap()
            .v1(Schema::Object(vec![("title".into(), Schema::String)]))
            .build()
            .unwrap();
        db.register_collection(def).unwrap();
        let emitter = db.new_emitter();
        db.put("notes", emitter, json!({"title": "hello"}), PutOptions::default())
            .unwrap();

        use futures::StreamExt;
        let mut observer = db.observe_query("notes", QueryOptions::default()).unwrap();
        let first = futures::executor::block_on(observer.next()).unwrap();
        assert_eq!(first.total, 1);

        db.put("notes", emitter, json!({"title": "world"}), PutOptions::default())
            .unwrap();
        let second = futures::executor::block_on(observer.next()).unwrap();
        assert_eq!(second.total, 2);
    }

    #[test]
    fn bulk_put_emits_one_bulk_event_naming_the_successful_ids() {
        let db = open_db();
        let def = CollectionBuilder::new("notes")
            .unwrap()
            .v1(Schema::Object(vec![("title".into(), Schema::String)]))
            .build()
            .unwrap();
        db.register_collection(def).unwrap();
        let emitter = db.new_emitter();

        let mut events = db.on_change(Some("notes".into()), None);
        let result = db
            .bulk_put(
                "notes",
                emitter,
                vec![
                    (json!({"title": "a"}), PutOptions::default()),
                    (json!({"title": "b"}), PutOptions::default()),
                ],
            )
            .unwrap();
        assert_eq!(result.successes().len(), 2);

        use futures::StreamExt;
        let event = futures::executor::block_on(events.next()).unwrap();
        match event {
            ChangeEvent::Bulk { ids, .. } => assert_eq!(ids.len(), 2),
            other => panic!("expected a Bulk event, got {other:?}"),
        }
    }
}
