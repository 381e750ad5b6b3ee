//! The storage engine: per-collection record storage with
//! field/unique/computed indexes, filter+sort+paginate queries, bulk
//! operations, and a durability contract backed by `sled`.
//!
//! A thin typed wrapper sits in front of a raw `sled::Tree`, with an
//! in-memory index maintained alongside it for the queries the raw tree
//! can't answer directly.

use crate::collection::{CollectionDef, ComputedIndex, FieldIndex, IndexDef};
use crate::error::{Error, Result};
use crate::id::{PeerId, RecordId};
use crate::record::Record;
use crate::schema::scalar_key;
use crate::sync::DeleteConflictStrategy;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A filter value: either an implicit equality scalar, or an explicit
/// operator object.
#[derive(Clone)]
pub enum FilterValue {
    /// Bare scalar — shorthand for `{eq: scalar}`.
    Scalar(Value),
    /// An explicit comparison/membership operator.
    Op(FilterOp),
}

/// The operators a filter field may use.
#[derive(Default, Clone)]
pub struct FilterOp {
    /// Equals.
    pub eq: Option<Value>,
    /// Not equals.
    pub ne: Option<Value>,
    /// Greater than.
    pub gt: Option<Value>,
    /// Greater than or equal.
    pub gte: Option<Value>,
    /// Less than.
    pub lt: Option<Value>,
    /// Less than or equal.
    pub lte: Option<Value>,
    /// Membership in a set.
    pub r#in: Option<Vec<Value>>,
    /// Substring containment (strings only).
    pub contains: Option<String>,
    /// Prefix match (strings only).
    pub starts_with: Option<String>,
}

/// A top-level conjunction of field filters; `$or` is deliberately absent
/// from the core.
pub type Filter = BTreeMap<String, FilterValue>;

/// Ascending or descending.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Low to high.
    Asc,
    /// High to low.
    Desc,
}

/// A sort specification.
#[derive(Clone)]
pub enum SortSpec {
    /// A single field, ascending.
    Field(String),
    /// An ordered list of `{field, direction}` entries.
    List(Vec<(String, SortDirection)>),
}

impl SortSpec {
    fn entries(&self) -> Vec<(&str, SortDirection)> {
        match self {
            SortSpec::Field(f) => vec![(f.as_str(), SortDirection::Asc)],
            SortSpec::List(list) => list.iter().map(|(f, d)| (f.as_str(), *d)).collect(),
        }
    }
}

/// Options accepted by `query`.
#[derive(Default, Clone)]
pub struct QueryOptions {
    /// Conjunctive filter; `None` matches every record.
    pub filter: Option<Filter>,
    /// Sort order; ties always break by `id` for determinism.
    pub sort: Option<SortSpec>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Number of matching records to skip before collecting `limit`.
    pub offset: Option<usize>,
    /// Include tombstoned records.
    pub include_deleted: bool,
}

/// The result of `query`.
#[derive(Default)]
pub struct QueryResult {
    /// The page of matching records.
    pub records: Vec<Record>,
    /// Total matches before `limit`/`offset` were applied.
    pub total: usize,
}

/// Options accepted by `put`.
#[derive(Default)]
pub struct PutOptions {
    /// Use this id instead of generating one.
    pub id: Option<RecordId>,
    /// Skip the unique-index check (caller already knows it's safe).
    pub skip_unique_check: bool,
    /// Metadata to attach.
    pub meta: Option<Value>,
}

/// Per-index in-memory lookup: key string -> matching live record ids.
struct IndexState {
    entries: BTreeMap<String, BTreeSet<RecordId>>,
    unique: bool,
    sparse: bool,
}

/// A single collection's records, indexes, and persistence tree.
pub struct CollectionStore {
    def: CollectionDef,
    records: RwLock<BTreeMap<RecordId, Record>>,
    insertion_order: RwLock<Vec<RecordId>>,
    indexes: RwLock<Vec<IndexState>>,
    tree: sled::Tree,
    pending_writes: AtomicUsize,
    /// This replica's actor id, used to mint CRDT dots for locally-written
    /// fields.
    local_peer: PeerId,
}

/// The outcome of one item in a bulk operation.
pub enum BulkOutcome<T> {
    /// The item succeeded.
    Ok(T),
    /// The item failed; the rest of the batch still proceeds.
    Err(Error),
}

/// What `bulk_put`/`bulk_delete` return: one outcome per input item, in
/// order, so a caller can match failures back to the item that caused them.
pub struct BulkResult<T> {
    /// Per-item outcomes, positionally aligned with the input slice.
    pub outcomes: Vec<BulkOutcome<T>>,
}

impl<T> BulkResult<T> {
    /// Ids/values of every item that succeeded.
    pub fn successes(&self) -> Vec<&T> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                BulkOutcome::Ok(v) => Some(v),
                BulkOutcome::Err(_) => None,
            })
            .collect()
    }

    /// True if at least one item failed.
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|o| matches!(o, BulkOutcome::Err(_)))
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sentinel index key for a non-sparse index whose field/computed value is
/// absent on a given record. Distinct from every real `scalar_key` output,
/// which always carries a `s:`/`n:`/`b:`/`j:` type tag.
const NULL_INDEX_KEY: &str = "z:null";

fn index_key_for_fields(data: &Value, fields: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(fields.len());
    for field in fields {
        let v = lookup_path(data, field)?;
        parts.push(scalar_key(v)?);
    }
    Some(parts.join("\u{1}"))
}

/// Resolves a dot-separated path against a JSON value, supporting nested
/// `object` fields and `record` subscripting.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

impl CollectionStore {
    /// Opens (or creates) the store for `def` backed by `tree`, minting CRDT
    /// dots under `local_peer` for every local write.
    pub fn open(def: CollectionDef, tree: sled::Tree, local_peer: PeerId) -> Result<Self> {
        let mut indexes = Vec::new();
        for idx in &def.indexes {
            let (unique, sparse) = match idx {
                IndexDef::Field(f) => (f.unique, f.sparse),
                IndexDef::Computed(c) => (c.unique, c.sparse),
            };
            indexes.push(IndexState {
                entries: BTreeMap::new(),
                unique,
                sparse,
            });
        }
        let store = Self {
            def,
            records: RwLock::new(BTreeMap::new()),
            insertion_order: RwLock::new(Vec::new()),
            indexes: RwLock::new(indexes),
            tree,
            pending_writes: AtomicUsize::new(0),
            local_peer,
        };
        store.load_from_tree()?;
        Ok(store)
    }

    /// Mints a dot under this replica's peer id for every top-level field in
    /// `fields`, so a local write's per-field LWW state is as current as the
    /// data it carries.
    fn assign_crdt_fields(&self, record: &mut Record, fields: &Value) {
        if let Some(obj) = fields.as_object() {
            for (field, value) in obj {
                record.crdt.assign(self.local_peer, field, value.clone());
            }
        }
    }

    fn load_from_tree(&self) -> Result<()> {
        for item in self.tree.iter() {
            let (key, value) = item?;
            let id = RecordId::from_string(String::from_utf8_lossy(&key).into_owned());
            if let Some(record) = decode_record(&value) {
                self.index_insert(&id, &record)?;
                self.insertion_order.write().push(id.clone());
                self.records.write().insert(id, record);
            }
        }
        Ok(())
    }

    /// The collection's name.
    pub fn name(&self) -> &str {
        &self.def.name
    }

    fn compute_index_key(&self, idx_def: &IndexDef, data: &Value) -> Option<String> {
        match idx_def {
            IndexDef::Field(FieldIndex { fields, .. }) => index_key_for_fields(data, fields),
            IndexDef::Computed(ComputedIndex { compute, .. }) => {
                compute(data).and_then(|v| scalar_key(&v))
            }
        }
    }

    /// The key a record actually indexes under for `idx_def`/`state`: the
    /// computed scalar key, or — for a non-sparse index — the sentinel null
    /// key when the field/computed value is absent. A sparse index simply
    /// omits the record.
    fn resolved_index_key(&self, idx_def: &IndexDef, state: &IndexState, data: &Value) -> Option<String> {
        match self.compute_index_key(idx_def, data) {
            Some(key) => Some(key),
            None if state.sparse => None,
            None => Some(NULL_INDEX_KEY.to_string()),
        }
    }

    /// Checks every unique index for a conflicting holder and, if none
    /// conflicts, reserves `id` under its new keys — all under one
    /// `indexes` write lock, so two concurrent callers racing on the same
    /// key can never both pass the check (the "check unique → apply" step
    /// of a put/patch is otherwise not atomic across the lock release).
    fn check_and_reserve_unique(&self, id: &RecordId, data: &Value) -> Result<()> {
        let mut indexes = self.indexes.write();
        for (idx_def, state) in self.def.indexes.iter().zip(indexes.iter()) {
            if !state.unique {
                continue;
            }
            if let Some(key) = self.resolved_index_key(idx_def, state, data) {
                if let Some(holders) = state.entries.get(&key) {
                    if holders.iter().any(|h| h != id) {
                        return Err(Error::UniqueViolation {
                            collection: self.def.name.clone(),
                            index: idx_def.name().to_string(),
                        });
                    }
                }
            }
        }
        for (idx_def, state) in self.def.indexes.iter().zip(indexes.iter_mut()) {
            if !state.unique {
                continue;
            }
            if let Some(key) = self.resolved_index_key(idx_def, state, data) {
                state.entries.entry(key).or_default().insert(id.clone());
            }
        }
        Ok(())
    }

    fn index_insert(&self, id: &RecordId, record: &Record) -> Result<()> {
        if record.deleted {
            return Ok(());
        }
        let mut indexes = self.indexes.write();
        for (idx_def, state) in self.def.indexes.iter().zip(indexes.iter_mut()) {
            if let Some(key) = self.resolved_index_key(idx_def, state, &record.data) {
                state.entries.entry(key).or_default().insert(id.clone());
            }
        }
        Ok(())
    }

    fn index_remove(&self, id: &RecordId, record: &Record) {
        let mut indexes = self.indexes.write();
        for (idx_def, state) in self.def.indexes.iter().zip(indexes.iter_mut()) {
            if let Some(key) = self.resolved_index_key(idx_def, state, &record.data) {
                if let Some(set) = state.entries.get_mut(&key) {
                    set.remove(id);
                    if set.is_empty() {
                        state.entries.remove(&key);
                    }
                }
            }
        }
    }

    fn persist(&self, id: &RecordId, record: &Record) -> Result<()> {
        self.tree.insert(id.as_ref().as_bytes(), encode_record(record))?;
        self.pending_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Inserts or replaces a record.
    pub fn put(&self, data: Value, opts: PutOptions) -> Result<Record> {
        self.def
            .schema
            .current_schema()
            .validate(&data)
            .map_err(|reason| Error::SchemaMismatch {
                collection: self.def.name.clone(),
                reason,
            })?;

        let id = opts.id.unwrap_or_else(RecordId::generate);

        if !opts.skip_unique_check {
            self.check_and_reserve_unique(&id, &data)?;
        }

        let now = now_ms();
        let mut records = self.records.write();
        let record = match records.get_mut(&id) {
            Some(existing) => {
                self.index_remove(&id, existing);
                self.assign_crdt_fields(existing, &data);
                existing.data = data;
                existing.updated_at = now;
                existing.deleted = false;
                existing.deleted_at = None;
                existing.dirty = true;
                if let Some(meta) = opts.meta {
                    existing.meta = meta;
                }
                existing.clone()
            }
            None => {
                let meta = opts.meta.unwrap_or(Value::Null);
                let mut record = Record::new(
                    id.clone(),
                    data.clone(),
                    self.def.current_version(),
                    now,
                    meta,
                );
                self.assign_crdt_fields(&mut record, &data);
                records.insert(id.clone(), record.clone());
                self.insertion_order.write().push(id.clone());
                record
            }
        };
        self.index_insert(&id, &record)?;
        self.persist(&id, &record)?;
        Ok(record)
    }

    /// Merges `fields` into an existing record.
    pub fn patch(&self, id: &RecordId, fields: Value, meta: Option<Value>) -> Result<Record> {
        let existing_data = {
            let records = self.records.read();
            let existing = records.get(id).ok_or_else(|| Error::NotFound {
                collection: self.def.name.clone(),
                id: id.to_string(),
            })?;
            existing.data.clone()
        };
        let mut merged = existing_data;
        merge_json(&mut merged, &fields);
        self.def
            .schema
            .current_schema()
            .validate(&merged)
            .map_err(|reason| Error::SchemaMismatch {
                collection: self.def.name.clone(),
                reason,
            })?;
        self.check_and_reserve_unique(id, &merged)?;

        let mut records = self.records.write();
        let existing = records.get_mut(id).ok_or_else(|| Error::NotFound {
            collection: self.def.name.clone(),
            id: id.to_string(),
        })?;
        self.index_remove(id, existing);
        self.assign_crdt_fields(existing, &fields);
        existing.data = merged;
        existing.updated_at = now_ms();
        existing.dirty = true;
        if let Some(meta) = meta {
            existing.meta = meta;
        }
        let record = existing.clone();
        drop(records);
        self.index_insert(id, &record)?;
        self.persist(id, &record)?;
        Ok(record)
    }

    /// Reads a record, optionally upgrading it in-memory if it was written
    /// under an older schema version.
    pub fn get(&self, id: &RecordId, include_deleted: bool, migrate: bool) -> Result<Option<Record>> {
        let found = {
            let records = self.records.read();
            records.get(id).cloned()
        };
        let Some(record) = found else {
            return Ok(None);
        };
        if record.deleted && !include_deleted {
            return Ok(None);
        }
        if record.version >= self.def.current_version() {
            return Ok(Some(record));
        }

        let upgraded_data = self.def.schema.migrate(record.version, record.data.clone());
        let mut snapshot = record.clone();
        snapshot.data = upgraded_data;
        snapshot.version = self.def.current_version();

        if migrate {
            let mut records = self.records.write();
            if let Some(record_mut) = records.get_mut(id) {
                record_mut.data = snapshot.data.clone();
                record_mut.version = snapshot.version;
            }
            drop(records);
            self.persist(id, &snapshot)?;
        }
        Ok(Some(snapshot))
    }

    /// Tombstones a record.
    pub fn delete(&self, id: &RecordId, meta: Option<Value>) -> Result<bool> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if record.deleted {
            return Ok(false);
        }
        self.index_remove(id, record);
        record.deleted = true;
        record.deleted_at = Some(now_ms());
        record.updated_at = now_ms();
        record.dirty = true;
        if let Some(meta) = meta {
            record.meta = meta;
        }
        let snapshot = record.clone();
        drop(records);
        self.persist(id, &snapshot)?;
        Ok(true)
    }

    /// Puts every item in `items`, continuing past per-item failures (e.g. a
    /// schema mismatch or unique violation on one item doesn't block the
    /// rest of the batch).
    pub fn bulk_put(&self, items: Vec<(Value, PutOptions)>) -> BulkResult<Record> {
        let outcomes = items
            .into_iter()
            .map(|(data, opts)| match self.put(data, opts) {
                Ok(record) => BulkOutcome::Ok(record),
                Err(e) => BulkOutcome::Err(e),
            })
            .collect();
        BulkResult { outcomes }
    }

    /// Tombstones every id in `ids`, continuing past per-item failures.
    /// An id with no live record is reported as `Ok(false)`, matching
    /// `delete`'s own not-found semantics, rather than as a failure.
    pub fn bulk_delete(&self, ids: &[RecordId], meta: Option<Value>) -> BulkResult<bool> {
        let outcomes = ids
            .iter()
            .map(|id| match self.delete(id, meta.clone()) {
                Ok(deleted) => BulkOutcome::Ok(deleted),
                Err(e) => BulkOutcome::Err(e),
            })
            .collect();
        BulkResult { outcomes }
    }

    /// Returns every record in insertion order, optionally paginated.
    pub fn get_all(&self, include_deleted: bool, limit: Option<usize>, offset: Option<usize>) -> Vec<Record> {
        let order = self.insertion_order.read();
        let records = self.records.read();
        let iter = order
            .iter()
            .filter_map(|id| records.get(id))
            .filter(|r| include_deleted || !r.deleted)
            .skip(offset.unwrap_or(0));
        match limit {
            Some(n) => iter.take(n).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    /// Filters, sorts and paginates.
    pub fn query(&self, opts: QueryOptions) -> Result<QueryResult> {
        if let Some(filter) = &opts.filter {
            for field in filter.keys() {
                self.validate_known_field(field)?;
            }
        }
        let records = self.records.read();
        let mut matched: Vec<Record> = records
            .values()
            .filter(|r| opts.include_deleted || !r.deleted)
            .filter(|r| match &opts.filter {
                Some(f) => matches_filter(&r.data, f),
                None => true,
            })
            .cloned()
            .collect();
        drop(records);

        if let Some(sort) = &opts.sort {
            let entries = sort.entries();
            matched.sort_by(|a, b| {
                for (field, dir) in &entries {
                    let av = lookup_path(&a.data, field);
                    let bv = lookup_path(&b.data, field);
                    let ord = compare_values(av, bv);
                    let ord = if *dir == SortDirection::Desc { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                a.id.as_ref().cmp(b.id.as_ref())
            });
        } else {
            matched.sort_by(|a, b| a.id.as_ref().cmp(b.id.as_ref()));
        }

        let total = matched.len();
        let offset = opts.offset.unwrap_or(0);
        let page: Vec<Record> = match opts.limit {
            Some(n) => matched.into_iter().skip(offset).take(n).collect(),
            None => matched.into_iter().skip(offset).collect(),
        };
        Ok(QueryResult { records: page, total })
    }

    fn validate_known_field(&self, field: &str) -> Result<()> {
        // Only object-shaped current schemas declare enumerable properties;
        // anything else (record/map schemas) accepts arbitrary field paths.
        if let crate::schema::Schema::Object(props) = self.def.schema.current_schema() {
            let top = field.split('.').next().unwrap_or(field);
            if !props.iter().any(|(name, _)| name == top) {
                return Err(Error::UnknownField {
                    collection: self.def.name.clone(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Counts matching records without materializing a page.
    pub fn count(&self, filter: Option<Filter>) -> Result<usize> {
        if let Some(filter) = &filter {
            for field in filter.keys() {
                self.validate_known_field(field)?;
            }
        }
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|r| !r.deleted)
            .filter(|r| match &filter {
                Some(f) => matches_filter(&r.data, f),
                None => true,
            })
            .count())
    }

    /// Every record currently flagged `dirty`.
    pub fn dirty(&self) -> Vec<Record> {
        self.records
            .read()
            .values()
            .filter(|r| r.dirty)
            .cloned()
            .collect()
    }

    /// Clears the dirty flag for `id` if its current state still matches
    /// `snapshot`.
    pub fn mark_synced(&self, id: &RecordId, sequence: u64, snapshot: crate::record::SyncSnapshot) -> Result<bool> {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(id) else {
            return Ok(false);
        };
        if record.sync_snapshot() != snapshot {
            return Ok(false);
        }
        record.sequence = sequence;
        record.dirty = false;
        record.pending_patches.clear();
        let snap = record.clone();
        drop(records);
        self.persist(id, &snap)?;
        Ok(true)
    }

    /// Applies a decrypted remote record over the local state, CRDT-merging
    /// where applicable. `strategy` resolves the case where one side is a
    /// delete and the other an update. Returns the merged record.
    pub fn apply_remote(
        &self,
        id: &RecordId,
        remote_data: Value,
        remote_crdt: Option<crate::crdt::CrdtState>,
        remote_sequence: u64,
        remote_deleted: bool,
        remote_version: u32,
        strategy: DeleteConflictStrategy,
    ) -> Result<Record> {
        let mut records = self.records.write();
        let local = records.get(id).cloned();
        let merged = match (local, remote_crdt) {
            (Some(mut local), Some(remote_crdt)) => {
                self.index_remove(id, &local);
                use crate::crdt::Lattice;
                let local_was_deleted = local.deleted;
                local.crdt.join(&remote_crdt);
                for (field, value) in local.crdt.iter() {
                    if let Some(obj) = local.data.as_object_mut() {
                        obj.insert(field.to_string(), value.clone());
                    }
                }
                if remote_sequence > local.sequence {
                    local.sequence = remote_sequence;
                }
                local.deleted = resolve_delete_conflict(strategy, local_was_deleted, remote_deleted);
                if local.deleted && local.deleted_at.is_none() {
                    local.deleted_at = Some(now_ms());
                } else if !local.deleted {
                    local.deleted_at = None;
                }
                local.updated_at = now_ms();
                local
            }
            (Some(mut local), None) => {
                // Non-CRDT update: remote sequence strictly greater wins,
                // otherwise the local value is kept. A delete/update
                // conflict at the same sequence boundary is still resolved
                // by `strategy` rather than deferring to remote_sequence.
                if remote_sequence > local.sequence {
                    let resolved_deleted = resolve_delete_conflict(strategy, local.deleted, remote_deleted);
                    self.index_remove(id, &local);
                    local.data = remote_data;
                    local.sequence = remote_sequence;
                    local.deleted = resolved_deleted;
                    local.version = remote_version;
                    local.updated_at = now_ms();
                    if resolved_deleted {
                        local.deleted_at = Some(now_ms());
                    } else {
                        local.deleted_at = None;
                    }
                }
                local
            }
            (None, crdt) => {
                let mut record = Record::new(id.clone(), remote_data, remote_version, now_ms(), Value::Null);
                record.sequence = remote_sequence;
                record.dirty = false;
                record.deleted = remote_deleted;
                if remote_deleted {
                    record.deleted_at = Some(now_ms());
                }
                if let Some(crdt) = crdt {
                    record.crdt = crdt;
                }
                record
            }
        };
        records.insert(id.clone(), merged.clone());
        if !self.insertion_order.read().contains(id) {
            self.insertion_order.write().push(id.clone());
        }
        drop(records);
        self.index_insert(id, &merged)?;
        self.persist(id, &merged)?;
        Ok(merged)
    }

    /// Flushes all outstanding writes to the durable backend.
    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        self.pending_writes.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// True iff an unflushed mutation exists.
    pub fn has_pending_writes(&self) -> bool {
        self.pending_writes.load(Ordering::SeqCst) > 0
    }

    /// Reaps tombstones whose grace window has elapsed and whose delete has
    /// been acknowledged.
    pub fn reap_tombstones(&self, grace_period_ms: u64) -> Result<usize> {
        let now = now_ms();
        let to_reap: Vec<RecordId> = self
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.reapable(now, grace_period_ms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &to_reap {
            self.records.write().remove(id);
            self.insertion_order.write().retain(|i| i != id);
            self.tree.remove(id.as_ref().as_bytes())?;
        }
        Ok(to_reap.len())
    }
}

/// Resolves a local/remote delete-vs-update divergence per `strategy`.
fn resolve_delete_conflict(strategy: DeleteConflictStrategy, local_deleted: bool, remote_deleted: bool) -> bool {
    match strategy {
        DeleteConflictStrategy::RemoteWins => remote_deleted,
        DeleteConflictStrategy::LocalWins => local_deleted,
        DeleteConflictStrategy::DeleteWins => local_deleted || remote_deleted,
        DeleteConflictStrategy::UpdateWins => local_deleted && remote_deleted,
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
}

fn matches_filter(data: &Value, filter: &Filter) -> bool {
    filter.iter().all(|(field, value)| {
        let found = lookup_path(data, field);
        match value {
            FilterValue::Scalar(expected) => found == Some(expected),
            FilterValue::Op(op) => matches_op(found, op),
        }
    })
}

fn matches_op(found: Option<&Value>, op: &FilterOp) -> bool {
    if let Some(eq) = &op.eq {
        if found != Some(eq) {
            return false;
        }
    }
    if let Some(ne) = &op.ne {
        if found == Some(ne) {
            return false;
        }
    }
    if let Some(gt) = &op.gt {
        if compare_values(found, Some(gt)) != std::cmp::Ordering::Greater {
            return false;
        }
    }
    if let Some(gte) = &op.gte {
        if compare_values(found, Some(gte)) == std::cmp::Ordering::Less {
            return false;
        }
    }
    if let Some(lt) = &op.lt {
        if compare_values(found, Some(lt)) != std::cmp::Ordering::Less {
            return false;
        }
    }
    if let Some(lte) = &op.lte {
        if compare_values(found, Some(lte)) == std::cmp::Ordering::Greater {
            return false;
        }
    }
    if let Some(set) = &op.r#in {
        if !found.map(|f| set.contains(f)).unwrap_or(false) {
            return false;
        }
    }
    if let Some(sub) = &op.contains {
        if !found
            .and_then(|v| v.as_str())
            .map(|s| s.contains(sub.as_str()))
            .unwrap_or(false)
        {
            return false;
        }
    }
    if let Some(prefix) = &op.starts_with {
        if !found
            .and_then(|v| v.as_str())
            .map(|s| s.starts_with(prefix.as_str()))
            .unwrap_or(false)
        {
            return false;
        }
    }
    true
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn encode_record(record: &Record) -> Vec<u8> {
    serde_json::to_vec(&WireRecord::from(record)).expect("Record always serializes")
}

fn decode_record(bytes: &[u8]) -> Option<Record> {
    serde_json::from_slice::<WireRecord>(bytes).ok().map(Into::into)
}

/// The on-disk shape of a `Record`; kept distinct from the in-memory type
/// so the backend encoding can evolve independently of the public API.
#[derive(serde::Serialize, serde::Deserialize)]
struct WireRecord {
    id: String,
    created_at: u64,
    updated_at: u64,
    data: Value,
    version: u32,
    crdt: Vec<u8>,
    pending_patches: Vec<Vec<u8>>,
    deleted: bool,
    deleted_at: Option<u64>,
    sequence: u64,
    dirty: bool,
    meta: Value,
    edit_chain: Option<Vec<u8>>,
}

impl From<&Record> for WireRecord {
    fn from(r: &Record) -> Self {
        Self {
            id: r.id.to_string(),
            created_at: r.created_at,
            updated_at: r.updated_at,
            data: r.data.clone(),
            version: r.version,
            crdt: r.crdt.to_bytes(),
            pending_patches: r.pending_patches.clone(),
            deleted: r.deleted,
            deleted_at: r.deleted_at,
            sequence: r.sequence,
            dirty: r.dirty,
            meta: r.meta.clone(),
            edit_chain: r.edit_chain.clone(),
        }
    }
}

impl From<WireRecord> for Record {
    fn from(w: WireRecord) -> Self {
        Self {
            id: RecordId::from_string(w.id),
            created_at: w.created_at,
            updated_at: w.updated_at,
            data: w.data,
            version: w.version,
            crdt: crate::crdt::CrdtState::from_bytes(&w.crdt).unwrap_or_default(),
            pending_patches: w.pending_patches,
            deleted: w.deleted,
            deleted_at: w.deleted_at,
            sequence: w.sequence,
            dirty: w.dirty,
            meta: w.meta,
            edit_chain: w.edit_chain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionBuilder;
    use crate::schema::Schema;
    use serde_json::json;

    fn open_users() -> CollectionStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("users").unwrap();
        let def = CollectionBuilder::new("users")
            .unwrap()
            .v1(Schema::Object(vec![
                ("name".into(), Schema::String),
                ("email".into(), Schema::String),
                ("age".into(), Schema::Optional(Box::new(Schema::Number))),
            ]))
            .index(&["email"], true, false)
            .build()
            .unwrap();
        CollectionStore::open(def, tree, PeerId::generate()).unwrap()
    }

    #[test]
    fn crud_roundtrip() {
        let store = open_users();
        let record = store
            .put(json!({"name": "Alice", "email": "a@x", "age": 30}), PutOptions::default())
            .unwrap();
        assert!(!record.id.to_string().is_empty());

        let fetched = store.get(&record.id, false, false).unwrap().unwrap();
        assert_eq!(fetched.data["name"], json!("Alice"));

        let patched = store
            .patch(&record.id, json!({"age": 31}), None)
            .unwrap();
        assert_eq!(patched.data["age"], json!(31));
        assert_eq!(patched.data["name"], json!("Alice"));

        assert!(store.delete(&record.id, None).unwrap());
        assert!(store.get(&record.id, false, false).unwrap().is_none());
    }

    #[test]
    fn unique_index_blocks_second_insert() {
        let store = open_users();
        store
            .put(json!({"name": "Alice", "email": "a@x"}), PutOptions::default())
            .unwrap();
        let err = store
            .put(json!({"name": "Bob", "email": "a@x"}), PutOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { .. }));
    }

    #[test]
    fn non_sparse_unique_index_blocks_two_records_missing_the_field() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("accounts").unwrap();
        let def = CollectionBuilder::new("accounts")
            .unwrap()
            .v1(Schema::Object(vec![
                ("name".into(), Schema::String),
                ("referral_code".into(), Schema::Optional(Box::new(Schema::String))),
            ]))
            .index(&["referral_code"], true, false)
            .build()
            .unwrap();
        let store = CollectionStore::open(def, tree, PeerId::generate()).unwrap();

        store
            .put(json!({"name": "Alice"}), PutOptions::default())
            .unwrap();
        let err = store
            .put(json!({"name": "Bob"}), PutOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation { .. }));
    }

    #[test]
    fn sparse_unique_index_allows_two_records_missing_the_field() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("accounts").unwrap();
        let def = CollectionBuilder::new("accounts")
            .unwrap()
            .v1(Schema::Object(vec![
                ("name".into(), Schema::String),
                ("referral_code".into(), Schema::Optional(Box::new(Schema::String))),
            ]))
            .index(&["referral_code"], true, true)
            .build()
            .unwrap();
        let store = CollectionStore::open(def, tree, PeerId::generate()).unwrap();

        store
            .put(json!({"name": "Alice"}), PutOptions::default())
            .unwrap();
        store
            .put(json!({"name": "Bob"}), PutOptions::default())
            .unwrap();
    }

    #[test]
    fn bulk_put_reports_per_item_failures_without_aborting_the_batch() {
        let store = open_users();
        let items = vec![
            (json!({"name": "Alice", "email": "a@x"}), PutOptions::default()),
            (json!({"name": "Bob", "email": "a@x"}), PutOptions::default()),
            (json!({"name": "Carol", "email": "c@x"}), PutOptions::default()),
        ];
        let result = store.bulk_put(items);
        assert!(result.has_failures());
        assert_eq!(result.successes().len(), 2);
    }

    #[test]
    fn bulk_delete_reports_missing_ids_as_false_not_failures() {
        let store = open_users();
        let record = store
            .put(json!({"name": "Alice", "email": "a@x"}), PutOptions::default())
            .unwrap();
        let ghost = RecordId::generate();
        let result = store.bulk_delete(&[record.id.clone(), ghost], None);
        assert!(!result.has_failures());
        let outcomes: Vec<bool> = result
            .outcomes
            .iter()
            .map(|o| matches!(o, BulkOutcome::Ok(true)))
            .collect();
        assert_eq!(outcomes, vec![true, false]);
    }

    #[test]
    fn apply_remote_delete_conflict_honors_configured_strategy() {
        let store = open_users();
        let record = store
            .put(json!({"name": "Alice", "email": "a@x"}), PutOptions::default())
            .unwrap();
        store.delete(&record.id, None).unwrap();

        // Local is deleted, remote carries a later update: UpdateWins keeps
        // the record live.
        let merged = store
            .apply_remote(
                &record.id,
                json!({"name": "Alice", "email": "a@x"}),
                None,
                record.sequence + 1,
                false,
                record.version,
                DeleteConflictStrategy::UpdateWins,
            )
            .unwrap();
        assert!(!merged.deleted);
    }

    #[test]
    fn query_filters_sorts_and_paginates() {
        let store = open_users();
        for (name, age) in [("Alice", 30), ("Bob", 25), ("Carol", 35)] {
            store
                .put(
                    json!({"name": name, "email": format!("{name}@x")}),
                    PutOptions::default(),
                )
                .unwrap();
            let _ = age;
        }
        let mut filter = Filter::new();
        filter.insert(
            "name".into(),
            FilterValue::Op(FilterOp {
                starts_with: Some("A".into()),
                ..Default::default()
            }),
        );
        let result = store
            .query(QueryOptions {
                filter: Some(filter),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.records[0].data["name"], json!("Alice"));
    }
}
