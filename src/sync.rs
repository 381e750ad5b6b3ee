//! Sync engine: pull-first/push-second cycles per collection,
//! CRDT merge vs. sequence-LWW dispatch, retry/quarantine, a throttled
//! scheduler, and progress reporting.
//!
//! A `poll_fn`-style task drains pending work and drives one `SyncTransport`
//! per collection under a per-collection lock, with the transport itself
//! fully abstracted behind the injected boundary.

use crate::error::{Error, ErrorClass, Result};
use crate::id::RecordId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A record ready to leave the device, already enveloped.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Record id.
    pub id: RecordId,
    /// Schema version the envelope was written under.
    pub version: u32,
    /// Encrypted record envelope.
    pub ciphertext: Vec<u8>,
    /// Opaque CRDT blob.
    pub crdt: Vec<u8>,
    /// Signed edit-chain entry, if edit-chain tracking is enabled.
    pub edit_chain: Option<Vec<u8>>,
    /// The record's DEK, freshly wrapped under the current epoch.
    pub wrapped_dek: [u8; 44],
}

/// A server-assigned sequence for one pushed record.
#[derive(Debug, Clone)]
pub struct PushAck {
    /// Record id.
    pub id: RecordId,
    /// Server-assigned monotonic sequence.
    pub sequence: u64,
}

/// A record arriving from the server.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    /// Record id.
    pub id: RecordId,
    /// Server sequence for this record.
    pub sequence: u64,
    /// Encrypted record envelope.
    pub ciphertext: Vec<u8>,
    /// Opaque CRDT blob, if the record carries CRDT-mergeable fields.
    pub crdt: Option<Vec<u8>>,
    /// Schema version the envelope was written under.
    pub version: u32,
    /// Whether the server-side record is tombstoned.
    pub deleted: bool,
    /// The record's DEK, wrapped under whichever epoch it was last written.
    pub wrapped_dek: [u8; 44],
}

/// A per-record decode failure reported by `pull`.
#[derive(Debug, Clone)]
pub struct PullFailure {
    /// Record id that failed to decode.
    pub id: RecordId,
    /// Whether the failure should be retried or counted toward quarantine.
    pub class: ErrorClass,
}

/// What `pull` returns.
#[derive(Debug, Clone, Default)]
pub struct PullResult {
    /// Records with `sequence > since`.
    pub records: Vec<InboundRecord>,
    /// The highest sequence the server currently holds for this collection,
    /// if it differs from `max(records.sequence)` (e.g. an empty pull still
    /// advances the cursor).
    pub latest_sequence: Option<u64>,
    /// Per-record decode failures.
    pub failures: Vec<PullFailure>,
}

/// The injected network boundary.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Uploads `records`, returning the server-assigned sequence for each.
    async fn push(&self, collection: &str, records: Vec<OutboundRecord>) -> Result<Vec<PushAck>>;

    /// Downloads every record in `collection` with `sequence > since`.
    async fn pull(&self, collection: &str, since: u64) -> Result<PullResult>;
}

/// Which side wins when both a delete and an update have diverged across
/// sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteConflictStrategy {
    /// The remote delete wins.
    RemoteWins,
    /// The local update wins.
    LocalWins,
    /// Whichever side is deleted wins, regardless of direction.
    DeleteWins,
    /// Whichever side is an update wins, regardless of direction.
    UpdateWins,
}

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Consecutive permanent-error threshold before a record is quarantined.
    pub quarantine_threshold: u32,
    /// Push batch size; `None` disables batching (pushes everything dirty
    /// in one cycle).
    pub push_batch_size: Option<usize>,
    /// Scheduler cooldown between coalesced trigger bursts.
    pub scheduler_cooldown: Duration,
    /// Strategy used when a delete and an update have diverged.
    pub delete_conflict_strategy: DeleteConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 3,
            push_batch_size: Some(50),
            scheduler_cooldown: Duration::from_millis(1000),
            delete_conflict_strategy: DeleteConflictStrategy::UpdateWins,
        }
    }
}

/// `{phase, collection, processed, total}`.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Which half of the cycle this report is for.
    pub phase: SyncPhase,
    /// Collection the cycle is operating on.
    pub collection: String,
    /// Records processed so far in this phase.
    pub processed: usize,
    /// Total records this phase expects to process.
    pub total: usize,
}

/// The phase a `SyncProgress` report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Pulling from the server.
    Pull,
    /// Pushing to the server.
    Push,
}

/// The outcome of one collection's sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Ids that were pulled and merged.
    pub pulled: Vec<RecordId>,
    /// Ids that were pushed and acknowledged.
    pub pushed: Vec<RecordId>,
    /// Errors encountered, folded in rather than propagated (module doc:
    /// sync cycles never let an error escape the cycle boundary).
    pub errors: Vec<String>,
}

/// Per-record retry/quarantine bookkeeping for one collection.
#[derive(Default)]
struct QuarantineState {
    failure_counts: HashMap<RecordId, u32>,
    quarantined: HashSet<RecordId>,
}

impl QuarantineState {
    fn record_failure(&mut self, id: &RecordId, threshold: u32) {
        let count = self.failure_counts.entry(id.clone()).or_insert(0);
        *count += 1;
        if *count >= threshold {
            self.quarantined.insert(id.clone());
        }
    }

    fn record_success(&mut self, id: &RecordId) {
        self.failure_counts.remove(id);
    }

    fn is_quarantined(&self, id: &RecordId) -> bool {
        self.quarantined.contains(id)
    }

    fn retry(&mut self) {
        self.quarantined.clear();
        self.failure_counts.clear();
    }
}

/// Per-collection cursor and quarantine state, plus the lock that
/// serializes push/pull/applyRemote for this collection. `cycle_lock` is an
/// async-aware mutex — held across the `.await` points of the whole
/// cycle — rather than `parking_lot::Mutex`, which is not meant to be held
/// across suspension points.
#[derive(Default)]
struct CollectionSyncState {
    last_sequence: Mutex<u64>,
    quarantine: Mutex<QuarantineState>,
    cycle_lock: futures::lock::Mutex<()>,
}

/// The callback invoked by `applyRemoteChanges`; bridges the decrypted wire
/// shape back into the storage engine. Kept generic over a plain function so
/// `SyncEngine` itself never depends on `crate::store::CollectionStore`
/// directly — the database glue (`crate::db`) supplies this.
pub type ApplyRemoteFn<'a> = dyn Fn(&RecordId, Value, Option<crate::crdt::CrdtState>, u64, bool, u32, DeleteConflictStrategy) -> Result<()>
    + Send
    + Sync
    + 'a;

/// Decrypts one inbound record's envelope into plaintext JSON plus optional
/// CRDT bytes. Supplied by the caller since it needs key material the sync
/// engine itself does not hold.
pub type DecryptFn<'a> = dyn Fn(&InboundRecord) -> Result<(Value, Option<crate::crdt::CrdtState>)> + Send + Sync + 'a;

/// Drives push/pull cycles for every collection registered with it.
pub struct SyncEngine {
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    collections: Mutex<HashMap<String, Arc<CollectionSyncState>>>,
    progress: Mutex<Vec<Box<dyn Fn(SyncProgress) + Send + Sync>>>,
}

impl SyncEngine {
    /// Builds an engine over `transport` with `config`.
    pub fn new(transport: Arc<dyn SyncTransport>, config: SyncConfig) -> Self {
        Self {
            config,
            transport,
            collections: Mutex::new(HashMap::new()),
            progress: Mutex::new(Vec::new()),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, cb: impl Fn(SyncProgress) + Send + Sync + 'static) {
        self.progress.lock().push(Box::new(cb));
    }

    fn report(&self, phase: SyncPhase, collection: &str, processed: usize, total: usize) {
        let progress = SyncProgress {
            phase,
            collection: collection.to_string(),
            processed,
            total,
        };
        for cb in self.progress.lock().iter() {
            cb(progress.clone());
        }
    }

    /// Clones out (creating if absent) the `Arc` for `collection`'s sync
    /// state, dropping the map lock immediately — the returned handle is
    /// then safe to hold across `.await` points.
    fn state(&self, collection: &str) -> Arc<CollectionSyncState> {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .clone()
    }

    /// Unquarantines every record in `collection`.
    pub fn retry_quarantined(&self, collection: &str) {
        let state = self.state(collection);
        state.quarantine.lock().retry();
    }

    /// One pull-then-push cycle for `collection`.
    #[tracing::instrument(skip(self, dirty, decrypt, apply_remote, mark_synced), fields(dirty = dirty.len()))]
    pub async fn sync_collection(
        &self,
        collection: &str,
        dirty: Vec<(RecordId, crate::record::SyncSnapshot, OutboundRecord)>,
        decrypt: &DecryptFn<'_>,
        apply_remote: &ApplyRemoteFn<'_>,
        mark_synced: &(dyn Fn(&RecordId, u64, crate::record::SyncSnapshot) -> Result<bool> + Send + Sync),
    ) -> SyncResult {
        let state = self.state(collection);
        let mut result = SyncResult::default();

        // Held for the whole cycle; `syncAll` walks collections one at a
        // time, each under its own lock.
        let _cycle_guard = state.cycle_lock.lock().await;

        let since = *state.last_sequence.lock();
        tracing::debug!(collection, since, "starting sync cycle");

        match self.transport.pull(collection, since).await {
            Ok(pull) => {
                let total = pull.records.len();
                self.report(SyncPhase::Pull, collection, 0, total);
                let mut max_seen = since;
                for (i, inbound) in pull.records.into_iter().enumerate() {
                    let quarantined = state.quarantine.lock().is_quarantined(&inbound.id);
                    if quarantined {
                        self.report(SyncPhase::Pull, collection, i + 1, total);
                        continue;
                    }
                    max_seen = max_seen.max(inbound.sequence);
                    match decrypt(&inbound) {
                        Ok((data, crdt)) => {
                            match apply_remote(
                                &inbound.id,
                                data,
                                crdt,
                                inbound.sequence,
                                inbound.deleted,
                                inbound.version,
                                self.config.delete_conflict_strategy,
                            ) {
                                Ok(()) => {
                                    state.quarantine.lock().record_success(&inbound.id);
                                    result.pulled.push(inbound.id.clone());
                                }
                                Err(e) => {
                                    self.note_failure(&state, &inbound.id, &e, &mut result);
                                }
                            }
                        }
                        Err(e) => {
                            self.note_failure(&state, &inbound.id, &e, &mut result);
                        }
                    }
                    self.report(SyncPhase::Pull, collection, i + 1, total);
                }
                for failure in pull.failures {
                    match failure.class {
                        ErrorClass::Transient => {}
                        ErrorClass::Permanent => state
                            .quarantine
                            .lock()
                            .record_failure(&failure.id, self.config.quarantine_threshold),
                    }
                }
                *state.last_sequence.lock() = since.max(pull.latest_sequence.unwrap_or(max_seen));
            }
            Err(e) => {
                tracing::warn!(collection, error = %e, "pull failed");
                result.errors.push(e.to_string());
            }
        }

        // Push.
        let total = dirty.len();
        self.report(SyncPhase::Push, collection, 0, total);
        let batch_size = self.config.push_batch_size.unwrap_or(usize::MAX);
        let mut processed = 0;
        for batch in dirty.chunks(batch_size.max(1)) {
            let snapshots: HashMap<RecordId, crate::record::SyncSnapshot> = batch
                .iter()
                .map(|(id, snap, _)| (id.clone(), *snap))
                .collect();
            let outbound: Vec<OutboundRecord> = batch.iter().map(|(_, _, o)| o.clone()).collect();
            match self.transport.push(collection, outbound).await {
                Ok(acks) => {
                    for ack in acks {
                        if let Some(snapshot) = snapshots.get(&ack.id) {
                            match mark_synced(&ack.id, ack.sequence, *snapshot) {
                                Ok(true) => result.pushed.push(ack.id),
                                Ok(false) => {}
                                Err(e) => result.errors.push(e.to_string()),
                            }
                        }
                    }
                }
                Err(e) => result.errors.push(e.to_string()),
            }
            processed += batch.len();
            self.report(SyncPhase::Push, collection, processed, total);
        }

        tracing::debug!(
            collection,
            pulled = result.pulled.len(),
            pushed = result.pushed.len(),
            errors = result.errors.len(),
            "sync cycle complete"
        );
        result
    }

    fn note_failure(&self, state: &CollectionSyncState, id: &RecordId, error: &Error, result: &mut SyncResult) {
        result.errors.push(format!("{id}: {error}"));
        match error.classify() {
            ErrorClass::Transient => {
                tracing::debug!(%id, %error, "transient sync failure, will retry");
            }
            ErrorClass::Permanent => {
                tracing::warn!(%id, %error, "permanent sync failure");
                state
                    .quarantine
                    .lock()
                    .record_failure(id, self.config.quarantine_threshold);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransport {
        pull_calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for NullTransport {
        async fn push(&self, _collection: &str, records: Vec<OutboundRecord>) -> Result<Vec<PushAck>> {
            Ok(records
                .into_iter()
                .enumerate()
                .map(|(i, r)| PushAck {
                    id: r.id,
                    sequence: i as u64 + 1,
                })
                .collect())
        }

        async fn pull(&self, _collection: &str, _since: u64) -> Result<PullResult> {
            self.pull_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PullResult::default())
        }
    }

    #[async_std::test]
    async fn empty_cycle_reports_no_errors() {
        let transport = Arc::new(NullTransport {
            pull_calls: AtomicUsize::new(0),
        });
        let engine = SyncEngine::new(transport, SyncConfig::default());
        let decrypt: &DecryptFn = &|_| unreachable!();
        let apply: &ApplyRemoteFn = &|_, _, _, _, _, _, _| unreachable!();
        let mark_synced = |_: &RecordId, _: u64, _: crate::record::SyncSnapshot| Ok(true);
        let result = engine
            .sync_collection("widgets", Vec::new(), decrypt, apply, &mark_synced)
            .await;
        assert!(result.errors.is_empty());
    }

    #[test]
    fn quarantine_triggers_at_threshold() {
        let mut state = QuarantineState::default();
        let id = RecordId::generate();
        state.record_failure(&id, 3);
        state.record_failure(&id, 3);
        assert!(!state.is_quarantined(&id));
        state.record_failure(&id, 3);
        assert!(state.is_quarantined(&id));
    }
}
