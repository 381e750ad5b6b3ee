//! The `Record` type.

use crate::crdt::CrdtState;
use crate::id::RecordId;
use serde_json::Value;

/// The atomic unit stored in a collection.
#[derive(Debug, Clone)]
pub struct Record {
    /// Opaque identifier, assigned on insert or user-supplied.
    pub id: RecordId,
    /// Creation timestamp, milliseconds since epoch.
    pub created_at: u64,
    /// Last-mutation timestamp, milliseconds since epoch.
    pub updated_at: u64,
    /// User payload conforming to the collection's current schema version.
    pub data: Value,
    /// Schema version this `data` was stored under.
    pub version: u32,
    /// CRDT merge state for this record's fields.
    pub crdt: CrdtState,
    /// Binary deltas not yet folded into `crdt`; cleared at sync time.
    pub pending_patches: Vec<Vec<u8>>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Tombstone timestamp, set when `deleted` first became true.
    pub deleted_at: Option<u64>,
    /// Last server-assigned sequence; 0 means never synced.
    pub sequence: u64,
    /// True when local changes have not yet been acknowledged by the server.
    pub dirty: bool,
    /// Free-form metadata, e.g. space scoping set by middleware.
    pub meta: Value,
    /// Serialized signed edit history, if edit-chain tracking is enabled.
    pub edit_chain: Option<Vec<u8>>,
}

impl Record {
    /// Builds a freshly-inserted record at `now`.
    pub fn new(id: RecordId, data: Value, version: u32, now: u64, meta: Value) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            data,
            version,
            crdt: CrdtState::new(),
            pending_patches: Vec::new(),
            deleted: false,
            deleted_at: None,
            sequence: 0,
            dirty: true,
            meta,
            edit_chain: None,
        }
    }

    /// A snapshot of the mutable fields `markSynced` must compare against
    /// to decide whether an ack is stale.
    pub fn sync_snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            pending_patches_len: self.pending_patches.len(),
            deleted: self.deleted,
        }
    }

    /// True once the tombstone grace window has elapsed and the delete has
    /// been acknowledged by every sync peer.
    pub fn reapable(&self, now: u64, grace_period_ms: u64) -> bool {
        self.deleted
            && self.sequence > 0
            && !self.dirty
            && self
                .deleted_at
                .map(|at| now.saturating_sub(at) >= grace_period_ms)
                .unwrap_or(false)
    }
}

/// A point-in-time snapshot of a record's mutable-but-not-yet-acked state,
/// compared against the live record when an ack arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSnapshot {
    /// Length of `pending_patches` at snapshot time.
    pub pending_patches_len: usize,
    /// `deleted` at snapshot time.
    pub deleted: bool,
}
