//! The error taxonomy used across the crate.
//!
//! Writes surface these synchronously; sync cycles never let one escape —
//! they get folded into `SyncResult.errors` instead (see `crate::sync`).

use thiserror::Error;

/// Every error the core can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// A value did not match the declared schema.
    #[error("value does not match schema for collection {collection:?}: {reason}")]
    SchemaMismatch {
        /// Collection the write was addressed to.
        collection: String,
        /// Human-readable mismatch description.
        reason: String,
    },

    /// A collection definition used a reserved field name.
    #[error("collection {collection:?} uses reserved field {field:?}")]
    ReservedField {
        /// Offending collection.
        collection: String,
        /// Offending field name.
        field: String,
    },

    /// `patch`/`get`/`delete` addressed a missing record.
    #[error("record {id:?} not found in collection {collection:?}")]
    NotFound {
        /// Collection queried.
        collection: String,
        /// Missing record id.
        id: String,
    },

    /// A write collided with a unique index.
    #[error("value for unique index {index:?} already present in collection {collection:?}")]
    UniqueViolation {
        /// Collection written to.
        collection: String,
        /// Offending index name.
        index: String,
    },

    /// A computed index's pure function threw.
    #[error("computed index {index:?} failed: {reason}")]
    ComputedIndexError {
        /// Offending index name.
        index: String,
        /// Failure description.
        reason: String,
    },

    /// A filter referenced a field the schema does not have.
    #[error("unknown field {field:?} in filter for collection {collection:?}")]
    UnknownField {
        /// Collection queried.
        collection: String,
        /// Unknown field path.
        field: String,
    },

    /// An encrypted blob's version byte is not one this build understands.
    #[error("unsupported wire version {version}")]
    UnsupportedWireVersion {
        /// The version byte actually seen.
        version: u8,
    },

    /// Decrypt, unwrap, or signature verification failed.
    #[error("cryptographic operation failed: {0}")]
    CryptoFailure(String),

    /// The server's epoch state did not match the locally proposed advance.
    #[error("epoch mismatch: server is at epoch {current_epoch}, rewrap in flight to {rewrap_epoch:?}")]
    EpochMismatch {
        /// Server's current authoritative epoch.
        current_epoch: u32,
        /// Epoch a rewrap is (or was) in flight to, if any.
        rewrap_epoch: Option<u32>,
    },

    /// A collection name, index name, or other identifier was malformed.
    #[error("invalid name {0:?}")]
    InvalidName(String),

    /// An edit chain failed to verify.
    #[error("edit chain verification failed: {0}")]
    InvalidEditChain(String),

    /// The transport classified this as retryable.
    #[error("transient transport error: {0}")]
    TransportTransient(String),

    /// The transport classified this as non-retryable.
    #[error("permanent transport error: {0}")]
    TransportPermanent(String),

    /// The persistence backend rejected a write due to quota.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// The persistence backend failed for some other reason.
    #[error("backend I/O error: {0}")]
    BackendIo(#[from] sled::Error),

    /// Catch-all for collaborator errors that do not fit the taxonomy above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Whether an error should be retried by the sync engine, or should count
/// toward a record's quarantine threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried on the next sync cycle; does not count toward quarantine.
    Transient,
    /// Counts toward quarantine; the record is skipped once the threshold is hit.
    Permanent,
}

impl Error {
    /// Classifies this error for the sync engine's retry/quarantine bookkeeping.
    ///
    /// Errors outside the sync path (schema, unique, not-found) have no
    /// natural classification and default to `Permanent` so a caller that
    /// mistakenly routes them through `classify` fails closed rather than
    /// retrying forever.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Error::TransportTransient(_) | Error::QuotaExceeded => ErrorClass::Transient,
            Error::TransportPermanent(_)
            | Error::UnsupportedWireVersion { .. }
            | Error::CryptoFailure(_) => ErrorClass::Permanent,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
