//! Boundary interfaces: the
//! collaborator traits the core is built against but never implements
//! itself, plus the tagged transient/permanent split every one of them
//! reports through.
//!
//! `SyncTransport` lives in `crate::sync` since it is exercised nowhere
//! else; this module holds `CryptoProvider`, the other injected
//! collaborator, collected in one place the way a crate root gathers
//! its externally-implemented traits.

use crate::envelope::EncryptedBlob;
use crate::error::{ErrorClass, Result};
use crate::id::RecordId;
use crate::keys::WrappedDek;
use serde_json::Value;

/// Binding context for a record's encrypted envelope: which space and
/// record this blob's AAD is bound to.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    /// The space the record belongs to, if any binding context applies.
    pub space_id: Option<String>,
    /// The record being encrypted/decrypted.
    pub record_id: Option<RecordId>,
}

/// The crypto collaborator injected at database open. Implementations must keep all private key bytes
/// non-exportable beyond this interface.
pub trait CryptoProvider: Send + Sync {
    /// Encrypts `plaintext` under a freshly-generated DEK wrapped at the
    /// current epoch, returning the blob and the wrapped DEK.
    fn encrypt_record(
        &self,
        ctx: &EncryptionContext,
        plaintext: &[u8],
    ) -> Result<(EncryptedBlob, WrappedDek)>;

    /// Decrypts `blob` using the DEK recovered from `wrapped_dek`.
    fn decrypt_record(
        &self,
        ctx: &EncryptionContext,
        blob: &EncryptedBlob,
        wrapped_dek: &WrappedDek,
    ) -> Result<Vec<u8>>;

    /// Rewraps an existing wrapped DEK at `at_epoch`, without touching the
    /// underlying plaintext.
    fn rewrap_dek(&self, wrapped: &WrappedDek, at_epoch: u32) -> Result<WrappedDek>;

    /// The space's current authoritative epoch.
    fn current_epoch(&self) -> u32;

    /// Derives the transient channel key for presence/event payloads in
    /// `space_id` at the current epoch.
    fn derive_channel_key(&self, space_id: &str) -> Result<crate::crypto::SymmetricKey>;

    /// Signs `data` with this replica's signing identity.
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Verifies `sig` over `data` against `public_key_jwk`.
    fn verify(&self, data: &[u8], sig: &[u8], public_key_jwk: &Value) -> Result<bool>;

    /// Mints a fresh record id.
    fn generate_record_id(&self) -> RecordId;
}

/// Tags a boundary-collaborator error as transient (retriable) or
/// permanent (quarantine), mirroring `crate::error::Error::classify` for
/// errors that originate outside the core's own taxonomy.
pub trait BoundaryError {
    /// This error's retry classification.
    fn boundary_class(&self) -> ErrorClass;
}

impl BoundaryError for crate::error::Error {
    fn boundary_class(&self) -> ErrorClass {
        self.classify()
    }
}
