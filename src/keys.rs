//! Key hierarchy: the forward-only epoch chain, per-record DEK
//! lifecycle, and channel key derivation.

use crate::crypto::{self, SymmetricKey};
use crate::error::{Error, Result};
use crate::id::SpaceId;

/// Defense-in-depth cap on how far forward the epoch chain will be derived
/// in one call, bounding effort against a malicious server claiming an
/// absurd epoch.
pub const MAX_EPOCH_ADVANCE: u32 = 1000;

/// The 44-byte wrapped-DEK wire layout: `[epoch u32 BE][AES-KW ciphertext 40]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek {
    /// The epoch this DEK is wrapped under.
    pub epoch: u32,
    /// The 40-byte AES-KW ciphertext.
    pub ciphertext: [u8; 40],
}

impl WrappedDek {
    /// Serializes to the 44-byte wire layout.
    pub fn to_bytes(&self) -> [u8; 44] {
        let mut out = [0u8; 44];
        out[..4].copy_from_slice(&self.epoch.to_be_bytes());
        out[4..].copy_from_slice(&self.ciphertext);
        out
    }

    /// Parses the 44-byte wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 44 {
            return Err(Error::CryptoFailure(format!(
                "wrapped DEK must be 44 bytes, got {}",
                bytes.len()
            )));
        }
        let epoch = u32::from_be_bytes(bytes[..4].try_into().unwrap());
        let mut ciphertext = [0u8; 40];
        ciphertext.copy_from_slice(&bytes[4..]);
        Ok(Self { epoch, ciphertext })
    }

    /// Reads the epoch prefix without authenticated decryption, so the caller can decide which epoch-KEK to derive
    /// before attempting the (expensive, fallible) unwrap.
    pub fn peek_epoch(bytes: &[u8]) -> Result<u32> {
        if bytes.len() < 4 {
            return Err(Error::CryptoFailure("wrapped DEK too short to peek".into()));
        }
        Ok(u32::from_be_bytes(bytes[..4].try_into().unwrap()))
    }
}

/// The forward-only epoch key chain for one space.
///
/// `epoch_key_0 = rootKey`; each subsequent epoch is an HKDF-SHA256
/// expansion of the previous one. Knowledge of `epoch_key_N` does not reveal
/// `epoch_key_{N-1}` — the chain only runs forward.
pub struct EpochChain {
    root_key: SymmetricKey,
    space: SpaceId,
}

impl EpochChain {
    /// Roots a chain at `root_key` for `space`.
    pub fn new(root_key: SymmetricKey, space: SpaceId) -> Self {
        Self { root_key, space }
    }

    /// Derives `epoch_key_N` directly from the root key, capping the
    /// forward distance at `MAX_EPOCH_ADVANCE`.
    pub fn epoch_key(&self, epoch: u32) -> Result<SymmetricKey> {
        if epoch > MAX_EPOCH_ADVANCE {
            return Err(Error::CryptoFailure(format!(
                "epoch {epoch} exceeds MAX_EPOCH_ADVANCE"
            )));
        }
        let mut key = self.root_key.clone();
        for n in 1..=epoch {
            let info = format!("epoch:v1:{}:{n}", self.space);
            key = key.derive(b"epoch-salt:v1", info.as_bytes());
        }
        Ok(key)
    }

    /// Derives `epoch_key_to` starting from an already-known `epoch_key_from`,
    /// without re-deriving from the root. Used when a caller already holds a mid-chain epoch key.
    pub fn derive_forward(
        from_epoch: u32,
        from_key: &SymmetricKey,
        space: &SpaceId,
        to_epoch: u32,
    ) -> Result<SymmetricKey> {
        if to_epoch < from_epoch {
            return Err(Error::CryptoFailure(
                "cannot derive an epoch key backwards".into(),
            ));
        }
        if to_epoch - from_epoch > MAX_EPOCH_ADVANCE {
            return Err(Error::CryptoFailure(format!(
                "epoch distance {} exceeds MAX_EPOCH_ADVANCE",
                to_epoch - from_epoch
            )));
        }
        let mut key = from_key.clone();
        for n in (from_epoch + 1)..=to_epoch {
            let info = format!("epoch:v1:{space}:{n}");
            key = key.derive(b"epoch-salt:v1", info.as_bytes());
        }
        Ok(key)
    }

    /// Derives the transient channel key for presence/event payloads at the
    /// given epoch.
    pub fn channel_key(&self, epoch: u32) -> Result<SymmetricKey> {
        let epoch_key = self.epoch_key(epoch)?;
        let info = format!("channel:v1:{}", self.space);
        Ok(epoch_key.derive(b"channel-salt:v1", info.as_bytes()))
    }
}

/// Wraps a freshly-generated DEK under the current epoch's key.
pub fn wrap_dek(dek: &SymmetricKey, epoch_key: &SymmetricKey, epoch: u32) -> Result<WrappedDek> {
    let ciphertext = crypto::wrap_key(epoch_key, dek)?;
    Ok(WrappedDek { epoch, ciphertext })
}

/// Unwraps a DEK, returning it along with the epoch it was wrapped under
///. The caller must have already derived
/// `epoch_key` for `wrapped.epoch` (typically via `peek_epoch` then
/// `EpochChain::epoch_key`).
pub fn unwrap_dek(wrapped: &WrappedDek, epoch_key: &SymmetricKey) -> Result<SymmetricKey> {
    crypto::unwrap_key(epoch_key, &wrapped.ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_chain_is_deterministic() {
        let root = SymmetricKey::generate();
        let space = SpaceId::new("space-1");
        let chain = EpochChain::new(root.clone(), space.clone());
        let chain2 = EpochChain::new(root, space);
        assert_eq!(
            chain.epoch_key(5).unwrap().as_bytes(),
            chain2.epoch_key(5).unwrap().as_bytes()
        );
    }

    #[test]
    fn derive_forward_matches_direct_derivation() {
        let root = SymmetricKey::generate();
        let space = SpaceId::new("space-1");
        let chain = EpochChain::new(root, space.clone());
        let e3 = chain.epoch_key(3).unwrap();
        let e7_direct = chain.epoch_key(7).unwrap();
        let e7_forward = EpochChain::derive_forward(3, &e3, &space, 7).unwrap();
        assert_eq!(e7_direct.as_bytes(), e7_forward.as_bytes());
    }

    #[test]
    fn wrap_unwrap_preserves_epoch_prefix() {
        // The epoch prefix is independent wire metadata from how the key
        // itself was derived, so boundary-value epochs are
        // exercised directly against an arbitrary key.
        let kek = SymmetricKey::generate();
        let dek = crypto::generate_dek();
        let wrapped = wrap_dek(&dek, &kek, 0x7FFF_FFFF).unwrap();
        let bytes = wrapped.to_bytes();
        assert_eq!(WrappedDek::peek_epoch(&bytes).unwrap(), 0x7FFF_FFFF);
        let back = WrappedDek::from_bytes(&bytes).unwrap();
        let unwrapped = unwrap_dek(&back, &kek).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }
}
