//! Epoch advance protocol driver: rewraps every DEK in a space
//! onto a fresh epoch key without ever touching record plaintext.
//!
//! Built on `keys.rs`'s `EpochChain`/`WrappedDek`/`wrap_dek`/`unwrap_dek`;
//! this module is the orchestration layer on top of those primitives,
//! driving them through a multi-step protocol while the primitives
//! themselves stay stateless.

use crate::error::{Error, Result};
use crate::id::SpaceId;
use crate::keys::{self, EpochChain, WrappedDek, MAX_EPOCH_ADVANCE};

/// Structured conflict returned when an `epochBegin` compare-and-set loses
/// a race against another advance already in flight.
#[derive(Debug, Clone, Copy)]
pub struct EpochState {
    /// The server's current authoritative epoch.
    pub current_epoch: u32,
    /// The epoch a rewrap is in flight to, if any.
    pub rewrap_epoch: Option<u32>,
}

/// The server-side compare-and-set collaborator an epoch advance needs.
pub trait EpochCoordinator: Send + Sync {
    /// Begins an advance to `new_epoch`, optionally setting the server's
    /// minimum-key-generation floor for revocation.
    /// Returns the server's post-call state; the caller compares it against
    /// what it asked for to detect a lost race.
    fn epoch_begin(
        &self,
        space: &SpaceId,
        new_epoch: u32,
        set_min_key_generation: bool,
    ) -> Result<EpochState>;

    /// Fetches every wrapped record DEK and wrapped file DEK currently on
    /// the server.
    fn fetch_wrapped_deks(&self, space: &SpaceId) -> Result<Vec<WrappedDek>>;

    /// Uploads the rewrapped DEKs in one call.
    fn upload_rewrapped(&self, space: &SpaceId, rewrapped: &[WrappedDek]) -> Result<()>;

    /// Clears `rewrapEpoch`, making `new_epoch` authoritative.
    fn epoch_complete(&self, space: &SpaceId, new_epoch: u32) -> Result<()>;
}

/// Outcome of one epoch advance: how many DEKs were actually rewrapped
/// versus already at the target epoch (an idempotent skip).
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochAdvanceResult {
    /// DEKs rewrapped onto the new epoch.
    pub rewrapped: usize,
    /// DEKs already at the target epoch, left untouched.
    pub already_current: usize,
}

/// Drives one full epoch advance for `space` to `current_epoch + 1`.
/// `chain` must already be rooted at the space's root key.
///
/// `set_min_key_generation` effects revocation of a departing member when
/// combined with the DEK rewrap.
#[tracing::instrument(skip(coordinator, chain), fields(%space, current_epoch))]
pub fn advance_epoch(
    coordinator: &dyn EpochCoordinator,
    chain: &EpochChain,
    space: &SpaceId,
    current_epoch: u32,
    set_min_key_generation: bool,
) -> Result<EpochAdvanceResult> {
    let new_epoch = current_epoch + 1;
    if new_epoch - current_epoch > MAX_EPOCH_ADVANCE {
        return Err(Error::CryptoFailure(format!(
            "epoch advance to {new_epoch} exceeds MAX_EPOCH_ADVANCE"
        )));
    }

    let state = coordinator.epoch_begin(space, new_epoch, set_min_key_generation)?;
    if state.current_epoch != current_epoch || state.rewrap_epoch.is_some() {
        tracing::warn!(
            %space,
            wanted = current_epoch,
            server_epoch = state.current_epoch,
            "epoch advance lost the race"
        );
        return Err(Error::EpochMismatch {
            current_epoch: state.current_epoch,
            rewrap_epoch: state.rewrap_epoch,
        });
    }

    let wrapped_deks = coordinator.fetch_wrapped_deks(space)?;
    let new_epoch_key = chain.epoch_key(new_epoch)?;

    let mut result = EpochAdvanceResult::default();
    let mut rewrapped = Vec::with_capacity(wrapped_deks.len());
    for wrapped in &wrapped_deks {
        if wrapped.epoch == new_epoch {
            // Idempotent skip: a retried advance may see DEKs a previous,
            // partially-completed attempt already rewrapped.
            result.already_current += 1;
            continue;
        }
        let source_epoch_key = chain.epoch_key(wrapped.epoch)?;
        let dek = keys::unwrap_dek(wrapped, &source_epoch_key)?;
        rewrapped.push(keys::wrap_dek(&dek, &new_epoch_key, new_epoch)?);
        result.rewrapped += 1;
    }

    coordinator.upload_rewrapped(space, &rewrapped)?;
    coordinator.epoch_complete(space, new_epoch)?;
    tracing::info!(
        %space,
        new_epoch,
        rewrapped = result.rewrapped,
        already_current = result.already_current,
        "epoch advance complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, SymmetricKey};
    use parking_lot::Mutex;

    struct FakeCoordinator {
        server_epoch: Mutex<u32>,
        rewrap_epoch: Mutex<Option<u32>>,
        deks: Mutex<Vec<WrappedDek>>,
    }

    impl EpochCoordinator for FakeCoordinator {
        fn epoch_begin(
            &self,
            _space: &SpaceId,
            new_epoch: u32,
            _set_min_key_generation: bool,
        ) -> Result<EpochState> {
            let current = *self.server_epoch.lock();
            if new_epoch != current + 1 {
                return Ok(EpochState {
                    current_epoch: current,
                    rewrap_epoch: *self.rewrap_epoch.lock(),
                });
            }
            *self.rewrap_epoch.lock() = Some(new_epoch);
            Ok(EpochState {
                current_epoch: current,
                rewrap_epoch: None,
            })
        }

        fn fetch_wrapped_deks(&self, _space: &SpaceId) -> Result<Vec<WrappedDek>> {
            Ok(self.deks.lock().clone())
        }

        fn upload_rewrapped(&self, _space: &SpaceId, rewrapped: &[WrappedDek]) -> Result<()> {
            *self.deks.lock() = rewrapped.to_vec();
            Ok(())
        }

        fn epoch_complete(&self, _space: &SpaceId, new_epoch: u32) -> Result<()> {
            *self.server_epoch.lock() = new_epoch;
            *self.rewrap_epoch.lock() = None;
            Ok(())
        }
    }

    #[test]
    fn advance_rewraps_every_dek_onto_the_new_epoch() {
        let root = SymmetricKey::generate();
        let space = SpaceId::new("space-1");
        let chain = EpochChain::new(root, space.clone());
        let epoch0_key = chain.epoch_key(0).unwrap();
        let dek = crypto::generate_dek();
        let wrapped0 = keys::wrap_dek(&dek, &epoch0_key, 0).unwrap();

        let coordinator = FakeCoordinator {
            server_epoch: Mutex::new(0),
            rewrap_epoch: Mutex::new(None),
            deks: Mutex::new(vec![wrapped0]),
        };

        let result = advance_epoch(&coordinator, &chain, &space, 0, false).unwrap();
        assert_eq!(result.rewrapped, 1);
        assert_eq!(result.already_current, 0);
        assert_eq!(*coordinator.server_epoch.lock(), 1);

        let rewrapped = coordinator.deks.lock()[0].clone();
        assert_eq!(rewrapped.epoch, 1);
        let epoch1_key = chain.epoch_key(1).unwrap();
        let unwrapped = keys::unwrap_dek(&rewrapped, &epoch1_key).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn already_current_deks_are_skipped() {
        let root = SymmetricKey::generate();
        let space = SpaceId::new("space-1");
        let chain = EpochChain::new(root, space.clone());
        let epoch1_key = chain.epoch_key(1).unwrap();
        let dek = crypto::generate_dek();
        let already_wrapped = keys::wrap_dek(&dek, &epoch1_key, 1).unwrap();

        let coordinator = FakeCoordinator {
            server_epoch: Mutex::new(0),
            rewrap_epoch: Mutex::new(None),
            deks: Mutex::new(vec![already_wrapped]),
        };

        let result = advance_epoch(&coordinator, &chain, &space, 0, false).unwrap();
        assert_eq!(result.rewrapped, 0);
        assert_eq!(result.already_current, 1);
    }

    #[test]
    fn lost_race_surfaces_epoch_mismatch() {
        let root = SymmetricKey::generate();
        let space = SpaceId::new("space-1");
        let chain = EpochChain::new(root, space.clone());

        let coordinator = FakeCoordinator {
            server_epoch: Mutex::new(3),
            rewrap_epoch: Mutex::new(Some(4)),
            deks: Mutex::new(vec![]),
        };

        let err = advance_epoch(&coordinator, &chain, &space, 0, false).unwrap_err();
        assert!(matches!(err, Error::EpochMismatch { .. }));
    }
}
