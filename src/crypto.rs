//! Crypto primitives: AES-256-GCM, AES Key Wrap, HKDF-SHA256,
//! ECDSA P-256, ECDH+KDF JWE decryption, and OS randomness.
//!
//! Thin newtypes wrap RustCrypto primitives directly: no key material
//! escapes as a bare `Vec<u8>` longer than it has to, and each operation
//! maps to exactly one RustCrypto call.

use crate::envelope::EncryptedBlob;
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ecdsa::signature::{Signer, Verifier};
use hkdf::Hkdf;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

/// A symmetric key: a Data Encryption Key, an epoch key, or a channel key —
/// all 32 raw bytes, zeroed on drop.
#[derive(Clone)]
pub struct SymmetricKey([u8; 32]);

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl SymmetricKey {
    /// Wraps 32 raw bytes as a key.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates 32 bytes of OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrows the raw key bytes — callers must not persist this beyond the
    /// crypto call it feeds.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derives a new key via HKDF-SHA256 with the given salt and info,
    /// as used by the epoch and channel key derivations.
    pub fn derive(&self, salt: &[u8], info: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.0);
        let mut out = [0u8; 32];
        hk.expand(info, &mut out)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        Self(out)
    }
}

/// Generates a fresh 32-byte Data Encryption Key.
pub fn generate_dek() -> SymmetricKey {
    SymmetricKey::generate()
}

/// Encrypts `plaintext` under `key` with AES-256-GCM, returning the v4
/// wire-format blob. `aad` is the additional authenticated data;
/// pass an empty slice when no binding context applies.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedBlob> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoFailure(e.to_string()))?;
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| Error::CryptoFailure(e.to_string()))?;
    Ok(EncryptedBlob::new(iv, ciphertext))
}

/// Decrypts a v4 blob with AES-256-GCM under `key`, verifying `aad`.
/// A mismatched `aad` (wrong binding context) fails the same way a
/// corrupted ciphertext would.
pub fn decrypt(key: &SymmetricKey, blob: &EncryptedBlob, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoFailure(e.to_string()))?;
    cipher
        .decrypt(
            Nonce::from_slice(&blob.iv),
            Payload {
                msg: &blob.ciphertext,
                aad,
            },
        )
        .map_err(|e| Error::CryptoFailure(e.to_string()))
}

/// Wraps a DEK under `kek` with AES Key Wrap, producing the 40-byte
/// ciphertext half of the 44-byte wrapped-DEK layout.
pub fn wrap_key(kek: &SymmetricKey, dek: &SymmetricKey) -> Result<[u8; 40]> {
    let wrap = aes_kw::KekAes256::new(kek.as_bytes().into());
    let mut out = [0u8; 40];
    wrap.wrap(dek.as_bytes(), &mut out)
        .map_err(|e| Error::CryptoFailure(e.to_string()))?;
    Ok(out)
}

/// Unwraps a 40-byte AES-KW ciphertext back into a DEK.
pub fn unwrap_key(kek: &SymmetricKey, wrapped: &[u8; 40]) -> Result<SymmetricKey> {
    let wrap = aes_kw::KekAes256::new(kek.as_bytes().into());
    let mut out = [0u8; 32];
    wrap.unwrap(wrapped, &mut out)
        .map_err(|e| Error::CryptoFailure(e.to_string()))?;
    Ok(SymmetricKey::from_bytes(out))
}

/// An ECDSA P-256 signing keypair, used for edit-chain entries.
pub struct SigningIdentity {
    signing_key: SigningKey,
}

impl SigningIdentity {
    /// Generates a fresh signing identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restores a signing identity from a raw scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|e| Error::CryptoFailure(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Signs `payload`, returning an IEEE-P1363 (raw r||s) 64-byte signature.
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        let sig: Signature = self.signing_key.sign(payload);
        sig.to_bytes().into()
    }

    /// The public key, as a JWK.
    pub fn public_jwk(&self) -> serde_json::Value {
        let verifying_key = VerifyingKey::from(&self.signing_key);
        let jwk = verifying_key.to_jwk();
        serde_json::to_value(jwk).expect("JWK always serializes")
    }

    /// The raw verifying key bytes, for out-of-band comparison.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.signing_key)
    }
}

/// Verifies an IEEE-P1363 signature against a JWK-encoded public key.
pub fn verify(payload: &[u8], signature: &[u8], public_key_jwk: &serde_json::Value) -> Result<bool> {
    let jwk: p256::elliptic_curve::JwkEcKey =
        serde_json::from_value(public_key_jwk.clone()).map_err(|e| Error::Other(e.into()))?;
    let verifying_key =
        VerifyingKey::from_jwk(&jwk).map_err(|e| Error::CryptoFailure(e.to_string()))?;
    let sig = Signature::from_slice(signature).map_err(|e| Error::CryptoFailure(e.to_string()))?;
    Ok(verifying_key.verify(payload, &sig).is_ok())
}

/// Decrypts an ECDH-ES + KDF JWE-style envelope used at the auth boundary:
/// derive a shared secret between our static private key and the ephemeral
/// public key carried in the JWE header, then HKDF-expand it into the
/// content-encryption key.
///
/// This is only ever called by the external auth collaborator; the core
/// never produces JWEs itself.
pub fn ecdh_derive_cek(
    our_private: &p256::SecretKey,
    their_public: &p256::PublicKey,
    info: &[u8],
) -> SymmetricKey {
    let shared = p256::ecdh::diffie_hellman(
        our_private.to_nonzero_scalar(),
        their_public.as_affine(),
    );
    let hk = shared.extract::<Sha256>(None);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SymmetricKey::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrips() {
        let key = SymmetricKey::generate();
        let aad = b"ctx";
        let blob = encrypt(&key, b"hello world", aad).unwrap();
        let plaintext = decrypt(&key, &blob, aad).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn decrypt_fails_with_wrong_aad() {
        let key = SymmetricKey::generate();
        let blob = encrypt(&key, b"hello", b"ctx-a").unwrap();
        assert!(decrypt(&key, &blob, b"ctx-b").is_err());
    }

    #[test]
    fn empty_and_large_plaintext_roundtrip() {
        let key = SymmetricKey::generate();
        for len in [0, 4096] {
            let plaintext = vec![0xab; len];
            let blob = encrypt(&key, &plaintext, b"").unwrap();
            assert_eq!(decrypt(&key, &blob, b"").unwrap(), plaintext);
        }
    }

    #[test]
    fn wrap_unwrap_roundtrips() {
        let kek = SymmetricKey::generate();
        let dek = generate_dek();
        let wrapped = wrap_key(&kek, &dek).unwrap();
        let unwrapped = unwrap_key(&kek, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn sign_verify_roundtrips() {
        let identity = SigningIdentity::generate();
        let sig = identity.sign(b"payload");
        assert!(verify(b"payload", &sig, &identity.public_jwk()).unwrap());
        assert!(!verify(b"tampered", &sig, &identity.public_jwk()).unwrap());
    }
}
