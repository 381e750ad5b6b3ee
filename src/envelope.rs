//! Fixed-layout wire formats.
//!
//! These are bit-exact where compatibility matters, so every layout here is
//! hand-rolled rather than derived against a fixed byte layout, the way
//! archived wire structs are kept stable independent of any one
//! serialization crate's format.

use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wire versions this build accepts for encrypted blobs.
pub const SUPPORTED_VERSIONS: &[u8] = &[4];

const BLOB_VERSION: u8 = 0x04;
const IV_LEN: usize = 12;

/// `[version : 1][IV : 12][ciphertext || tag]`.
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    /// The wire version byte; always `0x04` for blobs this build produces.
    pub version: u8,
    /// The 96-bit GCM nonce.
    pub iv: [u8; IV_LEN],
    /// AES-GCM ciphertext with the 16-byte authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Builds a v4 blob from an IV and ciphertext-with-tag.
    pub fn new(iv: [u8; IV_LEN], ciphertext: Vec<u8>) -> Self {
        Self {
            version: BLOB_VERSION,
            iv,
            ciphertext,
        }
    }

    /// Serializes to the wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + IV_LEN + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parses the wire layout, dispatching on the version byte.
    ///
    /// Any version outside `SUPPORTED_VERSIONS` fails closed with
    /// `UnsupportedWireVersion` rather than attempting a best-effort parse.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::UnsupportedWireVersion { version: 0 });
        }
        let version = bytes[0];
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(Error::UnsupportedWireVersion { version });
        }
        if bytes.len() < 1 + IV_LEN {
            return Err(Error::CryptoFailure("truncated encrypted blob".into()));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[1..1 + IV_LEN]);
        let ciphertext = bytes[1 + IV_LEN..].to_vec();
        Ok(Self {
            version,
            iv,
            ciphertext,
        })
    }
}

/// Builds the additional authenticated data for a record envelope:
/// `"v1\0" || spaceId || "\0" || recordId`, or empty when no binding
/// context is supplied.
pub fn record_aad(space_id: Option<&str>, record_id: Option<&str>) -> Vec<u8> {
    match (space_id, record_id) {
        (Some(space), Some(record)) => {
            let mut aad = Vec::new();
            aad.extend_from_slice(b"v1\0");
            aad.extend_from_slice(space.as_bytes());
            aad.push(0);
            aad.extend_from_slice(record.as_bytes());
            aad
        }
        _ => Vec::new(),
    }
}

/// The channel AAD literals used for presence/event payloads.
pub enum ChannelContext {
    /// Ephemeral presence broadcast.
    Presence,
    /// Named event dispatch.
    Event,
}

impl ChannelContext {
    /// Builds `<"presence:v1"|"event:v1"> \0 spaceId`.
    pub fn aad(&self, space_id: &str) -> Vec<u8> {
        let literal: &[u8] = match self {
            ChannelContext::Presence => b"presence:v1",
            ChannelContext::Event => b"event:v1",
        };
        let mut aad = Vec::with_capacity(literal.len() + 1 + space_id.len());
        aad.extend_from_slice(literal);
        aad.push(0);
        aad.extend_from_slice(space_id.as_bytes());
        aad
    }
}

/// Length-prefixed padding buckets: pad to the next bucket
/// to blunt length side channels on ephemeral payloads.
pub const PADDING_BUCKETS: &[usize] = &[64, 256, 1024, 4096];

/// Pads `payload` up to the smallest bucket that fits it plus a 4-byte
/// big-endian length trailer; fails if the payload is larger than the
/// biggest bucket.
pub fn pad(payload: &[u8]) -> Result<Vec<u8>> {
    let needed = payload.len() + 4;
    let bucket = *PADDING_BUCKETS
        .iter()
        .find(|&&b| b >= needed)
        .ok_or_else(|| Error::CryptoFailure("payload exceeds largest padding bucket".into()))?;
    let mut out = vec![0u8; bucket];
    out[..payload.len()].copy_from_slice(payload);
    out[bucket - 4..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    Ok(out)
}

/// Reverses `pad`, trusting the trailing length marker.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 4 {
        return Err(Error::CryptoFailure("padded payload too short".into()));
    }
    let (body, trailer) = padded.split_at(padded.len() - 4);
    let len = u32::from_be_bytes(trailer.try_into().unwrap()) as usize;
    if len > body.len() {
        return Err(Error::CryptoFailure("padding length marker out of range".into()));
    }
    Ok(body[..len].to_vec())
}

/// A single entry in a record's append-only signed edit history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EditChainEntry {
    /// Author identifier (`a`).
    #[serde(rename = "a")]
    pub author: String,
    /// Timestamp in milliseconds since epoch (`t`).
    #[serde(rename = "t")]
    pub timestamp_ms: u64,
    /// The diffs this entry applies (`d`).
    #[serde(rename = "d")]
    pub diffs: Vec<Diff>,
    /// SHA-256 of the previous entry's signature, or `None` for the first entry (`p`).
    #[serde(rename = "p")]
    pub prev_hash: Option<[u8; 32]>,
    /// IEEE-P1363 signature over the canonical-JSON signing payload (`s`).
    #[serde(rename = "s", with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// The signer's public key as a JWK (`k`).
    #[serde(rename = "k")]
    pub public_key_jwk: Value,
}

/// A single field diff within an edit-chain entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diff {
    /// Dot-separated field path.
    pub path: String,
    /// Previous value, if any.
    pub from: Option<Value>,
    /// New value.
    pub to: Value,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// The exact payload an edit-chain entry signs: canonical JSON of
/// `{collection, recordId, author, t, d, p}`.
pub fn edit_chain_signing_payload(
    collection: &str,
    record_id: &str,
    author: &str,
    timestamp_ms: u64,
    diffs: &[Diff],
    prev_hash: Option<[u8; 32]>,
) -> Result<Vec<u8>> {
    let mut obj = serde_json::Map::new();
    obj.insert("collection".into(), Value::String(collection.to_string()));
    obj.insert("recordId".into(), Value::String(record_id.to_string()));
    obj.insert("author".into(), Value::String(author.to_string()));
    obj.insert("t".into(), Value::from(timestamp_ms));
    obj.insert(
        "d".into(),
        serde_json::to_value(diffs).map_err(|e| Error::Other(e.into()))?,
    );
    obj.insert(
        "p".into(),
        match prev_hash {
            Some(h) => Value::String(hex::encode(h)),
            None => Value::Null,
        },
    );
    Ok(canonical_json(&Value::Object(obj)))
}

/// Canonical JSON: sorted keys, no whitespace, stable number/boolean
/// encoding — implemented from first principles because `serde_json`'s map
/// ordering is not guaranteed to be key-order deterministic across inputs
/// built in different insertion orders.
///
/// Only used for signable/hashable content, never as a general-purpose
/// serialization format.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_canonical_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // BTreeMap sorts keys lexicographically regardless of the
            // caller's original insertion order.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push(b'{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical_string(k, out);
                out.push(b':');
                write_canonical(v, out);
            }
            out.push(b'}');
        }
    }
}

fn write_canonical_string(s: &str, out: &mut Vec<u8>) {
    // serde_json's string escaping is already deterministic for a given
    // input; only map/object key order needed first-principles handling.
    let escaped = serde_json::to_string(s).expect("string always serializes");
    out.extend_from_slice(escaped.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blob_roundtrips() {
        let blob = EncryptedBlob::new([7u8; 12], vec![1, 2, 3, 4]);
        let bytes = blob.to_bytes();
        assert_eq!(bytes[0], 0x04);
        let back = EncryptedBlob::from_bytes(&bytes).unwrap();
        assert_eq!(back.iv, blob.iv);
        assert_eq!(back.ciphertext, blob.ciphertext);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = EncryptedBlob::new([0u8; 12], vec![0]).to_bytes();
        bytes[0] = 0x09;
        let err = EncryptedBlob::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedWireVersion { version: 9 }));
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn padding_roundtrips_and_picks_smallest_bucket() {
        let payload = vec![9u8; 30];
        let padded = pad(&payload).unwrap();
        assert_eq!(padded.len(), 64);
        assert_eq!(unpad(&padded).unwrap(), payload);
    }

    #[test]
    fn padding_rejects_oversized_payload() {
        let payload = vec![0u8; 5000];
        assert!(pad(&payload).is_err());
    }
}
