//! Per-record CRDT state: a field-level last-writer-wins register map keyed
//! by `Dot<PeerId>`.
//!
//! A dot-indexed value map joins by keeping whichever side's clock
//! dominates for a given actor. This specializes that join rule to "one
//! `Dot` per field name", so a record's opaque `crdt` blob is this struct
//! serialized at the sync boundary, and kept as a typed value everywhere
//! else.

use crate::clock::Clock;
use crate::dot::Dot;
use crate::id::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Join semilattice: joins must be idempotent, associative and commutative.
pub trait Lattice {
    /// Merges `other` into `self`.
    fn join(&mut self, other: &Self);
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FieldEntry {
    dot: Dot<PeerId>,
    value: Value,
}

/// The CRDT state carried by a single record: one LWW register per field,
/// plus the vector clock recording which dots have been observed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CrdtState {
    clock: Clock<PeerId>,
    fields: BTreeMap<String, FieldEntry>,
}

impl CrdtState {
    /// An empty CRDT state, as a freshly `put` record starts with.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `field` to `value`, minting a fresh dot for `actor`.
    pub fn assign(&mut self, actor: PeerId, field: &str, value: Value) {
        let dot = self.clock.inc(actor);
        self.clock.apply(dot);
        self.fields
            .insert(field.to_string(), FieldEntry { dot, value });
    }

    /// Reads the current value of `field`, if assigned.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|e| &e.value)
    }

    /// Iterates all assigned fields.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, e)| (k.as_str(), &e.value))
    }

    /// True if no field has ever been assigned.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serializes to the opaque binary form that crosses the sync boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("CrdtState always serializes")
    }

    /// Deserializes from the opaque binary form.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

impl Lattice for CrdtState {
    fn join(&mut self, other: &Self) {
        for (field, their_entry) in &other.fields {
            match self.fields.get(field) {
                // We already have this field at a dot not dominated by
                // theirs: keep ours.
                Some(our_entry) if our_entry.dot >= their_entry.dot => {}
                _ => {
                    self.fields.insert(field.clone(), their_entry.clone());
                }
            }
        }
        self.clock.union(&other.clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_keeps_causally_newer_field() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        let mut s1 = CrdtState::new();
        s1.assign(a, "name", json!("Alice"));
        let mut s2 = CrdtState::new();
        s2.assign(b, "name", json!("Bob"));

        // Whichever side joins the other ends up with exactly one winner,
        // and joining twice doesn't change the result (idempotence).
        let mut merged = s1.clone();
        merged.join(&s2);
        let snapshot = merged.get("name").cloned();
        merged.join(&s2);
        assert_eq!(merged.get("name").cloned(), snapshot);
    }

    #[test]
    fn roundtrips_through_bytes() {
        let a = PeerId::generate();
        let mut s = CrdtState::new();
        s.assign(a, "title", json!("hello"));
        let bytes = s.to_bytes();
        let back = CrdtState::from_bytes(&bytes).unwrap();
        assert_eq!(back.get("title"), s.get("title"));
    }
}
