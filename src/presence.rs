//! Presence & events: encrypted ephemeral broadcast
//! under channel keys, a timestamped replay window, and named event
//! dispatch.
//!
//! The wire encoding builds on `envelope.rs` (`ChannelContext::aad`,
//! `pad`/`unpad`) and `crypto.rs` (AES-256-GCM encrypt/decrypt); the local
//! fanout is the same `futures::channel::mpsc` broadcast shape as
//! `change.rs`, with a `broadcast`/`subscribe` pair as the entry point.

use crate::crypto::{self, SymmetricKey};
use crate::envelope::{self, ChannelContext};
use crate::error::{Error, Result};
use crate::id::PeerId;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// A single presence tick or named event, once decrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMessage {
    /// Sender's replica id.
    pub peer: PeerId,
    /// Milliseconds since epoch at send time, used for the replay window.
    pub timestamp_ms: u64,
    /// `None` for a bare presence tick, `Some(name)` for a named event
    /// dispatch.
    pub event: Option<String>,
    /// Application payload.
    pub payload: Value,
}

/// Encrypts and pads `message` under `channel_key` for transmission.
pub fn encode(channel_key: &SymmetricKey, space_id: &str, message: &PresenceMessage) -> Result<Vec<u8>> {
    let ctx = if message.event.is_some() {
        ChannelContext::Event
    } else {
        ChannelContext::Presence
    };
    let plaintext = serde_json::to_vec(message).map_err(|e| Error::Other(e.into()))?;
    let blob = crypto::encrypt(channel_key, &plaintext, &ctx.aad(space_id))?;
    envelope::pad(&blob.to_bytes())
}

/// Reverses `encode`: unpads, decrypts, and parses the message. The caller
/// must know which `ChannelContext` was used, since the AAD differs; this
/// function tries presence first and falls back to event, since that's the
/// only thing the AAD actually gates.
pub fn decode(channel_key: &SymmetricKey, space_id: &str, wire: &[u8]) -> Result<PresenceMessage> {
    let blob_bytes = envelope::unpad(wire)?;
    let blob = envelope::EncryptedBlob::from_bytes(&blob_bytes)?;
    let presence_aad = ChannelContext::Presence.aad(space_id);
    let event_aad = ChannelContext::Event.aad(space_id);
    let plaintext = crypto::decrypt(channel_key, &blob, &presence_aad)
        .or_else(|_| crypto::decrypt(channel_key, &blob, &event_aad))?;
    serde_json::from_slice(&plaintext).map_err(|e| Error::Other(e.into()))
}

struct Subscriber {
    sender: mpsc::UnboundedSender<PresenceMessage>,
}

/// Local fanout and replay buffer for one space's presence channel.
///
/// Messages older than `window_ms` are dropped from the replay buffer and
/// are not replayed to new subscribers, but are still delivered live to
/// subscribers already registered.
pub struct PresenceBus {
    window_ms: u64,
    buffer: Mutex<VecDeque<PresenceMessage>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl PresenceBus {
    /// A fresh bus with the given replay window.
    pub fn new(window_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            window_ms,
            buffer: Mutex::new(VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn prune(&self, now_ms: u64, buffer: &mut VecDeque<PresenceMessage>) {
        while let Some(front) = buffer.front() {
            if now_ms.saturating_sub(front.timestamp_ms) > self.window_ms {
                buffer.pop_front();
            } else {
                break;
            }
        }
    }

    /// Publishes a decrypted message to every live subscriber and retains it
    /// in the replay buffer until it ages out.
    pub fn publish(&self, now_ms: u64, message: PresenceMessage) {
        {
            let mut buffer = self.buffer.lock();
            self.prune(now_ms, &mut buffer);
            buffer.push_back(message.clone());
        }
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| sub.sender.unbounded_send(message.clone()).is_ok());
    }

    /// Subscribes for live messages, first replaying every message in the
    /// window still live as of `now_ms`.
    pub fn subscribe(&self, now_ms: u64) -> mpsc::UnboundedReceiver<PresenceMessage> {
        let (sender, receiver) = mpsc::unbounded();
        {
            let mut buffer = self.buffer.lock();
            self.prune(now_ms, &mut buffer);
            for message in buffer.iter() {
                let _ = sender.unbounded_send(message.clone());
            }
        }
        self.subscribers.lock().push(Subscriber { sender });
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn encode_decode_roundtrips() {
        let key = SymmetricKey::generate();
        let message = PresenceMessage {
            peer: PeerId::generate(),
            timestamp_ms: 1000,
            event: None,
            payload: serde_json::json!({"cursor": 42}),
        };
        let wire = encode(&key, "space-1", &message).unwrap();
        let back = decode(&key, "space-1", &wire).unwrap();
        assert_eq!(back.timestamp_ms, message.timestamp_ms);
        assert_eq!(back.payload, message.payload);
    }

    #[test]
    fn named_event_roundtrips_under_event_aad() {
        let key = SymmetricKey::generate();
        let message = PresenceMessage {
            peer: PeerId::generate(),
            timestamp_ms: 1,
            event: Some("cursor-moved".into()),
            payload: serde_json::json!(null),
        };
        let wire = encode(&key, "space-1", &message).unwrap();
        let back = decode(&key, "space-1", &wire).unwrap();
        assert_eq!(back.event.as_deref(), Some("cursor-moved"));
    }

    #[test]
    fn decode_fails_under_wrong_space_aad() {
        let key = SymmetricKey::generate();
        let message = PresenceMessage {
            peer: PeerId::generate(),
            timestamp_ms: 1,
            event: None,
            payload: Value::Null,
        };
        let wire = encode(&key, "space-1", &message).unwrap();
        assert!(decode(&key, "space-2", &wire).is_err());
    }

    #[async_std::test]
    async fn subscriber_replays_window_then_receives_live() {
        let bus = PresenceBus::new(1000);
        bus.publish(
            100,
            PresenceMessage {
                peer: PeerId::generate(),
                timestamp_ms: 100,
                event: None,
                payload: Value::Null,
            },
        );
        let mut rx = bus.subscribe(500);
        let replayed = rx.next().await.unwrap();
        assert_eq!(replayed.timestamp_ms, 100);

        bus.publish(
            600,
            PresenceMessage {
                peer: PeerId::generate(),
                timestamp_ms: 600,
                event: None,
                payload: Value::Null,
            },
        );
        let live = rx.next().await.unwrap();
        assert_eq!(live.timestamp_ms, 600);
    }

    #[test]
    fn expired_messages_are_not_replayed() {
        let bus = PresenceBus::new(100);
        bus.publish(
            0,
            PresenceMessage {
                peer: PeerId::generate(),
                timestamp_ms: 0,
                event: None,
                payload: Value::Null,
            },
        );
        let mut rx = bus.subscribe(1000);
        assert!(rx.try_next().is_err() || rx.try_next().unwrap().is_none());
    }
}
