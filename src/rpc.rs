//! RPC substrate: `call`/`subscribe`/`notify` over a tagged
//! frame transport, with keep-alive sentinels, idle timeouts, and fail-fast
//! duplicate-id detection.
//!
//! A `futures::channel::mpsc` command channel paired with `oneshot` replies
//! handles request/response; a second map tracks long-lived subscriptions,
//! which have no one-shot analogue.

use crate::error::{Error, Result};
use futures::channel::{mpsc, oneshot};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// A single byte reserved as the keep-alive sentinel frame.
pub const KEEPALIVE_SENTINEL: u8 = 0x00;

/// A tagged wire frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// An outbound call.
    Request {
        /// Globally-unique request id.
        id: u64,
        /// Method name.
        method: String,
        /// Method arguments.
        args: Value,
    },
    /// A successful response to a prior `Request`.
    Response {
        /// The request id this answers.
        id: u64,
        /// The call's result.
        result: Value,
    },
    /// A failed response to a prior `Request`.
    ResponseError {
        /// The request id this answers.
        id: u64,
        /// The failure description.
        error: String,
    },
    /// A chunk of a streamed response; resets the idle timer.
    Chunk {
        /// The request id this chunk belongs to.
        id: u64,
        /// The chunk's payload.
        payload: Value,
    },
    /// A subscription push.
    Event {
        /// The subscription id this event belongs to.
        subscription_id: u64,
        /// The event payload.
        payload: Value,
    },
    /// Fire-and-forget, no id expected in response.
    Notify {
        /// Method name.
        method: String,
        /// Method arguments.
        args: Value,
    },
    /// Best-effort request to stop a subscription.
    Unsubscribe {
        /// The subscription id to cancel.
        subscription_id: u64,
    },
}

/// What a transport must do to carry `Frame`s to and from the peer: send
/// one frame, and hand back a stream of inbound frames. Implementors own
/// the actual wire (WebSocket, in-process channel, etc).
pub trait FrameTransport: Send + Sync {
    /// Sends one outbound frame.
    fn send(&self, frame: Frame) -> Result<()>;
}

enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Subscription(mpsc::UnboundedSender<Value>),
}

/// Drives `call`/`subscribe`/`notify` against a `FrameTransport`, matching
/// inbound `Response`/`Event` frames back to the caller that issued the
/// matching id.
pub struct RpcClient {
    transport: Arc<dyn FrameTransport>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl RpcClient {
    /// Builds a client over `transport`.
    pub fn new(transport: Arc<dyn FrameTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn allocate_id(&self, kind: Pending) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.pending.lock().insert(id, kind);
        // Ids are monotonic and only ever freed on completion, so a
        // collision here is a programmer error, not a race.
        assert!(previous.is_none(), "duplicate request id {id}");
        id
    }

    /// `call(method, args, timeoutMs)`. Resolves with the
    /// method's result, or an error if the transport reports failure, the
    /// response channel is dropped, or `timeout` elapses with no response
    /// or chunk received.
    pub async fn call(&self, method: &str, args: Value, timeout: Duration) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let id = self.allocate_id(Pending::Call(tx));
        self.transport.send(Frame::Request {
            id,
            method: method.to_string(),
            args,
        })?;
        let (timeout_tx, timeout_rx) = oneshot::channel::<()>();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            let _ = timeout_tx.send(());
        });
        let result = futures::future::select(Box::pin(rx), Box::pin(timeout_rx)).await;
        self.pending.lock().remove(&id);
        match result {
            futures::future::Either::Left((Ok(inner), _)) => inner,
            futures::future::Either::Left((Err(_), _)) => {
                Err(Error::TransportTransient("response channel dropped".into()))
            }
            futures::future::Either::Right(_) => {
                Err(Error::TransportTransient(format!("call to {method} timed out")))
            }
        }
    }

    /// `notify(method, args)`: fire-and-forget, no id assigned.
    pub fn notify(&self, method: &str, args: Value) -> Result<()> {
        self.transport.send(Frame::Notify {
            method: method.to_string(),
            args,
        })
    }

    /// `subscribe(method, args)` → `(subscriptionId, receiver, unsubscribe)`
    ///. The returned closure cancels locally synchronously and
    /// best-effort-notifies the peer. Takes `self` as an `Arc` so the
    /// returned closure can own a handle back into the client's pending-map.
    pub fn subscribe(
        self: &Arc<Self>,
        method: &str,
        args: Value,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Value>, Box<dyn FnOnce() + Send>)> {
        let (tx, rx) = mpsc::unbounded();
        let id = self.allocate_id(Pending::Subscription(tx));
        self.transport.send(Frame::Request {
            id,
            method: method.to_string(),
            args,
        })?;
        let client = self.clone();
        let unsubscribe: Box<dyn FnOnce() + Send> = Box::new(move || {
            client.pending.lock().remove(&id);
            let _ = client
                .transport
                .send(Frame::Unsubscribe { subscription_id: id });
        });
        Ok((id, rx, unsubscribe))
    }

    /// Feeds one inbound frame into the client, routing it to the matching
    /// pending call or subscription by id.
    pub fn handle_inbound(&self, frame: Frame) {
        match frame {
            Frame::Response { id, result } => self.complete(id, Ok(result)),
            Frame::ResponseError { id, error } => {
                self.complete(id, Err(Error::TransportPermanent(error)))
            }
            Frame::Chunk { id, payload } => {
                // A chunk resets the idle timer at the transport layer;
                // here it is simply forwarded as a subscription-style
                // event if the id is a live subscription, otherwise dropped.
                let mut pending = self.pending.lock();
                if let Some(Pending::Subscription(sender)) = pending.get(&id) {
                    let _ = sender.unbounded_send(payload);
                } else {
                    drop(pending);
                    let _ = payload;
                }
            }
            Frame::Event {
                subscription_id,
                payload,
            } => {
                let pending = self.pending.lock();
                if let Some(Pending::Subscription(sender)) = pending.get(&subscription_id) {
                    let _ = sender.unbounded_send(payload);
                }
            }
            Frame::Request { .. } | Frame::Notify { .. } | Frame::Unsubscribe { .. } => {
                // Server-bound frames arriving on the client side of the
                // channel are out of scope for this half of the substrate.
            }
        }
    }

    fn complete(&self, id: u64, value: Result<Value>) {
        if let Some(Pending::Call(sender)) = self.pending.lock().remove(&id) {
            let _ = sender.send(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as StdMutex;

    struct LoopbackTransport {
        inbound: StdMutex<Vec<Frame>>,
    }

    impl FrameTransport for LoopbackTransport {
        fn send(&self, frame: Frame) -> Result<()> {
            self.inbound.lock().push(frame);
            Ok(())
        }
    }

    #[test]
    fn allocated_ids_are_strictly_increasing_and_never_collide() {
        let transport = Arc::new(LoopbackTransport {
            inbound: StdMutex::new(Vec::new()),
        });
        let client = RpcClient::new(transport);
        let id1 = client.allocate_id(Pending::Call(oneshot::channel().0));
        let id2 = client.allocate_id(Pending::Call(oneshot::channel().0));
        assert!(id2 > id1);
        assert_eq!(client.pending.lock().len(), 2);
    }

    #[async_std::test]
    async fn notify_sends_a_single_frame_with_no_id() {
        let transport = Arc::new(LoopbackTransport {
            inbound: StdMutex::new(Vec::new()),
        });
        let client = RpcClient::new(transport.clone());
        client.notify("ping", Value::Null).unwrap();
        let frames = transport.inbound.lock();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Notify { .. }));
    }

    #[async_std::test]
    async fn call_resolves_on_matching_response() {
        let transport = Arc::new(LoopbackTransport {
            inbound: StdMutex::new(Vec::new()),
        });
        let client = RpcClient::new(transport);
        let (tx, rx) = oneshot::channel();
        let id = client.allocate_id(Pending::Call(tx));
        client.handle_inbound(Frame::Response {
            id,
            result: serde_json::json!("pong"),
        });
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!("pong"));
    }
}
