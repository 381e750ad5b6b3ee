//! Replica coordinator: multiple replicas attached to the same
//! backend behave as one storage engine, with one leader owning the
//! mutable engine and followers forwarding requests through a router.
//!
//! A leader here plays the role a single in-process command channel would
//! play alone, except now multiple replicas can contend for that role, so
//! the state machine and router bookkeeping exist to arbitrate it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-replica role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    /// Awaiting either lock acquisition or a `leader-announce`.
    Electing,
    /// Owns the mutable engine.
    Leader,
    /// Forwards requests to the leader's dedicated channel.
    Follower,
}

/// The named host-level exclusive lock a replica must acquire to become
/// leader. Implementors back this with whatever cross-process
/// primitive the host platform offers (a Web Lock, a flock, ...); this
/// crate only needs the acquire/release shape.
pub trait HostLock: Send + Sync {
    /// Attempts to acquire the lock without blocking, returning whether it
    /// was acquired.
    fn try_acquire(&self) -> bool;
    /// Releases a previously-acquired lock.
    fn release(&self);
}

/// One originating port's pending request, preserved across a transport
/// swap so it can be re-sent with its id intact.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// The globally-unique request id assigned by the router.
    pub request_id: u64,
    /// The port that originated this request.
    pub port_id: u64,
    /// That port's own local id for the request, mapped back on response.
    pub local_id: u64,
}

/// One originating port's live subscription, remapped the same way as
/// requests.
#[derive(Debug, Clone)]
pub struct PendingSubscription {
    /// The globally-unique subscription id assigned by the router.
    pub subscription_id: u64,
    /// The port that owns this subscription.
    pub port_id: u64,
    /// That port's own local id for the subscription.
    pub local_id: u64,
}

/// Maps router-assigned ids back to the originating port and its local id,
/// and increments a generation counter on every transport swap so stale
/// responses can be dropped.
#[derive(Default)]
pub struct Router {
    next_request_id: AtomicU64,
    next_subscription_id: AtomicU64,
    generation: AtomicU64,
    requests: Mutex<HashMap<u64, PendingRequest>>,
    subscriptions: Mutex<HashMap<u64, PendingSubscription>>,
}

impl Router {
    /// A fresh router with no pending work and generation 0.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Assigns a globally-unique request id for a request from `port_id`
    /// whose local id on that port is `local_id`.
    pub fn route_request(&self, port_id: u64, local_id: u64) -> u64 {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().insert(
            request_id,
            PendingRequest {
                request_id,
                port_id,
                local_id,
            },
        );
        request_id
    }

    /// Resolves a router request id back to its originating port, removing
    /// the bookkeeping entry (a response completes it).
    pub fn resolve_request(&self, request_id: u64) -> Option<PendingRequest> {
        self.requests.lock().remove(&request_id)
    }

    /// Assigns a globally-unique subscription id for `port_id`'s local
    /// subscription `local_id`.
    pub fn route_subscription(&self, port_id: u64, local_id: u64) -> u64 {
        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().insert(
            subscription_id,
            PendingSubscription {
                subscription_id,
                port_id,
                local_id,
            },
        );
        subscription_id
    }

    /// Looks up which port owns `subscription_id`, without removing it —
    /// events keep flowing until an explicit unsubscribe.
    pub fn subscription_owner(&self, subscription_id: u64) -> Option<PendingSubscription> {
        self.subscriptions.lock().get(&subscription_id).cloned()
    }

    /// Removes a subscription, e.g. on port disconnect or explicit
    /// unsubscribe.
    pub fn remove_subscription(&self, subscription_id: u64) {
        self.subscriptions.lock().remove(&subscription_id);
    }

    /// Drops every pending request/subscription owned by `port_id`, e.g. on
    /// that port's disconnect.
    pub fn drop_port(&self, port_id: u64) {
        self.requests.lock().retain(|_, r| r.port_id != port_id);
        self.subscriptions
            .lock()
            .retain(|_, s| s.port_id != port_id);
    }

    /// Every request currently pending, for replay onto a new transport.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.requests.lock().values().cloned().collect()
    }

    /// Every subscription currently live, for replay onto a new transport.
    pub fn pending_subscriptions(&self) -> Vec<PendingSubscription> {
        self.subscriptions.lock().values().cloned().collect()
    }

    /// Bumps the transport generation, returning the new value. Callers
    /// tag outbound frames with this and drop anything arriving tagged with
    /// an older generation.
    pub fn swap_transport(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The current transport generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether a frame tagged with `seen_generation` is still current, or
    /// should be silently dropped as stale.
    pub fn is_current_generation(&self, seen_generation: u64) -> bool {
        seen_generation == self.generation()
    }
}

/// Drives one replica's state machine.
///
/// This type owns only the role transitions and the router; it does not
/// know how to actually open the dormant engine or swap RPC transports —
/// those are host-specific side effects the caller performs when
/// `ReplicaCoordinator::promote` reports a promotion occurred.
pub struct ReplicaCoordinator {
    lock: Arc<dyn HostLock>,
    role: Mutex<ReplicaRole>,
    router: Arc<Router>,
}

impl ReplicaCoordinator {
    /// Starts a fresh replica in the `Electing` state.
    pub fn new(lock: Arc<dyn HostLock>) -> Self {
        Self {
            lock,
            role: Mutex::new(ReplicaRole::Electing),
            router: Router::new(),
        }
    }

    /// The replica's current role.
    pub fn role(&self) -> ReplicaRole {
        *self.role.lock()
    }

    /// This replica's router (id remapping, generation counter).
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Attempts the `electing → leader` transition by acquiring the named
    /// host-level lock. Returns `true` if this replica became
    /// leader.
    pub fn try_become_leader(&self) -> bool {
        let mut role = self.role.lock();
        if *role == ReplicaRole::Leader {
            return true;
        }
        if self.lock.try_acquire() {
            *role = ReplicaRole::Leader;
            tracing::info!("acquired host lock, became leader");
            true
        } else {
            false
        }
    }

    /// The `electing → follower` transition: another replica announced
    /// leadership first.
    pub fn become_follower(&self) {
        *self.role.lock() = ReplicaRole::Follower;
        tracing::debug!("following another replica's leadership");
    }

    /// The `leader → (gone)` transition: this replica is giving up
    /// leadership gracefully. Releases the
    /// host lock and returns to `Electing`.
    pub fn resign(&self) {
        let mut role = self.role.lock();
        if *role == ReplicaRole::Leader {
            self.lock.release();
            tracing::info!("resigned leadership, released host lock");
        }
        *role = ReplicaRole::Electing;
    }

    /// The `follower → leader` promotion path: the prior leader died and
    /// this replica won the lock. Bumps the router's transport generation
    /// and returns the pending work that must be replayed on the new
    /// transport.
    pub fn promote(&self) -> Option<PromotionWork> {
        let mut role = self.role.lock();
        if *role != ReplicaRole::Follower {
            return None;
        }
        if !self.lock.try_acquire() {
            return None;
        }
        *role = ReplicaRole::Leader;
        let generation = self.router.swap_transport();
        let requests = self.router.pending_requests();
        let subscriptions = self.router.pending_subscriptions();
        tracing::info!(
            generation,
            pending_requests = requests.len(),
            pending_subscriptions = subscriptions.len(),
            "promoted to leader, replaying pending work"
        );
        Some(PromotionWork {
            generation,
            requests,
            subscriptions,
        })
    }
}

/// What a promoted replica must replay on its new transport.
#[derive(Debug, Clone)]
pub struct PromotionWork {
    /// The router's generation after the swap; frames tagged with an older
    /// generation are stale.
    pub generation: u64,
    /// Requests to re-send with their original ids preserved.
    pub requests: Vec<PendingRequest>,
    /// Subscriptions to re-establish.
    pub subscriptions: Vec<PendingSubscription>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeLock(AtomicBool);

    impl HostLock for FakeLock {
        fn try_acquire(&self) -> bool {
            !self.0.swap(true, Ordering::SeqCst)
        }
        fn release(&self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn first_replica_to_acquire_the_lock_becomes_leader() {
        let lock = Arc::new(FakeLock(AtomicBool::new(false)));
        let replica_a = ReplicaCoordinator::new(lock.clone());
        let replica_b = ReplicaCoordinator::new(lock);
        assert!(replica_a.try_become_leader());
        assert!(!replica_b.try_become_leader());
        replica_b.become_follower();
        assert_eq!(replica_b.role(), ReplicaRole::Follower);
    }

    #[test]
    fn resign_releases_the_lock_for_a_follower_to_take() {
        let lock = Arc::new(FakeLock(AtomicBool::new(false)));
        let replica_a = ReplicaCoordinator::new(lock.clone());
        let replica_b = ReplicaCoordinator::new(lock);
        assert!(replica_a.try_become_leader());
        replica_b.become_follower();
        replica_a.resign();
        assert_eq!(replica_a.role(), ReplicaRole::Electing);
        assert!(replica_b.promote().is_some());
        assert_eq!(replica_b.role(), ReplicaRole::Leader);
    }

    #[test]
    fn promotion_bumps_generation_and_replays_pending_work() {
        let lock = Arc::new(FakeLock(AtomicBool::new(true)));
        let replica = ReplicaCoordinator::new(lock.clone());
        replica.become_follower();
        let router = replica.router();
        router.route_request(1, 10);
        router.route_subscription(1, 20);

        lock.release();
        let work = replica.promote().unwrap();
        assert_eq!(work.generation, 1);
        assert_eq!(work.requests.len(), 1);
        assert_eq!(work.subscriptions.len(), 1);
        assert!(router.is_current_generation(1));
        assert!(!router.is_current_generation(0));
    }

    #[test]
    fn dropping_a_port_removes_only_its_own_pending_work() {
        let router = Router::new();
        router.route_request(1, 10);
        router.route_request(2, 20);
        router.drop_port(1);
        let remaining = router.pending_requests();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].port_id, 2);
    }
}
