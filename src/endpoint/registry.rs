// ABOUTME: Peer registry shared by an endpoint and its dispatch layer
// ABOUTME: Mutex-guarded map from transport peer handles to application connection state

use crate::transport::PeerHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Map of admitted peers to their per-connection state
pub type PeerMap<S> = HashMap<PeerHandle, Arc<S>>;

/// Registry of admitted peers
///
/// Every operation holds the registry lock for its whole duration, including the
/// closures passed to [`with_peer`](Self::with_peer), [`remove_with`](Self::remove_with),
/// [`drain_with`](Self::drain_with) and [`visit`](Self::visit). The lock is not re-entrant:
/// a closure must not call back into the same registry. The one exception is
/// [`clear`](Self::clear) from inside `with_peer`, which is deferred until the closure
/// returns.
#[derive(Debug)]
pub struct PeerRegistry<S> {
    inner: Arc<Inner<S>>,
}

#[derive(Debug)]
struct Inner<S> {
    /// Map of peer handle to connection state
    peers: Mutex<PeerMap<S>>,
    /// Thread currently running a `with_peer` closure
    dispatching: Mutex<Option<ThreadId>>,
    /// Set by `clear` on the dispatching thread
    clear_pending: AtomicBool,
}

impl<S> PeerRegistry<S> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                peers: Mutex::new(HashMap::new()),
                dispatching: Mutex::new(None),
                clear_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Add a peer, replacing any state already stored for the handle
    pub fn insert(&self, peer: PeerHandle, state: Arc<S>) {
        let mut peers = self.inner.peers.lock();
        if peers.insert(peer, state).is_some() {
            log::debug!("Peer {} re-admitted, previous state replaced", peer);
        }
        log::info!("Peer {} added, total peers: {}", peer, peers.len());
    }

    /// State stored for a peer
    pub fn lookup(&self, peer: PeerHandle) -> Option<Arc<S>> {
        self.inner.peers.lock().get(&peer).cloned()
    }

    /// Remove a peer
    ///
    /// Nothing happens on an empty registry; an unknown handle is logged.
    pub fn erase(&self, peer: PeerHandle) -> Option<Arc<S>> {
        let mut peers = self.inner.peers.lock();
        if peers.is_empty() {
            return None;
        }
        match peers.remove(&peer) {
            Some(state) => {
                log::info!("Peer {} removed, total peers: {}", peer, peers.len());
                Some(state)
            }
            None => {
                log::error!("Unknown peer {}", peer);
                None
            }
        }
    }

    /// Run `f` on a peer's state while holding the lock
    ///
    /// `f` may call [`clear`](Self::clear) on this registry; the entries are then dropped
    /// once `f` returns, before the lock is released.
    pub fn with_peer<R>(&self, peer: PeerHandle, f: impl FnOnce(&Arc<S>) -> R) -> Option<R> {
        let mut peers = self.inner.peers.lock();
        let state = peers.get(&peer).cloned()?;

        *self.inner.dispatching.lock() = Some(thread::current().id());
        let result = f(&state);
        *self.inner.dispatching.lock() = None;

        if self.inner.clear_pending.swap(false, Ordering::AcqRel) {
            peers.clear();
            log::debug!("Deferred registry clear applied");
        }
        Some(result)
    }

    /// Remove a peer and run `f` on its handle under the same lock
    ///
    /// Returns `None` without calling `f` when the peer is unknown.
    pub fn remove_with<R>(&self, peer: PeerHandle, f: impl FnOnce(PeerHandle) -> R) -> Option<R> {
        let mut peers = self.inner.peers.lock();
        peers.remove(&peer)?;
        log::info!("Peer {} closed, total peers: {}", peer, peers.len());
        Some(f(peer))
    }

    /// Run `f` on every handle, then empty the registry, all under one lock
    pub fn drain_with(&self, mut f: impl FnMut(PeerHandle)) {
        let mut peers = self.inner.peers.lock();
        for peer in peers.keys() {
            f(*peer);
        }
        peers.clear();
    }

    /// Expose the whole map to `visitor` while holding the lock
    pub fn visit<R>(&self, visitor: impl FnOnce(&PeerMap<S>) -> R) -> R {
        let peers = self.inner.peers.lock();
        visitor(&peers)
    }

    /// Drop every entry
    ///
    /// Called from inside a [`with_peer`](Self::with_peer) closure, the clear happens when
    /// that closure returns.
    pub fn clear(&self) {
        if *self.inner.dispatching.lock() == Some(thread::current().id()) {
            self.inner.clear_pending.store(true, Ordering::Release);
            return;
        }
        self.inner.peers.lock().clear();
    }

    /// Whether a peer is registered
    pub fn contains(&self, peer: PeerHandle) -> bool {
        self.inner.peers.lock().contains_key(&peer)
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Whether no peer is registered
    pub fn is_empty(&self) -> bool {
        self.inner.peers.lock().is_empty()
    }
}

impl<S> Default for PeerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for PeerRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
