// ABOUTME: Receiver facade: listens on RIST URLs and admits inbound peers
// ABOUTME: Wraps the shared endpoint lifecycle with the receiver's data callback

use crate::endpoint::dispatch::{drop_data, DataReceived};
use crate::endpoint::lifecycle::{Endpoint, Version};
use crate::endpoint::registry::PeerMap;
use crate::endpoint::settings::{Settings, RECEIVER_PEER_WEIGHT};
use crate::transport::{PeerHandle, RistBackend, Role};
use std::sync::Arc;

/// RIST receiver accepting any number of inbound peers
///
/// `S` is the per-connection state the application attaches to each admitted peer.
///
/// Callbacks run on the transport worker while the peer registry is locked. From inside
/// a callback, do not call [`close_client_connection`](Self::close_client_connection),
/// [`close_all_client_connections`](Self::close_all_client_connections),
/// [`active_clients`](Self::active_clients) or [`client_count`](Self::client_count) on
/// the same receiver: that deadlocks. [`send_oob_data`](Self::send_oob_data) and
/// [`destroy`](Self::destroy) are allowed; the registry is emptied once the callback
/// returns.
pub struct RistReceiver<S> {
    endpoint: Endpoint<S>,
    data: DataReceived<S>,
}

impl<S: Send + Sync + 'static> RistReceiver<S> {
    /// Create an uninitialized receiver on top of `backend`
    pub fn new(backend: Arc<dyn RistBackend>) -> Self {
        Self {
            endpoint: Endpoint::new(Role::Receiver, backend),
            data: drop_data(),
        }
    }

    /// Decide admission of connecting peers
    ///
    /// Takes effect at the next [`init`](Self::init). Until set, every peer is rejected.
    pub fn on_validate_connection<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, u16) -> Option<Arc<S>> + Send + Sync + 'static,
    {
        self.endpoint.validate = Arc::new(f);
        self
    }

    /// Receive data from admitted peers
    ///
    /// Takes effect at the next [`init`](Self::init). Until set, data is logged and dropped.
    pub fn on_data<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&[u8], &Arc<S>, PeerHandle, u32) -> i32 + Send + Sync + 'static,
    {
        self.data = Arc::new(f);
        self
    }

    /// Receive out-of-band messages from admitted peers (optional)
    pub fn on_oob_data<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&[u8], &Arc<S>, PeerHandle) + Send + Sync + 'static,
    {
        self.endpoint.oob = Some(Arc::new(f));
        self
    }

    /// Listen on every URL (`rist://@host:port` or `rist6://@[host]:port`) and start
    ///
    /// All peers get the fixed receiver weight. On error the receiver is left
    /// uninitialized.
    pub fn init<U: AsRef<str>>(&self, urls: &[U], settings: &Settings) -> crate::Result<()> {
        let peers: Vec<(&str, u32)> = urls
            .iter()
            .map(|url| (url.as_ref(), RECEIVER_PEER_WEIGHT))
            .collect();
        self.endpoint
            .init(&peers, settings, Some(Arc::clone(&self.data)))
    }
}

impl<S> RistReceiver<S> {
    /// Stop the worker, release the transport context and forget every peer
    pub fn destroy(&self) -> crate::Result<()> {
        self.endpoint.destroy()
    }

    /// Whether `init` succeeded and `destroy` has not run since
    pub fn is_initialized(&self) -> bool {
        self.endpoint.is_initialized()
    }

    /// Send an out-of-band message to an admitted peer
    ///
    /// A transport failure destroys the receiver.
    pub fn send_oob_data(&self, peer: PeerHandle, payload: &[u8]) -> crate::Result<()> {
        self.endpoint.send_oob_data(peer, payload)
    }

    /// Disconnect one admitted peer
    pub fn close_client_connection(&self, peer: PeerHandle) -> crate::Result<()> {
        self.endpoint.close_client_connection(peer)
    }

    /// Disconnect every admitted peer
    pub fn close_all_client_connections(&self) {
        self.endpoint.close_all_client_connections()
    }

    /// Inspect the admitted peers while the registry is locked
    pub fn active_clients<R>(&self, visitor: impl FnOnce(&PeerMap<S>) -> R) -> R {
        self.endpoint.registry().visit(visitor)
    }

    /// Number of admitted peers
    pub fn client_count(&self) -> usize {
        self.endpoint.registry().len()
    }

    /// Wrapper and transport versions
    pub fn version(&self) -> Version {
        self.endpoint.version()
    }

    /// Always [`Role::Receiver`]
    pub fn role(&self) -> Role {
        self.endpoint.role()
    }
}
