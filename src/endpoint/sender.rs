// ABOUTME: Sender facade: connects to weighted RIST peers and pushes data
// ABOUTME: Wraps the shared endpoint lifecycle with data egress and short-write handling

use crate::endpoint::lifecycle::{Endpoint, Version};
use crate::endpoint::registry::PeerMap;
use crate::endpoint::settings::Settings;
use crate::error::Error;
use crate::transport::{DataBlock, PeerHandle, RistBackend, Role};
use std::sync::Arc;

/// RIST sender connecting to one or more peers
///
/// Peers the remote side accepts are offered to the validate callback like receiver
/// peers; admitted ones can receive out-of-band messages. The same re-entrancy rule as
/// [`RistReceiver`](crate::RistReceiver) applies to callbacks.
pub struct RistSender<S> {
    endpoint: Endpoint<S>,
}

impl<S: Send + Sync + 'static> RistSender<S> {
    /// Create an uninitialized sender on top of `backend`
    pub fn new(backend: Arc<dyn RistBackend>) -> Self {
        Self {
            endpoint: Endpoint::new(Role::Sender, backend),
        }
    }

    /// Decide admission of peers as they connect
    ///
    /// Takes effect at the next [`init`](Self::init). Until set, every peer is rejected.
    pub fn on_validate_connection<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&str, u16) -> Option<Arc<S>> + Send + Sync + 'static,
    {
        self.endpoint.validate = Arc::new(f);
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

    /// Connect to every `(url, weight)` and start
    ///
    /// Weights are passed to the transport unchanged, 0 included.
    pub fn init<U: AsRef<str>>(&self, peers: &[(U, u32)], settings: &Settings) -> crate::Result<()> {
        let peers: Vec<(&str, u32)> = peers
            .iter()
            .map(|(url, weight)| (url.as_ref(), *weight))
            .collect();
        self.endpoint.init(&peers, settings, None)
    }
}

impl<S> RistSender<S> {
    /// Stop the worker, release the transport context and forget every peer
    pub fn destroy(&self) -> crate::Result<()> {
        self.endpoint.destroy()
    }

    /// Whether `init` succeeded and `destroy` has not run since
    pub fn is_initialized(&self) -> bool {
        self.endpoint.is_initialized()
    }

    /// Send `payload` on `flow_id`
    ///
    /// A transport write failure destroys the sender. A short write returns
    /// [`Error::ShortWrite`] and leaves it running.
    pub fn send_data(&self, payload: &[u8], flow_id: u32) -> crate::Result<()> {
        let context = self.endpoint.context()?;
        let block = DataBlock {
            payload,
            flow_id,
            ..Default::default()
        };

        let written = match context.write_data(&block) {
            Ok(written) => written,
            Err(source) => {
                log::error!("rist_sender_data_write failed: {}", source);
                let _ = self.endpoint.destroy();
                return Err(Error::Transport {
                    op: "data_write",
                    source,
                });
            }
        };

        if written != payload.len() {
            log::error!("Did send {} bytes, out of {} bytes.", written, payload.len());
            return Err(Error::ShortWrite {
                written,
                expected: payload.len(),
            });
        }
        Ok(())
    }

    /// Send an out-of-band message to an admitted peer
    ///
    /// A transport failure destroys the sender.
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

    /// Always [`Role::Sender`]
    pub fn role(&self) -> Role {
        self.endpoint.role()
    }
}
