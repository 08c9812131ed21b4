// ABOUTME: Callback dispatch layer invoked by the transport worker
// ABOUTME: Admission on connect, silent disconnect, and registry-checked data/OOB routing

use crate::endpoint::registry::PeerRegistry;
use crate::error::Error;
use crate::transport::{Admission, DataBlock, OobBlock, PeerHandle, Role, TransportEvents};
use std::sync::Arc;

/// Decides whether a connecting peer is admitted
///
/// Receives the remote IP and port; returning `Some` admits the peer with that state.
pub type ValidateConnection<S> = Arc<dyn Fn(&str, u16) -> Option<Arc<S>> + Send + Sync>;

/// Receives inbound data: payload, peer state, peer handle, flow id
///
/// Returns 0 on success; any other status is reported back to the transport.
pub type DataReceived<S> = Arc<dyn Fn(&[u8], &Arc<S>, PeerHandle, u32) -> i32 + Send + Sync>;

/// Receives inbound out-of-band messages: payload, peer state, peer handle
pub type OobReceived<S> = Arc<dyn Fn(&[u8], &Arc<S>, PeerHandle) + Send + Sync>;

/// Callback used until the application installs its own: rejects everyone
pub(crate) fn reject_all<S>() -> ValidateConnection<S> {
    Arc::new(|ip: &str, port: u16| {
        log::error!(
            "validate connection callback not set, will not accept connection from {}:{}",
            ip,
            port
        );
        None
    })
}

/// Callback used until the receiving application installs its own: drops data
pub(crate) fn drop_data<S>() -> DataReceived<S> {
    Arc::new(|_: &[u8], _: &Arc<S>, peer: PeerHandle, _: u32| {
        log::error!("data callback not set, data from {} is lost", peer);
        -1
    })
}

/// Dispatch hooks installed into a transport context
///
/// Built once per `init` from the callbacks set at that time.
pub(crate) struct Dispatcher<S> {
    role: Role,
    registry: PeerRegistry<S>,
    validate: ValidateConnection<S>,
    data: Option<DataReceived<S>>,
    oob: Option<OobReceived<S>>,
}

impl<S> Dispatcher<S> {
    pub(crate) fn new(
        role: Role,
        registry: PeerRegistry<S>,
        validate: ValidateConnection<S>,
        data: Option<DataReceived<S>>,
        oob: Option<OobReceived<S>>,
    ) -> Self {
        Self {
            role,
            registry,
            validate,
            data,
            oob,
        }
    }
}

impl<S: Send + Sync> TransportEvents for Dispatcher<S> {
    fn on_connect(
        &self,
        remote_ip: &str,
        remote_port: u16,
        local_ip: &str,
        local_port: u16,
        peer: PeerHandle,
    ) -> Admission {
        match (self.validate)(remote_ip, remote_port) {
            Some(state) => {
                self.registry.insert(peer, state);
                log::debug!(
                    "{} accepted {}:{} on {}:{} as {}",
                    self.role.as_str(),
                    remote_ip,
                    remote_port,
                    local_ip,
                    local_port,
                    peer
                );
                Admission::Accept
            }
            None => {
                log::debug!(
                    "{} rejected {}:{} ({})",
                    self.role.as_str(),
                    remote_ip,
                    remote_port,
                    peer
                );
                Admission::Reject
            }
        }
    }

    fn on_disconnect(&self, peer: PeerHandle) {
        self.registry.erase(peer);
    }

    fn on_data(&self, block: &DataBlock<'_>) -> crate::Result<()> {
        let Some(data) = &self.data else {
            log::error!("{} has no data callback installed", self.role.as_str());
            return Err(Error::NoDataHandler);
        };
        let Some(peer) = block.peer else {
            log::error!("data block without peer, dropped");
            return Err(Error::MissingPeer);
        };

        let status = self
            .registry
            .with_peer(peer, |state| data(block.payload, state, peer, block.flow_id));

        match status {
            Some(0) => Ok(()),
            Some(status) => Err(Error::DataHandler(status)),
            None => {
                log::error!("registry <-> peer mismatch for {}", peer);
                Err(Error::UnknownPeer(peer))
            }
        }
    }

    fn on_oob(&self, block: &OobBlock<'_>) {
        // optional callback
        let Some(oob) = &self.oob else {
            return;
        };
        let delivered = self
            .registry
            .with_peer(block.peer, |state| oob(block.payload, state, block.peer));
        if delivered.is_none() {
            log::debug!("OOB data from unregistered {} dropped", block.peer);
        }
    }
}
