// ABOUTME: Endpoint lifecycle shared by receivers and senders
// ABOUTME: Context creation, per-peer setup, hook installation, teardown and egress plumbing

use crate::endpoint::dispatch::{reject_all, DataReceived, Dispatcher, OobReceived, ValidateConnection};
use crate::endpoint::registry::PeerRegistry;
use crate::endpoint::settings::{PeerConfig, Settings};
use crate::error::Error;
use crate::transport::{OobBlock, PeerHandle, RistBackend, RistContext, Role, TransportEvents};
use parking_lot::RwLock;
use std::sync::Arc;

/// Version of this wrapper
pub const WRAPPER_VERSION: u32 = 1;

/// Versions reported by [`RistReceiver::version`](crate::RistReceiver::version) and
/// [`RistSender::version`](crate::RistSender::version)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Version of this wrapper
    pub wrapper: u32,
    /// Major API version of the transport
    pub transport_major: u32,
    /// Minor API version of the transport
    pub transport_minor: u32,
}

/// State and lifecycle common to both roles
pub(crate) struct Endpoint<S> {
    role: Role,
    backend: Arc<dyn RistBackend>,
    /// `Some` exactly while initialized
    context: RwLock<Option<Arc<dyn RistContext>>>,
    registry: PeerRegistry<S>,
    pub(crate) validate: ValidateConnection<S>,
    pub(crate) oob: Option<OobReceived<S>>,
}

impl<S> Endpoint<S> {
    pub(crate) fn new(role: Role, backend: Arc<dyn RistBackend>) -> Self {
        log::debug!("RIST {} constructed", role.as_str());
        Self {
            role,
            backend,
            context: RwLock::new(None),
            registry: PeerRegistry::new(),
            validate: reject_all(),
            oob: None,
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn registry(&self) -> &PeerRegistry<S> {
        &self.registry
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.context.read().is_some()
    }

    pub(crate) fn version(&self) -> Version {
        let (transport_major, transport_minor) = self.backend.api_version();
        Version {
            wrapper: WRAPPER_VERSION,
            transport_major,
            transport_minor,
        }
    }

    /// Current context, or `NotInitialized`
    ///
    /// The read lock is released before returning so transport calls never run under it.
    pub(crate) fn context(&self) -> crate::Result<Arc<dyn RistContext>> {
        match self.context.read().as_ref() {
            Some(context) => Ok(Arc::clone(context)),
            None => {
                log::error!("RIST {} not initialised", self.role.as_str());
                Err(Error::NotInitialized)
            }
        }
    }

    pub(crate) fn destroy(&self) -> crate::Result<()> {
        // take the context out first: destroy joins the worker, which may be waiting on this lock
        let context = self.context.write().take();
        let Some(context) = context else {
            log::warn!("RIST {} not initialised", self.role.as_str());
            return Err(Error::NotInitialized);
        };

        let status = context.destroy();
        self.registry.clear();

        status.map_err(|source| {
            log::error!("rist_{}_destroy fail: {}", self.role.as_str(), source);
            Error::Transport {
                op: "destroy",
                source,
            }
        })
    }

    pub(crate) fn send_oob_data(&self, peer: PeerHandle, payload: &[u8]) -> crate::Result<()> {
        let context = self.context()?;
        let block = OobBlock { peer, payload };

        if let Err(source) = context.write_oob(&block) {
            log::error!("rist_{}_oob_write failed: {}", self.role.as_str(), source);
            let _ = self.destroy();
            return Err(Error::Transport {
                op: "oob_write",
                source,
            });
        }
        Ok(())
    }

    pub(crate) fn close_client_connection(&self, peer: PeerHandle) -> crate::Result<()> {
        let context = self.context()?;
        match self.registry.remove_with(peer, |peer| context.destroy_peer(peer)) {
            None => {
                log::error!("Could not find {}", peer);
                Err(Error::UnknownPeer(peer))
            }
            Some(Err(source)) => {
                log::error!("rist_{}_peer_destroy failed: {}", self.role.as_str(), source);
                Err(Error::Transport {
                    op: "peer_destroy",
                    source,
                })
            }
            Some(Ok(())) => Ok(()),
        }
    }

    pub(crate) fn close_all_client_connections(&self) {
        let context = self.context.read().clone();
        let role = self.role;
        self.registry.drain_with(|peer| {
            if let Some(context) = &context {
                if let Err(e) = context.destroy_peer(peer) {
                    log::error!("rist_{}_peer_destroy failed for {}: {}", role.as_str(), peer, e);
                }
            }
        });
    }
}

impl<S: Send + Sync + 'static> Endpoint<S> {
    /// Bring the endpoint up with one transport peer per `(url, weight)`
    ///
    /// On any failure after the context exists the endpoint is destroyed before the
    /// error is returned.
    pub(crate) fn init(
        &self,
        peers: &[(&str, u32)],
        settings: &Settings,
        data: Option<DataReceived<S>>,
    ) -> crate::Result<()> {
        if peers.is_empty() {
            log::error!("URL list is empty.");
            return Err(Error::EmptyUrlList);
        }
        if self.is_initialized() {
            log::error!("RIST {} already initialised", self.role.as_str());
            return Err(Error::AlreadyInitialized);
        }

        let logging = settings.logging();
        self.backend.configure_logging(&logging).map_err(|source| {
            log::error!("rist_logging_set failed: {}", source);
            Error::Transport {
                op: "logging_set",
                source,
            }
        })?;

        let context = self
            .backend
            .create_context(self.role, settings.profile, &logging)
            .map_err(|source| {
                log::error!("rist_{}_create fail: {}", self.role.as_str(), source);
                Error::Transport {
                    op: "create",
                    source,
                }
            })?;

        {
            let mut slot = self.context.write();
            if slot.is_some() {
                drop(slot);
                log::error!("RIST {} initialised concurrently", self.role.as_str());
                let _ = context.destroy();
                return Err(Error::AlreadyInitialized);
            }
            *slot = Some(Arc::clone(&context));
        }

        if let Err(e) = self.configure(context.as_ref(), peers, settings, data) {
            log::error!("RIST {} init failed: {}", self.role.as_str(), e);
            let _ = self.destroy();
            return Err(e);
        }

        log::info!("RIST {} started with {} peer(s)", self.role.as_str(), peers.len());
        Ok(())
    }

    fn configure(
        &self,
        context: &dyn RistContext,
        peers: &[(&str, u32)],
        settings: &Settings,
        data: Option<DataReceived<S>>,
    ) -> crate::Result<()> {
        for &(url, weight) in peers {
            let mut config = PeerConfig::from_settings(settings, weight);

            self.backend
                .parse_address(url, &mut config)
                .map_err(|source| Error::ParseAddress {
                    url: url.to_string(),
                    source,
                })?;

            let peer = context.create_peer(&config).map_err(|source| Error::PeerCreate {
                url: url.to_string(),
                source,
            })?;
            log::debug!("RIST {} created {} for {}", self.role.as_str(), peer, url);
        }

        if settings.max_jitter > 0 {
            context
                .set_max_jitter(settings.max_jitter)
                .map_err(Error::transport("jitter_max_set"))?;
        }

        let install_data = data.is_some();
        let dispatcher: Arc<dyn TransportEvents> = Arc::new(Dispatcher::new(
            self.role,
            self.registry.clone(),
            Arc::clone(&self.validate),
            data,
            self.oob.clone(),
        ));

        context
            .set_oob_handler(Arc::clone(&dispatcher))
            .map_err(Error::transport("oob_callback_set"))?;

        if install_data {
            context
                .set_data_handler(Arc::clone(&dispatcher))
                .map_err(Error::transport("data_callback_set"))?;
        }

        context
            .set_auth_handler(dispatcher)
            .map_err(Error::transport("auth_handler_set"))?;

        context.start().map_err(Error::transport("start"))
    }
}

impl<S> Drop for Endpoint<S> {
    fn drop(&mut self) {
        if self.is_initialized() {
            let _ = self.destroy();
        }
        log::debug!("RIST {} destruct", self.role.as_str());
    }
}
