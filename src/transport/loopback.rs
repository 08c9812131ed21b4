// ABOUTME: In-process loopback implementation of the RIST transport seam
// ABOUTME: Worker threads fed by crossbeam queues, synthetic peers, fault injection and call records

use super::{
    Admission, DataBlock, LogLevel, LogSink, LoggingSettings, OobBlock, PeerHandle, Profile,
    RistBackend, RistContext, Role, TransportError, TransportEvents,
};
use crate::endpoint::{PeerConfig, PSK_KEY_SIZE};
use crate::error::Error;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// librist API version the loopback mimics
const API_VERSION: (u32, u32) = (4, 2);
/// First port handed to connecting loopback peers
const EPHEMERAL_PORT_BASE: u32 = 40000;
/// Address every loopback sender connects from
const LOOPBACK_IP: &str = "127.0.0.1";

const STATUS_FAILED: i32 = -1;
const STATUS_ADDR_IN_USE: i32 = -98;
const STATUS_CONN_REFUSED: i32 = -111;

/// Transport operations, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`RistBackend::configure_logging`]
    ConfigureLogging,
    /// [`RistBackend::create_context`]
    CreateContext,
    /// [`RistBackend::parse_address`]
    ParseAddress,
    /// [`RistContext::create_peer`]
    CreatePeer,
    /// [`RistContext::destroy_peer`]
    DestroyPeer,
    /// [`RistContext::set_max_jitter`]
    SetMaxJitter,
    /// [`RistContext::set_oob_handler`]
    SetOobHandler,
    /// [`RistContext::set_data_handler`]
    SetDataHandler,
    /// [`RistContext::set_auth_handler`]
    SetAuthHandler,
    /// [`RistContext::start`]
    Start,
    /// [`RistContext::write_data`]
    WriteData,
    /// [`RistContext::write_oob`]
    WriteOob,
    /// [`RistContext::destroy`]
    Destroy,
}

/// A data write seen by the loopback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    /// Payload length offered
    pub len: usize,
    /// Flow id of the block
    pub flow_id: u32,
}

/// Work items for a context's worker thread
enum Event {
    Connect {
        remote_ip: String,
        remote_port: u16,
        local_ip: String,
        local_port: u16,
        peer: PeerHandle,
        reply: Sender<Admission>,
    },
    Disconnect(PeerHandle),
    Data {
        peer: PeerHandle,
        flow_id: u32,
        payload: Vec<u8>,
        reply: Option<Sender<crate::Result<()>>>,
    },
    Oob {
        peer: PeerHandle,
        payload: Vec<u8>,
        reply: Option<Sender<()>>,
    },
    Flush(Sender<()>),
    Shutdown,
}

/// Host and port of a loopback URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct Address {
    listen: bool,
    host: String,
    port: u16,
}

impl Address {
    fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split `rist://[@]host:port[?query]` or `rist6://[@][host]:port[?query]`
fn split_url(url: &str) -> Option<(Address, Option<&str>)> {
    let (ipv6, rest) = if let Some(rest) = url.strip_prefix("rist6://") {
        (true, rest)
    } else {
        (false, url.strip_prefix("rist://")?)
    };

    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, Some(query)),
        None => (rest, None),
    };
    let (listen, authority) = match authority.strip_prefix('@') {
        Some(authority) => (true, authority),
        None => (false, authority),
    };

    let (host, port) = if ipv6 {
        let inner = authority.strip_prefix('[')?;
        let (host, port) = inner.split_once("]:")?;
        (host, port)
    } else {
        authority.rsplit_once(':')?
    };
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok().filter(|p| *p > 0)?;

    Some((
        Address {
            listen,
            host: host.to_string(),
            port,
        },
        query,
    ))
}

/// Apply `key=value` URL overrides to a peer config
fn apply_query(query: &str, config: &mut PeerConfig) -> Result<(), String> {
    fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
        value.parse().map_err(|_| format!("bad value for {}: {}", key, value))
    }

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("malformed parameter: {}", pair))?;
        match key {
            "cname" => {
                config.cname.copy_from(value);
            }
            "secret" => {
                config.secret.copy_from(value);
                config.key_size = if value.is_empty() { 0 } else { PSK_KEY_SIZE };
            }
            "weight" => config.weight = num(key, value)?,
            "buffer" => {
                let ms = num(key, value)?;
                config.recovery_length_min = ms;
                config.recovery_length_max = ms;
            }
            "rtt-min" => config.recovery_rtt_min = num(key, value)?,
            "rtt-max" => config.recovery_rtt_max = num(key, value)?,
            "bandwidth" => config.recovery_maxbitrate = num(key, value)?,
            "return-bandwidth" => config.recovery_maxbitrate_return = num(key, value)?,
            "virt-dst-port" => config.virt_dst_port = num(key, value)?,
            _ => return Err(format!("unknown parameter: {}", key)),
        }
    }
    Ok(())
}

struct Listener {
    context: Weak<LoopbackContext>,
}

/// Host a listener must bind to accept connections for any address of `host`'s family
fn wildcard_for(host: &str) -> &'static str {
    if host.contains(':') {
        "::"
    } else {
        "0.0.0.0"
    }
}

/// State shared by every context created from one backend
#[derive(Default)]
struct Hub {
    next_handle: AtomicU64,
    next_port: AtomicU32,
    live_contexts: AtomicUsize,
    listeners: Mutex<HashMap<String, Listener>>,
    faults: Mutex<HashSet<Op>>,
    calls: Mutex<HashMap<Op, usize>>,
    write_limit: Mutex<Option<usize>>,
    peer_configs: Mutex<Vec<PeerConfig>>,
    writes: Mutex<Vec<WriteRecord>>,
    logging: Mutex<LoggingSettings>,
}

impl Hub {
    /// Count a call and fail it if a fault is injected
    fn call(&self, op: Op) -> Result<(), TransportError> {
        *self.calls.lock().entry(op).or_default() += 1;
        if self.faults.lock().contains(&op) {
            self.emit(LogLevel::Error, &format!("injected failure in {:?}", op));
            return Err(TransportError(STATUS_FAILED));
        }
        Ok(())
    }

    fn mint_handle(&self) -> PeerHandle {
        PeerHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn ephemeral_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % (65536 - EPHEMERAL_PORT_BASE);
        (EPHEMERAL_PORT_BASE + offset) as u16
    }

    /// Live listener for `host:port`, falling back to one bound to the wildcard address
    fn listener(&self, host: &str, port: u16) -> Option<Arc<LoopbackContext>> {
        let listeners = self.listeners.lock();
        let exact = format!("{}:{}", host, port);
        let wildcard = format!("{}:{}", wildcard_for(host), port);
        [exact, wildcard]
            .iter()
            .filter_map(|key| listeners.get(key))
            .find_map(|listener| listener.context.upgrade())
    }

    /// Emit a transport log line through the configured sink
    fn emit(&self, level: LogLevel, message: &str) {
        let logging = self.logging.lock().clone();
        if level == LogLevel::Disable || logging.level == LogLevel::Disable || level > logging.level {
            return;
        }
        match &logging.sink {
            LogSink::Facade => {
                if let Some(level) = level.to_log() {
                    log::log!(target: "ristnet::transport", level, "{}", message);
                }
            }
            LogSink::Callback(sink) => sink(level, message),
        }
    }
}

/// In-process RIST backend
///
/// Contexts created from the same backend value (or its clones) can reach each other:
/// a sender URL `rist://host:port` connects to the receiver listening on
/// `rist://@host:port`, or on the wildcard `rist://@0.0.0.0:port`
/// (`rist6://@[::]:port` for IPv6). Nothing touches the network.
#[derive(Clone, Default)]
pub struct LoopbackBackend {
    hub: Arc<Hub>,
}

impl LoopbackBackend {
    /// Create a backend with its own, empty address space
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail until [`heal`](Self::heal) is called
    pub fn fail(&self, op: Op) {
        self.hub.faults.lock().insert(op);
    }

    /// Stop failing `op`
    pub fn heal(&self, op: Op) {
        self.hub.faults.lock().remove(&op);
    }

    /// Cap the byte count reported by data writes
    pub fn limit_writes(&self, limit: Option<usize>) {
        *self.hub.write_limit.lock() = limit;
    }

    /// How often `op` has been called, failed calls included
    pub fn calls(&self, op: Op) -> usize {
        self.hub.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Every peer config passed to `create_peer`, in call order
    pub fn peer_configs(&self) -> Vec<PeerConfig> {
        self.hub.peer_configs.lock().clone()
    }

    /// Every data write, in call order
    pub fn data_writes(&self) -> Vec<WriteRecord> {
        self.hub.writes.lock().clone()
    }

    /// Contexts created and not yet destroyed
    pub fn live_contexts(&self) -> usize {
        self.hub.live_contexts.load(Ordering::SeqCst)
    }

    /// Connect a synthetic remote peer from `ip:port` to a listening context
    ///
    /// `listen` is either a listener URL or its `host:port`. The call waits until the
    /// listener's auth handler has answered. A rejected peer is still returned so its
    /// traffic can be replayed against the endpoint.
    pub fn connect_synthetic(
        &self,
        listen: &str,
        ip: &str,
        port: u16,
    ) -> Result<SyntheticPeer, TransportError> {
        let (host, local_port) = match split_url(listen) {
            Some((address, _)) => (address.host, address.port),
            None => {
                let (host, port) = listen.rsplit_once(':').ok_or(TransportError(STATUS_FAILED))?;
                let port = port.parse::<u16>().map_err(|_| TransportError(STATUS_FAILED))?;
                (host.trim_matches(&['[', ']'][..]).to_string(), port)
            }
        };
        let context = self
            .hub
            .listener(&host, local_port)
            .ok_or(TransportError(STATUS_CONN_REFUSED))?;

        let peer = self.hub.mint_handle();
        let admission = context
            .request_connect(ip, port, &host, local_port, peer)
            .ok_or(TransportError(STATUS_CONN_REFUSED))?;

        let inbox = Arc::new(Mutex::new(Vec::new()));
        if admission == Admission::Accept {
            context.link(peer, Link::Synthetic(Arc::clone(&inbox)));
        }

        Ok(SyntheticPeer {
            context: Arc::downgrade(&context),
            peer,
            admission,
            inbox,
        })
    }
}

impl RistBackend for LoopbackBackend {
    fn api_version(&self) -> (u32, u32) {
        API_VERSION
    }

    fn configure_logging(&self, logging: &LoggingSettings) -> Result<(), TransportError> {
        self.hub.call(Op::ConfigureLogging)?;
        *self.hub.logging.lock() = logging.clone();
        Ok(())
    }

    fn create_context(
        &self,
        role: Role,
        profile: Profile,
        _logging: &LoggingSettings,
    ) -> Result<Arc<dyn RistContext>, TransportError> {
        self.hub.call(Op::CreateContext)?;

        let (queue, inbox) = channel::unbounded();
        let hub = Arc::clone(&self.hub);
        let context = Arc::new_cyclic(|me| LoopbackContext {
            hub,
            role,
            me: me.clone(),
            queue,
            inbox: Mutex::new(Some(inbox)),
            state: Mutex::new(ContextState::default()),
        });

        self.hub.live_contexts.fetch_add(1, Ordering::SeqCst);
        self.hub
            .emit(LogLevel::Info, &format!("{} context created ({:?} profile)", role.as_str(), profile));
        Ok(context)
    }

    fn parse_address(&self, url: &str, config: &mut PeerConfig) -> Result<(), TransportError> {
        self.hub.call(Op::ParseAddress)?;

        let Some((_, query)) = split_url(url) else {
            self.hub.emit(LogLevel::Error, &format!("invalid URL: {}", url));
            return Err(TransportError(STATUS_FAILED));
        };
        if let Some(query) = query {
            if let Err(e) = apply_query(query, config) {
                self.hub.emit(LogLevel::Error, &format!("{}: {}", url, e));
                return Err(TransportError(STATUS_FAILED));
            }
        }
        config.address = url.to_string();
        Ok(())
    }
}

/// Association target of a local peer handle
#[derive(Clone)]
enum Link {
    /// A peer inside another loopback context
    Remote(Weak<LoopbackContext>, PeerHandle),
    /// A synthetic peer; OOB messages for it are collected here
    Synthetic(Arc<Mutex<Vec<Vec<u8>>>>),
}

#[derive(Default)]
struct Handlers {
    oob: Option<Arc<dyn TransportEvents>>,
    data: Option<Arc<dyn TransportEvents>>,
    auth: Option<Arc<dyn TransportEvents>>,
}

#[derive(Default)]
struct ContextState {
    handlers: Handlers,
    /// Peers created through `create_peer`
    local: HashMap<PeerHandle, Address>,
    /// Established associations
    links: HashMap<PeerHandle, Link>,
    max_jitter: Option<u32>,
    worker: Option<JoinHandle<()>>,
    started: bool,
    destroyed: bool,
}

struct LoopbackContext {
    hub: Arc<Hub>,
    role: Role,
    me: Weak<LoopbackContext>,
    queue: Sender<Event>,
    inbox: Mutex<Option<Receiver<Event>>>,
    state: Mutex<ContextState>,
}

impl LoopbackContext {
    fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.started && !state.destroyed
    }

    fn post(&self, event: Event) -> bool {
        self.queue.send(event).is_ok()
    }

    fn link(&self, peer: PeerHandle, link: Link) {
        self.state.lock().links.insert(peer, link);
    }

    /// Ask this context's auth handler about a connecting peer and wait for the answer
    fn request_connect(
        &self,
        remote_ip: &str,
        remote_port: u16,
        local_ip: &str,
        local_port: u16,
        peer: PeerHandle,
    ) -> Option<Admission> {
        if !self.is_running() {
            return None;
        }
        let (reply, answer) = channel::bounded(1);
        let posted = self.post(Event::Connect {
            remote_ip: remote_ip.to_string(),
            remote_port,
            local_ip: local_ip.to_string(),
            local_port,
            peer,
            reply,
        });
        if !posted {
            return None;
        }
        answer.recv().ok()
    }

    /// Associate every outbound peer with its listener
    fn connect_outbound(&self) {
        let targets: Vec<(PeerHandle, Address)> = self
            .state
            .lock()
            .local
            .iter()
            .filter(|(_, endpoint)| !endpoint.listen)
            .map(|(peer, endpoint)| (*peer, endpoint.clone()))
            .collect();

        for (local_peer, target) in targets {
            let (host, port) = (target.host.as_str(), target.port);
            let Some(remote) = self.hub.listener(host, port) else {
                self.hub
                    .emit(LogLevel::Warn, &format!("no listener at {}, {} stays idle", target.key(), local_peer));
                continue;
            };

            let remote_peer = self.hub.mint_handle();
            let local_port = self.hub.ephemeral_port();
            let theirs = remote.request_connect(LOOPBACK_IP, local_port, host, port, remote_peer);
            if theirs != Some(Admission::Accept) {
                self.hub
                    .emit(LogLevel::Notice, &format!("{} refused {}", target.key(), local_peer));
                continue;
            }

            let ours = self.request_connect(host, port, LOOPBACK_IP, local_port, local_peer);
            if ours == Some(Admission::Accept) {
                remote.link(remote_peer, Link::Remote(self.me.clone(), local_peer));
                self.link(local_peer, Link::Remote(Arc::downgrade(&remote), remote_peer));
            } else {
                remote.post(Event::Disconnect(remote_peer));
            }
        }
    }

    fn teardown(&self) {
        let (worker, links, listen_keys) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.started = false;
            state.handlers = Handlers::default();
            let listen_keys: Vec<String> = state
                .local
                .values()
                .filter(|endpoint| endpoint.listen)
                .map(Address::key)
                .collect();
            state.local.clear();
            let links: Vec<Link> = state.links.drain().map(|(_, link)| link).collect();
            (state.worker.take(), links, listen_keys)
        };

        self.hub.listeners.lock().retain(|key, listener| {
            !(listen_keys.contains(key) && Weak::ptr_eq(&listener.context, &self.me))
        });

        for link in links {
            if let Link::Remote(remote, remote_peer) = link {
                if let Some(remote) = remote.upgrade() {
                    remote.post(Event::Disconnect(remote_peer));
                }
            }
        }

        self.post(Event::Shutdown);
        if let Some(worker) = worker {
            // destroy from inside a callback cannot wait for its own thread
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }

        self.hub.live_contexts.fetch_sub(1, Ordering::SeqCst);
        self.hub
            .emit(LogLevel::Info, &format!("{} context destroyed", self.role.as_str()));
    }
}

impl RistContext for LoopbackContext {
    fn create_peer(&self, config: &PeerConfig) -> Result<PeerHandle, TransportError> {
        self.hub.call(Op::CreatePeer)?;

        let Some((endpoint, _)) = split_url(&config.address) else {
            self.hub
                .emit(LogLevel::Error, &format!("peer config without a valid address: {:?}", config.address));
            return Err(TransportError(STATUS_FAILED));
        };

        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            self.hub.emit(LogLevel::Error, "create_peer on a destroyed context");
            return Err(TransportError(STATUS_FAILED));
        }

        if endpoint.listen {
            let mut listeners = self.hub.listeners.lock();
            let key = endpoint.key();
            if listeners
                .get(&key)
                .is_some_and(|listener| listener.context.strong_count() > 0)
            {
                drop(listeners);
                self.hub.emit(LogLevel::Error, &format!("address in use: {}", key));
                return Err(TransportError(STATUS_ADDR_IN_USE));
            }
            listeners.insert(
                key,
                Listener {
                    context: self.me.clone(),
                },
            );
        }

        let peer = self.hub.mint_handle();
        self.hub.peer_configs.lock().push(config.clone());
        state.local.insert(peer, endpoint);
        Ok(peer)
    }

    fn destroy_peer(&self, peer: PeerHandle) -> Result<(), TransportError> {
        self.hub.call(Op::DestroyPeer)?;

        let (link, local) = {
            let mut state = self.state.lock();
            (state.links.remove(&peer), state.local.remove(&peer))
        };
        if link.is_none() && local.is_none() {
            return Err(TransportError(STATUS_FAILED));
        }
        if let Some(Link::Remote(remote, remote_peer)) = link {
            if let Some(remote) = remote.upgrade() {
                remote.post(Event::Disconnect(remote_peer));
            }
        }
        Ok(())
    }

    fn set_max_jitter(&self, max_jitter_ms: u32) -> Result<(), TransportError> {
        self.hub.call(Op::SetMaxJitter)?;
        self.state.lock().max_jitter = Some(max_jitter_ms);
        Ok(())
    }

    fn set_oob_handler(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError> {
        self.hub.call(Op::SetOobHandler)?;
        self.state.lock().handlers.oob = Some(events);
        Ok(())
    }

    fn set_data_handler(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError> {
        self.hub.call(Op::SetDataHandler)?;
        if self.role != Role::Receiver {
            return Err(TransportError(STATUS_FAILED));
        }
        self.state.lock().handlers.data = Some(events);
        Ok(())
    }

    fn set_auth_handler(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError> {
        self.hub.call(Op::SetAuthHandler)?;
        self.state.lock().handlers.auth = Some(events);
        Ok(())
    }

    fn start(&self) -> Result<(), TransportError> {
        self.hub.call(Op::Start)?;

        let inbox = self.inbox.lock().take().ok_or(TransportError(STATUS_FAILED))?;
        let me = self.me.clone();
        let worker = thread::Builder::new()
            .name(format!("rist-loopback-{}", self.role.as_str()))
            .spawn(move || run_worker(me, inbox))
            .map_err(|_| TransportError(STATUS_FAILED))?;

        {
            let mut state = self.state.lock();
            state.worker = Some(worker);
            state.started = true;
        }

        if self.role == Role::Sender {
            self.connect_outbound();
        }
        Ok(())
    }

    fn write_data(&self, block: &DataBlock<'_>) -> Result<usize, TransportError> {
        self.hub.call(Op::WriteData)?;
        if self.role != Role::Sender || !self.is_running() {
            return Err(TransportError(STATUS_FAILED));
        }

        self.hub.writes.lock().push(WriteRecord {
            len: block.payload.len(),
            flow_id: block.flow_id,
        });

        let remotes: Vec<(Weak<LoopbackContext>, PeerHandle)> = self
            .state
            .lock()
            .links
            .values()
            .filter_map(|link| match link {
                Link::Remote(remote, peer) => Some((remote.clone(), *peer)),
                Link::Synthetic(_) => None,
            })
            .collect();
        for (remote, peer) in remotes {
            if let Some(remote) = remote.upgrade() {
                remote.post(Event::Data {
                    peer,
                    flow_id: block.flow_id,
                    payload: block.payload.to_vec(),
                    reply: None,
                });
            }
        }

        let written = match *self.hub.write_limit.lock() {
            Some(limit) => block.payload.len().min(limit),
            None => block.payload.len(),
        };
        Ok(written)
    }

    fn write_oob(&self, block: &OobBlock<'_>) -> Result<(), TransportError> {
        self.hub.call(Op::WriteOob)?;
        if !self.is_running() {
            return Err(TransportError(STATUS_FAILED));
        }

        let link = self.state.lock().links.get(&block.peer).cloned();
        match link {
            Some(Link::Remote(remote, peer)) => {
                if let Some(remote) = remote.upgrade() {
                    remote.post(Event::Oob {
                        peer,
                        payload: block.payload.to_vec(),
                        reply: None,
                    });
                }
                Ok(())
            }
            Some(Link::Synthetic(inbox)) => {
                inbox.lock().push(block.payload.to_vec());
                Ok(())
            }
            None => {
                self.hub
                    .emit(LogLevel::Error, &format!("OOB write to unknown {}", block.peer));
                Err(TransportError(STATUS_FAILED))
            }
        }
    }

    fn destroy(&self) -> Result<(), TransportError> {
        let status = self.hub.call(Op::Destroy);
        self.teardown();
        status
    }
}

impl Drop for LoopbackContext {
    fn drop(&mut self) {
        if !self.state.get_mut().destroyed {
            self.hub.live_contexts.fetch_sub(1, Ordering::SeqCst);
            self.hub
                .listeners
                .lock()
                .retain(|_, listener| listener.context.strong_count() > 0);
        }
    }
}

/// Worker loop: dispatch queued events until shutdown or until the context is gone
fn run_worker(context: Weak<LoopbackContext>, inbox: Receiver<Event>) {
    for event in inbox.iter() {
        let Some(context) = context.upgrade() else {
            break;
        };
        match event {
            Event::Shutdown => break,
            Event::Flush(reply) => {
                let _ = reply.send(());
            }
            Event::Connect {
                remote_ip,
                remote_port,
                local_ip,
                local_port,
                peer,
                reply,
            } => {
                let auth = context.state.lock().handlers.auth.clone();
                let admission = match auth {
                    Some(auth) => auth.on_connect(&remote_ip, remote_port, &local_ip, local_port, peer),
                    None => Admission::Accept,
                };
                let _ = reply.send(admission);
            }
            Event::Disconnect(peer) => {
                let auth = {
                    let mut state = context.state.lock();
                    state.links.remove(&peer);
                    state.handlers.auth.clone()
                };
                if let Some(auth) = auth {
                    auth.on_disconnect(peer);
                }
            }
            Event::Data {
                peer,
                flow_id,
                payload,
                reply,
            } => {
                let data = context.state.lock().handlers.data.clone();
                let block = DataBlock {
                    payload: &payload,
                    peer: Some(peer),
                    flow_id,
                };
                let result = match data {
                    Some(data) => data.on_data(&block),
                    None => Err(Error::NoDataHandler),
                };
                if let Err(e) = &result {
                    context
                        .hub
                        .emit(LogLevel::Debug, &format!("data from {} not delivered: {}", peer, e));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Event::Oob {
                peer,
                payload,
                reply,
            } => {
                let oob = context.state.lock().handlers.oob.clone();
                if let Some(oob) = oob {
                    oob.on_oob(&OobBlock {
                        peer,
                        payload: &payload,
                    });
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }
}

/// A remote peer injected into a listening loopback context
///
/// Every call waits until the listener's worker has processed it.
pub struct SyntheticPeer {
    context: Weak<LoopbackContext>,
    peer: PeerHandle,
    admission: Admission,
    inbox: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SyntheticPeer {
    /// Handle the listener knows this peer by
    pub fn handle(&self) -> PeerHandle {
        self.peer
    }

    /// The listener's answer at connect time
    pub fn admission(&self) -> Admission {
        self.admission
    }

    fn running_context(&self) -> crate::Result<Arc<LoopbackContext>> {
        self.context
            .upgrade()
            .filter(|context| context.is_running())
            .ok_or(Error::Transport {
                op: "synthetic_peer",
                source: TransportError(STATUS_CONN_REFUSED),
            })
    }

    /// Deliver a data block and return the listener's dispatch status
    pub fn send_data(&self, payload: &[u8], flow_id: u32) -> crate::Result<()> {
        let context = self.running_context()?;
        let (reply, answer) = channel::bounded(1);
        context.post(Event::Data {
            peer: self.peer,
            flow_id,
            payload: payload.to_vec(),
            reply: Some(reply),
        });
        drop(context);
        answer.recv().map_err(|_| Error::Transport {
            op: "synthetic_peer",
            source: TransportError(STATUS_CONN_REFUSED),
        })?
    }

    /// Deliver an out-of-band message
    pub fn send_oob(&self, payload: &[u8]) -> crate::Result<()> {
        let context = self.running_context()?;
        let (reply, answer) = channel::bounded(1);
        context.post(Event::Oob {
            peer: self.peer,
            payload: payload.to_vec(),
            reply: Some(reply),
        });
        drop(context);
        answer.recv().map_err(|_| Error::Transport {
            op: "synthetic_peer",
            source: TransportError(STATUS_CONN_REFUSED),
        })
    }

    /// Report the association as gone
    pub fn disconnect(&self) -> crate::Result<()> {
        let context = self.running_context()?;
        let (reply, answer) = channel::bounded(1);
        context.post(Event::Disconnect(self.peer));
        context.post(Event::Flush(reply));
        drop(context);
        answer.recv().map_err(|_| Error::Transport {
            op: "synthetic_peer",
            source: TransportError(STATUS_CONN_REFUSED),
        })
    }

    /// Out-of-band messages the listener sent to this peer
    pub fn received_oob(&self) -> Vec<Vec<u8>> {
        self.inbox.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Settings;

    #[test]
    fn test_split_url_forms() {
        let (endpoint, query) = split_url("rist://@0.0.0.0:5000").unwrap();
        assert!(endpoint.listen);
        assert_eq!(endpoint.key(), "0.0.0.0:5000");
        assert!(query.is_none());

        let (endpoint, query) = split_url("rist6://[::1]:6000?cname=a").unwrap();
        assert!(!endpoint.listen);
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 6000);
        assert_eq!(query, Some("cname=a"));

        assert!(split_url("udp://1.2.3.4:5").is_none());
        assert!(split_url("rist://1.2.3.4").is_none());
        assert!(split_url("rist://:5000").is_none());
        assert!(split_url("rist6://::1:5000").is_none());
    }

    #[test]
    fn test_parse_address_applies_overrides() {
        let backend = LoopbackBackend::new();
        let mut config = PeerConfig::from_settings(&Settings::default(), 5);

        backend
            .parse_address("rist://10.0.0.2:5000?weight=9&buffer=250&cname=cam1&secret=abc", &mut config)
            .unwrap();

        assert_eq!(config.address, "rist://10.0.0.2:5000?weight=9&buffer=250&cname=cam1&secret=abc");
        assert_eq!(config.weight, 9);
        assert_eq!(config.recovery_length_min, 250);
        assert_eq!(config.recovery_length_max, 250);
        assert_eq!(config.cname.as_bytes(), b"cam1");
        assert_eq!(config.key_size, PSK_KEY_SIZE);
        assert_eq!(backend.calls(Op::ParseAddress), 1);
    }

    #[test]
    fn test_parse_address_rejects_unknown_parameter() {
        let backend = LoopbackBackend::new();
        let mut config = PeerConfig::from_settings(&Settings::default(), 5);

        assert!(backend.parse_address("rist://10.0.0.2:5000?bogus=1", &mut config).is_err());
        assert!(backend.parse_address("not a url", &mut config).is_err());
        assert!(config.address.is_empty());
    }

    #[test]
    fn test_injected_fault_and_heal() {
        let backend = LoopbackBackend::new();
        backend.fail(Op::ConfigureLogging);
        assert!(backend.configure_logging(&LoggingSettings::default()).is_err());
        backend.heal(Op::ConfigureLogging);
        assert!(backend.configure_logging(&LoggingSettings::default()).is_ok());
        assert_eq!(backend.calls(Op::ConfigureLogging), 2);
    }

    #[test]
    fn test_listen_address_in_use() {
        let backend = LoopbackBackend::new();
        let logging = LoggingSettings::default();
        let first = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();
        let second = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();

        let mut config = PeerConfig::from_settings(&Settings::default(), 5);
        backend.parse_address("rist://@127.0.0.1:7000", &mut config).unwrap();

        assert!(first.create_peer(&config).is_ok());
        assert_eq!(second.create_peer(&config), Err(TransportError(STATUS_ADDR_IN_USE)));

        first.destroy().unwrap();
        assert!(second.create_peer(&config).is_ok());
        second.destroy().unwrap();
        assert_eq!(backend.live_contexts(), 0);
    }

    #[test]
    fn test_log_sink_callback_filters_by_level() {
        let backend = LoopbackBackend::new();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let logging = LoggingSettings {
            level: LogLevel::Warn,
            sink: LogSink::Callback(Arc::new(move |level: LogLevel, line: &str| {
                sink_lines.lock().push((level, line.to_string()));
            })),
        };
        backend.configure_logging(&logging).unwrap();

        backend.hub.emit(LogLevel::Info, "quiet");
        backend.hub.emit(LogLevel::Error, "loud");

        let lines = lines.lock();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (LogLevel::Error, "loud".to_string()));
    }

    fn listen_config(backend: &LoopbackBackend, url: &str) -> PeerConfig {
        let mut config = PeerConfig::from_settings(&Settings::default(), 5);
        backend.parse_address(url, &mut config).unwrap();
        config
    }

    #[test]
    fn test_destroyed_context_refuses_peers() {
        let backend = LoopbackBackend::new();
        let logging = LoggingSettings::default();
        let stale = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();
        let config = listen_config(&backend, "rist://@127.0.0.1:7100");

        stale.destroy().unwrap();
        assert_eq!(stale.create_peer(&config), Err(TransportError(STATUS_FAILED)));

        let fresh = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();
        assert!(fresh.create_peer(&config).is_ok());
        fresh.destroy().unwrap();
    }

    #[test]
    fn test_wildcard_listener_accepts_any_host() {
        let backend = LoopbackBackend::new();
        let logging = LoggingSettings::default();
        let v4 = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();
        let v6 = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();
        v4.create_peer(&listen_config(&backend, "rist://@0.0.0.0:7200")).unwrap();
        v6.create_peer(&listen_config(&backend, "rist6://@[::]:7200")).unwrap();
        v4.start().unwrap();
        v6.start().unwrap();

        let peer = backend.connect_synthetic("rist://127.0.0.1:7200", "10.0.0.1", 1000).unwrap();
        assert_eq!(peer.admission(), Admission::Accept);
        let peer = backend.connect_synthetic("[::1]:7200", "::1", 1000).unwrap();
        assert_eq!(peer.admission(), Admission::Accept);
        assert!(backend.connect_synthetic("127.0.0.1:7201", "10.0.0.1", 1000).is_err());

        v4.destroy().unwrap();
        v6.destroy().unwrap();
    }

    #[test]
    fn test_data_without_handler_is_reported() {
        let backend = LoopbackBackend::new();
        let logging = LoggingSettings::default();
        let context = backend.create_context(Role::Receiver, Profile::Main, &logging).unwrap();
        context.create_peer(&listen_config(&backend, "rist://@127.0.0.1:7300")).unwrap();
        context.start().unwrap();

        let peer = backend.connect_synthetic("127.0.0.1:7300", "10.0.0.1", 1000).unwrap();
        assert!(matches!(peer.send_data(b"x", 0), Err(Error::NoDataHandler)));
        context.destroy().unwrap();
    }
}
