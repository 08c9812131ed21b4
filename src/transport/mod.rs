// ABOUTME: Seam between the facades and the underlying RIST stack
// ABOUTME: Backend/context/event traits, peer handles, blocks and librist enumerations

mod loopback;

pub use loopback::{LoopbackBackend, Op, SyntheticPeer, WriteRecord};

use crate::endpoint::PeerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque identifier of a peer association, minted by the transport
///
/// Value semantics only: it is a map key, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(u64);

impl PeerHandle {
    /// Wrap a raw identifier handed out by a transport implementation
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Non-zero status returned by a transport call
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transport status {0}")]
pub struct TransportError(pub i32);

/// Which side of a RIST flow an endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listens and accepts inbound peers
    Receiver,
    /// Connects out and pushes data
    Sender,
}

impl Role {
    /// Lower-case name used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Receiver => "receiver",
            Role::Sender => "sender",
        }
    }
}

/// RIST profile
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Simple profile
    Simple = 0,
    /// Main profile
    #[default]
    Main = 1,
    /// Advanced profile
    Advanced = 2,
}

/// Transport log level, using the librist numbering
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Logging disabled
    Disable = -1,
    /// Errors only
    Error = 3,
    /// Warnings and above
    Warn = 4,
    /// Notices and above
    Notice = 5,
    /// Informational and above
    #[default]
    Info = 6,
    /// Everything
    Debug = 7,
    /// Packet loss simulation diagnostics
    Simulate = 100,
}

impl LogLevel {
    /// Matching level of the `log` facade, `None` when disabled
    pub fn to_log(self) -> Option<log::Level> {
        match self {
            LogLevel::Disable => None,
            LogLevel::Error => Some(log::Level::Error),
            LogLevel::Warn => Some(log::Level::Warn),
            LogLevel::Notice | LogLevel::Info => Some(log::Level::Info),
            LogLevel::Debug | LogLevel::Simulate => Some(log::Level::Debug),
        }
    }
}

/// ARQ recovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Left to the transport
    Unconfigured = 0,
    /// No retransmissions
    Disabled = 1,
    /// Time based recovery buffer
    #[default]
    Time = 2,
}

/// Congestion control applied to retransmissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControlMode {
    /// No congestion control
    Off = 0,
    /// Standard congestion control
    #[default]
    Normal = 1,
    /// Aggressive congestion control
    Aggressive = 2,
}

/// Answer to a connecting peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Keep the association
    Accept,
    /// Drop the association
    Reject,
}

/// Where transport log lines go
#[derive(Clone, Default)]
pub enum LogSink {
    /// The `log` facade, under the `ristnet::transport` target
    #[default]
    Facade,
    /// An application callback
    Callback(Arc<dyn Fn(LogLevel, &str) + Send + Sync>),
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::Facade => f.write_str("Facade"),
            LogSink::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Logging configuration forwarded to the transport
#[derive(Clone, Debug, Default)]
pub struct LoggingSettings {
    /// Highest level that is emitted
    pub level: LogLevel,
    /// Destination of emitted lines
    pub sink: LogSink,
}

/// A data packet, inbound or outbound
#[derive(Debug, Clone, Copy, Default)]
pub struct DataBlock<'a> {
    /// Payload bytes
    pub payload: &'a [u8],
    /// Peer the block came from; unset on egress
    pub peer: Option<PeerHandle>,
    /// Logical stream within the peer
    pub flow_id: u32,
}

/// An out-of-band control message
#[derive(Debug, Clone, Copy)]
pub struct OobBlock<'a> {
    /// Peer the message came from or goes to
    pub peer: PeerHandle,
    /// Payload bytes
    pub payload: &'a [u8],
}

/// Entry points the transport worker calls back into
///
/// Implementations are invoked from transport-owned threads, concurrently with the
/// application's own calls.
pub trait TransportEvents: Send + Sync {
    /// A remote peer is connecting on the association `peer`
    fn on_connect(
        &self,
        remote_ip: &str,
        remote_port: u16,
        local_ip: &str,
        local_port: u16,
        peer: PeerHandle,
    ) -> Admission;

    /// The association `peer` has gone away
    fn on_disconnect(&self, peer: PeerHandle);

    /// A data block arrived
    fn on_data(&self, block: &DataBlock<'_>) -> crate::Result<()>;

    /// An out-of-band message arrived
    fn on_oob(&self, block: &OobBlock<'_>);
}

/// Process-wide entry points of a RIST stack
pub trait RistBackend: Send + Sync {
    /// (major, minor) API version of the stack
    fn api_version(&self) -> (u32, u32);

    /// Install logging level and sink
    fn configure_logging(&self, logging: &LoggingSettings) -> Result<(), TransportError>;

    /// Create a receiver or sender context
    fn create_context(
        &self,
        role: Role,
        profile: Profile,
        logging: &LoggingSettings,
    ) -> Result<Arc<dyn RistContext>, TransportError>;

    /// Parse a `rist://` URL and layer its overrides onto `config`
    fn parse_address(&self, url: &str, config: &mut PeerConfig) -> Result<(), TransportError>;
}

/// One transport context with its own worker
pub trait RistContext: Send + Sync {
    /// Create a peer from a value copy of `config`
    fn create_peer(&self, config: &PeerConfig) -> Result<PeerHandle, TransportError>;

    /// Tear down a single peer association
    fn destroy_peer(&self, peer: PeerHandle) -> Result<(), TransportError>;

    /// Cap the jitter buffer, in milliseconds
    fn set_max_jitter(&self, max_jitter_ms: u32) -> Result<(), TransportError>;

    /// Route inbound out-of-band messages to `events`
    fn set_oob_handler(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError>;

    /// Route inbound data to `events` (receivers only)
    fn set_data_handler(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError>;

    /// Route connect and disconnect notifications to `events`
    fn set_auth_handler(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError>;

    /// Start the worker
    fn start(&self) -> Result<(), TransportError>;

    /// Write a data block, returning the number of bytes accepted
    fn write_data(&self, block: &DataBlock<'_>) -> Result<usize, TransportError>;

    /// Write an out-of-band message
    fn write_oob(&self, block: &OobBlock<'_>) -> Result<(), TransportError>;

    /// Stop the worker and release every peer
    ///
    /// Returns once no further callback can fire.
    fn destroy(&self) -> Result<(), TransportError>;
}
