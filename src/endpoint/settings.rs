// ABOUTME: Endpoint settings and per-peer transport configuration
// ABOUTME: Settings defaults/builders, bounded PSK and CNAME buffers, PeerConfig construction

use crate::error::Error;
use crate::transport::{CongestionControlMode, LogLevel, LogSink, LoggingSettings, Profile, RecoveryMode};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;

/// Peer config layout version understood by the transport
pub const PEER_CONFIG_VERSION: u32 = 0;
/// Virtual destination port used unless a URL overrides it
pub const DEFAULT_VIRT_DST_PORT: u16 = 1968;
/// Weight given to every receiver peer
pub const RECEIVER_PEER_WEIGHT: u32 = 5;
/// Key size announced when a pre-shared key is configured
pub const PSK_KEY_SIZE: u32 = 128;
/// Capacity of the PSK buffer in bytes
pub const SECRET_CAPACITY: usize = 128;
/// Capacity of the CNAME buffer in bytes
pub const CNAME_CAPACITY: usize = 128;

/// Recovery and retry defaults applied to every peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDefaults {
    /// ARQ recovery mode
    pub recovery_mode: RecoveryMode,
    /// Maximum bitrate in kbps, sender to receiver
    pub recovery_maxbitrate: u32,
    /// Maximum bitrate in kbps, receiver to sender
    pub recovery_maxbitrate_return: u32,
    /// Minimum recovery buffer in milliseconds
    pub recovery_length_min: u32,
    /// Maximum recovery buffer in milliseconds
    pub recovery_length_max: u32,
    /// Minimum RTT in milliseconds
    pub recovery_rtt_min: u32,
    /// Maximum RTT in milliseconds
    pub recovery_rtt_max: u32,
    /// Congestion control on retransmissions
    pub congestion_control_mode: CongestionControlMode,
    /// Minimum retransmission attempts
    pub min_retries: u32,
    /// Maximum retransmission attempts
    pub max_retries: u32,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            recovery_mode: RecoveryMode::Time,
            recovery_maxbitrate: 100_000,
            recovery_maxbitrate_return: 0,
            recovery_length_min: 1000,
            recovery_length_max: 1000,
            recovery_rtt_min: 50,
            recovery_rtt_max: 500,
            congestion_control_mode: CongestionControlMode::Normal,
            min_retries: 6,
            max_retries: 20,
        }
    }
}

/// Settings shared by receivers and senders
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// RIST profile
    pub profile: Profile,
    /// Transport log level
    pub log_level: LogLevel,
    /// Transport log destination
    #[serde(skip)]
    pub log_sink: LogSink,
    /// Pre-shared key; empty disables encryption
    pub psk: String,
    /// Canonical name; empty omits it
    pub cname: String,
    /// Session timeout in milliseconds
    pub session_timeout: u32,
    /// Keep-alive interval in milliseconds
    pub keep_alive_interval: u32,
    /// Maximum jitter in milliseconds; 0 leaves the transport default
    pub max_jitter: u32,
    /// Recovery and retry defaults
    pub peer_defaults: PeerDefaults,
}

impl Settings {
    /// Create settings with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Settings(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| Error::Settings(format!("{}: {}", path.display(), e)))
    }

    /// Set the RIST profile
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the transport log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Set the transport log destination
    pub fn log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = sink;
        self
    }

    /// Set the pre-shared key
    pub fn psk(mut self, psk: impl Into<String>) -> Self {
        self.psk = psk.into();
        self
    }

    /// Set the canonical name
    pub fn cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = cname.into();
        self
    }

    /// Set the session timeout in milliseconds
    pub fn session_timeout(mut self, ms: u32) -> Self {
        self.session_timeout = ms;
        self
    }

    /// Set the keep-alive interval in milliseconds
    pub fn keep_alive_interval(mut self, ms: u32) -> Self {
        self.keep_alive_interval = ms;
        self
    }

    /// Set the maximum jitter in milliseconds
    pub fn max_jitter(mut self, ms: u32) -> Self {
        self.max_jitter = ms;
        self
    }

    /// Replace the recovery and retry defaults
    pub fn peer_defaults(mut self, defaults: PeerDefaults) -> Self {
        self.peer_defaults = defaults;
        self
    }

    /// Logging configuration to hand to the transport
    pub fn logging(&self) -> LoggingSettings {
        LoggingSettings {
            level: self.log_level,
            sink: self.log_sink.clone(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profile: Profile::Main,
            log_level: LogLevel::Info,
            log_sink: LogSink::Facade,
            psk: String::new(),
            cname: String::new(),
            session_timeout: 5000,
            keep_alive_interval: 10000,
            max_jitter: 0,
            peer_defaults: PeerDefaults::default(),
        }
    }
}

/// Fixed-capacity byte buffer filled by a truncating copy
///
/// Input longer than `N` bytes keeps its first `N` bytes. A full buffer carries no
/// terminator; the stored length is authoritative.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BoundedBytes<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> BoundedBytes<N> {
    /// Replace the contents with at most `N` bytes of `value`
    ///
    /// Returns `true` when `value` had to be truncated.
    pub fn copy_from(&mut self, value: &str) -> bool {
        let src = value.as_bytes();
        let len = src.len().min(N);
        self.bytes = [0; N];
        self.bytes[..len].copy_from_slice(&src[..len]);
        self.len = len;
        src.len() > N
    }

    /// Stored bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Stored bytes as text; a cut through a multi-byte character shows as U+FFFD
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    /// Number of stored bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in bytes
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for BoundedBytes<N> {
    fn default() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }
}

impl<const N: usize> fmt::Debug for BoundedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoundedBytes<{}>(len={})", N, self.len)
    }
}

/// Configuration of a single transport peer
///
/// The transport copies this value when the peer is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// Layout version
    pub version: u32,
    /// Address filled in by URL parsing
    pub address: String,
    /// Virtual destination port
    pub virt_dst_port: u16,
    /// ARQ recovery mode
    pub recovery_mode: RecoveryMode,
    /// Maximum bitrate in kbps, sender to receiver
    pub recovery_maxbitrate: u32,
    /// Maximum bitrate in kbps, receiver to sender
    pub recovery_maxbitrate_return: u32,
    /// Minimum recovery buffer in milliseconds
    pub recovery_length_min: u32,
    /// Maximum recovery buffer in milliseconds
    pub recovery_length_max: u32,
    /// Minimum RTT in milliseconds
    pub recovery_rtt_min: u32,
    /// Maximum RTT in milliseconds
    pub recovery_rtt_max: u32,
    /// Load balancing weight across sender peers
    pub weight: u32,
    /// Congestion control on retransmissions
    pub congestion_control_mode: CongestionControlMode,
    /// Minimum retransmission attempts
    pub min_retries: u32,
    /// Maximum retransmission attempts
    pub max_retries: u32,
    /// Session timeout in milliseconds
    pub session_timeout: u32,
    /// Keep-alive interval in milliseconds
    pub keepalive_interval: u32,
    /// Pre-shared key
    pub secret: BoundedBytes<SECRET_CAPACITY>,
    /// Canonical name
    pub cname: BoundedBytes<CNAME_CAPACITY>,
    /// 0 for no encryption, 128 with a pre-shared key
    pub key_size: u32,
}

impl PeerConfig {
    /// Build a fresh peer config from endpoint settings and a peer weight
    pub fn from_settings(settings: &Settings, weight: u32) -> Self {
        let defaults = &settings.peer_defaults;
        let mut config = Self {
            version: PEER_CONFIG_VERSION,
            address: String::new(),
            virt_dst_port: DEFAULT_VIRT_DST_PORT,
            recovery_mode: defaults.recovery_mode,
            recovery_maxbitrate: defaults.recovery_maxbitrate,
            recovery_maxbitrate_return: defaults.recovery_maxbitrate_return,
            recovery_length_min: defaults.recovery_length_min,
            recovery_length_max: defaults.recovery_length_max,
            recovery_rtt_min: defaults.recovery_rtt_min,
            recovery_rtt_max: defaults.recovery_rtt_max,
            weight,
            congestion_control_mode: defaults.congestion_control_mode,
            min_retries: defaults.min_retries,
            max_retries: defaults.max_retries,
            session_timeout: settings.session_timeout,
            keepalive_interval: settings.keep_alive_interval,
            secret: BoundedBytes::default(),
            cname: BoundedBytes::default(),
            key_size: 0,
        };

        if !settings.psk.is_empty() {
            config.key_size = PSK_KEY_SIZE;
            if config.secret.copy_from(&settings.psk) {
                log::warn!("PSK longer than {} bytes, truncated", config.secret.capacity());
            }
        }

        if !settings.cname.is_empty() && config.cname.copy_from(&settings.cname) {
            log::warn!("CNAME longer than {} bytes, truncated", config.cname.capacity());
        }

        config
    }
}
