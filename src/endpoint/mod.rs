// ABOUTME: Endpoint module for RIST receivers and senders
// ABOUTME: Provides settings, the peer registry, callback dispatch and both facades

mod dispatch;
mod lifecycle;
mod receiver;
mod registry;
mod sender;
mod settings;

pub use dispatch::{DataReceived, OobReceived, ValidateConnection};
pub use lifecycle::{Version, WRAPPER_VERSION};
pub use receiver::RistReceiver;
pub use registry::{PeerMap, PeerRegistry};
pub use sender::RistSender;
pub use settings::{
    BoundedBytes, PeerConfig, PeerDefaults, Settings, CNAME_CAPACITY, DEFAULT_VIRT_DST_PORT,
    PEER_CONFIG_VERSION, PSK_KEY_SIZE, RECEIVER_PEER_WEIGHT, SECRET_CAPACITY,
};
