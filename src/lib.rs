// ABOUTME: Main library entry point for ristnet
// ABOUTME: Exports the receiver/sender facades, the transport seam and the error type

//! # ristnet
//!
//! Receiver and sender facades over a RIST (Reliable Internet Stream Transport) stack.
//!
//! The RIST protocol itself (loss recovery, retransmission, jitter buffering) lives behind
//! the [`transport::RistBackend`] and [`transport::RistContext`] traits. This crate adds the
//! part applications usually write by hand: peer admission, a registry mapping transport
//! peers to application state, routing of inbound data and out-of-band messages, and a
//! lifecycle that always tears down cleanly.
//!
//! ## Features
//!
//! - **Receiver**: listen on one or more URLs and accept many inbound peers
//! - **Sender**: connect to one or more weighted peers and push data
//! - **Loopback transport**: an in-process backend for tests and demos
//!
//! ## Example: Receiver and sender over the loopback transport
//!
//! ```no_run
//! use ristnet::{Settings, RistReceiver, RistSender};
//! use ristnet::transport::LoopbackBackend;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(LoopbackBackend::new());
//!
//! let mut receiver: RistReceiver<String> = RistReceiver::new(backend.clone());
//! receiver.on_validate_connection(|ip, port| Some(Arc::new(format!("{ip}:{port}"))));
//! receiver.on_data(|payload, peer_name, _peer, flow_id| {
//!     println!("{} bytes on flow {} from {}", payload.len(), flow_id, peer_name);
//!     0
//! });
//! receiver.init(&["rist://@127.0.0.1:5000"], &Settings::default()).unwrap();
//!
//! let mut sender: RistSender<()> = RistSender::new(backend);
//! sender.on_validate_connection(|_, _| Some(Arc::new(())));
//! sender.init(&[("rist://127.0.0.1:5000", 5)], &Settings::default()).unwrap();
//! sender.send_data(&[0u8; 1316], 1).unwrap();
//! ```

#![warn(missing_docs)]

/// Command line glue shared by the binaries
pub mod cli;
/// Receiver and sender facades
pub mod endpoint;
/// IP literal checks and RIST URL building
pub mod tools;
/// The seam to the underlying RIST stack, plus the loopback implementation
pub mod transport;

pub use endpoint::{
    PeerDefaults, PeerRegistry, RistReceiver, RistSender, Settings, Version, WRAPPER_VERSION,
};
pub use transport::PeerHandle;

/// Result type for ristnet operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for ristnet
pub mod error {
    use crate::transport::{PeerHandle, TransportError};
    use thiserror::Error;

    /// Error types for ristnet operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// `init` was called without any peer URL
        #[error("URL list is empty")]
        EmptyUrlList,

        /// The endpoint has no transport context
        #[error("endpoint not initialised")]
        NotInitialized,

        /// `init` was called on an endpoint that is already running
        #[error("endpoint already initialised")]
        AlreadyInitialized,

        /// A transport call returned a failure status
        #[error("{op} failed: {source}")]
        Transport {
            /// Name of the failing transport operation
            op: &'static str,
            /// Status reported by the transport
            #[source]
            source: TransportError,
        },

        /// The transport could not parse a peer URL
        #[error("failed to parse address {url}: {source}")]
        ParseAddress {
            /// The rejected URL
            url: String,
            /// Status reported by the transport
            #[source]
            source: TransportError,
        },

        /// The transport could not create a peer for a URL
        #[error("failed to create peer {url}: {source}")]
        PeerCreate {
            /// URL of the peer that could not be created
            url: String,
            /// Status reported by the transport
            #[source]
            source: TransportError,
        },

        /// The transport accepted fewer bytes than offered
        #[error("did send {written} bytes, out of {expected} bytes")]
        ShortWrite {
            /// Bytes the transport reported as written
            written: usize,
            /// Length of the payload
            expected: usize,
        },

        /// The peer is not in the registry
        #[error("unknown peer {0}")]
        UnknownPeer(PeerHandle),

        /// A data block arrived without a source peer
        #[error("data block carries no peer")]
        MissingPeer,

        /// Data arrived on a context without a data handler
        #[error("no data handler installed")]
        NoDataHandler,

        /// The application's data callback returned a non-zero status
        #[error("data callback returned status {0}")]
        DataHandler(i32),

        /// Not an IPv4 or IPv6 literal
        #[error("invalid IP address: {0}")]
        InvalidAddress(String),

        /// Port outside 1..=65535
        #[error("invalid port: {0}")]
        InvalidPort(String),

        /// A settings file could not be read or parsed
        #[error("settings error: {0}")]
        Settings(String),
    }

    impl Error {
        /// Build a closure wrapping a transport status for the named operation
        pub(crate) fn transport(op: &'static str) -> impl FnOnce(TransportError) -> Self {
            move |source| Error::Transport { op, source }
        }
    }
}
