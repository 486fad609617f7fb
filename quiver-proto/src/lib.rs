//! Sans-I/O core of a QUIC transport endpoint.
//!
//! This crate performs no I/O whatsoever. It parses and decrypts incoming UDP
//! datagrams into protocol events, demultiplexes them onto per-connection
//! state machines, runs the handshake and path-validation transitions, and
//! governs congestion through a CUBIC+Reno controller. Sockets, timers, the
//! TLS stack, and frame-body decoding live in the embedding application and
//! are reached through the traits in [`crypto`] and [`frame`].

use std::ops;
use std::time::Duration;

mod coding;

pub mod congestion;
pub mod crypto;
pub mod frame;

mod config;
pub use crate::config::{ConfigError, EndpointConfig, ServerConfig, TransportConfig};

mod connection;
pub use crate::connection::paths::{Path, Probe, StashedCid};
pub use crate::connection::spaces::{Dedup, PacketNumberSpace, SentMarker};
pub use crate::connection::{Connection, Event, State};

mod endpoint;
pub use crate::endpoint::{ConnectError, ConnectionHandle, Quic, Transmit};

mod packet;
pub use crate::packet::{Epoch, PacketHeader, PacketType, PnSpace};

mod shared;
pub use crate::shared::{ConnectionId, EcnCodepoint, RecvError};

mod token;
pub use crate::token::ResetToken;

mod transport_error;
pub use crate::transport_error::TransportError;

/// The QUIC protocol versions this endpoint accepts, most preferred first
pub const SUPPORTED_VERSIONS: &[u32] = &[0x0000_0001, 0xff00_001d];

/// Position of `version` in [`SUPPORTED_VERSIONS`], or `None` if unsupported
pub fn version_index(version: u32) -> Option<usize> {
    SUPPORTED_VERSIONS.iter().position(|&v| v == version)
}

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

//
// Protocol constants
//

/// Largest connection ID the wire format permits
pub const CONNECTION_ID_MAX_SIZE: usize = 20;
/// Smallest nonzero connection ID this endpoint will issue
pub const CONNECTION_ID_MIN_SIZE: usize = 1;
/// Minimum length of the DCID in a client's first Initial
pub const ENFORCED_INITIAL_CID_LENGTH: usize = 8;
/// Minimum UDP datagram size for a client Initial to be honored
pub const ENFORCED_INITIAL_MTU: usize = 1200;

/// Reference packet size used to scale congestion windows
pub const MAX_PACKET_SIZE: u64 = 1536;
/// Congestion window granted to a fresh path
pub const CWIN_INITIAL: u64 = 10 * MAX_PACKET_SIZE;
/// Floor below which the congestion window never shrinks
pub const CWIN_MINIMUM: u64 = 2 * MAX_PACKET_SIZE;
/// Round-trip time at which Reno-style slow start needs no compensation
pub const TARGET_RENO_RTT: Duration = Duration::from_millis(100);

/// Trailing secret length in a stateless reset packet
pub const RESET_SECRET_SIZE: usize = 16;
/// Shortest incoming 1-RTT packet checked against a reset secret
pub const RESET_PACKET_MIN_SIZE: usize = 21;
/// Minimum random padding in an outgoing stateless reset
pub const RESET_PACKET_PAD_SIZE: usize = 23;

/// Number of path challenges outstanding per path
pub const CHALLENGE_REPEAT_MAX: usize = 4;
/// Ring size of the HyStart RTT filter
pub const MIN_MAX_RTT_SCOPE: usize = 4;

/// Validity window granted to freshly minted retry tokens
pub const TOKEN_DELAY_SHORT: Duration = Duration::from_secs(10);

pub(crate) const INITIAL_RETRANSMIT_TIMER: Duration = Duration::from_millis(250);
pub(crate) const INITIAL_RTT: Duration = Duration::from_millis(100);
