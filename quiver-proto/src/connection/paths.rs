//! Per-path state: addresses, connection IDs, validation challenges, and the
//! congestion controller.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::config::TransportConfig;
use crate::congestion::{CcContext, CongestionController, Notification};
use crate::shared::ConnectionId;
use crate::{CHALLENGE_REPEAT_MAX, INITIAL_RETRANSMIT_TIMER, RESET_SECRET_SIZE};

/// One validated or probing `(peer_addr, local_addr, local_cnxid,
/// remote_cnxid)` 4-tuple.
///
/// `path[0]` is always the connection's default path. A path counts as
/// registered once its local connection ID has been announced to the peer.
pub struct Path {
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub local_cnxid: ConnectionId,
    pub remote_cnxid: ConnectionId,
    /// Sequence number of `remote_cnxid` in the peer's issuance order
    pub remote_cnxid_sequence: u64,
    /// Secret whose appearance at the tail of an undecryptable packet means
    /// the peer lost its state for this path
    pub reset_secret: [u8; RESET_SECRET_SIZE],

    pub send_mtu: u64,
    pub cwin: u64,
    pub smoothed_rtt: Duration,
    pub retransmit_timer: Duration,

    pub registered: bool,
    pub published: bool,
    pub activated: bool,

    pub challenge: [u64; CHALLENGE_REPEAT_MAX],
    pub challenge_required: bool,
    pub challenge_verified: bool,
    pub challenge_failed: bool,
    pub challenge_time: Option<Instant>,
    pub challenge_repeat_count: u32,

    /// Shadow address pair observed during a suspected NAT rebinding; kept
    /// beside the main pair until one of them validates
    pub alt_peer_addr: Option<SocketAddr>,
    pub alt_local_addr: Option<SocketAddr>,
    pub alt_challenge: [u64; CHALLENGE_REPEAT_MAX],
    pub alt_challenge_required: bool,
    pub alt_challenge_timeout: Option<Instant>,
    pub alt_challenge_repeat_count: u32,

    pub congestion: CongestionController,
}

impl Path {
    pub(crate) fn new(
        now: Instant,
        config: &TransportConfig,
        local_cnxid: ConnectionId,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            peer_addr,
            local_addr,
            local_cnxid,
            remote_cnxid: ConnectionId::EMPTY,
            remote_cnxid_sequence: 0,
            reset_secret: [0; RESET_SECRET_SIZE],
            send_mtu: config.initial_mtu,
            cwin: config.initial_window,
            smoothed_rtt: config.initial_rtt,
            retransmit_timer: INITIAL_RETRANSMIT_TIMER,
            registered: false,
            published: false,
            activated: false,
            challenge: [0; CHALLENGE_REPEAT_MAX],
            challenge_required: false,
            challenge_verified: false,
            challenge_failed: false,
            challenge_time: None,
            challenge_repeat_count: 0,
            alt_peer_addr: None,
            alt_local_addr: None,
            alt_challenge: [0; CHALLENGE_REPEAT_MAX],
            alt_challenge_required: false,
            alt_challenge_timeout: None,
            alt_challenge_repeat_count: 0,
            congestion: CongestionController::new_cubic(
                now,
                config.initial_window,
                config.minimum_window,
                config.initial_mtu,
            ),
        }
    }

    /// Whether the packet's 4-tuple matches this path's primary addresses
    pub(crate) fn addresses_match(&self, peer: SocketAddr, local: SocketAddr) -> bool {
        self.peer_addr == Some(peer) && self.local_addr == Some(local)
    }

    pub(crate) fn alt_addresses_match(&self, peer: SocketAddr, local: SocketAddr) -> bool {
        self.alt_peer_addr == Some(peer) && self.alt_local_addr == Some(local)
    }

    /// Discard any validation progress and arm a fresh set of challenges on
    /// both the primary and alternate address pairs
    pub(crate) fn refresh_challenges<R: RngCore>(&mut self, now: Instant, rng: &mut R) {
        self.challenge_required = true;
        for i in 0..CHALLENGE_REPEAT_MAX {
            self.challenge[i] = rng.next_u64();
            self.alt_challenge[i] = rng.next_u64();
        }
        self.challenge_verified = false;
        self.challenge_time = Some(now);
        self.challenge_repeat_count = 0;
    }

    /// Route a congestion notification to this path's controller
    pub fn congestion_notify(&mut self, notification: Notification, ctx: CcContext, now: Instant) {
        let Self {
            congestion,
            cwin,
            send_mtu,
            smoothed_rtt,
            ..
        } = self;
        congestion.notify(notification, cwin, *send_mtu, *smoothed_rtt, ctx, now);
    }
}

/// An in-flight multipath probe: a challenge sent from a new address pair
/// with a reserved peer connection ID
pub struct Probe {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub remote_cnxid: ConnectionId,
    pub sequence: u64,
    pub reset_secret: [u8; RESET_SECRET_SIZE],
    pub challenge: [u64; CHALLENGE_REPEAT_MAX],
}

/// A peer-issued connection ID waiting to be bound to a path
pub struct StashedCid {
    pub sequence: u64,
    pub cnx_id: ConnectionId,
    pub reset_secret: [u8; RESET_SECRET_SIZE],
}
