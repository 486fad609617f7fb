//! Per-connection protocol state: the handshake state machine, decrypted
//! segment dispatch, key-rotation bookkeeping, and path management.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use tracing::{debug, trace};

use crate::coding::BufExt;
use crate::config::TransportConfig;
use crate::congestion::CcContext;
use crate::crypto::{CryptoConfig, CryptoContext, Session};
use crate::frame::FrameDecoder;
use crate::packet::{Epoch, PacketHeader, PacketType, PnSpace};
use crate::shared::{ConnectionId, EcnCodepoint, RecvError};
use crate::transport_error::TransportError;
use crate::{Side, ENFORCED_INITIAL_CID_LENGTH, ENFORCED_INITIAL_MTU};

mod packet_crypto;

pub(crate) mod paths;
pub(crate) use paths::{Path, Probe, StashedCid};

pub(crate) mod spaces;
pub(crate) use spaces::PacketNumberSpace;

/// Lifecycle of a connection.
///
/// Ordering is meaningful: handshake states precede `Ready`, which precedes
/// the closing family, and range comparisons are used throughout the
/// dispatchers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum State {
    ClientInitSent,
    ClientInitResent,
    ClientHandshakeStart,
    ClientHandshakeProgress,
    ClientAlmostReady,
    ServerInit,
    ServerAlmostReady,
    ServerFalseStart,
    Ready,
    ClosingReceived,
    Closing,
    Draining,
    Disconnected,
    HandshakeFailure,
}

/// Connection-level happenings surfaced to the application
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// The peer lost its state and answered with a stateless reset
    StatelessReset,
    /// The server refused our version and offered these instead
    VersionNegotiation(Vec<u32>),
}

/// Protocol state of one QUIC connection.
///
/// Exclusively owned by the endpoint's registry; all mutation happens while
/// processing a single segment end-to-end.
pub struct Connection {
    side: Side,
    pub(crate) state: State,
    version: u32,

    /// The client's first destination CID; anchors the server's identity
    /// checks and the Initial secret derivation
    pub(crate) initial_cnxid: ConnectionId,
    /// Pre-retry destination CID; zero length while no Retry has occurred
    pub(crate) original_cnxid: ConnectionId,

    pub(crate) crypto: [CryptoContext; 4],
    pub(crate) crypto_old: CryptoContext,
    pub(crate) crypto_new: CryptoContext,
    pub(crate) key_phase_dec: bool,
    key_phase_enc: bool,
    pub(crate) crypto_rotation_sequence: u64,
    pub(crate) crypto_rotation_time_guard: Option<Instant>,

    pub(crate) spaces: [PacketNumberSpace; 3],
    pub(crate) paths: Vec<Path>,
    probes: Vec<Probe>,
    cnxid_stash: VecDeque<StashedCid>,

    retry_token: Option<Vec<u8>>,
    pub(crate) initial_validated: bool,
    initial_repeat_needed: bool,

    pub(crate) is_1rtt_received: bool,
    sending_ecn_ack: bool,
    ecn_ect0_total_local: u64,
    ecn_ect1_total_local: u64,
    ecn_ce_total_local: u64,
    alt_path_challenge_needed: bool,

    local_error: Option<TransportError>,
    server_name: Option<String>,

    tls: Box<dyn Session>,
    frames: Arc<dyn FrameDecoder>,
    crypto_config: Arc<dyn CryptoConfig>,
    transport_config: TransportConfig,

    events: VecDeque<Event>,
    rng: StdRng,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        side: Side,
        crypto_config: Arc<dyn CryptoConfig>,
        frames: Arc<dyn FrameDecoder>,
        transport_config: TransportConfig,
        initial_cnxid: ConnectionId,
        local_cnxid: ConnectionId,
        peer_addr: SocketAddr,
        server_name: Option<String>,
        version: u32,
        now: Instant,
        rng: StdRng,
    ) -> Self {
        let mut path = Path::new(
            now,
            &transport_config,
            local_cnxid,
            Some(peer_addr),
            None,
        );
        path.registered = true;

        let mut crypto: [CryptoContext; 4] = Default::default();
        crypto[Epoch::Initial as usize] = crypto_config.initial_keys(&initial_cnxid, side);

        let tls = crypto_config.start_session(side, server_name.as_deref());

        Self {
            side,
            state: match side {
                Side::Client => State::ClientInitSent,
                Side::Server => State::ServerInit,
            },
            version,
            initial_cnxid,
            original_cnxid: ConnectionId::EMPTY,
            crypto,
            crypto_old: CryptoContext::empty(),
            crypto_new: CryptoContext::empty(),
            key_phase_dec: false,
            key_phase_enc: false,
            crypto_rotation_sequence: 0,
            crypto_rotation_time_guard: None,
            spaces: Default::default(),
            paths: vec![path],
            probes: Vec::new(),
            cnxid_stash: VecDeque::new(),
            retry_token: None,
            initial_validated: false,
            initial_repeat_needed: false,
            is_1rtt_received: false,
            sending_ecn_ack: false,
            ecn_ect0_total_local: 0,
            ecn_ect1_total_local: 0,
            ecn_ce_total_local: 0,
            alt_path_challenge_needed: false,
            local_error: None,
            server_name,
            tls,
            frames,
            crypto_config,
            transport_config,
            events: VecDeque::new(),
            rng,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn initial_cnxid(&self) -> &ConnectionId {
        &self.initial_cnxid
    }

    /// The token to present in the next Initial, if a Retry supplied one
    pub fn retry_token(&self) -> Option<&[u8]> {
        self.retry_token.as_deref()
    }

    pub fn local_error(&self) -> Option<TransportError> {
        self.local_error
    }

    /// Whether the Initial flight should be repeated without waiting for the
    /// retransmit timer
    pub fn initial_repeat_needed(&self) -> bool {
        self.initial_repeat_needed
    }

    /// Whether a challenge is owed on some path's alternate address pair
    pub fn alt_path_challenge_needed(&self) -> bool {
        self.alt_path_challenge_needed
    }

    /// Key phase bit to put in outgoing 1-RTT packets
    pub fn key_phase_enc(&self) -> bool {
        self.key_phase_enc
    }

    /// Whether the next acknowledgement should carry ECN counts
    pub fn sending_ecn_ack(&self) -> bool {
        self.sending_ecn_ack
    }

    /// Received `(ECT(0), ECT(1), CE)` totals for the default path
    pub fn ecn_counters(&self) -> (u64, u64, u64) {
        (
            self.ecn_ect0_total_local,
            self.ecn_ect1_total_local,
            self.ecn_ce_total_local,
        )
    }

    /// Retrieve the next application-visible event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Hand the connection a connection ID issued by the peer
    pub fn stash_remote_cnxid(
        &mut self,
        sequence: u64,
        cnx_id: ConnectionId,
        reset_secret: [u8; crate::RESET_SECRET_SIZE],
    ) {
        self.cnxid_stash.push_back(StashedCid {
            sequence,
            cnx_id,
            reset_secret,
        });
    }

    //
    // Segment dispatchers. Each consumes one decrypted segment and returns
    // the outcome the datagram loop maps to its drop policy.
    //

    /// Version negotiation, accepted by clients that have not progressed past
    /// their first flight
    pub(crate) fn incoming_version_negotiation(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
    ) -> Result<(), RecvError> {
        if ph.dest_cnx_id != self.paths[0].local_cnxid || ph.version != 0 {
            // Not a proper echo; ignore without effect
            trace!("dropping version negotiation that does not echo our CID");
            return Ok(());
        }

        let mut versions = Vec::new();
        let mut cursor = std::io::Cursor::new(&bytes[ph.offset..ph.offset + ph.payload_length]);
        while let Ok(version) = cursor.get::<u32>() {
            versions.push(version);
        }
        if !versions.is_empty() {
            self.events.push_back(Event::VersionNegotiation(versions));
        }
        // The application picks a new version and starts over
        debug!("disconnecting upon version negotiation");
        self.state = State::Disconnected;
        Ok(())
    }

    /// Server retry: restart the handshake against the server-chosen CID
    /// with the provided token
    pub(crate) fn incoming_retry(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        now: Instant,
    ) -> Result<(), RecvError> {
        if !matches!(
            self.state,
            State::ClientInitSent | State::ClientInitResent
        ) || !self.original_cnxid.is_empty()
        {
            return Err(RecvError::UnexpectedPacket);
        }
        // The header must echo what we sent
        if ph.version != self.version || ph.pn64 != 0 {
            return Err(RecvError::UnexpectedPacket);
        }

        // Payload: odcil || odcid || token
        if ph.payload_length == 0 {
            return Err(RecvError::UnexpectedPacket);
        }
        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        let odcil = payload[0] as usize;
        if odcil != self.initial_cnxid.len()
            || odcil + 1 > ph.payload_length
            || payload[1..1 + odcil] != self.initial_cnxid[..]
        {
            return Err(RecvError::UnexpectedPacket);
        }
        let token = payload[1 + odcil..].to_vec();

        self.original_cnxid = self.initial_cnxid;
        self.initial_cnxid = ph.srce_cnx_id;
        self.retry_token = if token.is_empty() { None } else { Some(token) };
        self.reset(now);

        // The segment must not mark its packet number received
        Err(RecvError::Retry)
    }

    /// An Initial arriving at the server. The endpoint has already verified
    /// the retry token when that is required.
    pub(crate) fn incoming_client_initial(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        packet_length: usize,
        server_busy: bool,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<(), RecvError> {
        if ph.dest_cnx_id == self.paths[0].local_cnxid {
            self.initial_validated = true;
        }
        if !self.initial_validated
            && self.spaces[PnSpace::Initial as usize].retransmit_oldest.is_some()
            && packet_length >= ENFORCED_INITIAL_MTU
        {
            self.initial_repeat_needed = true;
        }

        if self.state == State::ServerInit && server_busy {
            self.local_error = Some(TransportError::SERVER_BUSY);
            self.state = State::HandshakeFailure;
        } else if self.state == State::ServerInit
            && self.initial_cnxid.len() < ENFORCED_INITIAL_CID_LENGTH
        {
            self.local_error = Some(TransportError::PROTOCOL_VIOLATION);
            self.state = State::HandshakeFailure;
        } else if self.state < State::ServerAlmostReady {
            // Document the incoming addresses
            if self.paths[0].local_addr.is_none() {
                self.paths[0].local_addr = Some(local_addr);
            }
            if self.paths[0].peer_addr.is_none() {
                self.paths[0].peer_addr = Some(peer_addr);
            }

            self.decode_frames(bytes, ph, 0)?;
            self.pump_tls()?;
        } else if self.state < State::Ready {
            self.ignore_incoming_handshake(bytes, ph);
        } else {
            // Initial keys should have been discarded by now
            return Err(RecvError::UnexpectedPacket);
        }

        Ok(())
    }

    /// An Initial arriving at the client: the server's first flight
    pub(crate) fn incoming_server_initial(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<(), RecvError> {
        if matches!(
            self.state,
            State::ClientInitSent | State::ClientInitResent
        ) {
            self.state = State::ClientHandshakeStart;
        }
        let restricted = self.state != State::ClientHandshakeStart;

        if self.paths[0].remote_cnxid.is_empty() && !restricted {
            // First response from the server: adopt its CID and record where
            // it reached us
            self.paths[0].remote_cnxid = ph.srce_cnx_id;
            self.paths[0].local_addr = Some(local_addr);
        } else if self.paths[0].remote_cnxid != ph.srce_cnx_id {
            return Err(RecvError::CnxidCheck);
        }

        if self.state < State::ClientHandshakeProgress {
            if ph.payload_length == 0 {
                return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
            }
            self.decode_frames(bytes, ph, 0)?;

            if !restricted {
                self.pump_tls()?;

                // Once handshake keys exist the Initial flight no longer
                // needs repeating
                let handshake = &self.crypto[Epoch::Handshake as usize];
                if self.state < State::ClientHandshakeProgress
                    && handshake.aead_rx.is_some()
                    && handshake.aead_tx.is_some()
                {
                    self.state = State::ClientHandshakeProgress;
                    self.implicit_handshake_ack(PnSpace::Initial, now);
                }
            }
        } else if self.state < State::Ready {
            self.ignore_incoming_handshake(bytes, ph);
        } else {
            return Err(RecvError::UnexpectedPacket);
        }

        Ok(())
    }

    /// Handshake packet arriving at the client
    pub(crate) fn incoming_server_handshake(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
    ) -> Result<(), RecvError> {
        let restricted = !matches!(
            self.state,
            State::ClientHandshakeStart | State::ClientHandshakeProgress
        );

        if self.paths[0].remote_cnxid != ph.srce_cnx_id {
            return Err(RecvError::CnxidCheck);
        }

        if self.state < State::Ready {
            if ph.payload_length == 0 {
                return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
            }
            self.decode_frames(bytes, ph, 0)?;
            if !restricted {
                self.pump_tls()?;
            }
            Ok(())
        } else {
            Err(RecvError::UnexpectedPacket)
        }
    }

    /// Handshake packet arriving at the server
    pub(crate) fn incoming_client_handshake(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
    ) -> Result<(), RecvError> {
        // A handshake packet can only come from a peer that owns the Initial
        // exchange
        self.initial_validated = true;

        if self.state < State::ServerAlmostReady {
            if ph.srce_cnx_id != self.paths[0].remote_cnxid {
                return Err(RecvError::CnxidCheck);
            }
            if ph.payload_length == 0 {
                return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
            }
            self.decode_frames(bytes, ph, 0)?;
            self.pump_tls()?;
            Ok(())
        } else if self.state <= State::Ready {
            // The client is never guaranteed to discard handshake keys, so
            // these may arrive long after the handshake; ack them without
            // side effects
            self.ignore_incoming_handshake(bytes, ph);
            Ok(())
        } else {
            Err(RecvError::UnexpectedPacket)
        }
    }

    /// 0-RTT data, accepted server-side in the narrow window before 1-RTT
    /// traffic begins
    pub(crate) fn incoming_0rtt(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
    ) -> Result<(), RecvError> {
        let dcid_ok = ph.dest_cnx_id == self.initial_cnxid
            || ph.dest_cnx_id == self.paths[0].local_cnxid;
        if !dcid_ok || ph.srce_cnx_id != self.paths[0].remote_cnxid {
            return Err(RecvError::CnxidCheck);
        }

        if matches!(
            self.state,
            State::ServerAlmostReady | State::ServerFalseStart
        ) || (self.state == State::Ready && !self.is_1rtt_received)
        {
            if ph.version != self.version {
                return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
            }
            if ph.payload_length == 0 {
                return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
            }
            self.decode_frames(bytes, ph, 0)?;
            self.pump_tls()?;
            Ok(())
        } else {
            Err(RecvError::UnexpectedPacket)
        }
    }

    /// 1-RTT data: path finding, frame decode, ECN accounting
    pub(crate) fn incoming_encrypted(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        ecn: Option<EcnCodepoint>,
        now: Instant,
    ) -> Result<(), RecvError> {
        if self.state < State::ClientAlmostReady || self.state == State::Disconnected {
            // Handshake incomplete or connection gone; ignore
            return Err(RecvError::UnexpectedPacket);
        }

        if self.state >= State::ClosingReceived {
            // Only watch for closing frames while winding down
            if self.state > State::Draining {
                return Err(RecvError::UnexpectedPacket);
            }
            let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
            let closing_received = self
                .frames
                .decode_closing(payload)
                .map_err(|e| self.connection_error(e))?;
            if closing_received {
                self.state = match self.side {
                    Side::Client => State::Disconnected,
                    Side::Server => State::Draining,
                };
            } else if self.state != State::Draining {
                self.spaces[ph.pc as usize].ack_needed = true;
            }
            return Ok(());
        }

        if ph.payload_length == 0 {
            return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
        }
        if ph.has_reserved_bit_set {
            // Reserved bits were not zero under header protection
            return Err(self.connection_error(TransportError::PROTOCOL_VIOLATION));
        }

        let path_id = self.find_incoming_path(ph, peer_addr, local_addr, now)?;
        self.is_1rtt_received = true;
        self.decode_frames(bytes, ph, path_id)?;
        self.ecn_accounting(ecn, path_id);
        self.pump_tls()?;
        Ok(())
    }

    /// The peer answered with a stateless reset: the connection is gone
    pub(crate) fn incoming_stateless_reset(&mut self) {
        debug!("stateless reset; abandoning connection");
        self.state = State::Disconnected;
        self.events.push_back(Event::StatelessReset);
    }

    //
    // Path finding for 1-RTT packets
    //

    /// Locate or create the path a 1-RTT packet arrived on, handling NAT
    /// rebinding and peer-initiated probing
    pub(crate) fn find_incoming_path(
        &mut self,
        ph: &PacketHeader,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<usize, RecvError> {
        let mut new_challenge_required = false;

        let path_id = if self.paths[0].local_cnxid.len() > 0 {
            // Paths were created in advance, when each local CID was issued
            // and announced
            match self
                .paths
                .iter()
                .position(|p| p.registered && p.local_cnxid == ph.dest_cnx_id)
            {
                Some(id) => id,
                None => return Err(RecvError::CnxidCheck),
            }
        } else if !ph.dest_cnx_id.is_empty() {
            return Err(RecvError::CnxidCheck);
        } else {
            // Zero-length CIDs: the address pair alone defines the path
            let found = self.paths.iter().position(|p| {
                p.peer_addr == Some(peer_addr)
                    && (p.local_addr.is_none() || p.local_addr == Some(local_addr))
            });
            match found {
                Some(id) => id,
                None => {
                    let id = self.create_path(now, Some(peer_addr), Some(local_addr));
                    self.paths[id].published = true;
                    self.paths[id].registered = true;
                    new_challenge_required = true;
                    id
                }
            }
        };

        let mut path_id = path_id;

        if self.paths[path_id].local_addr.is_none() {
            self.paths[path_id].local_addr = Some(local_addr);
        }

        if self.paths[path_id].peer_addr == Some(peer_addr) {
            if self.paths[path_id].local_addr != Some(local_addr) {
                self.paths[path_id].local_addr = Some(local_addr);
            }
            self.paths[path_id].activated = true;
        } else if !self.paths[0].remote_cnxid.is_empty()
            && self.paths[path_id].remote_cnxid.is_empty()
        {
            // A newly used path with no peer CID yet: adopt a probe, inherit
            // from the default path, or draw from the stash
            if let Some(probe) = self
                .probes
                .iter()
                .position(|p| p.peer_addr == peer_addr && p.local_addr == local_addr)
            {
                let probe = self.probes.swap_remove(probe);
                let path = &mut self.paths[path_id];
                path.remote_cnxid = probe.remote_cnxid;
                path.remote_cnxid_sequence = probe.sequence;
                path.reset_secret = probe.reset_secret;
                path.challenge = probe.challenge;
                path.peer_addr = Some(peer_addr);
                path.local_addr = Some(local_addr);
                path.activated = true;
            } else if self.side.is_client()
                && self.paths[0].addresses_match(peer_addr, local_addr)
            {
                // Only the CID changed relative to the default path: inherit
                // its peer CID, promote this path, retire the old default's
                trace!("peer CID migration onto default path addresses");
                let (head, tail) = self.paths.split_at_mut(path_id);
                let default = &mut head[0];
                let path = &mut tail[0];
                path.remote_cnxid = default.remote_cnxid;
                path.remote_cnxid_sequence = default.remote_cnxid_sequence;
                path.reset_secret = default.reset_secret;
                path.activated = true;
                path.challenge = default.challenge;
                path.challenge_time = default.challenge_time;
                path.challenge_repeat_count = default.challenge_repeat_count;
                path.challenge_required = default.challenge_required;
                path.challenge_verified = default.challenge_verified;
                path.challenge_failed = default.challenge_failed;
                path.peer_addr = Some(peer_addr);
                path.local_addr = Some(local_addr);
                default.remote_cnxid = ConnectionId::EMPTY;
                self.promote_path_to_default(path_id, now);
                path_id = 0;
                new_challenge_required = false;
            } else if !self.paths[path_id].activated {
                // The peer is probing a new path; bind a stashed CID if one
                // is available
                if let Some(stashed) = self.cnxid_stash.pop_front() {
                    let path = &mut self.paths[path_id];
                    path.remote_cnxid = stashed.cnx_id;
                    path.remote_cnxid_sequence = stashed.sequence;
                    path.reset_secret = stashed.reset_secret;
                    path.activated = true;
                    path.peer_addr = Some(peer_addr);
                    path.local_addr = Some(local_addr);
                    new_challenge_required = true;
                } else {
                    let path = &mut self.paths[path_id];
                    path.activated = false;
                    path.challenge_required = false;
                    new_challenge_required = false;
                }
            }
        } else {
            // The CID is documented but the addresses moved: NAT rebinding.
            // At most one such attempt is kept pending at a time.
            let path = &mut self.paths[path_id];
            if path.alt_addresses_match(peer_addr, local_addr) {
                // Further traffic from the same alternate addresses
                if path.alt_challenge_timeout.is_some_and(|t| now > t) {
                    path.alt_challenge_timeout = None;
                    path.alt_challenge_required = true;
                    path.alt_challenge_repeat_count = 0;
                    self.alt_path_challenge_needed = true;
                    new_challenge_required = true;
                }
            } else {
                let alt_unset = path.alt_peer_addr.is_none() && path.alt_local_addr.is_none();
                let alt_expired = path.alt_challenge_timeout.map_or(true, |t| now > t);
                if (alt_unset || alt_expired)
                    && ph.pn64
                        >= self.spaces[PnSpace::Application as usize].highest_received()
                {
                    // A most-recent packet from new addresses; probably a NAT
                    // rebinding but possibly an attack, so challenge both
                    // address sets
                    trace!(%peer_addr, "suspected NAT rebinding");
                    path.alt_peer_addr = Some(peer_addr);
                    path.alt_local_addr = Some(local_addr);
                    for i in 0..crate::CHALLENGE_REPEAT_MAX {
                        path.alt_challenge[i] = rand::RngCore::next_u64(&mut self.rng);
                    }
                    path.alt_challenge_required = true;
                    path.alt_challenge_timeout = None;
                    path.alt_challenge_repeat_count = 0;
                    self.alt_path_challenge_needed = true;
                    new_challenge_required = true;
                } else {
                    // Can't honor the new addresses; treat the packet as if
                    // received on the matching path
                }
            }
        }

        if new_challenge_required {
            let rng = &mut self.rng;
            self.paths[path_id].refresh_challenges(now, rng);
        }

        Ok(path_id)
    }

    pub(crate) fn create_path(
        &mut self,
        now: Instant,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> usize {
        self.paths.push(Path::new(
            now,
            &self.transport_config,
            ConnectionId::EMPTY,
            peer_addr,
            local_addr,
        ));
        self.paths.len() - 1
    }

    fn promote_path_to_default(&mut self, path_id: usize, _now: Instant) {
        self.paths.swap(0, path_id);
    }

    //
    // Helpers shared by the dispatchers
    //

    fn decode_frames(
        &mut self,
        bytes: &[u8],
        ph: &PacketHeader,
        path_id: usize,
    ) -> Result<(), RecvError> {
        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        match self.frames.decode(payload, ph.epoch, path_id) {
            Ok(summary) => {
                if summary.ack_eliciting {
                    self.spaces[ph.pc as usize].ack_needed = true;
                }
                if summary.close_received && self.state < State::ClosingReceived {
                    // The peer started winding down; from here on, only
                    // closing frames are interpreted
                    debug!("close received; entering closing");
                    self.state = State::ClosingReceived;
                }
                Ok(())
            }
            Err(e) => Err(self.connection_error(e)),
        }
    }

    /// Handshake data arriving after its epoch concluded: generate no side
    /// effects, but keep the peer's retransmission machinery happy by acking
    /// when the payload calls for it
    fn ignore_incoming_handshake(&mut self, bytes: &[u8], ph: &PacketHeader) {
        let pc = match ph.ptype {
            PacketType::Initial => PnSpace::Initial,
            PacketType::Handshake => PnSpace::Handshake,
            _ => return,
        };
        let payload = &bytes[ph.offset..ph.offset + ph.payload_length];
        if let Ok(summary) = self.frames.skip(payload) {
            if summary.ack_eliciting {
                self.spaces[pc as usize].ack_needed = true;
            }
        }
    }

    /// Run the TLS machine and apply whatever it produced
    fn pump_tls(&mut self) -> Result<(), RecvError> {
        let progress = match self.tls.process() {
            Ok(progress) => progress,
            Err(e) => return Err(self.connection_error(e)),
        };

        for (epoch, ctx) in progress.key_upgrades {
            trace!(?epoch, "new key material");
            self.crypto[epoch as usize] = ctx;
        }
        if progress.flight_ready && self.state == State::ServerInit {
            self.state = State::ServerAlmostReady;
        }
        if progress.handshake_complete {
            match self.side {
                Side::Client => {
                    if matches!(
                        self.state,
                        State::ClientHandshakeStart | State::ClientHandshakeProgress
                    ) {
                        self.state = State::ClientAlmostReady;
                    }
                }
                Side::Server => {
                    if matches!(
                        self.state,
                        State::ServerAlmostReady | State::ServerFalseStart
                    ) {
                        self.state = State::Ready;
                    }
                }
            }
        }
        Ok(())
    }

    /// The peer has implicitly acknowledged everything in `pc`
    fn implicit_handshake_ack(&mut self, pc: PnSpace, _now: Instant) {
        let space = &mut self.spaces[pc as usize];
        space.retransmit_oldest = None;
        space.nb_retransmit = 0;
    }

    fn connection_error(&mut self, error: TransportError) -> RecvError {
        debug!(%error, "connection error");
        self.local_error = Some(error);
        self.state = if self.state < State::Ready {
            State::HandshakeFailure
        } else {
            State::Closing
        };
        RecvError::Detected
    }

    /// Return to a pre-Initial state after accepting a Retry
    fn reset(&mut self, _now: Instant) {
        self.spaces = Default::default();
        self.crypto = Default::default();
        self.crypto[Epoch::Initial as usize] =
            self.crypto_config.initial_keys(&self.initial_cnxid, self.side);
        self.crypto_old = CryptoContext::empty();
        self.crypto_new = CryptoContext::empty();
        self.key_phase_dec = false;
        self.key_phase_enc = false;
        self.crypto_rotation_sequence = 0;
        self.crypto_rotation_time_guard = None;
        self.tls = self
            .crypto_config
            .start_session(self.side, self.server_name.as_deref());
        self.state = State::ClientInitSent;
    }

    /// ECN counters only accumulate for the default path
    fn ecn_accounting(&mut self, ecn: Option<EcnCodepoint>, path_id: usize) {
        if path_id != 0 {
            return;
        }
        match ecn {
            Some(EcnCodepoint::Ect1) => {
                self.ecn_ect1_total_local += 1;
                self.sending_ecn_ack = true;
            }
            Some(EcnCodepoint::Ect0) => {
                self.ecn_ect0_total_local += 1;
                self.sending_ecn_ack = true;
            }
            Some(EcnCodepoint::Ce) => {
                self.ecn_ce_total_local += 1;
                self.sending_ecn_ack = true;
            }
            None => {}
        }
    }

    /// Paths of this connection; index 0 is the default path
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn paths_mut(&mut self) -> &mut [Path] {
        &mut self.paths
    }

    /// Packet number space for `pc`
    pub fn space(&self, pc: PnSpace) -> &PacketNumberSpace {
        &self.spaces[pc as usize]
    }

    pub fn space_mut(&mut self, pc: PnSpace) -> &mut PacketNumberSpace {
        &mut self.spaces[pc as usize]
    }

    /// Context the congestion controller keys its recovery guard on
    pub fn cc_context(&self) -> CcContext {
        let space = &self.spaces[PnSpace::Application as usize];
        CcContext {
            send_sequence: space.send_sequence,
            highest_acknowledged: space.highest_acknowledged,
        }
    }

    /// Record a packet number as received and schedule acknowledgement
    /// bookkeeping
    pub(crate) fn record_pn_received(&mut self, pc: PnSpace, pn64: u64) {
        self.spaces[pc as usize].received.insert(pn64);
    }
}

#[cfg(test)]
mod tests;
