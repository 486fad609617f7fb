//! The process-wide registry and datagram entry point.
//!
//! A [`Quic`] owns every connection, the two hash indexes used to route
//! incoming packets (by destination CID and by source address), and the
//! queue of stateless packets awaiting transmission. It performs no I/O:
//! the embedder feeds datagrams to [`Quic::incoming_datagram`] and drains
//! [`Quic::poll_transmit`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::coding::BufMutExt;
use crate::config::{ConfigError, EndpointConfig, ServerConfig, TransportConfig};
use crate::connection::{Connection, State};
use crate::packet::{self, PacketHeader, PacketType, PnSpace};
use crate::shared::{ConnectionId, EcnCodepoint, RecvError};
use crate::token::{ResetToken, RetryToken};
use crate::{
    Side, ENFORCED_INITIAL_CID_LENGTH, ENFORCED_INITIAL_MTU, RESET_PACKET_MIN_SIZE,
    RESET_PACKET_PAD_SIZE, RESET_SECRET_SIZE, SUPPORTED_VERSIONS, TOKEN_DELAY_SHORT,
};

/// Internal identifier for a `Connection` within an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// An outbound stateless packet, ready for the socket layer
#[derive(Debug)]
pub struct Transmit {
    pub destination: SocketAddr,
    /// Local address the packet should leave from, when known
    pub local: Option<SocketAddr>,
    pub contents: Vec<u8>,
}

/// Errors in the parameters being used to create a new connection
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectError {
    /// The number of active connections is at the limit of the local CID
    /// space
    #[error("too many connections")]
    TooManyConnections,
}

/// The main entry point to the library: one UDP endpoint's worth of QUIC
/// state
pub struct Quic {
    rng: StdRng,
    config: Arc<EndpointConfig>,
    server_config: Option<Arc<ServerConfig>>,
    transport_config: TransportConfig,
    connections: Slab<Connection>,
    /// Routes packets by destination CID: local CIDs and, server side,
    /// client-chosen initial CIDs
    index_by_cid: FxHashMap<ConnectionId, ConnectionHandle>,
    /// Routes packets by source address, for zero-length-CID peers and
    /// stateless reset recognition
    index_by_addr: FxHashMap<SocketAddr, ConnectionHandle>,
    transmits: VecDeque<Transmit>,
    /// When each connection next wants the external scheduler's attention
    wake_times: FxHashMap<usize, Instant>,
    creation: Instant,
}

impl Quic {
    pub fn new(
        config: Arc<EndpointConfig>,
        server_config: Option<Arc<ServerConfig>>,
        transport_config: TransportConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        transport_config.validate()?;
        Ok(Self {
            rng: StdRng::from_entropy(),
            config,
            server_config,
            transport_config,
            connections: Slab::new(),
            index_by_cid: FxHashMap::default(),
            index_by_addr: FxHashMap::default(),
            transmits: VecDeque::new(),
            wake_times: FxHashMap::default(),
            creation: Instant::now(),
        })
    }

    fn is_server(&self) -> bool {
        self.server_config.is_some()
    }

    /// Get the next stateless packet to transmit
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn connection(&self, ch: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(ch.0)
    }

    pub fn connection_mut(&mut self, ch: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(ch.0)
    }

    /// The connection the external scheduler should serve next
    pub fn next_wake(&self) -> Option<(ConnectionHandle, Instant)> {
        self.wake_times
            .iter()
            .min_by_key(|(_, t)| **t)
            .map(|(ch, t)| (ConnectionHandle(*ch), *t))
    }

    /// Drop a connection and every index entry routing to it
    pub fn remove_connection(&mut self, ch: ConnectionHandle) {
        if !self.connections.contains(ch.0) {
            return;
        }
        let conn = self.connections.remove(ch.0);
        if !conn.initial_cnxid.is_empty()
            && self.index_by_cid.get(&conn.initial_cnxid) == Some(&ch)
        {
            self.index_by_cid.remove(&conn.initial_cnxid);
        }
        for path in &conn.paths {
            if path.local_cnxid.len() > 0
                && self.index_by_cid.get(&path.local_cnxid) == Some(&ch)
            {
                self.index_by_cid.remove(&path.local_cnxid);
            }
        }
        self.index_by_addr.retain(|_, v| *v != ch);
        self.wake_times.remove(&ch.0);
    }

    /// Initiate a connection
    pub fn connect(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        server_name: &str,
    ) -> Result<ConnectionHandle, ConnectError> {
        if self.is_full() {
            return Err(ConnectError::TooManyConnections);
        }
        let initial_cnxid = ConnectionId::random(&mut self.rng, ENFORCED_INITIAL_CID_LENGTH);
        let local_cnxid = self.new_local_cid();
        trace!(initial_dcid = %initial_cnxid, "connecting");
        let conn = Connection::new(
            Side::Client,
            self.config.crypto.clone(),
            self.config.frames.clone(),
            self.transport_config.clone(),
            initial_cnxid,
            local_cnxid,
            remote,
            Some(server_name.to_owned()),
            SUPPORTED_VERSIONS[0],
            now,
            StdRng::seed_from_u64(self.rng.gen()),
        );
        let ch = ConnectionHandle(self.connections.insert(conn));
        if local_cnxid.len() > 0 {
            self.index_by_cid.insert(local_cnxid, ch);
        }
        self.index_by_addr.insert(remote, ch);
        self.wake_times.insert(ch.0, now);
        Ok(ch)
    }

    /// Process one incoming UDP datagram, decoding coalesced segments left
    /// to right
    pub fn incoming_datagram(
        &mut self,
        now: Instant,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        ecn: Option<EcnCodepoint>,
        data: &mut [u8],
    ) {
        let packet_length = data.len();
        let mut consumed_index = 0;
        let mut previous_dest_id: Option<ConnectionId> = None;
        let mut ecn = ecn;

        while consumed_index < packet_length {
            match self.incoming_segment(
                now,
                &mut data[consumed_index..],
                packet_length,
                peer_addr,
                local_addr,
                ecn,
                &mut previous_dest_id,
            ) {
                Ok(consumed) => consumed_index += consumed,
                Err(e) => {
                    trace!(code = e.code(), "halting datagram processing");
                    break;
                }
            }
            // Avoid double counting ECN marks across coalesced segments
            ecn = None;
        }
    }

    /// Parse, decrypt and dispatch one segment; `Ok` carries the bytes
    /// consumed
    fn incoming_segment(
        &mut self,
        now: Instant,
        segment: &mut [u8],
        packet_length: usize,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        ecn: Option<EcnCodepoint>,
        previous_dest_id: &mut Option<ConnectionId>,
    ) -> Result<usize, RecvError> {
        let mut ph = packet::parse_header(segment, self.config.local_cid_len)
            .map_err(|_| RecvError::Detected)?;

        let is_stateless_type = matches!(
            ph.ptype,
            PacketType::VersionNegotiation | PacketType::Retry
        );
        let consumed = if is_stateless_type {
            segment.len()
        } else {
            ph.offset + ph.payload_length
        };

        let mut ch = self.lookup_connection(&ph, peer_addr);
        let mut new_ctx_created = false;

        if ch.is_none() && ph.ptype == PacketType::Initial {
            // A connection context may be created if the Initial is
            // acceptable
            if packet_length < ENFORCED_INITIAL_MTU {
                return Err(RecvError::InitialTooShort);
            }
            if ph.dest_cnx_id.len() < ENFORCED_INITIAL_CID_LENGTH {
                return Err(RecvError::InitialCidTooShort);
            }
            if self.is_server() {
                ch = Some(self.create_server_connection(&ph, peer_addr, now));
                new_ctx_created = true;
            }
        }

        let mut result: Result<(), RecvError> = Ok(());

        if let Some(c) = ch {
            if !is_stateless_type {
                let conn = &mut self.connections[c.0];
                let decrypted = match conn.remove_header_protection(segment, &mut ph) {
                    Ok(()) => conn.remove_packet_protection(segment, &ph, now),
                    Err(e) => Err(e),
                };
                match decrypted {
                    Ok(decoded) => {
                        if conn.spaces[ph.pc as usize].received.contains(ph.pn64) {
                            result = Err(RecvError::Duplicate);
                        } else {
                            ph.payload_length = decoded;
                        }
                    }
                    Err(_) => {
                        if ph.ptype == PacketType::OneRtt
                            && segment.len() >= RESET_PACKET_MIN_SIZE
                            && reset_secret_matches(
                                &segment[segment.len() - RESET_SECRET_SIZE..],
                                &conn.paths[0].reset_secret,
                            )
                        {
                            result = Err(RecvError::StatelessReset);
                        } else {
                            result = Err(RecvError::AeadCheck);
                            if new_ctx_created {
                                // The speculative context is torn down at once
                                self.remove_connection(c);
                                ch = None;
                                new_ctx_created = false;
                            }
                        }
                    }
                }
            }
        } else if ph.ptype == PacketType::OneRtt {
            // Possibly a packet for a forgotten connection; only stateless
            // reset recognition may match by address here
            if let Some(&candidate) = self.index_by_addr.get(&peer_addr) {
                let conn = &self.connections[candidate.0];
                if segment.len() >= RESET_PACKET_MIN_SIZE
                    && reset_secret_matches(
                        &segment[segment.len() - RESET_SECRET_SIZE..],
                        &conn.paths[0].reset_secret,
                    )
                {
                    ch = Some(candidate);
                    result = Err(RecvError::StatelessReset);
                }
            }
        }

        // All segments coalesced into one datagram must share a destination
        if result.is_ok() {
            match previous_dest_id {
                None => *previous_dest_id = Some(ph.dest_cnx_id),
                Some(prev) if *prev != ph.dest_cnx_id => {
                    result = Err(RecvError::CnxidSegment);
                }
                _ => {}
            }
        }

        if result.is_ok() {
            result = match ch {
                None => {
                    if ph.version_index.is_none() && ph.version != 0 {
                        if packet_length >= ENFORCED_INITIAL_MTU {
                            self.queue_version_negotiation(peer_addr, local_addr, &ph);
                        }
                        Ok(())
                    } else {
                        if !ph.dest_cnx_id.is_empty() {
                            self.queue_stateless_reset(
                                segment.len(),
                                peer_addr,
                                local_addr,
                                &ph,
                            );
                        }
                        Err(RecvError::Detected)
                    }
                }
                Some(c) => self.dispatch_segment(
                    c,
                    segment,
                    &ph,
                    packet_length,
                    peer_addr,
                    local_addr,
                    ecn,
                    now,
                    new_ctx_created,
                ),
            };
        }

        // Special outcomes observed before the common drop handling
        match result {
            Err(RecvError::StatelessReset) => {
                if let Some(c) = ch {
                    self.connections[c.0].incoming_stateless_reset();
                }
            }
            Err(RecvError::AeadCheck) => {
                // A handshake segment failing while the Initial flight is
                // outstanding means the server's Initial was probably lost;
                // force an immediate retransmit
                if let Some(c) = ch {
                    if ph.ptype == PacketType::Handshake {
                        let conn = &mut self.connections[c.0];
                        if matches!(
                            conn.state(),
                            State::ClientInitSent | State::ClientInitResent
                        ) {
                            let space = &conn.spaces[PnSpace::Initial as usize];
                            if space.nb_retransmit == 0 {
                                if let Some(marker) = space.retransmit_oldest {
                                    conn.paths[0].retransmit_timer =
                                        now.saturating_duration_since(marker.send_time);
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        // The dispatcher may have deleted the connection
        if let Some(c) = ch {
            if !self.connections.contains(c.0) {
                ch = None;
            }
        }

        match result {
            Ok(()) | Err(RecvError::SpuriousRepeat) => {
                if let Some(c) = ch {
                    let conn = &mut self.connections[c.0];
                    if conn.state() != State::Disconnected
                        && ph.ptype != PacketType::VersionNegotiation
                    {
                        conn.record_pn_received(ph.pc, ph.pn64);
                    }
                    self.wake_times.insert(c.0, now);
                }
                match result {
                    Ok(()) => Ok(consumed),
                    Err(e) => Err(e),
                }
            }
            Err(RecvError::Duplicate) => {
                // Dropped silently, but duplicates still earn an ack
                if let Some(c) = ch {
                    self.connections[c.0].spaces[ph.pc as usize].ack_needed = true;
                }
                Err(RecvError::Duplicate)
            }
            Err(e) => {
                debug!(code = e.code(), ptype = ?ph.ptype, "segment dropped");
                if let Some(c) = ch {
                    self.wake_times.insert(c.0, now);
                }
                Err(e)
            }
        }
    }

    /// Find the connection a freshly parsed segment belongs to, honoring the
    /// type-dependent matching rules
    fn lookup_connection(
        &self,
        ph: &PacketHeader,
        peer_addr: SocketAddr,
    ) -> Option<ConnectionHandle> {
        match ph.ptype {
            PacketType::VersionNegotiation => {
                if !ph.dest_cnx_id.is_empty() {
                    self.index_by_cid.get(&ph.dest_cnx_id).copied()
                } else {
                    let ch = self.index_by_addr.get(&peer_addr).copied()?;
                    // Address matching only applies to zero-length-CID
                    // connections
                    if self.connections[ch.0].paths[0].local_cnxid.len() != 0 {
                        return None;
                    }
                    Some(ch)
                }
            }
            PacketType::Initial
            | PacketType::ZeroRtt
            | PacketType::Handshake
            | PacketType::Retry => {
                let by_id = if !ph.dest_cnx_id.is_empty() {
                    self.index_by_cid.get(&ph.dest_cnx_id).copied()
                } else {
                    None
                };
                by_id.or_else(|| {
                    let ch = self.index_by_addr.get(&peer_addr).copied()?;
                    let conn = &self.connections[ch.0];
                    // A match by address is only valid when CID-based
                    // matching cannot apply
                    if conn.side().is_client() {
                        if conn.paths[0].local_cnxid.len() != 0 {
                            return None;
                        }
                    } else if !matches!(
                        ph.ptype,
                        PacketType::Initial | PacketType::ZeroRtt
                    ) {
                        return None;
                    } else if conn.initial_cnxid != ph.dest_cnx_id {
                        return None;
                    }
                    Some(ch)
                })
            }
            PacketType::OneRtt => {
                if self.config.local_cid_len > 0 {
                    self.index_by_cid.get(&ph.dest_cnx_id).copied()
                } else {
                    self.index_by_addr.get(&peer_addr).copied()
                }
            }
            PacketType::Error => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_segment(
        &mut self,
        c: ConnectionHandle,
        segment: &[u8],
        ph: &PacketHeader,
        packet_length: usize,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        ecn: Option<EcnCodepoint>,
        now: Instant,
        new_ctx_created: bool,
    ) -> Result<(), RecvError> {
        match ph.ptype {
            PacketType::VersionNegotiation => {
                let conn = &mut self.connections[c.0];
                if conn.state() == State::ClientInitSent {
                    conn.incoming_version_negotiation(segment, ph)
                } else {
                    Err(RecvError::Detected)
                }
            }
            PacketType::Initial => {
                {
                    let conn = &mut self.connections[c.0];
                    let matches_identity = (conn.side().is_server()
                        && ph.dest_cnx_id == conn.initial_cnxid)
                        || ph.dest_cnx_id == conn.paths[0].local_cnxid;
                    if !matches_identity {
                        return Err(RecvError::Detected);
                    }
                    // Document or verify the peer's source CID
                    if conn.paths[0].remote_cnxid.is_empty() {
                        conn.paths[0].remote_cnxid = ph.srce_cnx_id;
                    } else if conn.paths[0].remote_cnxid != ph.srce_cnx_id {
                        debug!("initial with wrong source CID");
                        return Err(RecvError::UnexpectedPacket);
                    }
                }
                if self.connections[c.0].side().is_server() {
                    let mut result = self.server_initial(
                        c,
                        segment,
                        ph,
                        packet_length,
                        peer_addr,
                        local_addr,
                        now,
                    );
                    let failed = result.is_err()
                        || self.connections[c.0].state() == State::Disconnected;
                    if failed && new_ctx_created {
                        self.remove_connection(c);
                        result = Err(RecvError::ConnectionDeleted);
                    }
                    result
                } else {
                    self.connections[c.0].incoming_server_initial(segment, ph, local_addr, now)
                }
            }
            PacketType::Retry => self.connections[c.0].incoming_retry(segment, ph, now),
            PacketType::Handshake => {
                let conn = &mut self.connections[c.0];
                if conn.side().is_client() {
                    conn.incoming_server_handshake(segment, ph)
                } else {
                    conn.incoming_client_handshake(segment, ph)
                }
            }
            PacketType::ZeroRtt => self.connections[c.0].incoming_0rtt(segment, ph),
            PacketType::OneRtt => self.connections[c.0].incoming_encrypted(
                segment, ph, peer_addr, local_addr, ecn, now,
            ),
            PacketType::Error => Err(RecvError::Detected),
        }
    }

    /// Token verification and the rest of server-side Initial processing
    fn server_initial(
        &mut self,
        c: ConnectionHandle,
        segment: &[u8],
        ph: &PacketHeader,
        packet_length: usize,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: Instant,
    ) -> Result<(), RecvError> {
        let server_config = match self.server_config.clone() {
            Some(config) => config,
            None => return Err(RecvError::UnexpectedPacket),
        };
        let server_busy = server_config.server_busy;

        if server_config.check_token
            && self.connections[c.0].state() == State::ServerInit
            && !server_busy
        {
            let token = &segment[ph.token_offset..ph.token_offset + ph.token_length];
            match RetryToken::verify(
                &*server_config.token_key,
                &peer_addr,
                self.micros(now),
                token,
            ) {
                Ok(verified) => {
                    let conn = &mut self.connections[c.0];
                    conn.original_cnxid = verified.orig_dst_cid;
                    conn.initial_validated = true;
                }
                Err(_) => {
                    debug!("invalid retry token; answering with a fresh retry");
                    let expiry = self.micros(now + TOKEN_DELAY_SHORT);
                    let fresh = RetryToken::encode(
                        &*server_config.token_key,
                        &peer_addr,
                        expiry,
                        &ph.dest_cnx_id,
                    );
                    self.queue_stateless_retry(c, ph, peer_addr, local_addr, &fresh);
                    return Err(RecvError::Retry);
                }
            }
        }

        self.connections[c.0].incoming_client_initial(
            segment,
            ph,
            packet_length,
            server_busy,
            peer_addr,
            local_addr,
        )
    }

    //
    // Stateless responses
    //

    /// Answer an unsupported version with the list we do speak, plus grease
    fn queue_version_negotiation(
        &mut self,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        ph: &PacketHeader,
    ) {
        trace!(version = ph.version, "sending version negotiation");
        let mut buf = Vec::new();
        buf.push(self.rng.gen::<u8>() | 0x80);
        buf.write(0u32);
        // Roles swap: our destination is their source
        buf.push(ph.srce_cnx_id.len() as u8);
        buf.extend_from_slice(&ph.srce_cnx_id);
        buf.push(ph.dest_cnx_id.len() as u8);
        buf.extend_from_slice(&ph.dest_cnx_id);
        for &version in SUPPORTED_VERSIONS {
            buf.write(version);
        }
        // Grease with a reserved value that must not match the offer
        let grease = loop {
            let candidate = (self.rng.gen::<u32>() & 0x0f0f_0f0f) | 0x0a0a_0a0a;
            if candidate != ph.version {
                break candidate;
            }
        };
        buf.write(grease);

        self.transmits.push_back(Transmit {
            destination: peer_addr,
            local: Some(local_addr),
            contents: buf,
        });
    }

    /// Answer an unknown DCID on a 1-RTT packet with a stateless reset
    fn queue_stateless_reset(
        &mut self,
        segment_length: usize,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        ph: &PacketHeader,
    ) {
        if ph.ptype != PacketType::OneRtt || segment_length < RESET_PACKET_MIN_SIZE {
            return;
        }
        debug!(dcid = %ph.dest_cnx_id, "unknown CID; sending stateless reset");

        let headroom = segment_length - RESET_SECRET_SIZE - 1;
        let pad_size = if headroom > RESET_PACKET_PAD_SIZE {
            self.rng.gen_range(0..headroom - RESET_PACKET_PAD_SIZE) + RESET_PACKET_PAD_SIZE
        } else {
            RESET_PACKET_PAD_SIZE
        };

        let mut buf = Vec::with_capacity(1 + pad_size + RESET_SECRET_SIZE);
        buf.push(0x30 | (self.rng.gen::<u8>() & 0x1f));
        let mut padding = vec![0u8; pad_size];
        self.rng.fill_bytes(&mut padding);
        buf.extend_from_slice(&padding);
        buf.extend_from_slice(&ResetToken::new(&*self.config.reset_key, &ph.dest_cnx_id));

        self.transmits.push_back(Transmit {
            destination: peer_addr,
            local: Some(local_addr),
            contents: buf,
        });
    }

    /// Queue a Retry carrying `odcil || odcid || token`
    fn queue_stateless_retry(
        &mut self,
        c: ConnectionHandle,
        ph: &PacketHeader,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        token: &[u8],
    ) {
        let (local_cnxid, initial_cnxid) = {
            let conn = &mut self.connections[c.0];
            conn.paths[0].remote_cnxid = ph.srce_cnx_id;
            (conn.paths[0].local_cnxid, conn.initial_cnxid)
        };

        let mut buf = Vec::new();
        buf.push(0xf0);
        buf.write(ph.version);
        buf.push(ph.srce_cnx_id.len() as u8);
        buf.extend_from_slice(&ph.srce_cnx_id);
        buf.push(local_cnxid.len() as u8);
        buf.extend_from_slice(&local_cnxid);
        buf.push(initial_cnxid.len() as u8);
        buf.extend_from_slice(&initial_cnxid);
        buf.extend_from_slice(token);

        self.transmits.push_back(Transmit {
            destination: peer_addr,
            local: Some(local_addr),
            contents: buf,
        });
    }

    //
    // Connection bookkeeping
    //

    fn create_server_connection(
        &mut self,
        ph: &PacketHeader,
        peer_addr: SocketAddr,
        now: Instant,
    ) -> ConnectionHandle {
        let local_cnxid = self.new_local_cid();
        let conn = Connection::new(
            Side::Server,
            self.config.crypto.clone(),
            self.config.frames.clone(),
            self.transport_config.clone(),
            ph.dest_cnx_id,
            local_cnxid,
            peer_addr,
            None,
            ph.version,
            now,
            StdRng::seed_from_u64(self.rng.gen()),
        );
        let ch = ConnectionHandle(self.connections.insert(conn));
        trace!(icid = %ph.dest_cnx_id, "incoming connection");
        self.index_by_cid.insert(ph.dest_cnx_id, ch);
        if local_cnxid.len() > 0 {
            self.index_by_cid.insert(local_cnxid, ch);
        }
        self.index_by_addr.insert(peer_addr, ch);
        ch
    }

    fn new_local_cid(&mut self) -> ConnectionId {
        if self.config.local_cid_len == 0 {
            return ConnectionId::EMPTY;
        }
        loop {
            let cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            if !self.index_by_cid.contains_key(&cid) {
                break cid;
            }
        }
    }

    /// Whether 3/4 of the local CID space is already in use
    fn is_full(&self) -> bool {
        self.config.local_cid_len <= 4
            && self.config.local_cid_len != 0
            && (2usize.pow(self.config.local_cid_len as u32 * 8) - self.index_by_cid.len())
                < 2usize.pow(self.config.local_cid_len as u32 * 8 - 2)
    }

    fn micros(&self, t: Instant) -> u64 {
        t.saturating_duration_since(self.creation).as_micros() as u64
    }
}

/// Compare a segment tail against a path's reset secret.
///
/// Accumulates the XOR of every byte pair before testing, so the running
/// time does not depend on the position of the first difference.
fn reset_secret_matches(tail: &[u8], secret: &[u8; RESET_SECRET_SIZE]) -> bool {
    debug_assert_eq!(tail.len(), RESET_SECRET_SIZE);
    let mut acc: u32 = 0;
    for (x, y) in tail.iter().zip(secret.iter()) {
        acc += u32::from(x ^ y);
    }
    acc == 0
}
