use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::*;
use crate::config::TransportConfig;
use crate::congestion::Notification;
use crate::crypto::testing;
use crate::frame::testing::TestFrameDecoder;
use crate::packet::PacketHeader;
use crate::SUPPORTED_VERSIONS;

fn client_addr() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], 4433))
}

fn server_addr() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 2], 443))
}

fn initial_cid() -> ConnectionId {
    ConnectionId::new(&[0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8])
}

fn server_cid() -> ConnectionId {
    ConnectionId::new(&[0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58])
}

fn connection(side: Side, local_cid_len: usize) -> (Connection, Arc<TestFrameDecoder>) {
    let frames = TestFrameDecoder::new();
    let local_cnxid = match local_cid_len {
        0 => ConnectionId::EMPTY,
        n => ConnectionId::new(&vec![0x0c; n]),
    };
    let peer = match side {
        Side::Client => server_addr(),
        Side::Server => client_addr(),
    };
    let conn = Connection::new(
        side,
        testing::config(),
        frames.clone(),
        TransportConfig::default(),
        initial_cid(),
        local_cnxid,
        peer,
        match side {
            Side::Client => Some("example.com".into()),
            Side::Server => None,
        },
        SUPPORTED_VERSIONS[0],
        Instant::now(),
        StdRng::seed_from_u64(7),
    );
    (conn, frames)
}

/// A header describing `payload_length` bytes of already-decrypted payload
/// starting at `offset` zero
fn header(ptype: PacketType, payload_length: usize) -> PacketHeader {
    let mut ph = PacketHeader::null();
    ph.ptype = ptype;
    ph.version = SUPPORTED_VERSIONS[0];
    ph.version_index = Some(0);
    ph.payload_length = payload_length;
    ph.epoch = match ptype {
        PacketType::ZeroRtt => Epoch::ZeroRtt,
        PacketType::Handshake => Epoch::Handshake,
        PacketType::OneRtt => Epoch::OneRtt,
        _ => Epoch::Initial,
    };
    ph.pc = match ptype {
        PacketType::ZeroRtt | PacketType::OneRtt => PnSpace::Application,
        PacketType::Handshake => PnSpace::Handshake,
        _ => PnSpace::Initial,
    };
    ph
}

#[test]
fn retry_restarts_handshake() {
    let (mut conn, _) = connection(Side::Client, 8);
    let odcid = initial_cid();

    let mut payload = vec![odcid.len() as u8];
    payload.extend_from_slice(&odcid);
    payload.extend_from_slice(b"resume-token");
    let mut ph = header(PacketType::Retry, payload.len());
    ph.srce_cnx_id = server_cid();

    assert_matches!(
        conn.incoming_retry(&payload, &ph, Instant::now()),
        Err(RecvError::Retry)
    );
    assert_eq!(conn.original_cnxid, odcid);
    assert_eq!(conn.initial_cnxid, server_cid());
    assert_eq!(conn.retry_token(), Some(&b"resume-token"[..]));
    assert_eq!(conn.state(), State::ClientInitSent);
}

#[test]
fn retry_rejected_after_first() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.original_cnxid = ConnectionId::new(&[1; 8]);

    let mut payload = vec![initial_cid().len() as u8];
    payload.extend_from_slice(&initial_cid());
    let ph = header(PacketType::Retry, payload.len());

    assert_matches!(
        conn.incoming_retry(&payload, &ph, Instant::now()),
        Err(RecvError::UnexpectedPacket)
    );
}

#[test]
fn retry_rejected_on_odcid_mismatch() {
    let (mut conn, _) = connection(Side::Client, 8);

    let wrong = ConnectionId::new(&[0xff; 8]);
    let mut payload = vec![wrong.len() as u8];
    payload.extend_from_slice(&wrong);
    let mut ph = header(PacketType::Retry, payload.len());
    ph.srce_cnx_id = server_cid();

    assert_matches!(
        conn.incoming_retry(&payload, &ph, Instant::now()),
        Err(RecvError::UnexpectedPacket)
    );
    assert!(conn.original_cnxid.is_empty());
}

#[test]
fn version_negotiation_must_echo_our_cid() {
    let (mut conn, _) = connection(Side::Client, 8);
    let mut payload = Vec::new();
    payload.extend_from_slice(&0xff00_001du32.to_be_bytes());

    // wrong DCID: silently ignored
    let mut ph = header(PacketType::VersionNegotiation, payload.len());
    ph.version = 0;
    ph.dest_cnx_id = ConnectionId::new(&[0xee; 8]);
    assert_matches!(conn.incoming_version_negotiation(&payload, &ph), Ok(()));
    assert_eq!(conn.state(), State::ClientInitSent);
    assert_eq!(conn.poll_event(), None);

    // proper echo: version list delivered, connection abandoned
    ph.dest_cnx_id = conn.paths[0].local_cnxid;
    assert_matches!(conn.incoming_version_negotiation(&payload, &ph), Ok(()));
    assert_eq!(conn.state(), State::Disconnected);
    assert_eq!(
        conn.poll_event(),
        Some(Event::VersionNegotiation(vec![0xff00_001d]))
    );
    assert_eq!(conn.poll_event(), None);
}

#[test]
fn server_initial_drives_client_handshake() {
    let (mut conn, frames) = connection(Side::Client, 8);

    let payload = vec![0u8; 64];
    let mut ph = header(PacketType::Initial, payload.len());
    ph.srce_cnx_id = server_cid();
    conn.spaces[PnSpace::Initial as usize].retransmit_oldest = Some(spaces::SentMarker {
        send_time: Instant::now(),
    });

    conn.incoming_server_initial(&payload, &ph, client_addr(), Instant::now())
        .unwrap();

    assert_eq!(conn.state(), State::ClientHandshakeProgress);
    assert_eq!(conn.paths[0].remote_cnxid, server_cid());
    assert_eq!(conn.paths[0].local_addr, Some(client_addr()));
    assert!(conn.crypto[Epoch::Handshake as usize].aead_rx.is_some());
    // the Initial space was implicitly acknowledged
    assert!(conn.spaces[PnSpace::Initial as usize]
        .retransmit_oldest
        .is_none());
    assert!(conn.spaces[PnSpace::Initial as usize].ack_needed);
    assert_eq!(frames.decoded.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn server_initial_scid_change_rejected() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.paths[0].remote_cnxid = server_cid();

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::Initial, payload.len());
    ph.srce_cnx_id = ConnectionId::new(&[0x77; 8]);

    assert_matches!(
        conn.incoming_server_initial(&payload, &ph, server_addr(), Instant::now()),
        Err(RecvError::CnxidCheck)
    );
}

#[test]
fn handshake_with_empty_payload_is_violation() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::ClientHandshakeStart;
    conn.paths[0].remote_cnxid = server_cid();

    let mut ph = header(PacketType::Handshake, 0);
    ph.srce_cnx_id = server_cid();

    assert_matches!(
        conn.incoming_server_handshake(&[], &ph),
        Err(RecvError::Detected)
    );
    assert_eq!(conn.state(), State::HandshakeFailure);
    assert_eq!(conn.local_error(), Some(TransportError::PROTOCOL_VIOLATION));
}

#[test]
fn late_handshake_is_ack_only() {
    let (mut conn, frames) = connection(Side::Server, 8);
    conn.state = State::Ready;
    conn.paths[0].remote_cnxid = server_cid();

    let payload = vec![1u8; 16];
    let mut ph = header(PacketType::Handshake, payload.len());
    ph.srce_cnx_id = server_cid();

    conn.incoming_client_handshake(&payload, &ph).unwrap();
    assert!(conn.spaces[PnSpace::Handshake as usize].ack_needed);
    // no frame side effects were produced
    assert_eq!(frames.decoded.load(std::sync::atomic::Ordering::Relaxed), 0);
}

#[test]
fn zero_rtt_gating() {
    let (mut conn, _) = connection(Side::Server, 8);
    conn.paths[0].remote_cnxid = server_cid();

    let payload = vec![1u8; 16];
    let mut ph = header(PacketType::ZeroRtt, payload.len());
    ph.dest_cnx_id = initial_cid();
    ph.srce_cnx_id = server_cid();

    // too early
    assert_matches!(
        conn.incoming_0rtt(&payload, &ph),
        Err(RecvError::UnexpectedPacket)
    );

    conn.state = State::ServerAlmostReady;
    conn.incoming_0rtt(&payload, &ph).unwrap();
    assert!(conn.spaces[PnSpace::Application as usize].ack_needed);

    // once 1-RTT traffic has arrived, 0-RTT is no longer welcome
    conn.state = State::Ready;
    conn.is_1rtt_received = true;
    assert_matches!(
        conn.incoming_0rtt(&payload, &ph),
        Err(RecvError::UnexpectedPacket)
    );
}

#[test]
fn zero_rtt_cid_checks() {
    let (mut conn, _) = connection(Side::Server, 8);
    conn.state = State::ServerAlmostReady;
    conn.paths[0].remote_cnxid = server_cid();

    let payload = vec![1u8; 16];
    let mut ph = header(PacketType::ZeroRtt, payload.len());
    ph.dest_cnx_id = ConnectionId::new(&[0x13; 8]);
    ph.srce_cnx_id = server_cid();

    assert_matches!(conn.incoming_0rtt(&payload, &ph), Err(RecvError::CnxidCheck));
}

#[test]
fn closing_transitions_on_close_receipt() {
    let (mut conn, frames) = connection(Side::Client, 8);
    conn.state = State::Closing;
    frames
        .closing
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;

    conn.incoming_encrypted(
        &payload,
        &ph,
        server_addr(),
        client_addr(),
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.state(), State::Disconnected);

    // a server drains instead
    let (mut server, frames) = connection(Side::Server, 8);
    server.state = State::Closing;
    frames
        .closing
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = server.paths[0].local_cnxid;
    server
        .incoming_encrypted(
            &payload,
            &ph,
            client_addr(),
            server_addr(),
            None,
            Instant::now(),
        )
        .unwrap();
    assert_eq!(server.state(), State::Draining);
}

#[test]
fn close_frame_enters_closing_received() {
    let (mut conn, frames) = connection(Side::Client, 8);
    conn.state = State::Ready;
    frames
        .close_in_decode
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;

    conn.incoming_encrypted(
        &payload,
        &ph,
        server_addr(),
        client_addr(),
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.state(), State::ClosingReceived);

    // wind-down traffic is still parsed for closing frames, and the close
    // acknowledgement completes the teardown
    frames
        .closing
        .store(true, std::sync::atomic::Ordering::Relaxed);
    conn.incoming_encrypted(
        &payload,
        &ph,
        server_addr(),
        client_addr(),
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.state(), State::Disconnected);
}

#[test]
fn draining_parses_closing_frames_without_acking() {
    let (mut conn, frames) = connection(Side::Server, 8);
    conn.state = State::Draining;

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;

    conn.incoming_encrypted(
        &payload,
        &ph,
        client_addr(),
        server_addr(),
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.state(), State::Draining);
    // no acknowledgement is owed while draining
    assert!(!conn.spaces[PnSpace::Application as usize].ack_needed);

    frames
        .closing
        .store(true, std::sync::atomic::Ordering::Relaxed);
    conn.incoming_encrypted(
        &payload,
        &ph,
        client_addr(),
        server_addr(),
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.state(), State::Draining);
}

#[test]
fn encrypted_after_handshake_failure_is_unexpected() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::HandshakeFailure;

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;

    assert_matches!(
        conn.incoming_encrypted(
            &payload,
            &ph,
            server_addr(),
            client_addr(),
            None,
            Instant::now(),
        ),
        Err(RecvError::UnexpectedPacket)
    );
}

#[test]
fn closing_without_close_frame_just_acks() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Closing;

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;

    conn.incoming_encrypted(
        &payload,
        &ph,
        server_addr(),
        client_addr(),
        None,
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.state(), State::Closing);
    assert!(conn.spaces[PnSpace::Application as usize].ack_needed);
}

#[test]
fn encrypted_reserved_bits_are_violation() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;
    ph.has_reserved_bit_set = true;

    assert_matches!(
        conn.incoming_encrypted(
            &payload,
            &ph,
            server_addr(),
            client_addr(),
            None,
            Instant::now(),
        ),
        Err(RecvError::Detected)
    );
    assert_eq!(conn.local_error(), Some(TransportError::PROTOCOL_VIOLATION));
}

#[test]
fn ecn_accounting_default_path_only() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;

    let payload = vec![1u8; 32];
    let mut ph = header(PacketType::OneRtt, payload.len());
    ph.dest_cnx_id = conn.paths[0].local_cnxid;

    conn.incoming_encrypted(
        &payload,
        &ph,
        server_addr(),
        client_addr(),
        Some(EcnCodepoint::Ce),
        Instant::now(),
    )
    .unwrap();
    assert_eq!(conn.ecn_ce_total_local, 1);
    assert!(conn.sending_ecn_ack);
}

//
// Path finding
//

#[test]
fn path_unknown_local_cid_is_rejected() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;

    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = ConnectionId::new(&[0x99; 8]);
    assert_matches!(
        conn.find_incoming_path(&ph, server_addr(), client_addr(), Instant::now()),
        Err(RecvError::CnxidCheck)
    );
}

#[test]
fn path_same_addresses_activates() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(server_addr());
    conn.paths[0].local_addr = Some(client_addr());

    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = conn.paths[0].local_cnxid;
    let id = conn
        .find_incoming_path(&ph, server_addr(), client_addr(), Instant::now())
        .unwrap();
    assert_eq!(id, 0);
    assert!(conn.paths[0].activated);
}

#[test]
fn path_nat_rebinding_installs_alt_and_challenges() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(server_addr());
    conn.paths[0].local_addr = Some(client_addr());
    conn.paths[0].remote_cnxid = server_cid();

    let rebound: SocketAddr = SocketAddr::from(([203, 0, 113, 9], 9999));
    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = conn.paths[0].local_cnxid;
    ph.pn64 = 17; // ahead of everything received so far

    let id = conn
        .find_incoming_path(&ph, rebound, client_addr(), Instant::now())
        .unwrap();
    assert_eq!(id, 0);
    let path = &conn.paths[0];
    assert_eq!(path.alt_peer_addr, Some(rebound));
    assert!(path.alt_challenge_required);
    assert!(path.challenge_required);
    assert!(path.challenge.iter().any(|&c| c != 0));
    assert_eq!(path.challenge_repeat_count, 0);
    // the primary addresses are untouched
    assert_eq!(path.peer_addr, Some(server_addr()));
}

#[test]
fn path_stale_packet_does_not_rebind() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(server_addr());
    conn.paths[0].local_addr = Some(client_addr());
    conn.paths[0].remote_cnxid = server_cid();
    for pn in 0..40u64 {
        conn.record_pn_received(PnSpace::Application, pn);
    }

    let rebound: SocketAddr = SocketAddr::from(([203, 0, 113, 9], 9999));
    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = conn.paths[0].local_cnxid;
    ph.pn64 = 3; // reordered straggler

    conn.find_incoming_path(&ph, rebound, client_addr(), Instant::now())
        .unwrap();
    assert_eq!(conn.paths[0].alt_peer_addr, None);
    assert!(!conn.paths[0].challenge_required);
}

#[test]
fn path_zero_length_cids_create_by_address() {
    let (mut conn, _) = connection(Side::Server, 0);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(client_addr());
    conn.paths[0].local_addr = Some(server_addr());
    conn.paths[0].remote_cnxid = server_cid();

    let migrated: SocketAddr = SocketAddr::from(([198, 51, 100, 7], 1234));
    let ph = header(PacketType::OneRtt, 16);
    let id = conn
        .find_incoming_path(&ph, migrated, server_addr(), Instant::now())
        .unwrap();
    assert_eq!(id, 1);
    assert!(conn.paths[id].published);
    assert!(conn.paths[id].registered);
    assert!(conn.paths[id].challenge_required);
    assert_eq!(conn.paths[id].peer_addr, Some(migrated));
}

#[test]
fn path_probe_adoption() {
    let (mut conn, _) = connection(Side::Server, 8);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(client_addr());
    conn.paths[0].local_addr = Some(server_addr());
    conn.paths[0].remote_cnxid = server_cid();

    // a second registered path, not yet bound to a peer CID
    let second_cid = ConnectionId::new(&[0x22; 8]);
    let id = conn.create_path(Instant::now(), None, None);
    conn.paths[id].local_cnxid = second_cid;
    conn.paths[id].registered = true;

    let probe_addr: SocketAddr = SocketAddr::from(([198, 51, 100, 8], 5555));
    let probe_cid = ConnectionId::new(&[0x33; 8]);
    conn.probes.push(Probe {
        peer_addr: probe_addr,
        local_addr: server_addr(),
        remote_cnxid: probe_cid,
        sequence: 2,
        reset_secret: [0xab; crate::RESET_SECRET_SIZE],
        challenge: [1, 2, 3, 4],
    });

    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = second_cid;
    let found = conn
        .find_incoming_path(&ph, probe_addr, server_addr(), Instant::now())
        .unwrap();
    assert_eq!(found, id);
    assert_eq!(conn.paths[id].remote_cnxid, probe_cid);
    assert_eq!(conn.paths[id].reset_secret, [0xab; crate::RESET_SECRET_SIZE]);
    assert!(conn.paths[id].activated);
    assert!(conn.probes.is_empty());
}

#[test]
fn path_stash_fallback() {
    let (mut conn, _) = connection(Side::Server, 8);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(client_addr());
    conn.paths[0].local_addr = Some(server_addr());
    conn.paths[0].remote_cnxid = server_cid();

    let second_cid = ConnectionId::new(&[0x22; 8]);
    let id = conn.create_path(Instant::now(), None, None);
    conn.paths[id].local_cnxid = second_cid;
    conn.paths[id].registered = true;

    let stashed_cid = ConnectionId::new(&[0x44; 8]);
    conn.stash_remote_cnxid(5, stashed_cid, [0xcd; crate::RESET_SECRET_SIZE]);

    let new_addr: SocketAddr = SocketAddr::from(([198, 51, 100, 9], 6666));
    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = second_cid;
    let found = conn
        .find_incoming_path(&ph, new_addr, server_addr(), Instant::now())
        .unwrap();
    assert_eq!(found, id);
    assert_eq!(conn.paths[id].remote_cnxid, stashed_cid);
    assert!(conn.paths[id].activated);
    assert!(conn.paths[id].challenge_required);

    // with the stash empty, a further probing path stays deactivated
    let third_cid = ConnectionId::new(&[0x55; 8]);
    let id3 = conn.create_path(Instant::now(), None, None);
    conn.paths[id3].local_cnxid = third_cid;
    conn.paths[id3].registered = true;
    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = third_cid;
    let found = conn
        .find_incoming_path(&ph, SocketAddr::from(([198, 51, 100, 10], 7777)), server_addr(), Instant::now())
        .unwrap();
    assert_eq!(found, id3);
    assert!(!conn.paths[id3].activated);
    assert!(!conn.paths[id3].challenge_required);
}

#[test]
fn path_client_cid_migration_promotes_to_default() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.paths[0].peer_addr = Some(server_addr());
    conn.paths[0].local_addr = Some(client_addr());
    conn.paths[0].remote_cnxid = server_cid();
    conn.paths[0].reset_secret = [0x77; crate::RESET_SECRET_SIZE];

    let fresh_cid = ConnectionId::new(&[0x66; 8]);
    let id = conn.create_path(Instant::now(), None, None);
    conn.paths[id].local_cnxid = fresh_cid;
    conn.paths[id].registered = true;

    let mut ph = header(PacketType::OneRtt, 16);
    ph.dest_cnx_id = fresh_cid;
    let found = conn
        .find_incoming_path(&ph, server_addr(), client_addr(), Instant::now())
        .unwrap();
    // the migrated path became the default
    assert_eq!(found, 0);
    assert_eq!(conn.paths[0].local_cnxid, fresh_cid);
    assert_eq!(conn.paths[0].remote_cnxid, server_cid());
    assert_eq!(conn.paths[0].reset_secret, [0x77; crate::RESET_SECRET_SIZE]);
    assert!(conn.paths[0].activated);
    // the retired default lost its peer CID
    assert!(conn.paths[1].remote_cnxid.is_empty());
}

//
// Key rotation
//

fn one_rtt_header(conn: &Connection, pn64: u64, key_phase: bool, payload_length: usize) -> PacketHeader {
    let mut ph = header(PacketType::OneRtt, payload_length);
    ph.dest_cnx_id = conn.paths[0].local_cnxid;
    ph.pn64 = pn64;
    ph.key_phase = key_phase;
    ph
}

fn sealed(body_len: usize, generation: u8) -> Vec<u8> {
    let mut payload = vec![0u8; body_len];
    testing::seal(&mut payload, generation);
    payload
}

#[test]
fn key_rotation_commits_on_new_phase() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.crypto[Epoch::OneRtt as usize] = testing::context(0);
    let now = Instant::now();

    // phase 0 decrypts under the current keys
    let mut bytes = sealed(32, 0);
    let ph = one_rtt_header(&conn, 1, false, bytes.len());
    assert_eq!(
        conn.remove_packet_protection(&mut bytes, &ph, now).ok(),
        Some(32)
    );

    // phase flip at pn 10: derives and commits the next generation
    let mut bytes = sealed(32, 1);
    let ph = one_rtt_header(&conn, 10, true, bytes.len());
    assert_eq!(
        conn.remove_packet_protection(&mut bytes, &ph, now).ok(),
        Some(32)
    );
    assert!(conn.key_phase_dec);
    assert_eq!(conn.crypto_rotation_sequence, 10);
    assert!(conn.crypto_rotation_time_guard.is_some());
    assert!(conn.crypto_old.aead_rx.is_some());

    // a straggler from before the rotation still decrypts under the old keys
    let mut bytes = sealed(32, 0);
    let ph = one_rtt_header(&conn, 5, false, bytes.len());
    assert_eq!(
        conn.remove_packet_protection(&mut bytes, &ph, now).ok(),
        Some(32)
    );

    // and packets in the new phase use the promoted keys
    let mut bytes = sealed(32, 1);
    let ph = one_rtt_header(&conn, 11, true, bytes.len());
    assert_eq!(
        conn.remove_packet_protection(&mut bytes, &ph, now).ok(),
        Some(32)
    );
}

#[test]
fn key_rotation_old_phase_expires_with_guard() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.crypto[Epoch::OneRtt as usize] = testing::context(0);
    let now = Instant::now();

    let mut bytes = sealed(32, 1);
    let ph = one_rtt_header(&conn, 10, true, bytes.len());
    conn.remove_packet_protection(&mut bytes, &ph, now).unwrap();

    // past the guard, stale-phase packets are refused even with old keys
    // still present
    let late = now + conn.paths[0].retransmit_timer + Duration::from_millis(1);
    let mut bytes = sealed(32, 0);
    let ph = one_rtt_header(&conn, 5, false, bytes.len());
    assert!(conn
        .remove_packet_protection(&mut bytes, &ph, late)
        .is_err());
}

#[test]
fn key_rotation_bad_new_phase_does_not_commit() {
    let (mut conn, _) = connection(Side::Client, 8);
    conn.state = State::Ready;
    conn.crypto[Epoch::OneRtt as usize] = testing::context(0);
    let now = Instant::now();

    // phase flipped but the ciphertext does not verify under generation 1
    let mut bytes = sealed(32, 9);
    let ph = one_rtt_header(&conn, 10, true, bytes.len());
    assert!(conn.remove_packet_protection(&mut bytes, &ph, now).is_err());
    assert!(!conn.key_phase_dec);
    assert_eq!(conn.crypto_rotation_sequence, 0);

    // current-phase traffic is unaffected
    let mut bytes = sealed(32, 0);
    let ph = one_rtt_header(&conn, 11, false, bytes.len());
    assert_eq!(
        conn.remove_packet_protection(&mut bytes, &ph, now).ok(),
        Some(32)
    );
}

#[test]
fn decrypt_before_keys_fails_cleanly() {
    let (mut conn, _) = connection(Side::Server, 8);

    let mut bytes = sealed(32, 0);
    let ph = one_rtt_header(&conn, 0, false, bytes.len());
    // no 1-RTT keys yet
    assert!(conn.remove_packet_protection(&mut bytes, &ph, Instant::now()).is_err());
}

#[test]
fn congestion_controller_reachable_per_path() {
    let (mut conn, _) = connection(Side::Client, 8);
    let before = conn.paths[0].cwin;
    let ctx = conn.cc_context();
    let mtu = conn.paths[0].send_mtu;
    conn.paths[0].congestion_notify(
        Notification::Acknowledgement { bytes: mtu },
        ctx,
        Instant::now(),
    );
    assert_eq!(conn.paths[0].cwin, before + mtu);
}
