//! Cleartext packet header parsing and packet number recovery.
//!
//! Because of header protection, a header cannot be fully decoded without a
//! crypto context: the packet number length, the number itself, and (for
//! short headers) the key phase only appear after unmasking. Parsing is
//! therefore two-phase: [`parse_header`] decodes the invariant fields and
//! records where the protected region starts, and
//! [`remove_header_protection`] completes the header in place once keys are
//! available.

use std::io;

use bytes::Buf;

use crate::coding::{BufExt, UnexpectedEnd};
use crate::crypto::HeaderKey;
use crate::shared::ConnectionId;
use crate::version_index;

/// The wire type of one packet
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    VersionNegotiation,
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRtt,
    /// Unparseable or unsupported; flows through the normal drop paths
    Error,
}

/// Cryptographic level of a packet
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PnSpace {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl PnSpace {
    pub fn iter() -> impl Iterator<Item = Self> {
        [PnSpace::Initial, PnSpace::Handshake, PnSpace::Application]
            .iter()
            .copied()
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
/// Reserved bits of an unmasked short-header first byte
pub(crate) const SHORT_RESERVED_BITS: u8 = 0x18;

/// Transient result of parsing one segment's header
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub version: u32,
    /// Position in the supported-version table; `None` means unknown
    pub version_index: Option<usize>,
    pub dest_cnx_id: ConnectionId,
    pub srce_cnx_id: ConnectionId,
    /// Bytes consumed by the header; past the packet number once unprotected
    pub offset: usize,
    /// Remaining payload bytes; shrinks as the packet number and AEAD tag
    /// are accounted for
    pub payload_length: usize,
    /// Length value as found in the packet, for logging
    pub pl_val: usize,
    /// Where the protected packet number begins
    pub pn_offset: usize,
    pub token_offset: usize,
    pub token_length: usize,
    /// Truncated packet number, 1-4 bytes
    pub pn: u32,
    /// All-ones above the truncated packet number bits
    pub pn_mask: u64,
    /// Reconstructed 64-bit packet number
    pub pn64: u64,
    pub epoch: Epoch,
    pub pc: PnSpace,
    pub spin: bool,
    pub has_spin_bit: bool,
    pub key_phase: bool,
    pub has_reserved_bit_set: bool,
}

impl PacketHeader {
    pub(crate) fn null() -> Self {
        Self {
            ptype: PacketType::Error,
            version: 0,
            version_index: None,
            dest_cnx_id: ConnectionId::EMPTY,
            srce_cnx_id: ConnectionId::EMPTY,
            offset: 0,
            payload_length: 0,
            pl_val: 0,
            pn_offset: 0,
            token_offset: 0,
            token_length: 0,
            pn: 0,
            pn_mask: 0,
            pn64: 0,
            epoch: Epoch::Initial,
            pc: PnSpace::Initial,
            spin: false,
            has_spin_bit: false,
            key_phase: false,
            has_reserved_bit_set: false,
        }
    }

    /// Make later decryption stages fail cleanly on a header that could not
    /// be completed
    pub(crate) fn poison(&mut self) {
        self.pn = 0xffff_ffff;
        self.pn_mask = 0xffff_ffff_0000_0000;
        self.pn64 = u64::MAX;
        self.offset = self.pn_offset;
    }
}

/// Parse the cleartext portion of the segment starting at `bytes[0]`.
///
/// `local_cid_len` is the length of connection IDs this endpoint issues,
/// needed to delimit short headers. Errors only when even the invariant
/// fields are truncated; recoverable malformations yield
/// `PacketType::Error` so they can flow through the normal drop paths.
pub(crate) fn parse_header(
    bytes: &[u8],
    local_cid_len: usize,
) -> Result<PacketHeader, UnexpectedEnd> {
    if bytes.is_empty() {
        return Err(UnexpectedEnd);
    }
    if bytes[0] & LONG_HEADER_FORM != 0 {
        parse_long_header(bytes)
    } else {
        Ok(parse_short_header(bytes, local_cid_len))
    }
}

fn parse_long_header(bytes: &[u8]) -> Result<PacketHeader, UnexpectedEnd> {
    let length = bytes.len();
    let mut buf = io::Cursor::new(bytes);
    let mut ph = PacketHeader::null();

    let flags = buf.get::<u8>()?;
    ph.version = buf.get::<u32>()?;
    ph.dest_cnx_id = buf.get_cid()?;
    ph.srce_cnx_id = buf.get_cid()?;
    ph.offset = buf.position() as usize;

    if ph.version == 0 {
        // A zero version identifies a version negotiation packet
        ph.ptype = PacketType::VersionNegotiation;
        ph.pc = PnSpace::Initial;
        ph.payload_length = length.saturating_sub(ph.offset);
        ph.pl_val = ph.payload_length;
        return Ok(ph);
    }

    ph.version_index = version_index(ph.version);
    if ph.version_index.is_some() {
        match (flags >> 4) & 7 {
            4 => {
                // Initials carry a retry token between the header and the
                // encrypted payload
                ph.epoch = Epoch::Initial;
                match buf.get_var() {
                    Ok(token_length) if buf.remaining() as u64 >= token_length => {
                        ph.ptype = PacketType::Initial;
                        ph.pc = PnSpace::Initial;
                        ph.token_offset = buf.position() as usize;
                        ph.token_length = token_length as usize;
                        buf.advance(token_length as usize);
                        ph.offset = buf.position() as usize;
                    }
                    _ => {
                        ph.ptype = PacketType::Error;
                        ph.offset = length;
                    }
                }
            }
            5 => {
                ph.ptype = PacketType::ZeroRtt;
                ph.pc = PnSpace::Application;
                ph.epoch = Epoch::ZeroRtt;
            }
            6 => {
                ph.ptype = PacketType::Handshake;
                ph.pc = PnSpace::Handshake;
                ph.epoch = Epoch::Handshake;
            }
            7 => {
                ph.ptype = PacketType::Retry;
                ph.pc = PnSpace::Initial;
                ph.epoch = Epoch::Initial;
            }
            _ => {
                ph.ptype = PacketType::Error;
                ph.version_index = None;
            }
        }
    }

    if ph.ptype == PacketType::Retry {
        // No length or packet number in retry packets
        if length > ph.offset {
            ph.payload_length = length - ph.offset;
            ph.pl_val = ph.payload_length;
        } else {
            ph.ptype = PacketType::Error;
        }
        return Ok(ph);
    }

    if ph.ptype != PacketType::Error {
        let payload_length = buf.get_var();
        match payload_length {
            Ok(len) if buf.remaining() as u64 >= len && ph.version_index.is_some() => {
                ph.payload_length = len as usize;
                ph.pl_val = ph.payload_length;
                ph.offset = buf.position() as usize;
                ph.pn_offset = ph.offset;
            }
            _ => {
                ph.ptype = PacketType::Error;
                ph.payload_length = length.saturating_sub(ph.offset);
                ph.pl_val = ph.payload_length;
            }
        }
    }

    Ok(ph)
}

fn parse_short_header(bytes: &[u8], local_cid_len: usize) -> PacketHeader {
    let length = bytes.len();
    let mut ph = PacketHeader::null();
    ph.pc = PnSpace::Application;
    ph.epoch = Epoch::OneRtt;

    if length < 1 + local_cid_len {
        ph.ptype = PacketType::Error;
        ph.offset = length;
        return ph;
    }

    ph.dest_cnx_id = ConnectionId::new(&bytes[1..1 + local_cid_len]);
    ph.offset = 1 + local_cid_len;

    // The fixed bit must be set in every 1-RTT packet
    ph.ptype = if bytes[0] & FIXED_BIT == FIXED_BIT {
        PacketType::OneRtt
    } else {
        PacketType::Error
    };
    ph.has_spin_bit = true;
    ph.spin = (bytes[0] >> 5) & 1 != 0;
    // Provisional; re-read from the unmasked byte after header protection
    // removal
    ph.key_phase = (bytes[0] >> 2) & 1 != 0;
    ph.pn_offset = ph.offset;
    ph.payload_length = length - ph.offset;

    ph
}

/// Reconstruct a 64-bit packet number from its truncated form.
///
/// `highest` is the largest packet number received so far in this space and
/// `mask` is all-ones above the truncated bits. The candidate closest to
/// `highest + 1` wins, with ties broken toward the lower value, and the
/// result never wraps below zero.
pub(crate) fn packet_number_64(highest: u64, mask: u64, pn: u32) -> u64 {
    let expected = highest.wrapping_add(1);
    let not_mask_plus_one = (!mask).wrapping_add(1);
    let mut pn64 = (expected & mask) | u64::from(pn);

    if pn64 < expected {
        let delta1 = expected - pn64;
        let delta2 = not_mask_plus_one - delta1;
        if delta2 < delta1 {
            pn64 += not_mask_plus_one;
        }
    } else {
        let delta1 = pn64 - expected;
        let delta2 = not_mask_plus_one.wrapping_sub(delta1);
        if delta2 <= delta1 && (pn64 & mask) > 0 {
            // Out of sequence packet from the previous roll
            pn64 -= not_mask_plus_one;
        }
    }

    pn64
}

/// Unmask the first byte and packet number in place, completing `ph`.
///
/// `highest` is the largest packet number received in the segment's number
/// space. On a sample that would overrun the segment the header is poisoned
/// and decryption must be skipped.
pub(crate) fn remove_header_protection(
    key: &dyn HeaderKey,
    bytes: &mut [u8],
    ph: &mut PacketHeader,
    highest: u64,
) -> Result<(), UnexpectedEnd> {
    let length = ph.offset + ph.payload_length;
    let sample_offset = ph.pn_offset + 4;
    let sample_size = key.sample_size();

    if sample_offset + sample_size > length {
        ph.poison();
        return Err(UnexpectedEnd);
    }

    let mask = key.mask(&bytes[sample_offset..sample_offset + sample_size]);

    let mut first_byte = bytes[0];
    let first_mask = if first_byte & LONG_HEADER_FORM != 0 {
        0x0f
    } else {
        0x1f
    };
    first_byte ^= mask[0] & first_mask;
    bytes[0] = first_byte;

    let pn_len = usize::from(first_byte & 3) + 1;
    let mut pn_val: u32 = 0;
    let mut pn_mask: u64 = u64::MAX;
    let mut offset = ph.pn_offset;
    for byte in &mask[1..=pn_len] {
        pn_val <<= 8;
        bytes[offset] ^= *byte;
        pn_val += u32::from(bytes[offset]);
        offset += 1;
        pn_mask <<= 8;
    }

    ph.pn = pn_val;
    ph.pn_mask = pn_mask;
    ph.offset = offset;
    ph.payload_length -= pn_len;
    if ph.ptype == PacketType::OneRtt {
        ph.key_phase = (first_byte >> 2) & 1 != 0;
    }
    ph.pn64 = packet_number_64(highest, ph.pn_mask, ph.pn);
    ph.has_reserved_bit_set =
        first_byte & LONG_HEADER_FORM == 0 && first_byte & SHORT_RESERVED_BITS != 0;

    Ok(())
}
