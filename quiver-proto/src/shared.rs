use std::fmt;

use rand::RngCore;
use thiserror::Error;

use crate::CONNECTION_ID_MAX_SIZE;

/// Protocol-level identifier for a connection.
///
/// An opaque byte string of up to 20 bytes. Equality is length, then bytes.
/// Mainly useful for identifying a connection's packets on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; CONNECTION_ID_MAX_SIZE],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= CONNECTION_ID_MAX_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; CONNECTION_ID_MAX_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub(crate) fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= CONNECTION_ID_MAX_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; CONNECTION_ID_MAX_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// The zero-length connection ID
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; CONNECTION_ID_MAX_SIZE],
    };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Explicit congestion notification codepoint
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnCodepoint {
    Ect0 = 0b10,
    Ect1 = 0b01,
    Ce = 0b11,
}

impl EcnCodepoint {
    pub fn from_bits(x: u8) -> Option<Self> {
        use self::EcnCodepoint::*;
        Some(match x & 0b11 {
            0b10 => Ect0,
            0b01 => Ect1,
            0b11 => Ce,
            _ => return None,
        })
    }
}

/// Why an incoming segment was not delivered.
///
/// Every dispatcher returns this rather than a magic integer; the datagram
/// loop maps each variant to its halt-and-continue policy in one place. The
/// numeric codes are stable and suitable for logging across versions.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum RecvError {
    #[error("AEAD authentication failed")]
    AeadCheck,
    #[error("stateless reset received")]
    StatelessReset,
    #[error("packet number already received")]
    Duplicate,
    #[error("packet not expected in this state")]
    UnexpectedPacket,
    #[error("initial packet below minimum datagram size")]
    InitialTooShort,
    #[error("initial destination connection ID too short")]
    InitialCidTooShort,
    #[error("connection ID check failed")]
    CnxidCheck,
    #[error("coalesced segment changed destination connection ID")]
    CnxidSegment,
    #[error("retry accepted, segment not acknowledged")]
    Retry,
    #[error("unexpected packet detected and dropped")]
    Detected,
    #[error("connection deleted")]
    ConnectionDeleted,
    #[error("spurious repeat detected")]
    SpuriousRepeat,
    #[error("out of memory")]
    Memory,
}

impl RecvError {
    /// Stable numeric code for this outcome
    pub fn code(self) -> u32 {
        use self::RecvError::*;
        match self {
            AeadCheck => 0x401,
            StatelessReset => 0x402,
            Duplicate => 0x403,
            UnexpectedPacket => 0x404,
            InitialTooShort => 0x405,
            InitialCidTooShort => 0x406,
            CnxidCheck => 0x407,
            CnxidSegment => 0x408,
            Retry => 0x409,
            Detected => 0x40a,
            ConnectionDeleted => 0x40b,
            SpuriousRepeat => 0x40c,
            Memory => 0x40d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn cid_equality_is_length_then_bytes() {
        let a = ConnectionId::new(&[1, 2, 3, 4]);
        let b = ConnectionId::new(&[1, 2, 3, 4, 0]);
        assert_ne!(a, b);
        assert_eq!(a, ConnectionId::new(&[1, 2, 3, 4]));
        assert!(ConnectionId::EMPTY.is_empty());
    }

    #[test]
    fn cid_random_has_requested_length() {
        let mut rng = StdRng::seed_from_u64(42);
        for len in 0..=CONNECTION_ID_MAX_SIZE {
            assert_eq!(ConnectionId::random(&mut rng, len).len(), len);
        }
    }
}
