//! Traits through which the external TLS library supplies cryptographic
//! material.
//!
//! The core never links a cipher suite. Header protection, packet protection,
//! token authentication and the handshake itself are reached through the
//! object-safe traits below, implemented by the embedding application on top
//! of its TLS stack.

use thiserror::Error;

use crate::packet::Epoch;
use crate::shared::ConnectionId;
use crate::transport_error::TransportError;
use crate::Side;

/// A cryptographic operation failed: bad tag, bad signature, or keys that
/// could not be derived
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("cryptographic operation failed")]
pub struct CryptoError;

/// Keys for removing (or applying) header protection
pub trait HeaderKey: Send + Sync {
    /// Length of the ciphertext sample fed to [`Self::mask`]
    fn sample_size(&self) -> usize;
    /// Compute the 5-byte header protection mask for the given sample
    fn mask(&self, sample: &[u8]) -> [u8; 5];
}

/// Keys for removing packet protection
pub trait PacketKey: Send + Sync {
    /// Length of the authentication tag appended to the plaintext
    fn tag_len(&self) -> usize;
    /// Decrypt `payload` in place, returning the plaintext length.
    ///
    /// `header` is the associated data: the cleartext packet header up to and
    /// including the unprotected packet number.
    fn decrypt(&self, packet_number: u64, header: &[u8], payload: &mut [u8])
        -> Result<usize, CryptoError>;
}

/// A pseudo random key, used for stateless reset secrets and retry tokens
pub trait HmacKey: Send + Sync {
    fn signature_len(&self) -> usize;
    /// Write the authentication code for `data` into `signature_out`
    fn sign(&self, data: &[u8], signature_out: &mut [u8]);
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

/// Key material for one cryptographic epoch.
///
/// Slots fill in as the handshake progresses; an absent decrypt key means
/// packets of that epoch arrived too soon. The 1-RTT context additionally
/// rotates through `old`/`new` copies held by the connection.
pub struct CryptoContext {
    pub header_rx: Option<Box<dyn HeaderKey>>,
    pub header_tx: Option<Box<dyn HeaderKey>>,
    pub aead_rx: Option<Box<dyn PacketKey>>,
    pub aead_tx: Option<Box<dyn PacketKey>>,
}

impl CryptoContext {
    pub fn empty() -> Self {
        Self {
            header_rx: None,
            header_tx: None,
            aead_rx: None,
            aead_tx: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header_rx.is_none()
            && self.header_tx.is_none()
            && self.aead_rx.is_none()
            && self.aead_tx.is_none()
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::empty()
    }
}

/// What one pump of the TLS machine produced
#[derive(Default)]
pub struct TlsProgress {
    /// Newly derived key material, to be installed per epoch
    pub key_upgrades: Vec<(Epoch, CryptoContext)>,
    /// The server's first flight is ready to send
    pub flight_ready: bool,
    /// The handshake has completed on this side
    pub handshake_complete: bool,
}

/// One TLS handshake, owned by a connection
pub trait Session: Send {
    /// Drive the handshake over whatever crypto-stream data the frame layer
    /// has delivered out of band, surfacing new keys and state advances
    fn process(&mut self) -> Result<TlsProgress, TransportError>;

    /// Derive the next 1-RTT key generation from the current one
    fn compute_rotated_keys(&mut self, current: &CryptoContext) -> Result<CryptoContext, CryptoError>;
}

/// Factory for sessions and Initial keys, shared by every connection of an
/// endpoint
pub trait CryptoConfig: Send + Sync {
    /// Initial-epoch keys, derived from the client's first destination CID
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> CryptoContext;

    /// Begin a handshake. `server_name` is present on the client side only.
    fn start_session(&self, side: Side, server_name: Option<&str>) -> Box<dyn Session>;
}
