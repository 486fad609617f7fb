//! Address-bound credentials: stateless reset secrets and retry tokens.

use std::fmt;
use std::net::SocketAddr;

use bytes::BufMut;

use crate::coding::{BufExt, BufMutExt};
use crate::crypto::{CryptoError, HmacKey};
use crate::shared::ConnectionId;
use crate::RESET_SECRET_SIZE;

/// Stateless reset secret for one connection ID.
///
/// Derived deterministically from the CID under the endpoint's reset key, so
/// an endpoint that lost all state can still be recognized as legitimate.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken([u8; RESET_SECRET_SIZE]);

impl ResetToken {
    pub fn new(key: &dyn HmacKey, id: &ConnectionId) -> Self {
        let mut signature = vec![0; key.signature_len()];
        key.sign(id, &mut signature);
        let mut result = [0; RESET_SECRET_SIZE];
        result.copy_from_slice(&signature[..RESET_SECRET_SIZE]);
        Self(result)
    }
}

impl std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A retry token: proof that the sender owned its source address recently.
///
/// Wire layout is `expiry (u64) || odcil || odcid || mac`, authenticated
/// together with the peer's address so a token cannot be replayed from
/// elsewhere.
pub(crate) struct RetryToken {
    /// The client's original destination CID, recovered on verification
    pub(crate) orig_dst_cid: ConnectionId,
}

impl RetryToken {
    pub(crate) fn encode(
        key: &dyn HmacKey,
        address: &SocketAddr,
        expiry_micros: u64,
        orig_dst_cid: &ConnectionId,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write(expiry_micros);
        buf.put_u8(orig_dst_cid.len() as u8);
        buf.put_slice(orig_dst_cid);

        let mut signed = buf.clone();
        push_address(&mut signed, address);
        let mut mac = vec![0; key.signature_len()];
        key.sign(&signed, &mut mac);
        buf.extend_from_slice(&mac);
        buf
    }

    /// Authenticate `token` for `address`, requiring it to still be valid at
    /// `now_micros`
    pub(crate) fn verify(
        key: &dyn HmacKey,
        address: &SocketAddr,
        now_micros: u64,
        token: &[u8],
    ) -> Result<Self, CryptoError> {
        let mac_len = key.signature_len();
        if token.len() < mac_len {
            return Err(CryptoError);
        }
        let (body, mac) = token.split_at(token.len() - mac_len);

        let mut signed = body.to_vec();
        push_address(&mut signed, address);
        key.verify(&signed, mac)?;

        let mut cursor = std::io::Cursor::new(body);
        let expiry: u64 = cursor.get().map_err(|_| CryptoError)?;
        let orig_dst_cid = cursor.get_cid().map_err(|_| CryptoError)?;
        if cursor.position() as usize != body.len() {
            return Err(CryptoError);
        }
        if expiry < now_micros {
            return Err(CryptoError);
        }

        Ok(Self { orig_dst_cid })
    }
}

fn push_address(buf: &mut Vec<u8>, address: &SocketAddr) {
    match address.ip() {
        std::net::IpAddr::V4(x) => buf.put_slice(&x.octets()),
        std::net::IpAddr::V6(x) => buf.put_slice(&x.octets()),
    }
    buf.put_u16(address.port());
}
