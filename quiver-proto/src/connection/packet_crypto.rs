//! Removal of header and packet protection for one connection, including
//! 1-RTT key-rotation accounting.

use std::time::Instant;

use tracing::{debug, trace};

use super::Connection;
use crate::crypto::PacketKey;
use crate::packet::{self, Epoch, PacketHeader};

/// Decryption failed; the caller decides between AEAD-check and
/// stateless-reset outcomes
#[derive(Debug)]
pub(crate) struct DecryptError;

impl Connection {
    /// Unmask the packet number of `ph` in place.
    ///
    /// A missing header key (the packet arrived before its epoch) or a
    /// sample overrunning the segment poisons the header so the segment
    /// flows through the normal drop path.
    pub(crate) fn remove_header_protection(
        &mut self,
        bytes: &mut [u8],
        ph: &mut PacketHeader,
    ) -> Result<(), DecryptError> {
        let highest = self.spaces[ph.pc as usize].highest_received();
        match self.crypto[ph.epoch as usize].header_rx {
            Some(ref key) => packet::remove_header_protection(&**key, bytes, ph, highest)
                .map_err(|_| DecryptError),
            None => {
                debug!(
                    epoch = ?ph.epoch,
                    "header protection key not ready; dropping"
                );
                ph.poison();
                Err(DecryptError)
            }
        }
    }

    /// AEAD-decrypt the payload in place, returning the plaintext length.
    ///
    /// 1-RTT packets select among the current, previous and next key
    /// generations by key phase; a successful decrypt under the next
    /// generation commits the rotation.
    pub(crate) fn remove_packet_protection(
        &mut self,
        bytes: &mut [u8],
        ph: &PacketHeader,
        now: Instant,
    ) -> Result<usize, DecryptError> {
        if ph.epoch != Epoch::OneRtt {
            // A single context per epoch, no rotation
            return match self.crypto[ph.epoch as usize].aead_rx {
                Some(ref key) => decrypt_in_place(&**key, bytes, ph),
                None => Err(DecryptError),
            };
        }

        if ph.key_phase == self.key_phase_dec {
            return match self.crypto[Epoch::OneRtt as usize].aead_rx {
                Some(ref key) => decrypt_in_place(&**key, bytes, ph),
                None => Err(DecryptError),
            };
        }

        if ph.pn64 < self.crypto_rotation_sequence {
            // The packet claims the previous key generation, honored only
            // within the rotation time guard
            return match self.crypto_rotation_time_guard {
                Some(guard) if now <= guard => match self.crypto_old.aead_rx {
                    Some(ref key) => decrypt_in_place(&**key, bytes, ph),
                    None => Err(DecryptError),
                },
                _ => {
                    // Too late; could be some kind of attack
                    trace!(pn = ph.pn64, "stale key phase outside rotation guard");
                    Err(DecryptError)
                }
            };
        }

        // A new rotation initiated by the peer
        if self.crypto_new.aead_rx.is_none() && self.crypto_new.aead_tx.is_none() {
            self.crypto_new = self
                .tls
                .compute_rotated_keys(&self.crypto[Epoch::OneRtt as usize])
                .map_err(|_| DecryptError)?;
        }
        let decoded = match self.crypto_new.aead_rx {
            Some(ref key) => decrypt_in_place(&**key, bytes, ph)?,
            None => return Err(DecryptError),
        };

        // Commit only on a packet that authenticated under the new keys
        trace!(pn = ph.pn64, "key rotation committed");
        self.crypto_rotation_time_guard = Some(now + self.paths[0].retransmit_timer);
        self.crypto_rotation_sequence = ph.pn64;
        self.apply_rotated_keys(false);
        if self.crypto_new.aead_tx.is_some() {
            self.apply_rotated_keys(true);
        }
        Ok(decoded)
    }

    /// Promote the next key generation to current, demoting current to old.
    /// Header protection keys do not rotate.
    fn apply_rotated_keys(&mut self, encryption_side: bool) {
        let current = &mut self.crypto[Epoch::OneRtt as usize];
        if encryption_side {
            self.crypto_old.aead_tx = current.aead_tx.take();
            current.aead_tx = self.crypto_new.aead_tx.take();
            self.key_phase_enc = !self.key_phase_enc;
        } else {
            self.crypto_old.aead_rx = current.aead_rx.take();
            current.aead_rx = self.crypto_new.aead_rx.take();
            self.key_phase_dec = !self.key_phase_dec;
        }
    }
}

fn decrypt_in_place(
    key: &dyn PacketKey,
    bytes: &mut [u8],
    ph: &PacketHeader,
) -> Result<usize, DecryptError> {
    let (header, rest) = bytes.split_at_mut(ph.offset);
    key.decrypt(ph.pn64, header, &mut rest[..ph.payload_length])
        .map_err(|_| DecryptError)
}
