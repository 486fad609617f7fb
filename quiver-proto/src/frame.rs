//! Contract with the external frame-body decoder.
//!
//! Stream data, flow control, ACK processing and the crypto stream are the
//! embedding application's business. The core only needs three things from
//! the frame layer: decode a decrypted payload for side effects, skim a
//! payload to learn whether it would require an acknowledgement, and watch a
//! closing payload for CONNECTION_CLOSE.

use crate::packet::Epoch;
use crate::transport_error::TransportError;

/// What the frame layer learned from one packet payload
#[derive(Debug, Default, Copy, Clone)]
pub struct FrameSummary {
    /// The payload carried at least one frame other than ACK and PADDING
    pub ack_eliciting: bool,
    /// The payload carried a CONNECTION_CLOSE or APPLICATION_CLOSE frame;
    /// the connection starts winding down
    pub close_received: bool,
}

/// Decodes frame bodies on behalf of the core
pub trait FrameDecoder: Send + Sync {
    /// Decode `payload` for its side effects.
    ///
    /// `path_id` names the arrival path within the connection; epoch 3
    /// payloads may carry path-response and connection-ID frames the frame
    /// layer feeds back through the connection API.
    fn decode(
        &self,
        payload: &[u8],
        epoch: Epoch,
        path_id: usize,
    ) -> Result<FrameSummary, TransportError>;

    /// Walk `payload` without side effects, reporting whether an ACK would be
    /// owed. Used for handshake packets that arrive after their epoch is over.
    fn skip(&self, payload: &[u8]) -> Result<FrameSummary, TransportError>;

    /// Scan a payload received while closing; `Ok(true)` when it carries a
    /// CONNECTION_CLOSE or APPLICATION_CLOSE frame
    fn decode_closing(&self, payload: &[u8]) -> Result<bool, TransportError>;
}
