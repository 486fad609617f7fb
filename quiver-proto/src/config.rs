use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::crypto::{CryptoConfig, HmacKey};
use crate::frame::FrameDecoder;
use crate::{
    CONNECTION_ID_MAX_SIZE, CONNECTION_ID_MIN_SIZE, CWIN_INITIAL, CWIN_MINIMUM,
    ENFORCED_INITIAL_MTU, INITIAL_RTT, TOKEN_DELAY_SHORT,
};

/// Global configuration for the endpoint, affecting all connections
pub struct EndpointConfig {
    /// Length of locally issued connection IDs, 0 to address connections by
    /// source address instead.
    ///
    /// The length of local connection IDs constrains the number of
    /// simultaneous connections the endpoint can maintain.
    pub local_cid_len: usize,

    /// Key from which stateless reset secrets are derived, allowing peers to
    /// recognize this endpoint after it has lost connection state
    pub reset_key: Arc<dyn HmacKey>,

    /// The TLS stack supplying Initial keys and handshake sessions
    pub crypto: Arc<dyn CryptoConfig>,

    /// The application's frame-body decoder
    pub frames: Arc<dyn FrameDecoder>,
}

impl EndpointConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.local_cid_len != 0
            && !(CONNECTION_ID_MIN_SIZE..=CONNECTION_ID_MAX_SIZE).contains(&self.local_cid_len)
        {
            return Err(ConfigError::IllegalValue(
                "local_cid_len must be 0 or in [1, 20]",
            ));
        }
        if self.reset_key.signature_len() < crate::RESET_SECRET_SIZE {
            return Err(ConfigError::IllegalValue(
                "reset_key must produce at least 16 bytes",
            ));
        }
        Ok(())
    }
}

/// Parameters governing incoming connections
pub struct ServerConfig {
    /// Key used to authenticate retry tokens issued by this endpoint
    pub token_key: Arc<dyn HmacKey>,
    /// Whether clients must present a valid retry token before the server
    /// commits state. Costs one round trip on first contact.
    pub check_token: bool,
    /// Refuse all new connections with SERVER_BUSY
    pub server_busy: bool,
    /// How long an issued retry token stays valid
    pub token_lifetime: Duration,
}

impl ServerConfig {
    pub fn new(token_key: Arc<dyn HmacKey>) -> Self {
        Self {
            token_key,
            check_token: false,
            server_busy: false,
            token_lifetime: TOKEN_DELAY_SHORT,
        }
    }
}

/// Parameters governing the transport machinery of every path
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Congestion window granted to a fresh path (bytes)
    pub initial_window: u64,
    /// Floor below which the congestion window never shrinks (bytes)
    pub minimum_window: u64,
    /// Datagram size assumed before path MTU discovery has run
    pub initial_mtu: u64,
    /// Round-trip estimate used before any sample has been taken
    pub initial_rtt: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_window: CWIN_INITIAL,
            minimum_window: CWIN_MINIMUM,
            initial_mtu: ENFORCED_INITIAL_MTU as u64,
            initial_rtt: INITIAL_RTT,
        }
    }
}

impl TransportConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.minimum_window > self.initial_window {
            return Err(ConfigError::IllegalValue(
                "minimum_window must not exceed initial_window",
            ));
        }
        if self.initial_mtu == 0 {
            return Err(ConfigError::IllegalValue("initial_mtu must be nonzero"));
        }
        Ok(())
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
