//! Loss-driven congestion control for a single path.

use std::time::{Duration, Instant};

mod cubic;
pub use cubic::{AlgState, Cubic};

/// A congestion-relevant event on a path.
///
/// Loss recovery, ACK processing and timers live outside this crate; they
/// report here and the controller adjusts the path's window in response.
#[derive(Debug, Copy, Clone)]
pub enum Notification {
    /// Bytes newly acknowledged by the peer
    Acknowledgement { bytes: u64 },
    /// ECN congestion-experienced mark reported by the peer
    EcnEc,
    /// A packet was declared lost by duplicate-threshold detection
    Repeat,
    /// The retransmission timer fired
    Timeout,
    /// A packet previously declared lost was acknowledged after all
    SpuriousRepeat,
    /// A fresh round-trip sample was taken
    RttMeasurement { rtt: Duration },
}

/// Application-space packet numbers the controller keys its recovery guard on
#[derive(Debug, Copy, Clone, Default)]
pub struct CcContext {
    /// Next packet number to be sent
    pub send_sequence: u64,
    /// Highest of our packets the peer has acknowledged
    pub highest_acknowledged: u64,
}

/// Congestion state of one path.
///
/// A closed set of algorithms dispatched by variant, so a controller can be
/// swapped by re-dispatching in exactly one place.
pub enum CongestionController {
    Cubic(Cubic),
}

impl CongestionController {
    pub fn new_cubic(now: Instant, initial_window: u64, minimum_window: u64, mtu: u64) -> Self {
        Self::Cubic(Cubic::new(now, initial_window, minimum_window, mtu))
    }

    /// Route one notification to the active algorithm, updating `cwin`
    pub fn notify(
        &mut self,
        notification: Notification,
        cwin: &mut u64,
        send_mtu: u64,
        smoothed_rtt: Duration,
        ctx: CcContext,
        now: Instant,
    ) {
        match self {
            Self::Cubic(state) => state.notify(notification, cwin, send_mtu, smoothed_rtt, ctx, now),
        }
    }
}
