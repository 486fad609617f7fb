//! CUBIC congestion avoidance with a Reno lower bound.
//!
//! The window follows `W_cubic(t) = C * (t - K)^3 + W_max` (in MTU units)
//! after a loss epoch begins, never dropping below what a Reno-style
//! additive increase would have reached. Slow start exits either by crossing
//! `ssthresh` or by the HyStart RTT-slope test.

use std::time::{Duration, Instant};

use tracing::trace;

use super::{CcContext, Notification};
use crate::{MIN_MAX_RTT_SCOPE, TARGET_RENO_RTT};

const C: f64 = 0.4;
const BETA: f64 = 7.0 / 8.0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlgState {
    SlowStart,
    Recovery,
    CongestionAvoidance,
}

pub struct Cubic {
    alg_state: AlgState,
    /// Send sequence at the last recovery entry; packets below it belong to
    /// the epoch already paid for
    recovery_sequence: u64,
    start_of_epoch: Instant,
    previous_start_of_epoch: Instant,
    /// Seconds until the cubic curve returns to `W_max`
    k: f64,
    /// Window at the last loss event, in MTU units
    w_max: f64,
    w_last_max: f64,
    /// Reno companion window, in bytes
    w_reno: f64,
    /// `u64::MAX` until the first loss or HyStart exit
    ssthresh: u64,
    minimum_window: u64,
    rtt_filter: MinMaxRtt,
}

impl Cubic {
    pub fn new(now: Instant, initial_window: u64, minimum_window: u64, mtu: u64) -> Self {
        let w_boundless = u64::MAX as f64 / mtu as f64;
        Self {
            alg_state: AlgState::SlowStart,
            recovery_sequence: 0,
            start_of_epoch: now,
            previous_start_of_epoch: now,
            k: 0.0,
            w_max: w_boundless,
            w_last_max: w_boundless,
            w_reno: initial_window as f64,
            ssthresh: u64::MAX,
            minimum_window,
            rtt_filter: MinMaxRtt::new(),
        }
    }

    pub fn notify(
        &mut self,
        notification: Notification,
        cwin: &mut u64,
        send_mtu: u64,
        smoothed_rtt: Duration,
        ctx: CcContext,
        now: Instant,
    ) {
        use Notification::*;
        match self.alg_state {
            AlgState::SlowStart => match notification {
                Acknowledgement { bytes } => {
                    if smoothed_rtt <= TARGET_RENO_RTT {
                        *cwin += bytes;
                    } else {
                        // Long feedback loops earn proportionally larger
                        // increments
                        let delta = smoothed_rtt.as_micros() as f64
                            / TARGET_RENO_RTT.as_micros() as f64
                            * bytes as f64;
                        *cwin += delta as u64;
                    }
                    if *cwin >= self.ssthresh {
                        self.w_reno = *cwin as f64 / 2.0;
                        self.enter_avoidance(send_mtu, now);
                    }
                }
                EcnEc | Repeat | Timeout => {
                    if self.past_recovery_guard(smoothed_rtt, ctx, now) {
                        self.enter_recovery(notification, cwin, send_mtu, now, ctx);
                    }
                }
                SpuriousRepeat => self.correct_spurious(cwin, send_mtu, now),
                RttMeasurement { rtt } => {
                    // RTT increase is the signal to leave initial slow start
                    if self.ssthresh == u64::MAX && self.rtt_filter.hystart_test(rtt, now) {
                        trace!(cwin, "hystart exit from slow start");
                        self.ssthresh = *cwin;
                        self.w_max = *cwin as f64 / send_mtu as f64;
                        self.w_last_max = self.w_max;
                        self.w_reno = *cwin as f64;
                        self.enter_avoidance(send_mtu, now);
                        // Skip the concave ramp and start probing immediately
                        match now.checked_sub(Duration::from_secs_f64(self.k)) {
                            Some(t) => self.start_of_epoch = t,
                            None => {
                                self.k = 0.0;
                                self.start_of_epoch = now;
                            }
                        }
                    }
                }
            },
            AlgState::Recovery => {
                // Notifications within one RTT of entry echo the loss that
                // started recovery; only a spurious-repeat correction may act
                if let SpuriousRepeat = notification {
                    self.correct_spurious(cwin, send_mtu, now);
                } else if self.past_recovery_guard(smoothed_rtt, ctx, now) {
                    match notification {
                        Acknowledgement { bytes } => {
                            self.alg_state = AlgState::SlowStart;
                            *cwin += bytes;
                            if *cwin >= self.ssthresh {
                                self.alg_state = AlgState::CongestionAvoidance;
                            }
                        }
                        EcnEc | Repeat | Timeout => {
                            self.enter_recovery(notification, cwin, send_mtu, now, ctx);
                        }
                        _ => {}
                    }
                }
            }
            AlgState::CongestionAvoidance => match notification {
                Acknowledgement { bytes } => {
                    let win_cubic = (self.w_cubic(now) * send_mtu as f64) as u64;
                    self.w_reno += bytes as f64 * send_mtu as f64 / self.w_reno;
                    // Pick the larger of the cubic and Reno windows
                    *cwin = win_cubic.max(self.w_reno as u64);
                }
                EcnEc | Repeat | Timeout => {
                    if self.past_recovery_guard(smoothed_rtt, ctx, now) {
                        self.enter_recovery(notification, cwin, send_mtu, now, ctx);
                    }
                }
                SpuriousRepeat => self.correct_spurious(cwin, send_mtu, now),
                RttMeasurement { .. } => {}
            },
        }
    }

    /// Whether a loss notification is new rather than an echo of the event
    /// that opened the current epoch
    fn past_recovery_guard(&self, smoothed_rtt: Duration, ctx: CcContext, now: Instant) -> bool {
        now.saturating_duration_since(self.start_of_epoch) > smoothed_rtt
            || self.recovery_sequence <= ctx.highest_acknowledged
    }

    // W_cubic(t) = C * (t - K)^3 + W_max, in MTU units
    fn w_cubic(&self, now: Instant) -> f64 {
        let delta_t =
            now.saturating_duration_since(self.start_of_epoch).as_secs_f64() - self.k;
        C * delta_t * delta_t * delta_t + self.w_max
    }

    fn enter_avoidance(&mut self, _send_mtu: u64, now: Instant) {
        self.k = cube_root(self.w_max * (1.0 - BETA) / C);
        self.alg_state = AlgState::CongestionAvoidance;
        self.start_of_epoch = now;
        self.previous_start_of_epoch = self.start_of_epoch;
    }

    fn enter_recovery(
        &mut self,
        notification: Notification,
        cwin: &mut u64,
        send_mtu: u64,
        now: Instant,
        ctx: CcContext,
    ) {
        self.recovery_sequence = ctx.send_sequence;
        // Reno-style reduction with the cubic beta
        self.w_max = *cwin as f64 / send_mtu as f64;
        if self.w_max < self.w_last_max {
            // Fast convergence
            self.w_last_max = self.w_max;
            self.w_max *= BETA;
        } else {
            self.w_last_max = self.w_max;
        }
        self.ssthresh = (self.w_max * BETA * send_mtu as f64) as u64;

        if self.ssthresh < self.minimum_window {
            // Collapse to slow start with the threshold unset so HyStart can
            // re-arm
            trace!(ssthresh = self.ssthresh, "window collapse to slow start");
            self.alg_state = AlgState::SlowStart;
            self.ssthresh = u64::MAX;
            self.previous_start_of_epoch = self.start_of_epoch;
            self.start_of_epoch = now;
            self.w_reno = self.minimum_window as f64;
            *cwin = self.minimum_window;
        } else if let Notification::Timeout = notification {
            *cwin = self.minimum_window;
            self.previous_start_of_epoch = self.start_of_epoch;
            self.start_of_epoch = now;
            self.alg_state = AlgState::SlowStart;
        } else {
            // Resume probing immediately from the reduced window
            self.enter_avoidance(send_mtu, now);
            let win_cubic = (self.w_cubic(now) * send_mtu as f64) as u64;
            self.w_reno = *cwin as f64 / 2.0;
            *cwin = win_cubic.max(self.w_reno as u64);
        }
    }

    /// The loss that opened this epoch never happened: restore the previous
    /// cubic curve and rewind the epoch clock
    fn correct_spurious(&mut self, cwin: &mut u64, send_mtu: u64, now: Instant) {
        self.w_max = self.w_last_max;
        let rewound = self.previous_start_of_epoch;
        self.enter_avoidance(send_mtu, rewound);
        let w_cubic = self.w_cubic(now);
        self.w_reno = w_cubic * send_mtu as f64;
        self.ssthresh = (self.w_max * BETA * send_mtu as f64) as u64;
        *cwin = self.w_reno as u64;
    }

    pub fn alg_state(&self) -> AlgState {
        self.alg_state
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }
}

/// Cube root by bracketing then three Newton iterations.
///
/// The seed is scaled by factors of 8 until `v <= x < 8v`, which puts the
/// iterate within a factor of two of the root.
fn cube_root(x: f64) -> f64 {
    let mut v = 1.0f64;
    let mut y = 1.0f64;

    while v > x * 8.0 {
        v /= 8.0;
        y /= 2.0;
        if v == 0.0 {
            break;
        }
    }
    while v < x {
        v *= 8.0;
        y *= 2.0;
    }

    for _ in 0..3 {
        let y2 = y * y;
        let y3 = y2 * y;
        y += (x - y3) / (3.0 * y2);
    }

    y
}

/// Sliding min/max filter over the last [`MIN_MAX_RTT_SCOPE`] RTT samples,
/// driving the HyStart slow-start exit
struct MinMaxRtt {
    samples: [Duration; MIN_MAX_RTT_SCOPE],
    sample_current: usize,
    is_init: bool,
    sample_min: Duration,
    sample_max: Duration,
    rtt_filtered_min: Option<Duration>,
    nb_rtt_excess: usize,
    last_rtt_sample_time: Option<Instant>,
}

impl MinMaxRtt {
    fn new() -> Self {
        Self {
            samples: [Duration::ZERO; MIN_MAX_RTT_SCOPE],
            sample_current: 0,
            is_init: false,
            sample_min: Duration::ZERO,
            sample_max: Duration::ZERO,
            rtt_filtered_min: None,
            nb_rtt_excess: 0,
            last_rtt_sample_time: None,
        }
    }

    fn filter(&mut self, rtt: Duration) {
        self.samples[self.sample_current] = rtt;
        self.sample_current += 1;
        if self.sample_current >= MIN_MAX_RTT_SCOPE {
            self.is_init = true;
            self.sample_current = 0;
        }

        let filled = if self.is_init {
            MIN_MAX_RTT_SCOPE
        } else {
            self.sample_current
        };
        self.sample_min = self.samples[0];
        self.sample_max = self.samples[0];
        for sample in &self.samples[1..filled] {
            if *sample < self.sample_min {
                self.sample_min = *sample;
            } else if *sample > self.sample_max {
                self.sample_max = *sample;
            }
        }
    }

    /// Record one sample (at most once per millisecond) and report whether
    /// the RTT has risen enough, for long enough, to end slow start
    fn hystart_test(&mut self, rtt: Duration, now: Instant) -> bool {
        let due = self
            .last_rtt_sample_time
            .map_or(true, |last| now > last + Duration::from_millis(1));
        if !due {
            return false;
        }
        self.filter(rtt);
        self.last_rtt_sample_time = Some(now);

        if !self.is_init {
            return false;
        }

        if self
            .rtt_filtered_min
            .map_or(true, |min| min > self.sample_max)
        {
            self.rtt_filtered_min = Some(self.sample_max);
        }
        let Some(filtered_min) = self.rtt_filtered_min else {
            return false;
        };

        if self.sample_min > filtered_min && (self.sample_min - filtered_min) * 4 > filtered_min {
            self.nb_rtt_excess += 1;
            if self.nb_rtt_excess >= MIN_MAX_RTT_SCOPE {
                return true;
            }
        } else {
            self.nb_rtt_excess = 0;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CWIN_MINIMUM, MAX_PACKET_SIZE};

    const MTU: u64 = MAX_PACKET_SIZE;

    fn controller(now: Instant) -> (Cubic, u64) {
        (
            Cubic::new(now, crate::CWIN_INITIAL, CWIN_MINIMUM, MTU),
            crate::CWIN_INITIAL,
        )
    }

    fn ms(x: u64) -> Duration {
        Duration::from_millis(x)
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let now = Instant::now();
        let (mut cc, mut cwin) = controller(now);
        let before = cwin;
        cc.notify(
            Notification::Acknowledgement { bytes: 3 * MTU },
            &mut cwin,
            MTU,
            ms(50),
            CcContext::default(),
            now,
        );
        assert_eq!(cwin, before + 3 * MTU);
        assert_eq!(cc.alg_state(), AlgState::SlowStart);
    }

    #[test]
    fn slow_start_scales_for_long_rtt() {
        let now = Instant::now();
        let (mut cc, mut cwin) = controller(now);
        let before = cwin;
        // 200ms smoothed RTT doubles the increment against the 100ms target
        cc.notify(
            Notification::Acknowledgement { bytes: MTU },
            &mut cwin,
            MTU,
            ms(200),
            CcContext::default(),
            now,
        );
        assert_eq!(cwin, before + 2 * MTU);
    }

    #[test]
    fn slow_start_exit_crossing_ssthresh() {
        let now = Instant::now();
        let (mut cc, mut cwin) = controller(now);
        cc.ssthresh = cwin + 2 * MTU - 1;
        cc.w_max = 40.0;
        cc.w_last_max = 40.0;
        cc.notify(
            Notification::Acknowledgement { bytes: 2 * MTU },
            &mut cwin,
            MTU,
            ms(50),
            CcContext::default(),
            now,
        );
        assert_eq!(cc.alg_state(), AlgState::CongestionAvoidance);
        assert_eq!(cc.w_reno, cwin as f64 / 2.0);
        // K = cbrt(W_max * (1 - beta) / C)
        let expected_k = cube_root(cc.w_max * (1.0 - BETA) / C);
        assert!((cc.k - expected_k).abs() < 1e-9);
    }

    #[test]
    fn avoidance_window_floors_at_reno() {
        let now = Instant::now();
        let (mut cc, _) = controller(now);
        let mut cwin = 64 * MTU;
        cc.notify(
            Notification::Repeat,
            &mut cwin,
            MTU,
            ms(10),
            CcContext {
                send_sequence: 100,
                highest_acknowledged: 50,
            },
            now + ms(100),
        );
        assert_eq!(cc.alg_state(), AlgState::CongestionAvoidance);
        // every subsequent ack keeps cwin at or above the Reno window
        let mut t = now + ms(200);
        for _ in 0..50 {
            cc.notify(
                Notification::Acknowledgement { bytes: MTU },
                &mut cwin,
                MTU,
                ms(10),
                CcContext::default(),
                t,
            );
            assert!(cwin >= cc.w_reno as u64);
            t += ms(20);
        }
    }

    #[test]
    fn recovery_entry_without_timeout_lands_in_avoidance() {
        let now = Instant::now();
        let (mut cc, _) = controller(now);
        let mut cwin = 64 * MTU;
        cc.notify(
            Notification::EcnEc,
            &mut cwin,
            MTU,
            ms(10),
            CcContext {
                send_sequence: 7,
                highest_acknowledged: 3,
            },
            now + ms(100),
        );
        assert!(cc.ssthresh() >= CWIN_MINIMUM);
        assert_eq!(cc.alg_state(), AlgState::CongestionAvoidance);
        assert_eq!(cc.recovery_sequence, 7);
    }

    #[test]
    fn recovery_entry_on_timeout_collapses_to_slow_start() {
        let now = Instant::now();
        let (mut cc, _) = controller(now);
        let mut cwin = 64 * MTU;
        cc.notify(
            Notification::Timeout,
            &mut cwin,
            MTU,
            ms(10),
            CcContext::default(),
            now + ms(100),
        );
        assert_eq!(cc.alg_state(), AlgState::SlowStart);
        assert_eq!(cwin, CWIN_MINIMUM);
    }

    #[test]
    fn tiny_threshold_collapse_unsets_ssthresh() {
        let now = Instant::now();
        let (mut cc, _) = controller(now);
        let mut cwin = CWIN_MINIMUM; // beta^2 * minimum is below the floor
        cc.notify(
            Notification::Repeat,
            &mut cwin,
            MTU,
            ms(10),
            CcContext::default(),
            now + ms(100),
        );
        assert_eq!(cc.alg_state(), AlgState::SlowStart);
        assert_eq!(cc.ssthresh(), u64::MAX);
        assert_eq!(cwin, CWIN_MINIMUM);
    }

    #[test]
    fn spurious_repeat_restores_previous_epoch() {
        let now = Instant::now();
        let (mut cc, _) = controller(now);
        let mut cwin = 64 * MTU;

        // First loss enters avoidance and remembers the pre-loss window
        cc.notify(
            Notification::Repeat,
            &mut cwin,
            MTU,
            ms(10),
            CcContext {
                send_sequence: 10,
                highest_acknowledged: 5,
            },
            now + ms(100),
        );
        let w_before_recovery = cc.w_last_max;

        // Half an RTT later the loss turns out to be spurious
        cc.notify(
            Notification::SpuriousRepeat,
            &mut cwin,
            MTU,
            ms(10),
            CcContext::default(),
            now + ms(105),
        );
        assert_eq!(cc.alg_state(), AlgState::CongestionAvoidance);
        assert_eq!(cc.w_max, w_before_recovery);
        assert_eq!(cwin, cc.w_reno as u64);
    }

    #[test]
    fn hystart_trips_after_scope_excesses() {
        let now = Instant::now();
        let mut filter = MinMaxRtt::new();
        let mut t = now;
        let base = ms(100);

        // establish the filtered minimum
        for _ in 0..MIN_MAX_RTT_SCOPE {
            t += ms(2);
            assert!(!filter.hystart_test(base, t));
        }
        // saturate the ring above 1.25x the filtered minimum; no trip yet
        for _ in 0..MIN_MAX_RTT_SCOPE {
            t += ms(2);
            assert!(!filter.hystart_test(ms(130), t));
        }
        // each further rising sample is an excess; the SCOPE-th one trips
        let mut rtt = ms(131);
        for i in 1..MIN_MAX_RTT_SCOPE {
            t += ms(2);
            let tripped = filter.hystart_test(rtt, t);
            assert_eq!(tripped, i == MIN_MAX_RTT_SCOPE - 1, "sample {i}");
            rtt += ms(1);
        }
    }

    #[test]
    fn hystart_ignores_samples_within_a_millisecond() {
        let now = Instant::now();
        let mut filter = MinMaxRtt::new();
        assert!(!filter.hystart_test(ms(100), now));
        let before = filter.sample_current;
        // arrives half a millisecond later; must not be recorded
        assert!(!filter.hystart_test(ms(500), now + Duration::from_micros(500)));
        assert_eq!(filter.sample_current, before);
    }

    #[test]
    fn hystart_exit_clamps_epoch_past_k() {
        let start = Instant::now();
        let now = start + Duration::from_secs(30);
        let (mut cc, _) = controller(start);
        let mut cwin = 64 * MTU;
        // drive the filter to the tripping point
        let mut t = now;
        for _ in 0..MIN_MAX_RTT_SCOPE {
            t += ms(2);
            cc.notify(
                Notification::RttMeasurement { rtt: ms(100) },
                &mut cwin,
                MTU,
                ms(100),
                CcContext::default(),
                t,
            );
        }
        for _ in 0..2 * MIN_MAX_RTT_SCOPE {
            t += ms(2);
            cc.notify(
                Notification::RttMeasurement { rtt: ms(140) },
                &mut cwin,
                MTU,
                ms(100),
                CcContext::default(),
                t,
            );
        }
        assert_eq!(cc.alg_state(), AlgState::CongestionAvoidance);
        assert_eq!(cc.ssthresh(), 64 * MTU);
        // the epoch is backdated so the curve is already past K
        assert!(t.saturating_duration_since(cc.start_of_epoch).as_secs_f64() >= cc.k - 1e-6);
    }

    #[test]
    fn cube_root_brackets_and_converges() {
        for &x in &[0.001f64, 0.5, 1.0, 8.0, 27.0, 1000.0, 123456.789] {
            let y = cube_root(x);
            assert!(
                (y * y * y - x).abs() / x < 1e-6,
                "cube_root({x}) = {y}"
            );
        }
    }
}
