//! Timing of the facility trigger pulses, fed by the readback task's batch callback.
//!
//! The monitor measures pulse frequency over non-overlapping windows of K callbacks: deltas
//! between consecutive timestamps accumulate in `sum_delta_t`, and on every K-th callback the
//! frequency is taken as `deltas / sum_delta_t` before the accumulator is reset. Once the first
//! timestamp has been seen every window holds exactly K deltas, so this is `K / sum_delta_t`. The
//! time between arming the monitor and the first pulse is not a pulse period and is not counted.
//!
//! A window whose frequency deviates from the expected rate by more than `tolerance` (a fraction
//! of the expected rate) counts as one missed-pulse event.
//!
//! [`PulseTimingMonitor::on_timestamp`] runs on the driver callback thread: it only updates a few
//! numbers and never blocks or logs above `trace` level.

use crate::config::TimingConfig;

#[derive(Clone, Debug)]
pub struct PulseTimingMonitor {
    cfg: TimingConfig,
    callback_count: u64,
    window_deltas: usize,
    sum_delta_t: f64,
    last_timestamp: f64,
    primed: bool,
    current_freq: f64,
    missed_count: u64,
}

impl PulseTimingMonitor {
    /// `armed_at` seeds `last_timestamp`, so the beam counts as present for one timeout after
    /// arming even before the first pulse arrives.
    pub fn new(cfg: TimingConfig, armed_at: f64) -> Self {
        Self {
            cfg: TimingConfig {
                window: cfg.window.max(1),
                ..cfg
            },
            callback_count: 0,
            window_deltas: 0,
            sum_delta_t: 0.0,
            last_timestamp: armed_at,
            primed: false,
            current_freq: 0.0,
            missed_count: 0,
        }
    }

    /// Records one completed acquisition at wall-clock time `t`.
    ///
    /// Returns the measured frequency when this call closes a window.
    pub fn on_timestamp(&mut self, t: f64) -> Option<f64> {
        self.callback_count += 1;
        if self.primed {
            self.sum_delta_t += t - self.last_timestamp;
            self.window_deltas += 1;
        } else {
            self.primed = true;
        }
        self.last_timestamp = t;

        if self.callback_count % self.cfg.window as u64 != 0 {
            return None;
        }
        let measured = if self.window_deltas > 0 && self.sum_delta_t > 0.0 {
            let freq = self.window_deltas as f64 / self.sum_delta_t;
            self.current_freq = freq;
            if (freq - self.cfg.expected_freq).abs() > self.cfg.tolerance * self.cfg.expected_freq {
                self.missed_count += 1;
            }
            tracing::trace!(freq, missed = self.missed_count, "pulse window closed");
            Some(freq)
        } else {
            None
        };
        self.sum_delta_t = 0.0;
        self.window_deltas = 0;
        measured
    }

    pub fn current_freq(&self) -> f64 {
        self.current_freq
    }

    pub fn missed_count(&self) -> u64 {
        self.missed_count
    }

    pub fn last_timestamp(&self) -> f64 {
        self.last_timestamp
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count
    }

    /// Seconds from the last pulse (or arming) to `now`
    pub fn since_last(&self, now: f64) -> f64 {
        now - self.last_timestamp
    }

    pub fn config(&self) -> &TimingConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn monitor(window: usize) -> PulseTimingMonitor {
        PulseTimingMonitor::new(
            TimingConfig {
                window,
                expected_freq: 10.0,
                tolerance: 0.1,
            },
            0.0,
        )
    }

    #[test]
    fn steady_10hz() {
        let mut mon = monitor(10);
        let mut closed = Vec::new();
        for k in 0..10 {
            closed.push(mon.on_timestamp(k as f64 * 0.1));
        }
        assert!(closed[..9].iter().all(|f| f.is_none()));
        let freq = closed[9].unwrap();
        assert!((freq - 10.0).abs() < 1e-9);
        assert!((mon.current_freq() - 10.0).abs() < 1e-9);
        assert_eq!(mon.missed_count(), 0);
        assert!((mon.last_timestamp() - 0.9).abs() < 1e-12);

        // Second window: exactly K deltas
        for k in 10..20 {
            mon.on_timestamp(k as f64 * 0.1);
        }
        assert!((mon.current_freq() - 10.0).abs() < 1e-9);
        assert_eq!(mon.missed_count(), 0);
    }

    #[test]
    fn gap_counts_as_missed() {
        let mut mon = monitor(10);
        for k in 0..9 {
            mon.on_timestamp(k as f64 * 0.1);
        }
        mon.on_timestamp(2.0);
        assert_eq!(mon.missed_count(), 1);
        assert!(mon.current_freq() < 9.0);
    }

    #[test]
    fn windows_do_not_overlap() {
        let mut mon = monitor(10);
        // One bad window then a good one: the good window is not polluted by the gap
        for k in 0..9 {
            mon.on_timestamp(k as f64 * 0.1);
        }
        mon.on_timestamp(2.0);
        for k in 1..=10 {
            mon.on_timestamp(2.0 + k as f64 * 0.1);
        }
        assert!((mon.current_freq() - 10.0).abs() < 1e-6);
        assert_eq!(mon.missed_count(), 1);
    }

    #[test]
    fn tolerance_is_relative() {
        // 10.5 Hz is inside 10 % of 10 Hz
        let mut mon = monitor(4);
        for k in 0..8 {
            mon.on_timestamp(k as f64 / 10.5);
        }
        assert_eq!(mon.missed_count(), 0);

        // 12 Hz is not
        let mut mon = monitor(4);
        for k in 0..8 {
            mon.on_timestamp(k as f64 / 12.0);
        }
        assert_eq!(mon.missed_count(), 2);
    }

    #[test]
    fn fast_poll_window_of_one() {
        let mut mon = monitor(1);
        // First call only primes
        assert_eq!(mon.on_timestamp(5.0), None);
        let freq = mon.on_timestamp(5.1).unwrap();
        assert!((freq - 10.0).abs() < 1e-6);
        assert_eq!(mon.callback_count(), 2);
    }

    #[test]
    fn liveness_from_arming() {
        let mon = PulseTimingMonitor::new(TimingConfig::default(), 100.0);
        assert_eq!(mon.last_timestamp(), 100.0);
        assert_eq!(mon.since_last(106.0), 6.0);
    }
}
