use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
///
/// Every timestamp handed to the readback callback, and every `now` the beam supervisor
/// compares against it, comes from this clock.
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

// Utility class for time-tracking
pub struct TickTimer {
    pub milis: f64,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            milis: wall_clock_secs() * 1e3,
        }
    }

    pub fn tick(&mut self) -> f64 {
        let milis = wall_clock_secs() * 1e3;
        let diff = milis - self.milis;
        self.milis = milis;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_is_monotone_enough() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let diff = timer.tick();
        assert!(diff >= 4.0, "expected at least 4 ms, got {diff}");
        // Second tick measures from the first one, not from construction
        assert!(timer.tick() < diff);
    }
}
