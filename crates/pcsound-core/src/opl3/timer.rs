//! The two OPL count-up timers, driven by emulated time in milliseconds.

/// Timer 1 ticks every 80 µs.
pub const TIMER0_INTERVAL_MS: f64 = 0.080;
/// Timer 2 ticks every 320 µs.
pub const TIMER1_INTERVAL_MS: f64 = 0.320;

#[derive(Debug, Clone)]
pub struct OplTimer {
    clock_interval: f64,
    start: f64,
    delay: f64,
    counter: u8,
    enabled: bool,
    overflow: bool,
    masked: bool,
}

impl OplTimer {
    pub fn new(clock_interval: f64) -> Self {
        Self {
            clock_interval,
            start: 0.0,
            delay: 0.0,
            counter: 0,
            enabled: false,
            overflow: false,
            masked: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// Checks for expiry at `now` and returns the overflow flag.
    pub fn update(&mut self, now: f64) -> bool {
        if self.enabled && self.delay > 0.0 && now - self.start >= 0.0 && !self.masked {
            self.overflow = true;
        }
        self.overflow
    }

    /// Clears the overflow flag and re-arms the timer on its period grid.
    pub fn reset(&mut self, now: f64) {
        self.overflow = false;
        if !self.enabled || self.delay <= 0.0 {
            return;
        }
        let remainder = (now - self.start).rem_euclid(self.delay);
        self.start = now + (self.delay - remainder);
    }

    pub fn start(&mut self, now: f64) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.delay = (256 - self.counter as u32) as f64 * self.clock_interval;
        self.start = now + self.delay;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
    }

    pub fn set_counter(&mut self, counter: u8) {
        self.counter = counter;
    }

    pub fn set_mask(&mut self, masked: bool) {
        self.masked = masked;
        if masked {
            self.overflow = false;
        }
    }

    /// Milliseconds until this timer next raises its flag, if it will.
    pub fn time_until_overflow(&self, now: f64) -> Option<f64> {
        if !self.enabled || self.masked || self.overflow || self.delay <= 0.0 {
            return None;
        }
        Some((self.start - now).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflows_after_programmed_period() {
        let mut timer = OplTimer::new(TIMER0_INTERVAL_MS);
        timer.set_counter(0xff);
        timer.start(10.0);
        assert!(!timer.update(10.05));
        assert!(timer.update(10.1));
        assert_eq!(timer.time_until_overflow(10.2), None);
    }

    #[test]
    fn reset_rearms_on_period_grid() {
        let mut timer = OplTimer::new(TIMER1_INTERVAL_MS);
        timer.set_counter(0xfe);
        timer.start(0.0);
        assert!(timer.update(1.0));
        timer.reset(1.0);
        assert!(!timer.update(1.0));
        let next = timer.time_until_overflow(1.0).unwrap_or_default();
        assert!((next - 0.28).abs() < 1e-9, "next overflow in {next}");
    }

    #[test]
    fn masked_timer_never_flags() {
        let mut timer = OplTimer::new(TIMER0_INTERVAL_MS);
        timer.start(0.0);
        timer.set_mask(true);
        assert!(!timer.update(100.0));
        assert_eq!(timer.time_until_overflow(0.0), None);
    }

    #[test]
    fn start_is_ignored_while_running() {
        let mut timer = OplTimer::new(TIMER0_INTERVAL_MS);
        timer.set_counter(0x00);
        timer.start(0.0);
        timer.start(5.0);
        let until = timer.time_until_overflow(0.0).unwrap_or_default();
        assert!((until - 20.48).abs() < 1e-9);
        timer.stop();
        assert!(!timer.is_enabled());
    }
}
