use std::time::{Duration, Instant};

/// Monotonic tick clock.
///
/// Endpoints measure the wall-clock time between `tick()` calls with this, and the
///  bandwidth probe uses one to time the gap between its two probe packets.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            start: Instant::now(),
        }
    }

    /// Time since the last reset. With `reset == true` the timer restarts, so
    ///  consecutive calls measure consecutive intervals.
    pub fn elapsed(&mut self, reset: bool) -> Duration {
        let elapsed = self.start.elapsed();
        if reset {
            self.reset();
        }
        elapsed
    }

    pub fn elapsed_millis(&mut self, reset: bool) -> f32 {
        self.elapsed(reset).as_secs_f32() * 1000.0
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}
