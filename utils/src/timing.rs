// Helpers for tracking how long operations take
//
// Austin Shafer - 2020
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Number of milliseconds since the unix epoch, truncated. Used
/// to stamp log lines.
pub fn get_current_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u32
}

/// A reusable stopwatch for timing sections of code
///
/// Call `start` before the region and `end` after it, then read
/// the elapsed time with `get_duration`.
pub struct StopWatch {
    sw_start: Instant,
    sw_end: Instant,
}

impl StopWatch {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            sw_start: now,
            sw_end: now,
        }
    }

    pub fn start(&mut self) {
        self.sw_start = Instant::now();
    }

    pub fn end(&mut self) {
        self.sw_end = Instant::now();
    }

    pub fn get_duration(&self) -> Duration {
        self.sw_end.duration_since(self.sw_start)
    }
}
