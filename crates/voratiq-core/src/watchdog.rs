//! Silence and wall-clock timers guarding a sandboxed agent process.
//!
//! The silence timer resets on every chunk written to stdout or stderr; the
//! wall-clock timer fires unconditionally once the cap elapses regardless of
//! output activity. Both timers are driven by polling from [`crate::sandbox`]
//! rather than a dedicated timer thread, consistent with this crate's
//! synchronous worker model.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default silence timeout: no stdout/stderr bytes for this long trips the
/// watchdog. Published on the manifest's `runtime` field so tests (and
/// operators) can assert on the value in force.
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default wall-clock cap: the agent process is killed unconditionally after
/// this much wall time regardless of output activity.
pub const DEFAULT_WALL_CLOCK_CAP: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Silence,
    WallClock,
}

impl TriggerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::Silence => "silence",
            TriggerReason::WallClock => "wall-clock",
        }
    }
}

pub struct Watchdog {
    started_at: Instant,
    last_activity: Mutex<Instant>,
    silence_timeout: Duration,
    wall_clock_cap: Duration,
}

impl Watchdog {
    pub fn new(silence_timeout: Duration, wall_clock_cap: Duration) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_activity: Mutex::new(now),
            silence_timeout,
            wall_clock_cap,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SILENCE_TIMEOUT, DEFAULT_WALL_CLOCK_CAP)
    }

    /// Record a chunk of stdout/stderr activity, resetting the silence timer.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("lock poisoned") = Instant::now();
    }

    /// Evaluate both timers against the current instant. Wall-clock is
    /// checked first since it is unconditional; silence is checked second.
    pub fn check(&self) -> Option<TriggerReason> {
        let now = Instant::now();
        if now.duration_since(self.started_at) >= self.wall_clock_cap {
            return Some(TriggerReason::WallClock);
        }
        let last_activity = *self.last_activity.lock().expect("lock poisoned");
        if now.duration_since(last_activity) >= self.silence_timeout {
            return Some(TriggerReason::Silence);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_watchdog_does_not_trigger() {
        let watchdog = Watchdog::new(Duration::from_secs(60), Duration::from_secs(600));
        assert!(watchdog.check().is_none());
    }

    #[test]
    fn silence_trigger_fires_after_timeout_without_touch() {
        let watchdog = Watchdog::new(Duration::from_millis(20), Duration::from_secs(600));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(watchdog.check(), Some(TriggerReason::Silence));
    }

    #[test]
    fn touch_resets_the_silence_timer() {
        let watchdog = Watchdog::new(Duration::from_millis(50), Duration::from_secs(600));
        std::thread::sleep(Duration::from_millis(30));
        watchdog.touch();
        std::thread::sleep(Duration::from_millis(30));
        assert!(watchdog.check().is_none());
    }

    #[test]
    fn wall_clock_trigger_fires_even_with_recent_activity() {
        let watchdog = Watchdog::new(Duration::from_secs(600), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(5));
        watchdog.touch();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(watchdog.check(), Some(TriggerReason::WallClock));
    }
}
