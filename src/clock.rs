//! Wall clock and sleeping, behind a trait so supervisors can be driven
//! deterministically.

use chrono::{Local, NaiveDateTime};
use std::time::{Duration, Instant};

use crate::lifecycle::StopFlag;

/// Longest uninterrupted sleep slice while a stop flag is being watched.
pub const STOP_POLL_SLICE: Duration = Duration::from_millis(250);

pub trait Clock: Send {
    /// Local wall-clock time, used for segment names.
    fn now(&self) -> NaiveDateTime;

    fn sleep(&self, duration: Duration);

    /// Sleeps for `duration` unless `stop` is raised first.
    ///
    /// Returns `false` if the sleep was cut short by the stop flag.
    fn pause(&self, duration: Duration, stop: &StopFlag) -> bool {
        let started = Instant::now();
        loop {
            if stop.is_set() {
                return false;
            }
            let elapsed = started.elapsed();
            if elapsed >= duration {
                return true;
            }
            self.sleep((duration - elapsed).min(STOP_POLL_SLICE));
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ShutdownController;

    #[test]
    fn pause_returns_immediately_when_stopped() {
        let controller = ShutdownController::new();
        controller.request_stop();
        let started = Instant::now();
        assert!(!SystemClock.pause(Duration::from_secs(30), &controller.flag()));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pause_completes_short_sleeps() {
        let flag = StopFlag::new();
        assert!(SystemClock.pause(Duration::from_millis(20), &flag));
    }
}
