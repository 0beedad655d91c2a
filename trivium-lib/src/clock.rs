use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Timelike;

/// Source of the wall-clock minute sampled by the session timer.
pub trait Clock: Send + Sync + 'static {
    /// Current minute of the hour, 0..=59.
    fn minute_of_hour(&self) -> u32;
}

/// Local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn minute_of_hour(&self) -> u32 {
        chrono::Local::now().minute()
    }
}

/// A clock moved by hand. Clones share the same minute.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    minute: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(minute: u32) -> Self {
        Self {
            minute: Arc::new(AtomicU32::new(minute % 60)),
        }
    }

    pub fn set(&self, minute: u32) {
        self.minute.store(minute % 60, Ordering::SeqCst);
    }

    /// Move to the next minute, wrapping at the top of the hour.
    pub fn advance(&self) {
        let next = (self.minute.load(Ordering::SeqCst) + 1) % 60;
        self.minute.store(next, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn minute_of_hour(&self) -> u32 {
        self.minute.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_wraps() {
        let clock = ManualClock::new(59);
        let shared = clock.clone();
        clock.advance();
        assert_eq!(shared.minute_of_hour(), 0);
    }

    #[test]
    fn test_system_clock_in_range() {
        assert!(SystemClock.minute_of_hour() < 60);
    }
}
