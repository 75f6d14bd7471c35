use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::RwLock;

/// Source of wall-clock time for date labels.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Manually driven clock for rollover tests.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<DateTime<Local>>,
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.read()
    }
}

impl MockClock {
    pub fn with_time(time: DateTime<Local>) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn new() -> Self {
        Self::with_time(Local::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write();
        *now += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
    }

    pub fn set_time(&self, time: DateTime<Local>) {
        *self.now.write() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a timestamp into a date label (`%Y%m%d` by default).
pub fn date_label(time: &DateTime<Local>, format: &str) -> String {
    time.format(format).to_string()
}
