use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Strictly increasing wall-clock timestamps, microsecond resolution.
///
/// If the system clock steps backwards, stamps keep counting up from the
/// last value handed out.
#[derive(Debug, Default)]
pub struct EventClock {
    last_micros: AtomicI64,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let prev = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(wall.max(last + 1))
            })
            .unwrap_or(wall);
        let stamped = wall.max(prev + 1);
        DateTime::from_timestamp_micros(stamped).unwrap_or_else(Utc::now)
    }
}
