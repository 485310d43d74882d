use std::fmt::Debug;

/// Source of wall-clock time for entry timestamps, in milliseconds since the Unix epoch.
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}
