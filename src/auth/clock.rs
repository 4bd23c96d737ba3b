//! Trusted wall-clock source
//!
//! Token generation needs a synchronized clock. Time sync itself (NTP, SNTP,
//! cellular network time) is handled elsewhere; this trait only reports the
//! result, or `None` while the clock cannot be trusted.

use chrono::{DateTime, TimeZone, Utc};

/// Source of trusted current time
pub trait Clock: Send + Sync {
    /// Current time, or `None` when the clock has not been synchronized
    fn now(&self) -> Option<DateTime<Utc>>;
}

/// Operating system clock with a sanity floor
///
/// A device RTC that has never been set usually reports a date near the
/// epoch. Anything before `trusted_after` is treated as unsynchronized.
#[derive(Debug, Clone)]
pub struct SystemClock {
    trusted_after: DateTime<Utc>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            trusted_after: Utc
                .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        }
    }

    /// Use a custom floor below which the clock is considered unsynchronized
    pub fn with_floor(trusted_after: DateTime<Utc>) -> Self {
        Self { trusted_after }
    }

    /// Pure check used by `now`
    pub fn is_trusted(&self, candidate: DateTime<Utc>) -> bool {
        candidate >= self.trusted_after
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.is_trusted(now).then_some(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_is_untrusted() {
        let clock = SystemClock::new();
        let epoch = Utc.timestamp_opt(0, 0).single().unwrap();
        assert!(!clock.is_trusted(epoch));
    }

    #[test]
    fn test_recent_time_is_trusted() {
        let clock = SystemClock::new();
        let recent = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap();
        assert!(clock.is_trusted(recent));
    }

    #[test]
    fn test_system_clock_reports_now() {
        let clock = SystemClock::new();
        assert!(clock.now().is_some());
    }

    #[test]
    fn test_custom_floor() {
        let floor = Utc.timestamp_opt(500, 0).single().unwrap();
        let clock = SystemClock::with_floor(floor);
        assert!(clock.is_trusted(Utc.timestamp_opt(1000, 0).single().unwrap()));
        assert!(!clock.is_trusted(Utc.timestamp_opt(499, 0).single().unwrap()));
    }
}
