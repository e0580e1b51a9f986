//! Abstraction over the system clock so that anything that reasons about
//! "now" (flush ages, watermark lag, dedupe TTLs) can be driven by a mock
//! clock in tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::time::Duration;

/// An instant in time, with UTC civil-time accessors.
///
/// A thin wrapper around [`DateTime<Utc>`] that only exposes the operations
/// the rest of the system needs, keeping chrono off most call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from nanoseconds since the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Construct from milliseconds since the unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis(millis))
    }

    /// Construct from whole seconds since the unix epoch.
    pub fn from_timestamp_secs(secs: i64) -> Self {
        Self(Utc.timestamp(secs, 0))
    }

    /// Construct from a [`DateTime<Utc>`].
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parse an RFC 3339 / ISO 8601 timestamp.
    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)))
    }

    /// Render as RFC 3339 with second precision and a `Z` suffix.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Milliseconds since the unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Microseconds since the unix epoch.
    pub fn timestamp_micros(&self) -> i64 {
        self.0.timestamp_micros()
    }

    /// Whole seconds since the unix epoch.
    pub fn timestamp_secs(&self) -> i64 {
        self.0.timestamp()
    }

    /// The wrapped [`DateTime<Utc>`].
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }

    /// `self - other`, or `None` if `other` is later than `self`.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        self.0.signed_duration_since(other.0).to_std().ok()
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + ChronoDuration::from_std(rhs).expect("duration out of range"))
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - ChronoDuration::from_std(rhs).expect("duration out of range"))
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current time according to this provider.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a manually controlled time.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Replace the current time, returning it.
    pub fn set(&self, time: Time) -> Time {
        *self.now.write() = time;
        time
    }

    /// Advance the clock by `duration`, returning the new time.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trip() {
        let t = Time::from_rfc3339("2024-01-01T00:05:00Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-01-01T00:05:00.000Z");
        assert_eq!(t.timestamp_secs(), 1_704_067_500);
    }

    #[test]
    fn duration_since_saturates_to_none() {
        let earlier = Time::from_timestamp_millis(100);
        let later = Time::from_timestamp_millis(350);
        assert_eq!(
            later.checked_duration_since(earlier),
            Some(Duration::from_millis(250))
        );
        assert_eq!(earlier.checked_duration_since(later), None);
    }

    #[test]
    fn mock_provider_is_controllable() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now(), Time::from_timestamp_nanos(0));

        provider.inc(Duration::from_secs(5));
        assert_eq!(provider.now(), Time::from_timestamp_secs(5));

        provider.set(Time::from_timestamp_millis(42));
        assert_eq!(provider.now().timestamp_millis(), 42);
    }
}
