//! Time source for cache busting values.
//!
//! Engines cache step results; a step that must run every time carries an
//! environment variable whose value changes on every call. Plans built with a
//! [`FixedClock`] are reproducible, which is what tests and replays want.

use chrono::{DateTime, SecondsFormat, Utc};

/// Supplies the current time.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// A value that differs between calls made at different instants.
    fn cache_bust(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Nanos, true)
    }
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always returns the same instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
