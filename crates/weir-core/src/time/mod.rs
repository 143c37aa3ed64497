//! # Time Module
//!
//! Event time, watermarks, and persistent event-time timers.
//!
//! ## Concepts
//!
//! - **Event Time**: millisecond timestamp at which the event occurred
//! - **Watermark**: assertion that no record with event time < watermark
//!   will be processed subsequently
//! - **Timer**: a one-shot event-time callback, persisted in an ordered
//!   state store and fired when the watermark passes its time
//!
//! ## Watermark Tracking
//!
//! [`WatermarkTracker`] maintains the per-task watermark from record
//! timestamps with a bounded out-of-orderness allowance:
//!
//! ```rust
//! use std::time::Duration;
//! use weir_core::time::{WatermarkTracker, Watermark};
//!
//! let mut tracker = WatermarkTracker::per_record(Duration::from_secs(1));
//! let wm = tracker.observe(5000);
//! assert_eq!(wm, Some(Watermark::new(4000))); // 5000 - 1000
//! ```
//!
//! ## Persistent Timers
//!
//! [`PersistentTimerStore`] stores [`Timer`]s in any ordered
//! [`StateStore`](crate::state::StateStore) under a time-major byte encoding
//! and fires them against a [`TimerHandler`] as the watermark advances.

mod timer;
mod timer_store;
mod watermark;

pub use timer::{time_prefix, Timer, TimerKey, TimerMetadata};
pub use timer_store::{PersistentTimerStore, TimerHandler};
pub use watermark::{EmitPolicy, WatermarkTracker};

pub(crate) use timer::{decode_ordered_time, encode_ordered_time};

/// A watermark indicating event-time progress.
///
/// Watermarks are monotonically non-decreasing assertions that no record
/// with an earlier event time will be processed subsequently. The initial
/// watermark of every task is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(i64);

impl Watermark {
    /// Creates a new watermark with the given timestamp.
    #[inline]
    #[must_use]
    pub fn new(timestamp: i64) -> Self {
        Self(timestamp)
    }

    /// Returns the watermark timestamp in milliseconds.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.0
    }

    /// Checks if an event time is late relative to this watermark.
    ///
    /// An event is late if its timestamp is strictly less than the
    /// watermark.
    #[inline]
    #[must_use]
    pub fn is_late(&self, event_time: i64) -> bool {
        event_time < self.0
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self(0)
    }
}

impl From<i64> for Watermark {
    fn from(timestamp: i64) -> Self {
        Self(timestamp)
    }
}

impl From<Watermark> for i64 {
    fn from(watermark: Watermark) -> Self {
        watermark.0
    }
}

/// Errors that can occur in time operations.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// A persisted timer key could not be decoded
    #[error("Invalid timer key: {0}")]
    InvalidTimerKey(String),

    /// Watermark regression (going backwards)
    #[error("Watermark regression: current={current}, new={new}")]
    WatermarkRegression {
        /// Current watermark value
        current: i64,
        /// Attempted new watermark value
        new: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_creation() {
        let watermark = Watermark::new(1000);
        assert_eq!(watermark.timestamp(), 1000);
    }

    #[test]
    fn test_watermark_late_detection() {
        let watermark = Watermark::new(1000);
        assert!(watermark.is_late(999));
        assert!(!watermark.is_late(1000));
        assert!(!watermark.is_late(1001));
    }

    #[test]
    fn test_watermark_ordering() {
        let w1 = Watermark::new(1000);
        let w2 = Watermark::new(2000);

        assert!(w1 < w2);
        assert_eq!(w1, Watermark::new(1000));
    }

    #[test]
    fn test_watermark_starts_at_zero() {
        assert_eq!(Watermark::default().timestamp(), 0);
    }

    #[test]
    fn test_watermark_conversions() {
        let wm = Watermark::from(1000i64);
        assert_eq!(wm.timestamp(), 1000);

        let ts: i64 = wm.into();
        assert_eq!(ts, 1000);
    }
}
