//! Per-task watermark tracking.
//!
//! The tracker derives the watermark from observed record timestamps as
//! `max(previous, event_time - allowed_out_of_orderness)`. Two emission
//! policies control when the derived value is surfaced to listeners:
//!
//! - [`EmitPolicy::PerRecord`]: the watermark advances on every record
//! - [`EmitPolicy::Interval`]: the watermark advances only on a scheduled
//!   wall-clock punctuation driven by the host

use std::time::Duration;

use super::Watermark;

/// When the tracked watermark is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitPolicy {
    /// Advance and emit on every observed record.
    PerRecord,
    /// Advance only on [`WatermarkTracker::on_punctuate`], which the host
    /// schedules at this wall-clock interval.
    Interval(Duration),
}

/// Maintains the event-time watermark for one stream task.
///
/// The watermark starts at 0 and is monotonically non-decreasing. Records
/// only ever raise the maximum observed event time; the watermark trails it
/// by the configured out-of-orderness allowance.
#[derive(Debug)]
pub struct WatermarkTracker {
    policy: EmitPolicy,
    allowed_out_of_orderness_ms: i64,
    max_event_time: i64,
    current: i64,
}

impl WatermarkTracker {
    /// Creates a tracker with the given allowance and emission policy.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(allowed_out_of_orderness: Duration, policy: EmitPolicy) -> Self {
        Self {
            policy,
            // Truncation is acceptable: allowances beyond 2^63 ms are not practical
            allowed_out_of_orderness_ms: allowed_out_of_orderness.as_millis() as i64,
            max_event_time: 0,
            current: 0,
        }
    }

    /// Creates a per-record tracker.
    #[must_use]
    pub fn per_record(allowed_out_of_orderness: Duration) -> Self {
        Self::new(allowed_out_of_orderness, EmitPolicy::PerRecord)
    }

    /// Creates an interval tracker; the host schedules
    /// [`Self::on_punctuate`] at `every`.
    #[must_use]
    pub fn at_interval(allowed_out_of_orderness: Duration, every: Duration) -> Self {
        Self::new(allowed_out_of_orderness, EmitPolicy::Interval(every))
    }

    /// Observes a record timestamp.
    ///
    /// Returns `Some(watermark)` when the policy is per-record and the
    /// watermark advanced. Under the interval policy this only updates the
    /// maximum observed event time.
    pub fn observe(&mut self, event_time: i64) -> Option<Watermark> {
        if event_time > self.max_event_time {
            self.max_event_time = event_time;
        }
        match self.policy {
            EmitPolicy::PerRecord => self.try_advance(self.candidate()),
            EmitPolicy::Interval(_) => None,
        }
    }

    /// Surfaces any pending watermark advance. Driven by the host's
    /// wall-clock punctuation under the interval policy.
    pub fn on_punctuate(&mut self) -> Option<Watermark> {
        self.try_advance(self.candidate())
    }

    /// Advances the watermark from an external source (e.g., a
    /// source-provided watermark). Returns `None` on no advance.
    pub fn advance_to(&mut self, timestamp: i64) -> Option<Watermark> {
        let advanced = self.try_advance(timestamp);
        if advanced.is_some() {
            // Keep max_event_time >= current + allowance so later records
            // cannot regress the derived candidate.
            let floor = timestamp.saturating_add(self.allowed_out_of_orderness_ms);
            if floor > self.max_event_time {
                self.max_event_time = floor;
            }
        }
        advanced
    }

    /// Returns the current watermark.
    #[must_use]
    pub fn current(&self) -> Watermark {
        Watermark::new(self.current)
    }

    /// Watermark lag: distance between the maximum observed event time and
    /// the current watermark.
    #[must_use]
    pub fn lag(&self) -> i64 {
        self.max_event_time.saturating_sub(self.current)
    }

    /// Returns the punctuation interval, if the policy is interval-based.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        match self.policy {
            EmitPolicy::Interval(every) => Some(every),
            EmitPolicy::PerRecord => None,
        }
    }

    fn candidate(&self) -> i64 {
        self.max_event_time
            .saturating_sub(self.allowed_out_of_orderness_ms)
    }

    fn try_advance(&mut self, candidate: i64) -> Option<Watermark> {
        if candidate > self.current {
            self.current = candidate;
            Some(Watermark::new(candidate))
        } else {
            None
        }
    }
}
