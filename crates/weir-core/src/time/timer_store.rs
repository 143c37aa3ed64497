//! Watermark-driven firing of persisted event-time timers.
//!
//! Timers live in an ordered [`StateStore`] under the time-major encoding
//! from [`super::timer`], so the store itself is the priority queue and
//! survives restarts through changelog replay. Firing is driven by
//! watermark advances and bounded per watermark event.
//!
//! ## Scan resume
//!
//! `next_timer_time` caches the earliest persisted timer time. Each firing
//! pass opens a single range scan at `time_prefix(next_timer_time)` instead
//! of scanning from the start of the store: on an LSM backend, fired timers
//! leave tombstones that a full scan would have to traverse, while the
//! seeded seek skips them in O(log n).
//!
//! ## At-least-once firing
//!
//! A timer is deleted only after its callback returns `Ok`; a crash between
//! callback and delete re-fires the timer on recovery. Callbacks must be
//! idempotent.

use bytes::Bytes;

use super::timer::{time_prefix, Timer, TimerMetadata};
use super::{TimeError, Watermark};
use crate::state::StateStore;
use crate::Result;

/// Watermarks below this are assumed to come from a task still
/// bootstrapping its sources; worth a log line, never worth gating.
const BOOTSTRAP_WATERMARK_MS: i64 = 10_000;

/// Callback seam for fired timers.
///
/// Invoked synchronously on the task thread, in `(time, metadata, key)`
/// order. Errors propagate out of the watermark advance; the failed timer
/// stays in the store.
pub trait TimerHandler {
    /// Handle a fired timer.
    ///
    /// # Errors
    ///
    /// Any error aborts the current firing pass and propagates to the
    /// caller of [`PersistentTimerStore::on_watermark`].
    fn on_timer(&mut self, time: i64, metadata: &TimerMetadata, key: &Bytes) -> Result<()>;
}

/// Persistent event-time timer store for one stream task.
///
/// All scalar fields are owned by the task thread; no synchronization is
/// required (or present).
pub struct PersistentTimerStore<S> {
    store: S,
    next_timer_time: i64,
    current_watermark: i64,
    max_fires_per_watermark: usize,
}

impl<S: StateStore> PersistentTimerStore<S> {
    /// Creates a timer store over the given backing store.
    ///
    /// # Panics
    ///
    /// Panics if `max_fires_per_watermark` is zero.
    #[must_use]
    pub fn new(store: S, max_fires_per_watermark: usize) -> Self {
        assert!(
            max_fires_per_watermark > 0,
            "max_fires_per_watermark must be positive"
        );
        Self {
            store,
            next_timer_time: i64::MAX,
            current_watermark: 0,
            max_fires_per_watermark,
        }
    }

    /// Resets the task-local scalars and re-seeds `next_timer_time` from the
    /// (possibly changelog-restored) backing store.
    ///
    /// # Errors
    ///
    /// Returns an error if a persisted timer key cannot be decoded.
    pub fn on_init(&mut self) -> Result<()> {
        self.next_timer_time = i64::MAX;
        self.current_watermark = 0;
        let first = {
            let mut scan = self.store.all();
            scan.next()
        };
        if let Some((key, _)) = first {
            self.next_timer_time = Timer::decode(&key)?.time;
        }
        Ok(())
    }

    /// Registers a one-shot timer.
    ///
    /// If the timer's time is already behind the current watermark, the
    /// handler fires inline on this call stack and the store is not
    /// touched: the watermark has passed, so persisting the timer would
    /// silently violate "no work past the watermark is deferred".
    ///
    /// # Errors
    ///
    /// Propagates handler errors (inline fire) and store write errors.
    pub fn add_timer(&mut self, timer: Timer, handler: &mut dyn TimerHandler) -> Result<()> {
        if timer.time < self.current_watermark {
            return handler.on_timer(timer.time, &timer.metadata, &timer.key);
        }
        self.store.put(&timer.encode(), &[])?;
        if timer.time < self.next_timer_time {
            self.next_timer_time = timer.time;
        }
        Ok(())
    }

    /// Advances the watermark, firing all due timers (bounded per call).
    ///
    /// `current_watermark` is updated *after* firing, so timer callbacks
    /// observe the pre-advance watermark.
    ///
    /// # Errors
    ///
    /// Returns `TimeError::WatermarkRegression` if `watermark` is behind the
    /// current one, and propagates handler and store errors.
    pub fn on_watermark(
        &mut self,
        watermark: Watermark,
        handler: &mut dyn TimerHandler,
    ) -> Result<()> {
        let w = watermark.timestamp();
        if w < BOOTSTRAP_WATERMARK_MS {
            tracing::warn!(watermark = w, "low watermark, task may still be bootstrapping");
        }
        if w < self.current_watermark {
            return Err(TimeError::WatermarkRegression {
                current: self.current_watermark,
                new: w,
            }
            .into());
        }
        if w >= self.next_timer_time {
            self.fire_timers(w, handler)?;
        }
        self.current_watermark = w;
        Ok(())
    }

    /// Fires due timers in `(time, metadata, key)` order.
    ///
    /// One bounded range scan collects at most `max_fires_per_watermark`
    /// due timers plus a single lookahead; each collected timer is then
    /// fired and deleted, in that order per timer.
    fn fire_timers(&mut self, w: i64, handler: &mut dyn TimerHandler) -> Result<()> {
        let mut due: Vec<Timer> = Vec::new();
        let mut resume_at = i64::MAX;
        {
            let prefix = time_prefix(self.next_timer_time);
            let mut scan = self.store.scan_from(&prefix);
            while let Some((key, _)) = scan.next() {
                let timer = Timer::decode(&key)?;
                if w >= timer.time {
                    if due.len() == self.max_fires_per_watermark {
                        // Budget spent: remember where to resume, fire later
                        resume_at = timer.time;
                        break;
                    }
                    due.push(timer);
                } else {
                    // First timer strictly after the watermark
                    resume_at = timer.time;
                    break;
                }
            }
        }

        for timer in &due {
            handler.on_timer(timer.time, &timer.metadata, &timer.key)?;
            // Delete only after the callback succeeded (at-least-once)
            self.store.delete(&timer.encode())?;
        }

        self.next_timer_time = resume_at;
        Ok(())
    }

    /// The cached earliest persisted timer time, or `i64::MAX` if none.
    #[must_use]
    pub fn next_timer_time(&self) -> i64 {
        self.next_timer_time
    }

    /// The watermark as of the last completed [`Self::on_watermark`].
    #[must_use]
    pub fn current_watermark(&self) -> i64 {
        self.current_watermark
    }

    /// Decodes every persisted timer in firing order. Init-path only.
    ///
    /// # Errors
    ///
    /// Returns an error if a persisted timer key cannot be decoded.
    pub fn all_timers(&self) -> Result<Vec<Timer>> {
        let mut timers = Vec::new();
        for (key, _) in self.store.all() {
            timers.push(Timer::decode(&key)?);
        }
        Ok(timers)
    }

    /// Number of persisted timers.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.store.len()
    }
}
