//! # Windowed Aggregation
//!
//! Fixed tumbling windows with allowed lateness, late-data restatement,
//! deferred closure, and post-close queryability.
//!
//! ## Window lifecycle
//!
//! A window `[start, start + size)` over key `k`:
//!
//! 1. **Open**: first on-time record creates the aggregate entry and, once
//!    per window start, registers the event-time timers.
//! 2. **Close** (`start + size + allowed_lateness`): every entry of the
//!    window is emitted with `WindowClosed`. State is retained.
//! 3. **Queryable**: between close and expiry the aggregate remains
//!    readable via [`WindowedAggregator::get`]; new records for the window
//!    are restated, never merged.
//! 4. **Expire** (`close + queryable_after_close`): the window's entries
//!    are range-deleted, bypassing the changelog (replaying the expiry
//!    timer reconstructs the deletion).
//!
//! Records arriving past allowed lateness are forwarded immediately as
//! `Restatement` of just that record's contribution; they never touch the
//! window state.
//!
//! ## Emit policies
//!
//! - `emit_on_close`: emit all window entries when the close timer fires
//! - `emit_updated_entries_on_commit`: emit `WindowOpen` snapshots of
//!   entries flushed at each commit boundary
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use bytes::Bytes;
//! use weir_core::operator::{window::*, Record};
//! use weir_core::state::InMemoryStore;
//! use weir_core::time::WatermarkTracker;
//!
//! let cfg = WindowConfig::new(Duration::from_secs(60))
//!     .with_allowed_lateness(Duration::from_secs(5));
//! let mut agg = WindowedAggregator::new(
//!     cfg,
//!     SumAggregator,
//!     WatermarkTracker::per_record(Duration::ZERO),
//!     InMemoryStore::new(),
//!     InMemoryStore::new(),
//! );
//!
//! agg.on_record(Record::new(Bytes::from_static(b"k"), 5, 1_000)).unwrap();
//! let emits = agg.on_watermark(120_000).unwrap();
//! assert_eq!(emits[0].value.value, 5);
//! ```

use bytes::Bytes;
use fxhash::FxHashSet;
use parking_lot::Mutex;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};
use std::sync::Arc;
use std::time::Duration;

use super::{Emit, EmitVec, OperatorError, Record};
use crate::state::{
    CachingStore, ChangelogSink, FlushListener, StateStore, StateStoreExt,
};
use crate::time::{
    decode_ordered_time, encode_ordered_time, PersistentTimerStore, Timer, TimerHandler,
    TimerMetadata, Watermark, WatermarkTracker,
};

/// Default bound on timers fired per watermark event.
pub const DEFAULT_MAX_TIMER_FIRES_PER_WATERMARK: usize = 10_000;

/// A key scoped to one tumbling window.
///
/// Two windowed keys are equal iff start, size, and key all match. The byte
/// encoding is `start (8, ordered BE) || size (8, ordered BE) || key`; the
/// start-major prefix is what window range scans and range deletes key off.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimeWindowed {
    /// Window start, inclusive, in milliseconds.
    pub start_ms: i64,
    /// Window duration in milliseconds.
    pub size_ms: i64,
    /// Serialized record key.
    pub key: Bytes,
}

impl TimeWindowed {
    /// Creates a windowed key.
    #[must_use]
    pub fn new(start_ms: i64, size_ms: i64, key: Bytes) -> Self {
        Self {
            start_ms,
            size_ms,
            key,
        }
    }

    /// Window end, exclusive, in milliseconds.
    #[must_use]
    pub fn end_ms(&self) -> i64 {
        self.start_ms.saturating_add(self.size_ms)
    }

    /// Encodes this windowed key for the aggregate store.
    #[must_use]
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + self.key.len());
        key.extend_from_slice(&encode_ordered_time(self.start_ms));
        key.extend_from_slice(&encode_ordered_time(self.size_ms));
        key.extend_from_slice(&self.key);
        key
    }

    /// Decodes a windowed key from aggregate-store bytes.
    ///
    /// # Errors
    ///
    /// Returns `OperatorError::InvalidKey` if the bytes are shorter than the
    /// two 8-byte prefixes.
    pub fn from_key(bytes: &[u8]) -> Result<Self, OperatorError> {
        if bytes.len() < 16 {
            return Err(OperatorError::InvalidKey(format!(
                "windowed key must be at least 16 bytes, got {}",
                bytes.len()
            )));
        }
        let mut start = [0u8; 8];
        start.copy_from_slice(&bytes[..8]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            start_ms: decode_ordered_time(start),
            size_ms: decode_ordered_time(size),
            key: Bytes::copy_from_slice(&bytes[16..]),
        })
    }

    /// The 8-byte prefix shared by every entry with this window start.
    #[must_use]
    pub fn start_prefix(start_ms: i64) -> [u8; 8] {
        encode_ordered_time(start_ms)
    }
}

/// Half-open byte range covering exactly the entries with window start `ws`.
fn window_scan_bounds(ws: i64) -> ([u8; 8], [u8; 8]) {
    (
        TimeWindowed::start_prefix(ws),
        TimeWindowed::start_prefix(ws.saturating_add(1)),
    )
}

/// How an emitted value relates to its window's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultState {
    /// Pre-close snapshot of a still-open window.
    WindowOpen,
    /// Final emission at window close.
    WindowClosed,
    /// A record past allowed lateness, forwarded without merging into state.
    Restatement,
}

/// A value paired with its window result state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowedValue<T> {
    /// Lifecycle state of the emission.
    pub state: ResultState,
    /// The aggregate (or restated) value.
    pub value: T,
}

impl<T> WindowedValue<T> {
    /// An open-window snapshot.
    #[must_use]
    pub fn open(value: T) -> Self {
        Self {
            state: ResultState::WindowOpen,
            value,
        }
    }

    /// A final closed-window emission.
    #[must_use]
    pub fn closed(value: T) -> Self {
        Self {
            state: ResultState::WindowClosed,
            value,
        }
    }

    /// A restatement of a late record.
    #[must_use]
    pub fn restatement(value: T) -> Self {
        Self {
            state: ResultState::Restatement,
            value,
        }
    }
}

/// Aggregation function folded over a window's records.
///
/// The accumulator is persisted per `(window, key)` through rkyv; derive
/// `Archive`, `rkyv::Serialize`, and `rkyv::Deserialize` on it.
pub trait WindowAggregator: Send {
    /// Input value type.
    type Value;
    /// Accumulator persisted per windowed key.
    type Acc;

    /// Creates the empty accumulator.
    fn initialize(&self) -> Self::Acc;

    /// Folds one record into the accumulator.
    fn apply(&self, key: &[u8], value: &Self::Value, acc: Self::Acc) -> Self::Acc;
}

/// Sums `i64` record values.
#[derive(Debug, Clone, Default)]
pub struct SumAggregator;

impl WindowAggregator for SumAggregator {
    type Value = i64;
    type Acc = i64;

    fn initialize(&self) -> i64 {
        0
    }

    fn apply(&self, _key: &[u8], value: &i64, acc: i64) -> i64 {
        acc + *value
    }
}

/// Counts records, ignoring their payloads.
#[derive(Debug, Clone, Default)]
pub struct CountAggregator;

impl WindowAggregator for CountAggregator {
    type Value = Bytes;
    type Acc = u64;

    fn initialize(&self) -> u64 {
        0
    }

    fn apply(&self, _key: &[u8], _value: &Bytes, acc: u64) -> u64 {
        acc + 1
    }
}

/// Custom window-start assignment: `(event_time, key, value) -> start_ms`.
pub type WindowStartFn<V> = Box<dyn Fn(i64, &[u8], &V) -> i64 + Send>;

/// Configuration for the windowed aggregator.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    window_size: Duration,
    allowed_lateness: Duration,
    queryable_after_close: Duration,
    emit_on_close: bool,
    emit_updated_on_commit: bool,
    max_timer_fires_per_watermark: usize,
    commit_interval: Duration,
}

impl WindowConfig {
    /// Creates a config with the given window size.
    ///
    /// Defaults: no lateness, no queryable-after-close interval, emit on
    /// close, no commit-time emissions.
    ///
    /// # Panics
    ///
    /// Panics if the window size is zero.
    #[must_use]
    pub fn new(window_size: Duration) -> Self {
        assert!(!window_size.is_zero(), "window size must be positive");
        Self {
            window_size,
            allowed_lateness: Duration::ZERO,
            queryable_after_close: Duration::ZERO,
            emit_on_close: true,
            emit_updated_on_commit: false,
            max_timer_fires_per_watermark: DEFAULT_MAX_TIMER_FIRES_PER_WATERMARK,
            commit_interval: Duration::from_secs(30),
        }
    }

    /// Grace period after window end during which records still merge.
    #[must_use]
    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }

    /// Interval after close during which state remains readable.
    #[must_use]
    pub fn with_queryable_after_close(mut self, interval: Duration) -> Self {
        self.queryable_after_close = interval;
        self
    }

    /// Whether closing a window emits all its entries.
    #[must_use]
    pub fn with_emit_on_close(mut self, emit: bool) -> Self {
        self.emit_on_close = emit;
        self
    }

    /// Whether each commit emits open-window snapshots of flushed entries.
    #[must_use]
    pub fn with_emit_updated_on_commit(mut self, emit: bool) -> Self {
        self.emit_updated_on_commit = emit;
        self
    }

    /// Bounds timers fired per watermark event.
    #[must_use]
    pub fn with_max_timer_fires_per_watermark(mut self, max: usize) -> Self {
        self.max_timer_fires_per_watermark = max;
        self
    }

    /// Interval at which the host schedules the commit punctuation that
    /// drives [`WindowedAggregator::on_commit`].
    #[must_use]
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// The commit interval for the host's punctuation schedule.
    #[must_use]
    pub fn commit_interval(&self) -> Duration {
        self.commit_interval
    }

    /// Window size in milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn window_size_ms(&self) -> i64 {
        self.window_size.as_millis() as i64
    }

    /// Allowed lateness in milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness.as_millis() as i64
    }

    /// Queryable-after-close interval in milliseconds.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn queryable_after_close_ms(&self) -> i64 {
        self.queryable_after_close.as_millis() as i64
    }
}

/// Counters for window lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct WindowMetrics {
    restatements: u64,
    closed_windows: u64,
    expired_windows: u64,
    early_emits: u64,
}

impl WindowMetrics {
    /// Records forwarded as restatements.
    #[must_use]
    pub fn restatements(&self) -> u64 {
        self.restatements
    }

    /// Close timers fired.
    #[must_use]
    pub fn closed_windows(&self) -> u64 {
        self.closed_windows
    }

    /// Expire timers fired.
    #[must_use]
    pub fn expired_windows(&self) -> u64 {
        self.expired_windows
    }

    /// Open-window snapshots emitted at commit boundaries.
    #[must_use]
    pub fn early_emits(&self) -> u64 {
        self.early_emits
    }
}

/// Flush listener accumulating flushed entries for commit-time emission.
#[derive(Clone, Default)]
struct PendingEmits(Arc<Mutex<Vec<(Vec<u8>, Bytes)>>>);

impl PendingEmits {
    fn drain(&self) -> Vec<(Vec<u8>, Bytes)> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl FlushListener for PendingEmits {
    fn on_flushed(&mut self, key: &[u8], value: &Bytes) {
        self.0.lock().push((key.to_vec(), value.clone()));
    }
}

fn decode_acc<Acc>(bytes: &[u8]) -> Result<Acc, OperatorError>
where
    Acc: Archive,
    Acc::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<Acc, HighDeserializer<RkyvError>>,
{
    let archived = rkyv::access::<Acc::Archived, RkyvError>(bytes)
        .map_err(|e| OperatorError::SerializationFailed(e.to_string()))?;
    rkyv::deserialize::<Acc, RkyvError>(archived)
        .map_err(|e| OperatorError::SerializationFailed(e.to_string()))
}

fn decode_window_start(key: &Bytes) -> Result<i64, OperatorError> {
    let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| {
        OperatorError::InvalidKey(format!(
            "window timer key must be 8 bytes, got {}",
            key.len()
        ))
    })?;
    Ok(decode_ordered_time(bytes))
}

/// Tumbling window assignment aligned to epoch; floors correctly for
/// negative timestamps.
fn default_window_start(event_time: i64, size_ms: i64) -> i64 {
    event_time - event_time.rem_euclid(size_ms)
}

/// Fired-timer handler scoped to one watermark advance.
///
/// Borrows the transformer's state disjointly from the timer store so that
/// firing can mutate window state while the timer scan resumes.
struct CloseExpireHandler<'a, S, Acc> {
    state: &'a mut CachingStore<S>,
    window_starts: &'a mut FxHashSet<i64>,
    metrics: &'a mut WindowMetrics,
    emit_timestamp: i64,
    out: &'a mut EmitVec<Acc>,
}

impl<S, Acc> TimerHandler for CloseExpireHandler<'_, S, Acc>
where
    S: StateStore,
    Acc: Archive,
    Acc::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<Acc, HighDeserializer<RkyvError>>,
{
    fn on_timer(&mut self, _time: i64, metadata: &TimerMetadata, key: &Bytes) -> crate::Result<()> {
        let ws = decode_window_start(key)?;
        let (from, to) = window_scan_bounds(ws);
        match metadata {
            TimerMetadata::Close => {
                for (entry_key, entry_value) in self.state.range(&from, &to) {
                    let window = TimeWindowed::from_key(&entry_key)?;
                    let acc = decode_acc::<Acc>(&entry_value)?;
                    self.out.push(Emit {
                        window,
                        value: WindowedValue::closed(acc),
                        timestamp: self.emit_timestamp,
                    });
                }
                self.metrics.closed_windows += 1;
            }
            TimerMetadata::Expire => {
                self.state.delete_range_without_changelog(&from, &to)?;
                self.window_starts.remove(&ws);
                self.metrics.expired_windows += 1;
            }
            // Not registered by this operator; nothing to do
            TimerMetadata::User(_) => {}
        }
        Ok(())
    }
}

/// Tumbling-window aggregation transformer for one stream task.
///
/// Owns the caching aggregate store, the persistent timer store, and the
/// task watermark; the host drives it with records, watermarks, wall-clock
/// punctuations, and commit callbacks, and forwards the returned emissions.
pub struct WindowedAggregator<A: WindowAggregator, S, T = S> {
    cfg: WindowConfig,
    aggregator: A,
    window_start_fn: Option<WindowStartFn<A::Value>>,
    state: CachingStore<S>,
    timers: PersistentTimerStore<T>,
    watermark: WatermarkTracker,
    non_expired_window_starts: FxHashSet<i64>,
    pending_commit_emits: PendingEmits,
    metrics: WindowMetrics,
}

impl<A, S, T> WindowedAggregator<A, S, T>
where
    A: WindowAggregator,
    A::Acc: Archive + for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    <A::Acc as Archive>::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + RkyvDeserialize<A::Acc, HighDeserializer<RkyvError>>,
    S: StateStore,
    T: StateStore,
{
    /// Creates a transformer over the given aggregate and timer stores.
    #[must_use]
    pub fn new(
        cfg: WindowConfig,
        aggregator: A,
        watermark: WatermarkTracker,
        aggregate_store: S,
        timer_store: T,
    ) -> Self {
        let pending = PendingEmits::default();
        let mut state = CachingStore::new(aggregate_store);
        if cfg.emit_updated_on_commit {
            state.register_flush_listener(Box::new(pending.clone()));
        }
        let timers = PersistentTimerStore::new(timer_store, cfg.max_timer_fires_per_watermark);
        Self {
            cfg,
            aggregator,
            window_start_fn: None,
            state,
            timers,
            watermark,
            non_expired_window_starts: FxHashSet::default(),
            pending_commit_emits: pending,
            metrics: WindowMetrics::default(),
        }
    }

    /// Overrides window-start assignment.
    #[must_use]
    pub fn with_window_start_fn(mut self, f: WindowStartFn<A::Value>) -> Self {
        self.window_start_fn = Some(f);
        self
    }

    /// Attaches a changelog sink to the aggregate store.
    pub fn set_changelog_sink(&mut self, sink: Arc<dyn ChangelogSink>) {
        self.state.set_changelog_sink(sink);
    }

    /// Resets task-local state after a restart: re-seeds the timer store
    /// and rebuilds the window-start dedup set from persisted expire
    /// timers.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted timers cannot be decoded.
    pub fn on_init(&mut self) -> crate::Result<()> {
        self.timers.on_init()?;
        self.non_expired_window_starts.clear();
        let horizon = self
            .cfg
            .window_size_ms()
            .saturating_add(self.cfg.allowed_lateness_ms())
            .saturating_add(self.cfg.queryable_after_close_ms());
        for timer in self.timers.all_timers()? {
            if matches!(timer.metadata, TimerMetadata::Expire) {
                self.non_expired_window_starts
                    .insert(timer.time.saturating_sub(horizon));
            }
        }
        Ok(())
    }

    /// Processes one record.
    ///
    /// Advancing the watermark (per the tracker's policy) fires due timers
    /// first, so a record whose own window just closed is restated rather
    /// than merged.
    ///
    /// # Errors
    ///
    /// Propagates state, timer, and codec errors; all are fatal to the
    /// task.
    pub fn on_record(&mut self, record: Record<A::Value>) -> crate::Result<EmitVec<A::Acc>> {
        let mut out = EmitVec::new();
        if let Some(w) = self.watermark.observe(record.event_time) {
            self.handle_watermark(w, &mut out)?;
        }

        let watermark_ms = self.watermark.current().timestamp();
        let size_ms = self.cfg.window_size_ms();
        let ws = match &self.window_start_fn {
            Some(f) => f(record.event_time, &record.key, &record.value),
            None => default_window_start(record.event_time, size_ms),
        };
        let window = TimeWindowed::new(ws, size_ms, record.key.clone());

        let close_time = ws
            .saturating_add(size_ms)
            .saturating_add(self.cfg.allowed_lateness_ms());
        if close_time <= watermark_ms {
            // Past allowed lateness: forward this record's own contribution,
            // leave the (possibly already expired) window state alone.
            let acc =
                self.aggregator
                    .apply(&record.key, &record.value, self.aggregator.initialize());
            self.metrics.restatements += 1;
            out.push(Emit {
                window,
                value: WindowedValue::restatement(acc),
                timestamp: watermark_ms,
            });
            return Ok(out);
        }

        self.register_window_timers(ws, &mut out)?;

        let state_key = window.to_key();
        let prior = self
            .state
            .get_typed_or_else::<A::Acc>(&state_key, || self.aggregator.initialize())?;
        let next = self.aggregator.apply(&record.key, &record.value, prior);
        self.state.put_typed(&state_key, &next)?;
        Ok(out)
    }

    /// Advances the watermark from an external source.
    ///
    /// # Errors
    ///
    /// Propagates timer-firing errors.
    pub fn on_watermark(&mut self, timestamp: i64) -> crate::Result<EmitVec<A::Acc>> {
        let mut out = EmitVec::new();
        if let Some(w) = self.watermark.advance_to(timestamp) {
            self.handle_watermark(w, &mut out)?;
        }
        Ok(out)
    }

    /// Wall-clock punctuation hook for the interval watermark policy.
    ///
    /// # Errors
    ///
    /// Propagates timer-firing errors.
    pub fn on_punctuate(&mut self) -> crate::Result<EmitVec<A::Acc>> {
        let mut out = EmitVec::new();
        if let Some(w) = self.watermark.on_punctuate() {
            self.handle_watermark(w, &mut out)?;
        }
        Ok(out)
    }

    /// Commit hook: flushes the caching store and, when configured, emits
    /// `WindowOpen` snapshots of the flushed entries at the current
    /// watermark.
    ///
    /// # Errors
    ///
    /// Propagates flush and codec errors.
    pub fn on_commit(&mut self) -> crate::Result<EmitVec<A::Acc>> {
        let mut out = EmitVec::new();
        self.state.flush()?;
        let flushed = self.pending_commit_emits.drain();
        if self.cfg.emit_updated_on_commit {
            let timestamp = self.watermark.current().timestamp();
            for (key, value) in flushed {
                let window = TimeWindowed::from_key(&key)?;
                let acc = decode_acc::<A::Acc>(&value)?;
                self.metrics.early_emits += 1;
                out.push(Emit {
                    window,
                    value: WindowedValue::open(acc),
                    timestamp,
                });
            }
        }
        Ok(out)
    }

    /// Reads a window entry; available until the window expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored accumulator cannot be decoded.
    pub fn get(&self, window: &TimeWindowed) -> crate::Result<Option<A::Acc>> {
        Ok(self.state.get_typed::<A::Acc>(&window.to_key())?)
    }

    /// Window lifecycle counters.
    #[must_use]
    pub fn metrics(&self) -> &WindowMetrics {
        &self.metrics
    }

    /// The task's current watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        self.watermark.current()
    }

    /// Registers the close and expire timers on first sight of a window
    /// start.
    fn register_window_timers(
        &mut self,
        ws: i64,
        out: &mut EmitVec<A::Acc>,
    ) -> crate::Result<()> {
        if !self.non_expired_window_starts.insert(ws) {
            return Ok(());
        }
        let close_time = ws
            .saturating_add(self.cfg.window_size_ms())
            .saturating_add(self.cfg.allowed_lateness_ms());
        let expire_time = close_time.saturating_add(self.cfg.queryable_after_close_ms());
        let ws_key = Bytes::copy_from_slice(&TimeWindowed::start_prefix(ws));
        let emit_on_close = self.cfg.emit_on_close;

        let mut handler = CloseExpireHandler {
            state: &mut self.state,
            window_starts: &mut self.non_expired_window_starts,
            metrics: &mut self.metrics,
            emit_timestamp: self.watermark.current().timestamp(),
            out,
        };
        if emit_on_close {
            self.timers.add_timer(
                Timer::new(close_time, TimerMetadata::Close, ws_key.clone()),
                &mut handler,
            )?;
        }
        self.timers.add_timer(
            Timer::new(expire_time, TimerMetadata::Expire, ws_key),
            &mut handler,
        )?;
        Ok(())
    }

    /// Fires due timers for an advanced watermark.
    fn handle_watermark(&mut self, w: Watermark, out: &mut EmitVec<A::Acc>) -> crate::Result<()> {
        let mut handler = CloseExpireHandler {
            state: &mut self.state,
            window_starts: &mut self.non_expired_window_starts,
            metrics: &mut self.metrics,
            emit_timestamp: w.timestamp(),
            out,
        };
        self.timers.on_watermark(w, &mut handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStore;

    const SIZE: u64 = 60_000;
    const LATENESS: u64 = 5_000;
    const QUERYABLE: u64 = 10_000;

    type SumWindow = WindowedAggregator<SumAggregator, InMemoryStore>;

    fn build(emit_updated_on_commit: bool) -> SumWindow {
        let cfg = WindowConfig::new(Duration::from_millis(SIZE))
            .with_allowed_lateness(Duration::from_millis(LATENESS))
            .with_queryable_after_close(Duration::from_millis(QUERYABLE))
            .with_emit_updated_on_commit(emit_updated_on_commit);
        WindowedAggregator::new(
            cfg,
            SumAggregator,
            WatermarkTracker::per_record(Duration::ZERO),
            InMemoryStore::new(),
            InMemoryStore::new(),
        )
    }

    fn record(key: &str, value: i64, event_time: i64) -> Record<i64> {
        Record::new(Bytes::copy_from_slice(key.as_bytes()), value, event_time)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn window(start_ms: i64, key: &str) -> TimeWindowed {
        TimeWindowed::new(start_ms, SIZE as i64, Bytes::copy_from_slice(key.as_bytes()))
    }

    #[test]
    fn test_windowed_key_round_trip() {
        let original = window(120_000, "user-1");
        let decoded = TimeWindowed::from_key(&original.to_key()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.end_ms(), 180_000);
    }

    #[test]
    fn test_windowed_key_range_covers_exactly_one_start() {
        let (from, to) = window_scan_bounds(60_000);
        let inside = window(60_000, "any").to_key();
        let before = window(59_999, "zzz").to_key();
        let after = window(60_001, "").to_key();

        assert!(inside.as_slice() >= &from[..] && inside.as_slice() < &to[..]);
        assert!(before.as_slice() < &from[..]);
        assert!(after.as_slice() >= &to[..]);
    }

    #[test]
    fn test_default_window_start_floors_negative_times() {
        assert_eq!(default_window_start(0, 1000), 0);
        assert_eq!(default_window_start(999, 1000), 0);
        assert_eq!(default_window_start(1000, 1000), 1000);
        assert_eq!(default_window_start(-1, 1000), -1000);
        assert_eq!(default_window_start(-1000, 1000), -1000);
        assert_eq!(default_window_start(-1001, 1000), -2000);
    }

    #[test]
    fn test_close_emits_aggregate_at_watermark_time() {
        let mut agg = build(false);
        assert!(agg.on_record(record("a", 1, 1000)).unwrap().is_empty());
        assert!(agg.on_record(record("a", 2, 2000)).unwrap().is_empty());

        // Past close (65_000), before expiry (75_000)
        let out = agg.on_watermark(70_000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].window, window(0, "a"));
        assert_eq!(out[0].value, WindowedValue::closed(3));
        assert_eq!(out[0].timestamp, 70_000);
        assert_eq!(agg.metrics().closed_windows(), 1);

        // State retained for querying until expiry
        assert_eq!(agg.get(&window(0, "a")).unwrap(), Some(3));
    }

    #[test]
    fn test_expire_deletes_window_state_without_emitting() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_record(record("a", 2, 2000)).unwrap();
        agg.on_watermark(70_000).unwrap();

        let out = agg.on_watermark(90_000).unwrap();
        assert!(out.is_empty());
        assert_eq!(agg.metrics().expired_windows(), 1);
        assert_eq!(agg.get(&window(0, "a")).unwrap(), None);
        assert_eq!(agg.state.len(), 0);
    }

    #[test]
    fn test_close_and_expire_in_one_watermark_emit_then_delete() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_record(record("a", 2, 2000)).unwrap();

        let out = agg.on_watermark(80_000).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, WindowedValue::closed(3));
        assert_eq!(agg.metrics().closed_windows(), 1);
        assert_eq!(agg.metrics().expired_windows(), 1);
        assert_eq!(agg.get(&window(0, "a")).unwrap(), None);
    }

    #[test]
    fn test_late_record_is_restated_immediately() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_record(record("a", 2, 2000)).unwrap();
        agg.on_watermark(80_000).unwrap();

        let out = agg.on_record(record("a", 5, 3000)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].window, window(0, "a"));
        assert_eq!(out[0].value, WindowedValue::restatement(5));
        assert_eq!(out[0].timestamp, 80_000);
        assert_eq!(agg.metrics().restatements(), 1);
        // Restatements never touch persisted state
        assert_eq!(agg.get(&window(0, "a")).unwrap(), None);
        assert_eq!(agg.state.dirty_len(), 0);
    }

    #[test]
    fn test_record_within_allowed_lateness_still_merges() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_watermark(62_000).unwrap(); // past window end, within lateness

        let out = agg.on_record(record("a", 7, 2000)).unwrap();
        assert!(out.is_empty());
        assert_eq!(agg.get(&window(0, "a")).unwrap(), Some(8));
        assert_eq!(agg.metrics().restatements(), 0);
    }

    #[test]
    fn test_commit_emits_open_snapshots_at_watermark() {
        let mut agg = build(true);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_watermark(5000).unwrap();

        let out = agg.on_commit().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].window, window(0, "a"));
        assert_eq!(out[0].value, WindowedValue::open(1));
        assert_eq!(out[0].timestamp, 5000);
        assert_eq!(agg.metrics().early_emits(), 1);

        // Nothing dirty, so a second commit emits nothing
        assert!(agg.on_commit().unwrap().is_empty());
    }

    #[test]
    fn test_commit_emits_nothing_when_disabled() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        assert!(agg.on_commit().unwrap().is_empty());
        // But the flush itself happened
        assert_eq!(agg.state.dirty_len(), 0);
        assert_eq!(agg.state.inner().len(), 1);
    }

    #[test]
    fn test_close_emits_every_key_in_the_window() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_record(record("b", 2, 2000)).unwrap();
        agg.on_record(record("c", 3, 61_000)).unwrap(); // next window

        let out = agg.on_watermark(70_000).unwrap();
        let mut closed: Vec<(Bytes, i64)> = out
            .iter()
            .map(|e| (e.window.key.clone(), e.value.value))
            .collect();
        closed.sort();
        assert_eq!(
            closed,
            vec![
                (Bytes::from_static(b"a"), 1),
                (Bytes::from_static(b"b"), 2),
            ]
        );
        // Window starting at 60_000 is untouched
        assert_eq!(agg.get(&window(60_000, "c")).unwrap(), Some(3));
    }

    #[test]
    fn test_timers_registered_once_per_window_start() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();
        agg.on_record(record("b", 2, 2000)).unwrap();
        // One Close + one Expire for the shared window start
        assert_eq!(agg.timers.pending_timers(), 2);

        agg.on_record(record("a", 1, 61_000)).unwrap();
        assert_eq!(agg.timers.pending_timers(), 4);
    }

    #[test]
    fn test_expire_timer_always_registered_close_timer_optional() {
        let cfg = WindowConfig::new(Duration::from_millis(SIZE)).with_emit_on_close(false);
        let mut agg: SumWindow = WindowedAggregator::new(
            cfg,
            SumAggregator,
            WatermarkTracker::per_record(Duration::ZERO),
            InMemoryStore::new(),
            InMemoryStore::new(),
        );
        agg.on_record(record("a", 1, 1000)).unwrap();

        let timers = agg.timers.all_timers().unwrap();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].metadata, TimerMetadata::Expire);

        // No close emission; expiry still cleans up
        let out = agg.on_watermark(100_000).unwrap();
        assert!(out.is_empty());
        assert_eq!(agg.get(&window(0, "a")).unwrap(), None);
    }

    #[test]
    fn test_record_advancing_watermark_past_own_close_gets_restated_next() {
        let mut agg = build(false);
        agg.on_record(record("a", 1, 1000)).unwrap();

        // This record advances the watermark past the first window's close
        // and expiry before it is itself processed.
        let out = agg.on_record(record("b", 9, 80_000)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, WindowedValue::closed(1));

        let out = agg.on_record(record("a", 5, 2000)).unwrap();
        assert_eq!(out[0].value, WindowedValue::restatement(5));
    }

    #[test]
    fn test_close_fires_before_expire_at_same_timer_time() {
        // Custom starts so that w1's close and w2's expiry land on the same
        // timer time; time-major order fires w2's close, then w1's close,
        // then w2's expiry.
        let cfg = WindowConfig::new(Duration::from_millis(SIZE))
            .with_allowed_lateness(Duration::from_millis(LATENESS))
            .with_queryable_after_close(Duration::from_millis(QUERYABLE));
        let mut agg: SumWindow = WindowedAggregator::new(
            cfg,
            SumAggregator,
            WatermarkTracker::per_record(Duration::ZERO),
            InMemoryStore::new(),
            InMemoryStore::new(),
        )
        .with_window_start_fn(Box::new(|_, key, _| {
            if key == b"w1" {
                60_000
            } else {
                50_000
            }
        }));

        agg.on_record(record("w1", 1, 61_000)).unwrap();
        agg.on_record(record("w2", 2, 51_000)).unwrap();

        // w2 close at 115_000; w1 close and w2 expiry both at 125_000
        let out = agg.on_watermark(125_000).unwrap();
        let states: Vec<(i64, ResultState)> = out
            .iter()
            .map(|e| (e.window.start_ms, e.value.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (50_000, ResultState::WindowClosed),
                (60_000, ResultState::WindowClosed),
            ]
        );
        // w2 expired in the same pass, after its close emitted
        assert_eq!(agg.get(&window(50_000, "w2")).unwrap(), None);
        assert_eq!(agg.get(&window(60_000, "w1")).unwrap(), Some(1));
    }

    #[test]
    fn test_on_init_rebuilds_window_start_set_from_expire_timers() {
        // Simulate a restart: the timer store was restored from the
        // changelog with one live expiry timer for window start 0.
        let mut timer_backing = InMemoryStore::new();
        #[allow(clippy::cast_possible_wrap)]
        let expire_time = (SIZE + LATENESS + QUERYABLE) as i64;
        let persisted = Timer::new(
            expire_time,
            TimerMetadata::Expire,
            Bytes::copy_from_slice(&TimeWindowed::start_prefix(0)),
        );
        timer_backing.put(&persisted.encode(), &[]).unwrap();

        let cfg = WindowConfig::new(Duration::from_millis(SIZE))
            .with_allowed_lateness(Duration::from_millis(LATENESS))
            .with_queryable_after_close(Duration::from_millis(QUERYABLE));
        let mut agg: WindowedAggregator<SumAggregator, InMemoryStore, InMemoryStore> =
            WindowedAggregator::new(
                cfg,
                SumAggregator,
                WatermarkTracker::per_record(Duration::ZERO),
                InMemoryStore::new(),
                timer_backing,
            );
        agg.on_init().unwrap();
        assert!(agg.non_expired_window_starts.contains(&0));

        // A record for the restored window must not re-register timers
        agg.on_record(record("a", 1, 1000)).unwrap();
        assert_eq!(agg.timers.pending_timers(), 1);
    }

    #[test]
    fn test_interval_policy_closes_windows_on_punctuation() {
        let cfg = WindowConfig::new(Duration::from_millis(SIZE));
        let mut agg: SumWindow = WindowedAggregator::new(
            cfg,
            SumAggregator,
            WatermarkTracker::at_interval(Duration::ZERO, Duration::from_secs(1)),
            InMemoryStore::new(),
            InMemoryStore::new(),
        );

        agg.on_record(record("a", 4, 1000)).unwrap();
        agg.on_record(record("a", 6, 70_000)).unwrap();
        // Watermark has not advanced between punctuations, so this still merges
        assert!(agg.on_record(record("a", 1, 2000)).unwrap().is_empty());
        assert_eq!(agg.current_watermark().timestamp(), 0);

        let out = agg.on_punctuate().unwrap();
        assert_eq!(agg.current_watermark().timestamp(), 70_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, WindowedValue::closed(5));
        // Second window is still open
        assert_eq!(agg.get(&window(60_000, "a")).unwrap(), Some(6));
    }

    #[test]
    fn test_count_aggregator() {
        let cfg = WindowConfig::new(Duration::from_millis(1000));
        let mut agg: WindowedAggregator<CountAggregator, InMemoryStore> = WindowedAggregator::new(
            cfg,
            CountAggregator,
            WatermarkTracker::per_record(Duration::ZERO),
            InMemoryStore::new(),
            InMemoryStore::new(),
        );
        for t in [10, 20, 30] {
            agg.on_record(Record::new(
                Bytes::from_static(b"k"),
                Bytes::from_static(b"payload"),
                t,
            ))
            .unwrap();
        }
        let out = agg.on_watermark(2000).unwrap();
        assert_eq!(out[0].value, WindowedValue::closed(3));
    }
}
