//! # weir-core
//!
//! Event-time stream-processing core: tumbling-window aggregation over a
//! persistent, watermark-driven timer store.
//!
//! This crate provides:
//! - **State**: ordered key-value stores with a write-through caching layer
//!   that flushes at commit boundaries
//! - **Time**: watermark tracking and persisted event-time timers with
//!   bounded, watermark-driven firing
//! - **Operator**: the windowed aggregation transformer (allowed lateness,
//!   late-data restatement, deferred close, post-close queryability) and a
//!   coordinator for bounded async downstream work
//!
//! ## Design Principles
//!
//! 1. **Single-threaded per task** - each stream task owns its stores,
//!    watermark, and timers; no cross-task shared mutable state
//! 2. **The store is the queue** - timers persist in an ordered store under
//!    a time-major encoding, so firing order is scan order and restarts
//!    recover from the changelog
//! 3. **No error is swallowed** - store, codec, and callback errors all
//!    propagate; the host restarts the task
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use bytes::Bytes;
//! use weir_core::operator::window::{SumAggregator, WindowConfig, WindowedAggregator};
//! use weir_core::operator::Record;
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
//! agg.on_record(Record::new(Bytes::from_static(b"k"), 2, 1_000))?;
//! let emits = agg.on_watermark(120_000)?;
//! assert_eq!(emits[0].value.value, 2);
//! # Ok::<(), weir_core::Error>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod operator;
pub mod state;
pub mod time;

/// Result type for weir-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for weir-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// State store errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Time and timer errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] operator::OperatorError),

    /// Async flush coordination errors
    #[error("Flush error: {0}")]
    Flush(#[from] operator::flush::FlushError),
}
