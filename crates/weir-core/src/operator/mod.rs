//! # Operator Module
//!
//! The windowed aggregation transformer and its collaborators.
//!
//! Records flow in as `(key, value, event_time)` triples; the transformer
//! folds them into per-window aggregates and returns emissions as
//! [`EmitVec`] batches that the host forwards downstream. Asynchronous
//! downstream work is gated by [`flush::AsyncFlushCoordinator`] at commit
//! boundaries.

use bytes::Bytes;
use smallvec::SmallVec;

pub mod flush;
pub mod window;

use window::{TimeWindowed, WindowedValue};

/// A record entering the transformer.
#[derive(Debug, Clone)]
pub struct Record<V> {
    /// Serialized record key.
    pub key: Bytes,
    /// Record value.
    pub value: V,
    /// Event time in milliseconds.
    pub event_time: i64,
}

impl<V> Record<V> {
    /// Creates a new record.
    #[must_use]
    pub fn new(key: Bytes, value: V, event_time: i64) -> Self {
        Self {
            key,
            value,
            event_time,
        }
    }
}

/// One downstream emission: a windowed key, its value with result state,
/// and the timestamp to forward it at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emit<T> {
    /// The window and key this emission belongs to.
    pub window: TimeWindowed,
    /// The emitted value and its result state.
    pub value: WindowedValue<T>,
    /// Emission timestamp (the watermark at emit time).
    pub timestamp: i64,
}

/// Collection type for transformer emissions.
///
/// Uses `SmallVec` to avoid heap allocation for common cases: most records
/// produce zero emissions, a restatement produces one, a window close
/// produces one per key in the window.
pub type EmitVec<T> = SmallVec<[Emit<T>; 4]>;

/// Errors that can occur in operators.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// State access error
    #[error("State access failed: {0}")]
    StateAccessFailed(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A stored key could not be decoded
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Processing error from user code
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}
