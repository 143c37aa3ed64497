//! Event-time timers and their order-preserving byte codec.
//!
//! A persisted timer key is laid out time-major so that a lexicographic scan
//! of the timer store visits timers in firing order:
//!
//! ```text
//! time (8 bytes, big-endian, sign bit flipped)
//! metadata tag (1 byte): 0 = Close, 1 = Expire, 2 = User
//! [payload length (2 bytes, big-endian) || payload]   -- User only
//! key (remaining bytes)
//! ```
//!
//! Flipping the sign bit makes the unsigned byte order of the 8-byte prefix
//! match signed `i64` order, so pre-epoch timestamps sort before positive
//! ones. [`time_prefix`] exposes the 8-byte prefix bounding all timers at a
//! given time, which is what lets the timer store seek past tombstoned
//! prefixes instead of scanning from the beginning.

use bytes::Bytes;
use smallvec::SmallVec;
use std::cmp::Ordering;

use super::TimeError;

/// Encoded timer key. Sized to keep short keys inline.
pub type TimerKey = SmallVec<[u8; 24]>;

const SIGN_BIT: u64 = 1 << 63;
const TAG_CLOSE: u8 = 0;
const TAG_EXPIRE: u8 = 1;
const TAG_USER: u8 = 2;

/// Flips the sign bit so unsigned byte comparison matches signed order.
#[inline]
#[allow(clippy::cast_sign_loss)]
pub(crate) fn encode_ordered_time(time: i64) -> [u8; 8] {
    ((time as u64) ^ SIGN_BIT).to_be_bytes()
}

/// Inverse of [`encode_ordered_time`].
#[inline]
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn decode_ordered_time(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64
}

/// Returns the shortest key prefix bounding all timers at exactly `time`.
///
/// A scan starting at this prefix sees no timer earlier than `time`.
#[inline]
#[must_use]
pub fn time_prefix(time: i64) -> [u8; 8] {
    encode_ordered_time(time)
}

/// What a timer means when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerMetadata {
    /// Emit all entries of the window as closed; state is retained.
    Close,
    /// Range-delete the window's entries from the state store.
    Expire,
    /// Opaque user-defined timer payload.
    User(Bytes),
}

impl TimerMetadata {
    fn tag(&self) -> u8 {
        match self {
            Self::Close => TAG_CLOSE,
            Self::Expire => TAG_EXPIRE,
            Self::User(_) => TAG_USER,
        }
    }
}

impl Ord for TimerMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        // Matches the encoded byte order: tag, then for user payloads the
        // length prefix, then the payload bytes.
        match (self, other) {
            (Self::User(a), Self::User(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl PartialOrd for TimerMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A one-shot event-time timer.
///
/// Timers order by `(time, metadata, key)`; the byte codec preserves this
/// order, which is the invariant the timer store's range scans rely on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timer {
    /// Event time at which the timer fires, in milliseconds.
    pub time: i64,
    /// What firing this timer means.
    pub metadata: TimerMetadata,
    /// Key the timer is scoped to (e.g., an encoded window start).
    pub key: Bytes,
}

impl Timer {
    /// Creates a new timer.
    #[must_use]
    pub fn new(time: i64, metadata: TimerMetadata, key: Bytes) -> Self {
        Self {
            time,
            metadata,
            key,
        }
    }

    /// Encodes this timer into its store key.
    #[must_use]
    pub fn encode(&self) -> TimerKey {
        let mut out = TimerKey::new();
        out.extend_from_slice(&encode_ordered_time(self.time));
        out.push(self.metadata.tag());
        if let TimerMetadata::User(payload) = &self.metadata {
            debug_assert!(payload.len() <= usize::from(u16::MAX));
            #[allow(clippy::cast_possible_truncation)]
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(payload);
        }
        out.extend_from_slice(&self.key);
        out
    }

    /// Decodes a timer from its store key.
    ///
    /// # Errors
    ///
    /// Returns `TimeError::InvalidTimerKey` if the bytes are not a valid
    /// timer encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, TimeError> {
        if bytes.len() < 9 {
            return Err(TimeError::InvalidTimerKey(format!(
                "expected at least 9 bytes, got {}",
                bytes.len()
            )));
        }
        let mut time_bytes = [0u8; 8];
        time_bytes.copy_from_slice(&bytes[..8]);
        let time = decode_ordered_time(time_bytes);

        let (metadata, key_offset) = match bytes[8] {
            TAG_CLOSE => (TimerMetadata::Close, 9),
            TAG_EXPIRE => (TimerMetadata::Expire, 9),
            TAG_USER => {
                if bytes.len() < 11 {
                    return Err(TimeError::InvalidTimerKey(
                        "user timer missing payload length".to_string(),
                    ));
                }
                let len = usize::from(u16::from_be_bytes([bytes[9], bytes[10]]));
                if bytes.len() < 11 + len {
                    return Err(TimeError::InvalidTimerKey(format!(
                        "user timer payload truncated: want {len} bytes"
                    )));
                }
                (
                    TimerMetadata::User(Bytes::copy_from_slice(&bytes[11..11 + len])),
                    11 + len,
                )
            }
            tag => {
                return Err(TimeError::InvalidTimerKey(format!(
                    "unknown metadata tag {tag}"
                )))
            }
        };

        Ok(Self {
            time,
            metadata,
            key: Bytes::copy_from_slice(&bytes[key_offset..]),
        })
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.metadata.cmp(&other.metadata))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
