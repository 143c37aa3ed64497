//! # State Store Module
//!
//! Ordered key-value storage for windowed aggregation state and persisted
//! timers.
//!
//! ## Design
//!
//! - **Byte-ordered keys**: all scans are lexicographic over the raw key
//!   bytes. Window and timer codecs lay out their keys so that the byte
//!   order matches the logical order, which is what makes range scans usable
//!   as "all entries for this window start" and "all timers from this time".
//! - **Scoped iterators**: scans borrow the store, so every iterator is
//!   released on scope exit, including error paths.
//!
//! ## Backends
//!
//! - [`InMemoryStore`]: `BTreeMap`-based reference backend with O(log n + k)
//!   range scans. A production deployment would sit this trait on top of an
//!   LSM engine; the contract is the same.
//! - [`CachingStore`]: write-through cache wrapper with commit-time flush,
//!   see [`cache`].
//!
//! ## Example
//!
//! ```rust
//! use weir_core::state::{StateStore, StateStoreExt, InMemoryStore};
//!
//! let mut store = InMemoryStore::new();
//!
//! store.put(b"user:1", b"alice").unwrap();
//! assert_eq!(store.get(b"user:1").unwrap().as_ref(), b"alice");
//!
//! // Typed access (requires StateStoreExt)
//! store.put_typed(b"count", &42u64).unwrap();
//! let count: u64 = store.get_typed(b"count").unwrap().unwrap();
//! assert_eq!(count, 42);
//! ```

use bytes::Bytes;
use rkyv::{
    api::high::{HighDeserializer, HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    rancor::Error as RkyvError,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};
use std::collections::BTreeMap;
use std::ops::Bound;

pub mod cache;

pub use cache::{CachingStore, ChangelogSink, FlushListener};

/// Trait for ordered state store implementations.
///
/// This is the storage abstraction consumed by the windowed aggregator and
/// the persistent timer store. Keys and values are opaque bytes; ordering is
/// lexicographic over the key bytes.
///
/// # Thread Safety
///
/// State stores are `Send` but not `Sync`. Each stream task owns its stores
/// and accesses them from a single thread.
pub trait StateStore: Send {
    /// Get a value by key.
    ///
    /// Returns `None` if the key does not exist.
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the operation fails (e.g., I/O on a
    /// disk-backed store).
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the operation fails.
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Scan entries with `from <= key < to` in key order.
    fn range<'a>(
        &'a self,
        from: &'a [u8],
        to: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Scan entries with `key >= from` in key order, unbounded above.
    fn scan_from<'a>(&'a self, from: &'a [u8]) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a>;

    /// Scan every entry in key order.
    fn all(&self) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + '_> {
        self.scan_from(&[])
    }

    /// Delete all entries with `from <= key < to`.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the operation fails.
    fn delete_range(&mut self, from: &[u8], to: &[u8]) -> Result<(), StateError>;

    /// Check if a key exists without copying the value.
    fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries in the store.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extension trait for [`StateStore`] providing typed access methods.
///
/// These methods use generics and thus cannot be part of the dyn-compatible
/// `StateStore` trait. Types go through rkyv; derive `Archive`,
/// `rkyv::Serialize`, and `rkyv::Deserialize` on accumulator types.
pub trait StateStoreExt: StateStore {
    /// Get a value and deserialize it using rkyv.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if deserialization fails.
    fn get_typed<T>(&self, key: &[u8]) -> Result<Option<T>, StateError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
    {
        match self.get(key) {
            Some(bytes) => {
                let archived = rkyv::access::<T::Archived, RkyvError>(&bytes)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                let value = rkyv::deserialize::<T, RkyvError>(archived)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Get a value, or produce a default when the key is absent.
    ///
    /// The default is *not* written back; callers that mutate the value put
    /// it afterwards.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if deserialization fails.
    fn get_typed_or_else<T>(
        &self,
        key: &[u8],
        default: impl FnOnce() -> T,
    ) -> Result<T, StateError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
            + RkyvDeserialize<T, HighDeserializer<RkyvError>>,
    {
        Ok(self.get_typed(key)?.unwrap_or_else(default))
    }

    /// Serialize and store a value using rkyv.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Serialization` if serialization fails.
    fn put_typed<T>(&mut self, key: &[u8], value: &T) -> Result<(), StateError>
    where
        T: for<'a> RkyvSerialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let bytes = rkyv::to_bytes::<RkyvError>(value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        self.put(key, &bytes)
    }
}

// Blanket implementation for all StateStore types
impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// In-memory state store using `BTreeMap` for sorted key access.
///
/// The reference backend for tests and single-process deployments. Range
/// scans are O(log n + k); deletions are physical (no tombstones), unlike an
/// LSM backend, which is why the timer store never assumes scans are free of
/// deleted prefixes.
pub struct InMemoryStore {
    data: BTreeMap<Vec<u8>, Bytes>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for InMemoryStore {
    #[inline]
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    #[inline]
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.data
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.data.remove(key);
        Ok(())
    }

    fn range<'a>(
        &'a self,
        from: &'a [u8],
        to: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    fn scan_from<'a>(&'a self, from: &'a [u8]) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        Box::new(
            self.data
                .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
                .map(|(k, v)| (Bytes::copy_from_slice(k), v.clone())),
        )
    }

    fn delete_range(&mut self, from: &[u8], to: &[u8]) -> Result<(), StateError> {
        let doomed: Vec<Vec<u8>> = self
            .data
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.data.remove(&key);
        }
        Ok(())
    }

    #[inline]
    fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Errors that can occur in state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// I/O error from a disk-backed store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_basic() {
        let mut store = InMemoryStore::new();

        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Bytes::from("value1"));
        assert_eq!(store.len(), 1);

        store.put(b"key1", b"value2").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Bytes::from("value2"));
        assert_eq!(store.len(), 1);

        store.delete(b"key1").unwrap();
        assert!(store.get(b"key1").is_none());
        assert_eq!(store.len(), 0);

        // Deleting a missing key is not an error
        store.delete(b"nonexistent").unwrap();
    }

    #[test]
    fn test_contains() {
        let mut store = InMemoryStore::new();
        assert!(!store.contains(b"key1"));

        store.put(b"key1", b"value1").unwrap();
        assert!(store.contains(b"key1"));

        store.delete(b"key1").unwrap();
        assert!(!store.contains(b"key1"));
    }

    #[test]
    fn test_range_scan_bounds() {
        let mut store = InMemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.put(b"c", b"3").unwrap();
        store.put(b"d", b"4").unwrap();

        let keys: Vec<_> = store
            .range(b"b", b"d")
            .map(|(k, _)| k.as_ref().to_vec())
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_scan_from_is_unbounded() {
        let mut store = InMemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.put(b"m", b"2").unwrap();
        store.put(b"z", b"3").unwrap();

        let keys: Vec<_> = store
            .scan_from(b"m")
            .map(|(k, _)| k.as_ref().to_vec())
            .collect();
        assert_eq!(keys, vec![b"m".to_vec(), b"z".to_vec()]);

        assert_eq!(store.all().count(), 3);
    }

    #[test]
    fn test_scan_returns_sorted() {
        let mut store = InMemoryStore::new();
        store.put(b"c", b"3").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();

        let keys: Vec<_> = store.all().map(|(k, _)| k.as_ref().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_delete_range() {
        let mut store = InMemoryStore::new();
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            store.put(key, b"x").unwrap();
        }

        store.delete_range(b"b", b"d").unwrap();

        assert!(store.contains(b"a"));
        assert!(!store.contains(b"b"));
        assert!(!store.contains(b"c"));
        assert!(store.contains(b"d"));
    }

    #[test]
    fn test_typed_access() {
        let mut store = InMemoryStore::new();

        store.put_typed(b"count", &42u64).unwrap();
        let count: u64 = store.get_typed(b"count").unwrap().unwrap();
        assert_eq!(count, 42);

        store.put_typed(b"name", &String::from("alice")).unwrap();
        let name: String = store.get_typed(b"name").unwrap().unwrap();
        assert_eq!(name, "alice");

        let missing: Option<u64> = store.get_typed(b"missing").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_typed_or_else_does_not_insert() {
        let store = InMemoryStore::new();

        let value: u64 = store.get_typed_or_else(b"counter", || 7).unwrap();
        assert_eq!(value, 7);
        assert!(store.is_empty());
    }

    #[test]
    fn test_binary_keys_sort_bytewise() {
        let mut store = InMemoryStore::new();
        store.put(&[0x00, 0xFF], b"a").unwrap();
        store.put(&[0x01, 0x00], b"b").unwrap();
        store.put(&[0x00, 0x01], b"c").unwrap();

        let keys: Vec<_> = store.all().map(|(k, _)| k.as_ref().to_vec()).collect();
        assert_eq!(
            keys,
            vec![vec![0x00, 0x01], vec![0x00, 0xFF], vec![0x01, 0x00]]
        );
    }
}
