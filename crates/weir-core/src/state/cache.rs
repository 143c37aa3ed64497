//! Write-through caching store with commit-time flush.
//!
//! [`CachingStore`] buffers writes in front of an underlying [`StateStore`]
//! until the host's commit boundary. At flush, dirty entries are written
//! through to the inner store, mutations are recorded to an optional
//! [`ChangelogSink`], and the registered [`FlushListener`] observes each
//! flushed entry.
//!
//! Range scans merge the dirty buffer with the inner store in key order, so
//! readers always see their own uncommitted writes.
//!
//! ## Changelog bypass
//!
//! [`CachingStore::delete_range_without_changelog`] applies a range delete
//! directly to the inner store without recording per-key deletions. Window
//! expiry uses this: replaying the expiry timer reconstructs the deletion, so
//! the changelog does not need the individual keys.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::Arc;

use super::{StateError, StateStore};

/// Observer invoked once per flushed dirty entry at commit boundaries.
///
/// The value passed is the post-flush canonical value re-read from the
/// underlying store, not the buffered value. For a plain put-semantics store
/// the two are identical; for a merging store they can differ, and the
/// canonical one is what downstream consumers must see.
pub trait FlushListener: Send {
    /// Called for each flushed put, in key order, before the flush returns.
    fn on_flushed(&mut self, key: &[u8], value: &Bytes);
}

/// Sink recording state mutations for changelog replication.
///
/// Best-effort: a `false` return means the sink could not accept the record
/// (backpressure), never that the state mutation failed. The store remains
/// the source of truth.
pub trait ChangelogSink: Send + Sync {
    /// Records a put. Returns `false` if the sink is full.
    fn record_put(&self, key: &[u8], value: &[u8]) -> bool;

    /// Records a delete. Returns `false` if the sink is full.
    fn record_delete(&self, key: &[u8]) -> bool;
}

/// A buffered mutation awaiting flush.
#[derive(Debug, Clone)]
enum CacheEntry {
    Put(Bytes),
    Tombstone,
}

/// Write-through cache in front of an ordered state store.
///
/// Reads see the cache first; writes buffer until [`CachingStore::flush`].
/// Scans merge cache and inner store in key order with the cache winning on
/// key collisions and tombstones hiding inner entries.
pub struct CachingStore<S> {
    inner: S,
    dirty: BTreeMap<Vec<u8>, CacheEntry>,
    listener: Option<Box<dyn FlushListener>>,
    changelog: Option<Arc<dyn ChangelogSink>>,
}

impl<S: StateStore> CachingStore<S> {
    /// Creates a caching store over the given inner store.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            dirty: BTreeMap::new(),
            listener: None,
            changelog: None,
        }
    }

    /// Registers the flush observer. A second registration replaces the
    /// first; there is exactly one observer.
    pub fn register_flush_listener(&mut self, listener: Box<dyn FlushListener>) {
        self.listener = Some(listener);
    }

    /// Attaches a changelog sink that records flushed mutations.
    pub fn set_changelog_sink(&mut self, sink: Arc<dyn ChangelogSink>) {
        self.changelog = Some(sink);
    }

    /// Returns a reference to the inner state store.
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of buffered (unflushed) mutations.
    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Buffers a deletion without reading back the prior value.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the operation fails.
    pub fn delete_without_prior_value(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.dirty.insert(key.to_vec(), CacheEntry::Tombstone);
        Ok(())
    }

    /// Deletes `from <= key < to` directly on the inner store, bypassing the
    /// changelog sink, and drops any buffered entries in the range.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the inner delete fails.
    pub fn delete_range_without_changelog(
        &mut self,
        from: &[u8],
        to: &[u8],
    ) -> Result<(), StateError> {
        self.inner.delete_range(from, to)?;
        let buffered: Vec<Vec<u8>> = self
            .dirty
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in buffered {
            self.dirty.remove(&key);
        }
        Ok(())
    }

    /// Flushes all buffered mutations to the inner store.
    ///
    /// Puts and deletes are written through and recorded to the changelog
    /// sink. The flush listener then observes each flushed put with the
    /// canonical value re-read from the inner store, in key order. Returns
    /// the number of mutations flushed.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if a write to the inner store fails; buffered
    /// entries are retained in that case.
    pub fn flush(&mut self) -> Result<usize, StateError> {
        for (key, entry) in &self.dirty {
            match entry {
                CacheEntry::Put(value) => {
                    self.inner.put(key, value)?;
                    if let Some(changelog) = &self.changelog {
                        let _ = changelog.record_put(key, value);
                    }
                }
                CacheEntry::Tombstone => {
                    self.inner.delete(key)?;
                    if let Some(changelog) = &self.changelog {
                        let _ = changelog.record_delete(key);
                    }
                }
            }
        }

        let flushed = self.dirty.len();

        if let Some(mut listener) = self.listener.take() {
            for (key, entry) in &self.dirty {
                if matches!(entry, CacheEntry::Put(_)) {
                    if let Some(canonical) = self.inner.get(key) {
                        listener.on_flushed(key, &canonical);
                    }
                }
            }
            self.listener = Some(listener);
        }

        self.dirty.clear();
        Ok(flushed)
    }
}

impl<S: StateStore> StateStore for CachingStore<S> {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        match self.dirty.get(key) {
            Some(CacheEntry::Put(value)) => Some(value.clone()),
            Some(CacheEntry::Tombstone) => None,
            None => self.inner.get(key),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        self.dirty
            .insert(key.to_vec(), CacheEntry::Put(Bytes::copy_from_slice(value)));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        self.delete_without_prior_value(key)
    }

    fn range<'a>(
        &'a self,
        from: &'a [u8],
        to: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        let cache = self
            .dirty
            .range::<[u8], _>((Bound::Included(from), Bound::Excluded(to)));
        Box::new(MergeScan::new(self.inner.range(from, to), cache))
    }

    fn scan_from<'a>(&'a self, from: &'a [u8]) -> Box<dyn Iterator<Item = (Bytes, Bytes)> + 'a> {
        let cache = self
            .dirty
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded));
        Box::new(MergeScan::new(self.inner.scan_from(from), cache))
    }

    fn delete_range(&mut self, from: &[u8], to: &[u8]) -> Result<(), StateError> {
        let doomed: Vec<Vec<u8>> = self
            .range(from, to)
            .map(|(k, _)| k.as_ref().to_vec())
            .collect();
        for key in doomed {
            self.dirty.insert(key, CacheEntry::Tombstone);
        }
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> bool {
        match self.dirty.get(key) {
            Some(CacheEntry::Put(_)) => true,
            Some(CacheEntry::Tombstone) => false,
            None => self.inner.contains(key),
        }
    }

    fn len(&self) -> usize {
        let mut len = self.inner.len();
        for (key, entry) in &self.dirty {
            match entry {
                CacheEntry::Put(_) if !self.inner.contains(key) => len += 1,
                CacheEntry::Tombstone if self.inner.contains(key) => len -= 1,
                _ => {}
            }
        }
        len
    }
}

/// Two-way merge of an inner-store scan and the dirty buffer.
///
/// Cache entries win on key collision; tombstones suppress inner entries.
struct MergeScan<'a, I, C>
where
    I: Iterator<Item = (Bytes, Bytes)>,
    C: Iterator<Item = (&'a Vec<u8>, &'a CacheEntry)>,
{
    inner: Peekable<I>,
    cache: Peekable<C>,
}

impl<'a, I, C> MergeScan<'a, I, C>
where
    I: Iterator<Item = (Bytes, Bytes)>,
    C: Iterator<Item = (&'a Vec<u8>, &'a CacheEntry)>,
{
    fn new(inner: I, cache: C) -> Self {
        Self {
            inner: inner.peekable(),
            cache: cache.peekable(),
        }
    }
}

impl<'a, I, C> Iterator for MergeScan<'a, I, C>
where
    I: Iterator<Item = (Bytes, Bytes)>,
    C: Iterator<Item = (&'a Vec<u8>, &'a CacheEntry)>,
{
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let side = match (self.inner.peek(), self.cache.peek()) {
                (None, None) => return None,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some((ik, _)), Some((ck, _))) => ik.as_ref().cmp(ck.as_slice()),
            };
            match side {
                std::cmp::Ordering::Less => return self.inner.next(),
                std::cmp::Ordering::Equal => {
                    // Cache shadows the inner entry
                    self.inner.next();
                    let (key, entry) = self.cache.next()?;
                    match entry {
                        CacheEntry::Put(value) => {
                            return Some((Bytes::copy_from_slice(key), value.clone()))
                        }
                        CacheEntry::Tombstone => {}
                    }
                }
                std::cmp::Ordering::Greater => {
                    let (key, entry) = self.cache.next()?;
                    match entry {
                        CacheEntry::Put(value) => {
                            return Some((Bytes::copy_from_slice(key), value.clone()))
                        }
                        CacheEntry::Tombstone => {}
                    }
                }
            }
        }
    }
}
