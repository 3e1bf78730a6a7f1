#[macro_use]
extern crate log;
#[macro_use]
extern crate crunchy;
extern crate byteorder;
extern crate fnv;
#[cfg(unix)]
extern crate libc;

pub mod error;
pub mod hasher;
pub mod key;
mod alloc;
mod store;
mod table;

pub use crate::alloc::{AllocStrategy, MAX_ARENA_CAPACITY};
pub use crate::error::{AbortHandler, Error, ErrorHandler, PanicHandler, Result};
pub use crate::key::{Key, KeyBytes, KeyKind};
pub use crate::table::MAX_CAPACITY;

use std::cmp::max;
use std::fmt::{self, Debug};
use std::iter::{FromIterator, FusedIterator};
use std::marker::PhantomData;
use std::mem;
use std::ops::Index;
use std::sync::Arc;

use crate::hasher::{generate_seed, hash_bytes, hash_fixed};
use crate::key::pack_fixed;
use crate::store::{FreeList, ValueStore};
use crate::table::{DataIndices, IndexTable, Probe};

const MIN_CAPACITY: usize = 64;

/// Keeps the index table at most half full and purges tombstones before
/// they crowd out the empty slots that end every probe.
#[derive(Clone)]
struct GrowthPolicy;

impl GrowthPolicy {
    #[inline]
    fn new() -> GrowthPolicy {
        GrowthPolicy
    }

    /// A map's "capacity" is the number of values it can hold without
    /// growing. Its "raw capacity" is the number of index slots required to
    /// provide that capacity at a load factor of 1/2. The raw capacity is
    /// always zero or a power of two.
    #[inline]
    fn try_raw_capacity(&self, len: usize) -> Result<usize> {
        max(len, MIN_CAPACITY)
            .checked_mul(2)
            .and_then(|l| l.checked_next_power_of_two())
            .ok_or(Error::CapacityExceeded {
                requested: len,
                limit: MAX_CAPACITY,
            })
    }

    /// The capacity of the given raw capacity. The value store is always
    /// allocated to exactly this many values.
    #[inline]
    fn capacity(&self, raw_cap: usize) -> usize {
        raw_cap / 2
    }

    /// Occupied plus deleted slots may fill up to 3/4 of the table; past that
    /// the table is rebuilt at the same size.
    #[inline]
    fn must_purge(&self, len: usize, tombstones: usize, raw_cap: usize) -> bool {
        (len + tombstones).saturating_mul(4) > raw_cap.saturating_mul(3)
    }
}

/// Per-map settings, consumed by [`DMap::with_config`].
///
/// ```
/// use dmap::{AllocStrategy, Config, DMap, PanicHandler};
///
/// let config = Config::default()
///     .initial_capacity(1024)
///     .strategy(AllocStrategy::Virtual)
///     .max_bytes(64 << 20)
///     .error_handler(PanicHandler);
/// let mut map: DMap<u64, u32> = DMap::with_config(config);
/// map.insert(&1, 1);
/// assert!(map.capacity() >= 1024);
/// ```
#[derive(Clone)]
pub struct Config {
    initial_capacity: usize,
    key_kind: Option<KeyKind>,
    strategy: AllocStrategy,
    max_bytes: usize,
    seed: Option<u64>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            initial_capacity: MIN_CAPACITY,
            key_kind: None,
            strategy: AllocStrategy::Heap,
            max_bytes: MAX_ARENA_CAPACITY,
            seed: None,
            error_handler: Arc::new(AbortHandler),
        }
    }
}

impl Config {
    /// Values to allocate room for on the first insert. Never less than 64.
    pub fn initial_capacity(mut self, capacity: usize) -> Config {
        self.initial_capacity = capacity;
        self
    }

    /// Binds the map to a key kind up front instead of on the first insert.
    pub fn key_kind(mut self, kind: KeyKind) -> Config {
        self.key_kind = Some(kind);
        self
    }

    pub fn strategy(mut self, strategy: AllocStrategy) -> Config {
        self.strategy = strategy;
        self
    }

    /// Upper bound for the value store in bytes. With
    /// [`AllocStrategy::Virtual`] this is also the address space reserved.
    pub fn max_bytes(mut self, bytes: usize) -> Config {
        self.max_bytes = bytes;
        self
    }

    /// Fixes the hash seed. By default every map draws a fresh one.
    pub fn seed(mut self, seed: u64) -> Config {
        self.seed = Some(seed);
        self
    }

    /// Handler for errors raised by the infallible operations. Pass an
    /// `Arc<dyn ErrorHandler>` to share one handler between maps.
    pub fn error_handler<H: ErrorHandler + 'static>(mut self, handler: H) -> Config {
        self.error_handler = Arc::new(handler);
        self
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("initial_capacity", &self.initial_capacity)
            .field("key_kind", &self.key_kind)
            .field("strategy", &self.strategy)
            .field("max_bytes", &self.max_bytes)
            .field("seed", &self.seed)
            .finish()
    }
}

struct Header {
    seed: u64,
    key_kind: Option<KeyKind>,
}

// A dmap splits every entry in two:
//
//   - the index table maps a key to a data index. Its slots hold the key's
//     hash, a tag to confirm the match and the data index. Only the table is
//     rebuilt when the map grows.
//
//   - the value store holds the values, densely, at their data index. It
//     grows in place (realloc) or not at all (reserve/commit), so a value
//     keeps its data index for as long as its key stays in the map.
//
// Deleting a key leaves a tombstone in the table and pushes the data index
// onto the free list. The stale value stays in the store until an insert
// reuses the index, the map is cleared, or the map is dropped.
//
// Variable-length keys are never stored. Two keys are considered equal when
// both their hash and a second hash seeded with the first agree, so a false
// match needs a 128-bit collision.

/// An index-stable hash map.
///
/// ```
/// use dmap::DMap;
///
/// let mut map: DMap<u32, &str> = DMap::new();
/// let idx = map.insert(&7, "seven");
/// assert_eq!(map.get(&7), Some(&"seven"));
/// assert_eq!(map.value_at(idx), Some(&"seven"));
/// assert_eq!(map.delete(&7), Some(idx));
/// assert_eq!(map.get(&7), None);
/// ```
pub struct DMap<K: ?Sized, V> {
    hdr: Header,
    table: IndexTable,
    store: ValueStore<V>,
    free_list: FreeList,
    resize_policy: GrowthPolicy,
    config: Config,
    marker: PhantomData<fn(&K)>,
}

impl<K: Key + ?Sized, V> DMap<K, V> {
    /// Creates an empty map. Nothing is allocated before the first insert.
    pub fn new() -> DMap<K, V> {
        DMap::with_config(Config::default())
    }

    pub fn with_capacity(capacity: usize) -> DMap<K, V> {
        DMap::with_config(Config::default().initial_capacity(capacity))
    }

    /// Creates an empty map, routing an invalid config to its error handler.
    pub fn with_config(config: Config) -> DMap<K, V> {
        let handler = config.error_handler.clone();
        match DMap::try_with_config(config) {
            Ok(map) => map,
            Err(err) => handler.handle(err),
        }
    }

    pub fn try_with_config(config: Config) -> Result<DMap<K, V>> {
        if let Some(KeyKind::Fixed(width)) = config.key_kind {
            if !KeyKind::Fixed(width).is_valid() {
                return Err(Error::UnsupportedKeyWidth { width });
            }
        }
        let seed = config.seed.unwrap_or_else(generate_seed);
        Ok(DMap {
            hdr: Header {
                seed,
                key_kind: config.key_kind,
            },
            table: IndexTable::empty(),
            store: ValueStore::new(config.strategy, config.max_bytes),
            free_list: FreeList::new(),
            resize_policy: GrowthPolicy::new(),
            config,
            marker: PhantomData,
        })
    }

    /// Number of live entries.
    #[inline]
    pub fn count(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Values the map holds before it has to grow.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Slots in the index table.
    #[inline]
    pub fn index_capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Upper bound (exclusive) of the data indices handed out so far: live
    /// entries plus released indices waiting for reuse.
    #[inline]
    pub fn iteration_range(&self) -> usize {
        let range = self.table.len() + self.free_list.len();
        debug_assert_eq!(range, self.store.len());
        range
    }

    /// All values below [`iteration_range`](#method.iteration_range),
    /// including the stale values of deleted entries.
    #[inline]
    pub fn raw_values(&self) -> &[V] {
        self.store.as_slice()
    }

    /// The value stored at `index`, live or stale.
    #[inline]
    pub fn value_at(&self, index: usize) -> Option<&V> {
        self.store.get(index)
    }

    /// Iterates over the live values, in index table order.
    pub fn values(&self) -> Values<'_, V> {
        Values {
            indices: self.table.data_indices(),
            values: self.store.as_slice(),
        }
    }

    /// The key kind the map is bound to, once known.
    pub fn key_kind(&self) -> Option<KeyKind> {
        self.hdr.key_kind
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.hdr.seed
    }

    /// The backend holding the values. Differs from the configured one
    /// after a fallback to the heap.
    pub fn strategy(&self) -> AllocStrategy {
        self.store.strategy().unwrap_or(self.config.strategy)
    }

    /// `true` when `raw_values().as_ptr()` survives growth.
    pub fn has_stable_addresses(&self) -> bool {
        self.strategy() == AllocStrategy::Virtual
    }

    /// Inserts `value` under `key`, overwriting (and dropping) a previous
    /// value. Returns the data index, which does not change while the key
    /// stays in the map.
    pub fn insert(&mut self, key: &K, value: V) -> usize {
        match self.try_insert(key, value) {
            Ok(idx) => idx,
            Err(err) => self.fatal(err),
        }
    }

    pub fn try_insert(&mut self, key: &K, value: V) -> Result<usize> {
        let encoded = key.encode();
        let bytes = encoded.as_slice();
        let kind = self.bind_key_kind(bytes.len())?;
        self.try_fit(1)?;
        let (hash, tag) = self.hash_key(kind, bytes);
        match self.table.probe(hash, tag) {
            Probe::Found(idx) => {
                self.store.replace(idx, value);
                Ok(idx)
            }
            Probe::Vacant(slot) => {
                let idx = place(&mut self.free_list, &mut self.store, value)?;
                self.table.fill(slot, hash, tag, idx);
                Ok(idx)
            }
        }
    }

    /// Returns the value of `key`, inserting the result of `constructor`
    /// first if the key is missing.
    pub fn get_or_insert_with<F>(&mut self, key: &K, constructor: F) -> (usize, &mut V)
    where
        F: FnOnce() -> V,
    {
        let handler = self.config.error_handler.clone();
        match self.try_get_or_insert_with(key, constructor) {
            Ok(entry) => entry,
            Err(err) => handler.handle(err),
        }
    }

    pub fn try_get_or_insert_with<F>(&mut self, key: &K, constructor: F) -> Result<(usize, &mut V)>
    where
        F: FnOnce() -> V,
    {
        let encoded = key.encode();
        let bytes = encoded.as_slice();
        let kind = self.bind_key_kind(bytes.len())?;
        self.try_fit(1)?;
        let (hash, tag) = self.hash_key(kind, bytes);
        let free_list = &mut self.free_list;
        let store = &mut self.store;
        let (idx, _) = self
            .table
            .insert_or_find(hash, tag, || place(free_list, store, constructor()))?;
        Ok((idx, &mut self.store.as_mut_slice()[idx]))
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(err) => self.fatal(err),
        }
    }

    pub fn try_get(&self, key: &K) -> Result<Option<&V>> {
        Ok(self.locate(key)?.and_then(|idx| self.store.get(idx)))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.locate(key) {
            Ok(Some(idx)) => self.store.get_mut(idx),
            Ok(None) => None,
            Err(err) => self.fatal(err),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get_index(key).is_some()
    }

    /// The data index of `key`, if present.
    pub fn get_index(&self, key: &K) -> Option<usize> {
        match self.locate(key) {
            Ok(idx) => idx,
            Err(err) => self.fatal(err),
        }
    }

    /// Removes `key` and returns the data index it occupied. The index is
    /// handed out again by a later insert.
    pub fn delete(&mut self, key: &K) -> Option<usize> {
        match self.try_delete(key) {
            Ok(idx) => idx,
            Err(err) => self.fatal(err),
        }
    }

    pub fn try_delete(&mut self, key: &K) -> Result<Option<usize>> {
        let kind = match self.hdr.key_kind {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let encoded = key.encode();
        let bytes = encoded.as_slice();
        check_key(kind, bytes.len())?;
        if self.table.len() == 0 {
            return Ok(None);
        }
        let (hash, tag) = self.hash_key(kind, bytes);
        let removed = self.table.remove(hash, tag);
        if let Some(idx) = removed {
            self.free_list.release(idx);
        }
        Ok(removed)
    }

    /// Makes room for at least `additional` more entries without growing.
    pub fn reserve(&mut self, additional: usize) {
        if let Err(err) = self.try_reserve(additional) {
            self.fatal(err)
        }
    }

    pub fn try_reserve(&mut self, additional: usize) -> Result<()> {
        self.try_fit(additional)
    }

    /// Removes every entry and drops all values, live and stale. The
    /// allocations, the key kind and the seed are kept.
    pub fn clear(&mut self) {
        self.store.clear();
        self.table.clear();
        self.free_list.clear();
    }

    fn fatal(&self, err: Error) -> ! {
        self.config.error_handler.handle(err)
    }

    /// Validates a key of `len` bytes for insertion, adopting `K::KIND` if
    /// the map has no key kind yet.
    fn bind_key_kind(&mut self, len: usize) -> Result<KeyKind> {
        let kind = self.hdr.key_kind.unwrap_or(K::KIND);
        check_key(kind, len)?;
        if self.hdr.key_kind.is_none() {
            debug!("binding map to {}s", kind);
            self.hdr.key_kind = Some(kind);
        }
        Ok(kind)
    }

    fn locate(&self, key: &K) -> Result<Option<usize>> {
        let kind = match self.hdr.key_kind {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let encoded = key.encode();
        let bytes = encoded.as_slice();
        check_key(kind, bytes.len())?;
        if self.table.len() == 0 {
            return Ok(None);
        }
        let (hash, tag) = self.hash_key(kind, bytes);
        Ok(self.table.find(hash, tag))
    }

    #[inline]
    fn hash_key(&self, kind: KeyKind, bytes: &[u8]) -> (u64, u64) {
        match kind {
            KeyKind::Fixed(_) => {
                let packed = pack_fixed(bytes);
                (hash_fixed(packed, self.hdr.seed), packed)
            }
            KeyKind::Bytes => {
                let hash = hash_bytes(bytes, self.hdr.seed);
                (hash, hash_bytes(bytes, hash))
            }
        }
    }

    /// Ensures `additional` more entries fit, allocating lazily on first use,
    /// doubling when full and purging tombstones when they pile up.
    fn try_fit(&mut self, additional: usize) -> Result<()> {
        if additional == 0 {
            return Ok(());
        }
        let min_cap = self
            .table
            .len()
            .checked_add(additional)
            .ok_or(Error::CapacityExceeded {
                requested: usize::max_value(),
                limit: MAX_CAPACITY,
            })?;
        let raw_cap = self.table.capacity();
        if raw_cap == 0 {
            let raw_cap = self
                .resize_policy
                .try_raw_capacity(max(min_cap, self.config.initial_capacity))?;
            debug!(
                "allocating map: {} index slots, {:?} value store",
                raw_cap, self.config.strategy
            );
            return self.try_resize(raw_cap);
        }
        if min_cap > self.resize_policy.capacity(raw_cap) {
            let new_raw_cap = self.resize_policy.try_raw_capacity(min_cap)?;
            self.try_resize(new_raw_cap)
        } else if self
            .resize_policy
            .must_purge(min_cap, self.table.tombstones(), raw_cap)
        {
            debug!(
                "purging {} tombstones from {} index slots",
                self.table.tombstones(),
                raw_cap
            );
            self.table.rehash(raw_cap)
        } else {
            Ok(())
        }
    }

    /// Grows the value store, then rebuilds the index table with
    /// `new_raw_cap` slots. A failure at either step leaves every entry where
    /// it was.
    #[inline(never)]
    #[cold]
    fn try_resize(&mut self, new_raw_cap: usize) -> Result<()> {
        debug_assert!(new_raw_cap.is_power_of_two());
        let new_cap = self.resize_policy.capacity(new_raw_cap);
        if new_cap > MAX_CAPACITY {
            return Err(Error::CapacityExceeded {
                requested: new_cap,
                limit: MAX_CAPACITY,
            });
        }
        let bytes = new_cap.saturating_mul(mem::size_of::<V>());
        if bytes > self.config.max_bytes {
            return Err(Error::CapacityExceeded {
                requested: bytes,
                limit: self.config.max_bytes,
            });
        }
        self.store.grow_to(new_cap)?;
        let old_raw_cap = self.table.capacity();
        if old_raw_cap == 0 {
            self.table = IndexTable::with_capacity(new_raw_cap)?;
        } else {
            self.table.rehash(new_raw_cap)?;
        }
        debug!(
            "index table grown {} -> {} slots, value store capacity {}",
            old_raw_cap, new_raw_cap, new_cap
        );
        Ok(())
    }
}

/// Stores `value` at a released index if there is one, else appends it.
fn place<V>(free_list: &mut FreeList, store: &mut ValueStore<V>, value: V) -> Result<usize> {
    match free_list.acquire() {
        Some(idx) => {
            store.replace(idx, value);
            Ok(idx)
        }
        None => store.push(value),
    }
}

#[inline]
fn check_key(kind: KeyKind, len: usize) -> Result<()> {
    if kind.accepts(len) {
        Ok(())
    } else {
        Err(Error::KeyMismatch {
            expected: kind,
            len,
        })
    }
}

impl<K: Key + ?Sized, V> Default for DMap<K, V> {
    fn default() -> DMap<K, V> {
        DMap::new()
    }
}

impl<K: ?Sized, V> Debug for DMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DMap")
            .field("len", &self.table.len())
            .field("capacity", &self.store.capacity())
            .field("index_capacity", &self.table.capacity())
            .field("key_kind", &self.hdr.key_kind)
            .finish()
    }
}

impl<'a, K: Key + ?Sized, V> Index<&'a K> for DMap<K, V> {
    type Output = V;

    /// Returns a reference to the value corresponding to the supplied key.
    ///
    /// # Panics
    ///
    /// Panics if the key is not present in the `DMap`.
    #[inline]
    fn index(&self, key: &K) -> &V {
        self.get(key).expect("no entry found for key")
    }
}

impl<K: Key, V> FromIterator<(K, V)> for DMap<K, V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> DMap<K, V> {
        let mut map = DMap::new();
        map.extend(iter);
        map
    }
}

impl<K: Key, V> Extend<(K, V)> for DMap<K, V> {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let iter = iter.into_iter();
        let reserve = if self.is_empty() {
            iter.size_hint().0
        } else {
            (iter.size_hint().0 + 1) / 2
        };
        self.reserve(reserve);
        for (k, v) in iter {
            self.insert(&k, v);
        }
    }
}

/// Iterator over the live values of a [`DMap`].
pub struct Values<'a, V: 'a> {
    indices: DataIndices<'a>,
    values: &'a [V],
}

impl<'a, V> Iterator for Values<'a, V> {
    type Item = &'a V;

    #[inline]
    fn next(&mut self) -> Option<&'a V> {
        let values = self.values;
        self.indices.next().map(|idx| &values[idx])
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }
}

impl<'a, V> ExactSizeIterator for Values<'a, V> {
    #[inline]
    fn len(&self) -> usize {
        self.indices.len()
    }
}

impl<'a, V> FusedIterator for Values<'a, V> {}

#[cfg(test)]
mod test_map {
    use super::{AllocStrategy, Config, DMap, Error, ErrorHandler, KeyKind, PanicHandler};
    use std::cell::RefCell;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::{Arc, Mutex};

    fn panicking() -> Config {
        Config::default().error_handler(PanicHandler).seed(0x5eed)
    }

    #[test]
    fn insert_and_get() {
        let mut map: DMap<u32, u32> = DMap::new();
        assert_eq!(map.capacity(), 0);
        assert_eq!(map.get(&3), None);

        map.insert(&3, 4);
        map.insert(&1, 2);

        assert_eq!(map.get(&3), Some(&4));
        assert_eq!(map.get(&1), Some(&2));
        assert_eq!(map.get(&2), None);
        assert_eq!(map[&3], 4);
        assert_eq!(map.count(), 2);
        assert_eq!(map.key_kind(), Some(KeyKind::Fixed(4)));
    }

    #[test]
    fn test_lazy_init() {
        let mut map: DMap<u64, u64> = DMap::with_config(panicking());
        assert_eq!(map.index_capacity(), 0);
        assert_eq!(map.delete(&5), None);
        assert!(!map.contains_key(&5));
        assert_eq!(map.iteration_range(), 0);
        assert!(map.raw_values().is_empty());

        map.insert(&5, 5);
        assert_eq!(map.index_capacity(), 128);
        assert_eq!(map.capacity(), 64);
    }

    #[test]
    fn test_overwrite_keeps_index() {
        let mut map: DMap<u64, &str> = DMap::with_config(panicking());
        let idx = map.insert(&42, "a");
        assert_eq!(map.insert(&42, "b"), idx);
        assert_eq!(map.get(&42), Some(&"b"));
        assert_eq!(map.count(), 1);
        assert_eq!(map.iteration_range(), 1);
    }

    #[test]
    fn test_index_stability_across_growth() {
        let mut map: DMap<u32, u64> = DMap::with_config(panicking());
        let indices: Vec<usize> = (0..10_000u32).map(|i| map.insert(&i, i as u64 * 7)).collect();
        assert!(map.index_capacity() >= 2 * 10_000);
        for (i, &idx) in indices.iter().enumerate() {
            let key = i as u32;
            assert_eq!(map.get_index(&key), Some(idx));
            assert_eq!(map.get(&key), Some(&(i as u64 * 7)));
            assert_eq!(map.value_at(idx), Some(&(i as u64 * 7)));
        }
    }

    #[test]
    fn test_delete_then_miss() {
        let mut map: DMap<i32, i32> = DMap::with_config(panicking());
        for i in -50..50 {
            map.insert(&i, -i);
        }
        let idx = map.get_index(&7).unwrap();
        assert_eq!(map.delete(&7), Some(idx));
        assert_eq!(map.get(&7), None);
        assert_eq!(map.delete(&7), None);
        assert_eq!(map.delete(&1000), None);
        assert_eq!(map.count(), 99);
        assert_eq!(map.iteration_range(), 100);
        // the stale value stays readable by index
        assert_eq!(map.value_at(idx), Some(&-7));

        let reused = map.insert(&7, 70);
        assert_eq!(reused, idx);
        assert_eq!(map.get(&7), Some(&70));
    }

    #[test]
    fn test_free_list_reuse_keeps_capacity() {
        let mut map: DMap<u32, u32> = DMap::with_config(panicking());
        let mut first = Vec::new();
        for key in 1..=1000u32 {
            first.push(map.insert(&key, key));
        }
        let capacity = map.capacity();
        let index_capacity = map.index_capacity();
        assert_eq!(capacity, 1024);

        let mut released = Vec::new();
        for key in 1..=500u32 {
            released.push(map.delete(&key).unwrap());
        }
        assert_eq!(map.count(), 500);

        let mut reused = Vec::new();
        for key in 2000..2500u32 {
            reused.push(map.insert(&key, key));
        }
        assert_eq!(map.count(), 1000);
        assert_eq!(map.capacity(), capacity);
        assert_eq!(map.index_capacity(), index_capacity);
        assert_eq!(map.iteration_range(), 1000);

        released.sort();
        reused.sort();
        assert_eq!(released, reused);
        for key in 501..=1000u32 {
            assert_eq!(map.get_index(&key), Some(first[key as usize - 1]));
        }
        for key in 2000..2500u32 {
            assert_eq!(map.get(&key), Some(&key));
        }
    }

    #[test]
    fn test_load_factor() {
        let mut map: DMap<u64, ()> = DMap::with_config(panicking());
        for i in 0..5000u64 {
            map.insert(&i, ());
            assert!(map.count() * 2 <= map.index_capacity());
            assert_eq!(map.capacity() * 2, map.index_capacity());
        }
    }

    #[test]
    fn test_churn_purges_tombstones() {
        let mut map: DMap<u64, u64> = DMap::with_config(panicking());
        for i in 0..100_000u64 {
            map.insert(&i, i);
            assert_eq!(map.delete(&i), Some(0));
        }
        assert!(map.is_empty());
        assert_eq!(map.index_capacity(), 128);
        assert_eq!(map.iteration_range(), 1);
        for i in 0..100_000u64 {
            assert_eq!(map.get(&i), None);
        }
    }

    #[test]
    fn test_count_tracks_distinct_deletes() {
        let mut map: DMap<u16, u16> = DMap::with_config(panicking());
        for i in 0..1000u16 {
            map.insert(&i, i);
        }
        for i in (0..1000u16).step_by(3) {
            map.delete(&i);
            map.delete(&i);
        }
        assert_eq!(map.count(), 1000 - 334);
        assert_eq!(map.values().len(), map.count());
    }

    #[test]
    fn test_byte_string_keys() {
        let mut map: DMap<str, usize> = DMap::with_config(panicking());
        let words = ["", "a", "ab", "abc", "a much longer key than sixteen bytes", "abc "];
        for (i, word) in words.iter().enumerate() {
            map.insert(word, i);
        }
        assert_eq!(map.key_kind(), Some(KeyKind::Bytes));
        for (i, word) in words.iter().enumerate() {
            assert_eq!(map.get(word), Some(&i));
        }
        assert_eq!(map.get("abcd"), None);
        assert_eq!(map.delete("abc"), Some(3));
        assert_eq!(map.get("abc"), None);
        assert_eq!(map.get("abc "), Some(&5));
    }

    #[test]
    fn test_many_byte_string_keys() {
        let mut map: DMap<String, usize> = DMap::with_config(panicking());
        for i in 0..20_000 {
            map.insert(&format!("key-{}", i), i);
        }
        for i in 0..20_000 {
            assert_eq!(map.get(&format!("key-{}", i)), Some(&i));
        }
        assert_eq!(map.get(&"key-20000".to_string()), None);
    }

    #[test]
    fn test_key_mismatch() {
        let mut map: DMap<[u8], u32> =
            DMap::with_config(panicking().key_kind(KeyKind::Fixed(4)));
        assert_eq!(map.try_insert(b"abcd", 1), Ok(0));
        let mismatch = Error::KeyMismatch {
            expected: KeyKind::Fixed(4),
            len: 3,
        };
        assert_eq!(map.try_insert(b"abc", 2), Err(mismatch.clone()));
        assert_eq!(map.try_get(b"abc"), Err(mismatch.clone()));
        assert_eq!(map.try_delete(b"abc"), Err(mismatch));
        assert_eq!(map.count(), 1);
        assert_eq!(map.get(b"abcd"), Some(&1));

        let mut wide: DMap<u32, u32> =
            DMap::with_config(panicking().key_kind(KeyKind::Fixed(8)));
        assert_eq!(
            wide.try_insert(&1, 1),
            Err(Error::KeyMismatch {
                expected: KeyKind::Fixed(8),
                len: 4
            })
        );
        assert!(wide.is_empty());
    }

    #[test]
    fn test_unsupported_key_width() {
        let res = DMap::<u64, u64>::try_with_config(Config::default().key_kind(KeyKind::Fixed(9)));
        assert_eq!(res.err(), Some(Error::UnsupportedKeyWidth { width: 9 }));
        let res = DMap::<u64, u64>::try_with_config(Config::default().key_kind(KeyKind::Fixed(0)));
        assert_eq!(res.err(), Some(Error::UnsupportedKeyWidth { width: 0 }));
    }

    #[test]
    fn test_capacity_budget() {
        let mut map: DMap<u64, u64> = DMap::with_config(panicking().max_bytes(1024));
        for i in 0..128u64 {
            map.insert(&i, i);
        }
        assert_eq!(map.capacity(), 128);
        assert_eq!(
            map.try_insert(&128, 128),
            Err(Error::CapacityExceeded {
                requested: 2048,
                limit: 1024
            })
        );
        assert_eq!(map.count(), 128);
        assert_eq!(map.capacity(), 128);
        for i in 0..128u64 {
            assert_eq!(map.get(&i), Some(&i));
        }
        // room for one more entry is checked before the lookup
        assert!(map.try_insert(&5, 50).is_err());
        assert_eq!(map.get(&5), Some(&5));
        map.delete(&5);
        assert!(map.try_insert(&500, 500).is_ok());
    }

    #[test]
    #[should_panic(expected = "key is not the correct size")]
    fn test_handler_receives_key_mismatch() {
        let mut map: DMap<[u8], u32> =
            DMap::with_config(panicking().key_kind(KeyKind::Fixed(4)));
        map.insert(b"abc", 1);
    }

    #[test]
    fn test_map_usable_after_handler_unwinds() {
        let mut map: DMap<u64, u64> = DMap::with_config(panicking().max_bytes(512));
        for i in 0..64u64 {
            map.insert(&i, i);
        }
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            map.insert(&64, 64);
        }));
        assert!(res.is_err());
        assert_eq!(map.count(), 64);
        assert_eq!(map.get(&63), Some(&63));
    }

    struct RecordingHandler {
        seen: Mutex<Vec<Error>>,
    }

    impl ErrorHandler for RecordingHandler {
        fn handle(&self, err: Error) -> ! {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(err.clone());
            }
            panic!("recorded: {}", err)
        }
    }

    #[test]
    fn test_handler_shared_between_maps() {
        let recorder = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let shared: Arc<dyn ErrorHandler> = recorder.clone();
        let config = Config::default()
            .key_kind(KeyKind::Fixed(4))
            .error_handler(shared);
        let mut a: DMap<[u8], u32> = DMap::with_config(config.clone());
        let mut b: DMap<[u8], u32> = DMap::with_config(config.max_bytes(0));

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            a.insert(b"abc", 1);
        }));
        assert!(res.is_err());
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            b.insert(b"abcd", 1);
        }));
        assert!(res.is_err());

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Error::KeyMismatch {
                    expected: KeyKind::Fixed(4),
                    len: 3
                },
                Error::CapacityExceeded {
                    requested: 256,
                    limit: 0
                },
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_virtual_addresses_are_stable() {
        let config = panicking()
            .strategy(AllocStrategy::Virtual)
            .max_bytes(1 << 26);
        let mut map: DMap<u64, u64> = DMap::with_config(config);
        map.insert(&0, 0);
        assert!(map.has_stable_addresses());
        let base = map.raw_values().as_ptr();
        let first = map.get(&0).unwrap() as *const u64;
        for i in 1..100_000u64 {
            map.insert(&i, i);
        }
        assert_eq!(map.raw_values().as_ptr(), base);
        assert_eq!(map.get(&0).unwrap() as *const u64, first);
        assert_eq!(map.get(&99_999), Some(&99_999));
    }

    // wider than any page size, so the virtual reservation cannot be used
    #[repr(align(131072))]
    struct OverAligned(u64);

    #[test]
    fn test_virtual_falls_back_for_over_aligned_values() {
        let config = panicking().strategy(AllocStrategy::Virtual);
        let mut map: DMap<u32, OverAligned> = DMap::with_config(config);
        assert_eq!(map.strategy(), AllocStrategy::Virtual);
        map.insert(&1, OverAligned(11));
        map.insert(&2, OverAligned(22));
        assert_eq!(map.strategy(), AllocStrategy::Heap);
        assert!(!map.has_stable_addresses());
        assert_eq!(map.get(&1).map(|v| v.0), Some(11));
        assert_eq!(map.get(&2).map(|v| v.0), Some(22));
        assert_eq!(map.raw_values().as_ptr() as usize % 131072, 0);
    }

    #[test]
    fn test_heap_strategy() {
        let mut map: DMap<u64, u64> = DMap::with_config(panicking());
        map.insert(&1, 1);
        assert_eq!(map.strategy(), AllocStrategy::Heap);
        assert!(!map.has_stable_addresses());
    }

    #[test]
    fn test_clear() {
        let mut map: DMap<u32, String> = DMap::with_config(panicking());
        for i in 0..300u32 {
            map.insert(&i, i.to_string());
        }
        map.delete(&10);
        let capacity = map.capacity();
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iteration_range(), 0);
        assert_eq!(map.get(&1), None);
        assert_eq!(map.capacity(), capacity);
        assert_eq!(map.insert(&7, "seven".to_string()), 0);
        assert_eq!(map.get(&7).map(|s| s.as_str()), Some("seven"));
    }

    #[test]
    fn test_get_or_insert_with() {
        let mut map: DMap<u32, u32> = DMap::with_config(panicking());
        for &key in &[1, 2, 1, 1, 3, 2] {
            *map.get_or_insert_with(&key, || 0).1 += 1;
        }
        assert_eq!(map.get(&1), Some(&3));
        assert_eq!(map.get(&2), Some(&2));
        assert_eq!(map.get(&3), Some(&1));

        let mut calls = 0;
        let (idx, _) = map.get_or_insert_with(&1, || {
            calls += 1;
            0
        });
        assert_eq!(calls, 0);
        assert_eq!(Some(idx), map.get_index(&1));
    }

    #[test]
    fn test_get_mut() {
        let mut map: DMap<u8, Vec<u8>> = DMap::with_config(panicking());
        map.insert(&1, vec![1]);
        map.get_mut(&1).unwrap().push(2);
        assert_eq!(map.get(&1), Some(&vec![1, 2]));
        assert!(map.get_mut(&2).is_none());
    }

    #[test]
    fn test_reserve() {
        let mut map: DMap<u32, u32> = DMap::with_config(panicking());
        map.reserve(1000);
        assert_eq!(map.capacity(), 1024);
        let index_capacity = map.index_capacity();
        for i in 0..1000u32 {
            map.insert(&i, i);
        }
        assert_eq!(map.index_capacity(), index_capacity);
        assert!(map.try_reserve(usize::max_value()).is_err());
        assert_eq!(map.count(), 1000);
    }

    #[test]
    fn test_values() {
        let mut map: DMap<u32, u32> = DMap::with_config(panicking());
        for i in 0..100u32 {
            map.insert(&i, i);
        }
        for i in 0..50u32 {
            map.delete(&i);
        }
        let mut values: Vec<u32> = map.values().cloned().collect();
        values.sort();
        assert_eq!(values, (50..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_from_iter() {
        let xs = [(1u32, 2u32), (2, 3), (3, 4), (4, 5), (5, 6), (6, 7)];
        let map: DMap<u32, u32> = xs.iter().cloned().collect();
        for &(k, v) in &xs {
            assert_eq!(map.get(&k), Some(&v));
        }
        assert_eq!(map.len(), xs.len());
    }

    #[test]
    fn test_same_seed_same_layout() {
        let mut a: DMap<u64, u64> = DMap::with_config(panicking());
        let mut b: DMap<u64, u64> = DMap::with_config(panicking());
        assert_eq!(a.seed(), b.seed());
        for i in 0..1000u64 {
            assert_eq!(a.insert(&i, i), b.insert(&i, i));
        }
        let va: Vec<u64> = a.values().cloned().collect();
        let vb: Vec<u64> = b.values().cloned().collect();
        assert_eq!(va, vb);
    }

    thread_local! { static DROP_VECTOR: RefCell<Vec<i32>> = RefCell::new(Vec::new()) }

    struct Droppable {
        k: usize,
    }

    impl Droppable {
        fn new(k: usize) -> Droppable {
            DROP_VECTOR.with(|slot| {
                slot.borrow_mut()[k] += 1;
            });

            Droppable { k: k }
        }
    }

    impl Drop for Droppable {
        fn drop(&mut self) {
            DROP_VECTOR.with(|slot| {
                slot.borrow_mut()[self.k] -= 1;
            });
        }
    }

    #[test]
    fn test_drops() {
        DROP_VECTOR.with(|slot| {
            *slot.borrow_mut() = vec![0; 200];
        });

        {
            let mut m: DMap<usize, Droppable> = DMap::with_config(panicking());

            for i in 0..100 {
                m.insert(&i, Droppable::new(i));
            }

            for i in 0..50 {
                m.insert(&i, Droppable::new(i + 100));
            }

            DROP_VECTOR.with(|v| {
                for i in 0..50 {
                    assert_eq!(v.borrow()[i], 0);
                    assert_eq!(v.borrow()[i + 100], 1);
                }
                for i in 50..100 {
                    assert_eq!(v.borrow()[i], 1);
                }
            });

            // deleted values live on until their index is reused
            for i in 50..75 {
                m.delete(&i);
            }
            DROP_VECTOR.with(|v| {
                for i in 50..75 {
                    assert_eq!(v.borrow()[i], 1);
                }
            });

            for i in 150..160 {
                m.insert(&i, Droppable::new(i));
            }
            DROP_VECTOR.with(|v| {
                let dropped = (50..75).filter(|&i| v.borrow()[i] == 0).count();
                assert_eq!(dropped, 10);
            });
        }

        DROP_VECTOR.with(|v| {
            for i in 0..200 {
                assert_eq!(v.borrow()[i], 0);
            }
        });
    }
}
