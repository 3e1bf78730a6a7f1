//! The index table: an open-addressing array of slots mapping a key's hash
//! to the data index of its value.
//!
//! Essential invariants of this structure:
//!
//!   - the capacity is zero or a power of two, so `hash & mask` picks the
//!     home slot and probing is linear: `idx = (idx + 1) & mask`.
//!
//!   - `data_idx` doubles as the slot state. `EMPTY` ends every probe,
//!     `DELETED` (a tombstone) is skipped by lookups and may be reclaimed by
//!     inserts, anything else is an occupied slot.
//!
//!   - a live key is encoded by exactly one occupied slot, reachable from its
//!     home slot without crossing an `EMPTY` one.
//!
//!   - there is always at least one `EMPTY` slot once the table is allocated.
//!     The map keeps `len + tombstones` well below the capacity, which is
//!     what lets the probe loops run without a bound.
//!
//! The `tag` of a slot is what gets compared after the hash: the raw key
//! for fixed-width keys, or a second, independently seeded hash of the key
//! bytes for variable-length keys (the bytes themselves are never stored).

use std::mem;

use crate::error::{Error, Result};

const EMPTY: u32 = u32::max_value();
const DELETED: u32 = u32::max_value() - 1;

/// Largest number of values a map can address.
pub const MAX_CAPACITY: usize = u32::max_value() as usize - 2;

#[derive(Debug, Clone, Copy)]
struct Slot {
    hash: u64,
    tag: u64,
    data_idx: u32,
}

impl Slot {
    const VACANT: Slot = Slot {
        hash: 0,
        tag: 0,
        data_idx: EMPTY,
    };

    #[inline]
    fn is_empty(&self) -> bool {
        self.data_idx == EMPTY
    }

    #[inline]
    fn is_occupied(&self) -> bool {
        self.data_idx < DELETED
    }

    #[inline]
    fn matches(&self, hash: u64, tag: u64) -> bool {
        self.is_occupied() && self.hash == hash && self.tag == tag
    }
}

/// Outcome of probing for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// The key is present; carries its data index.
    Found(usize),
    /// The key is absent; carries the slot an insert should fill.
    Vacant(usize),
}

pub(crate) struct IndexTable {
    slots: Box<[Slot]>,
    mask: usize,
    occupied: usize,
    tombstones: usize,
}

fn allocate_slots(capacity: usize) -> Result<Box<[Slot]>> {
    let mut slots: Vec<Slot> = Vec::new();
    slots
        .try_reserve_exact(capacity)
        .map_err(|_| Error::AllocFailed {
            bytes: capacity.saturating_mul(mem::size_of::<Slot>()),
        })?;
    slots.resize(capacity, Slot::VACANT);
    Ok(slots.into_boxed_slice())
}

impl IndexTable {
    /// A table with no slots. Nothing can be inserted until it is rehashed.
    pub fn empty() -> IndexTable {
        IndexTable {
            slots: Vec::new().into_boxed_slice(),
            mask: 0,
            occupied: 0,
            tombstones: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<IndexTable> {
        assert!(capacity.is_power_of_two());
        Ok(IndexTable {
            slots: allocate_slots(capacity)?,
            mask: capacity - 1,
            occupied: 0,
            tombstones: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.occupied
    }

    #[inline]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    #[inline]
    fn home(&self, hash: u64) -> usize {
        hash as usize & self.mask
    }

    #[inline]
    fn next(&self, idx: usize) -> usize {
        (idx + 1) & self.mask
    }

    /// Slot position holding `(hash, tag)`, if any.
    fn find_slot(&self, hash: u64, tag: u64) -> Option<usize> {
        if self.capacity() == 0 {
            return None;
        }
        let mut idx = self.home(hash);
        let mut probes = 0;
        loop {
            let slot = &self.slots[idx];
            if slot.is_empty() {
                return None;
            }
            if slot.matches(hash, tag) {
                return Some(idx);
            }
            idx = self.next(idx);
            probes += 1;
            debug_assert!(probes <= self.capacity(), "index table has no empty slot");
        }
    }

    /// Data index stored for `(hash, tag)`.
    #[inline]
    pub fn find(&self, hash: u64, tag: u64) -> Option<usize> {
        self.find_slot(hash, tag)
            .map(|idx| self.slots[idx].data_idx as usize)
    }

    /// Probes for `(hash, tag)`. A miss reports the slot a new entry should
    /// take: the first tombstone met on the probe path, or else the empty
    /// slot that ended the probe.
    pub fn probe(&self, hash: u64, tag: u64) -> Probe {
        debug_assert!(self.capacity() > 0);
        let mut idx = self.home(hash);
        let mut first_tombstone = None;
        loop {
            let slot = &self.slots[idx];
            if slot.is_empty() {
                return Probe::Vacant(first_tombstone.unwrap_or(idx));
            }
            if slot.matches(hash, tag) {
                return Probe::Found(slot.data_idx as usize);
            }
            if slot.data_idx == DELETED && first_tombstone.is_none() {
                first_tombstone = Some(idx);
            }
            idx = self.next(idx);
        }
    }

    /// Occupies a slot previously reported as `Probe::Vacant`.
    pub fn fill(&mut self, slot: usize, hash: u64, tag: u64, data_idx: usize) {
        debug_assert!(data_idx < MAX_CAPACITY);
        debug_assert!(!self.slots[slot].is_occupied());
        if self.slots[slot].data_idx == DELETED {
            self.tombstones -= 1;
        }
        self.slots[slot] = Slot {
            hash,
            tag,
            data_idx: data_idx as u32,
        };
        self.occupied += 1;
    }

    /// Returns the data index of `(hash, tag)` and `true` when present.
    /// Otherwise takes a fresh data index from `alloc_index`, records it in
    /// the slot picked by [`probe`](#method.probe) and returns it with `false`.
    ///
    /// If `alloc_index` fails the table is left untouched.
    pub fn insert_or_find<F>(&mut self, hash: u64, tag: u64, alloc_index: F) -> Result<(usize, bool)>
    where
        F: FnOnce() -> Result<usize>,
    {
        match self.probe(hash, tag) {
            Probe::Found(data_idx) => Ok((data_idx, true)),
            Probe::Vacant(slot) => {
                let data_idx = alloc_index()?;
                self.fill(slot, hash, tag, data_idx);
                Ok((data_idx, false))
            }
        }
    }

    /// Turns the slot of `(hash, tag)` into a tombstone and returns its data index.
    pub fn remove(&mut self, hash: u64, tag: u64) -> Option<usize> {
        let idx = self.find_slot(hash, tag)?;
        let data_idx = self.slots[idx].data_idx;
        self.slots[idx].data_idx = DELETED;
        self.occupied -= 1;
        self.tombstones += 1;
        Some(data_idx as usize)
    }

    /// Rebuilds the table with `new_capacity` slots. Occupied slots are
    /// reinserted by their stored hash, tombstones are dropped. Data indices
    /// are carried over unchanged.
    #[inline(never)]
    #[cold]
    pub fn rehash(&mut self, new_capacity: usize) -> Result<()> {
        assert!(new_capacity.is_power_of_two());
        assert!(self.occupied < new_capacity);

        let mut fresh = IndexTable::with_capacity(new_capacity)?;
        for slot in self.slots.iter().filter(|slot| slot.is_occupied()) {
            let mut idx = fresh.home(slot.hash);
            while !fresh.slots[idx].is_empty() {
                idx = fresh.next(idx);
            }
            fresh.slots[idx] = *slot;
            fresh.occupied += 1;
        }
        debug_assert_eq!(fresh.occupied, self.occupied);
        *self = fresh;
        Ok(())
    }

    /// Empties every slot, keeping the capacity.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = Slot::VACANT;
        }
        self.occupied = 0;
        self.tombstones = 0;
    }

    /// Data indices of all occupied slots, in slot order.
    pub fn data_indices(&self) -> DataIndices<'_> {
        DataIndices {
            inner: self.slots.iter(),
            remaining: self.occupied,
        }
    }
}

pub(crate) struct DataIndices<'a> {
    inner: std::slice::Iter<'a, Slot>,
    remaining: usize,
}

impl<'a> Iterator for DataIndices<'a> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.inner.find(|slot| slot.is_occupied())?;
        self.remaining -= 1;
        Some(slot.data_idx as usize)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> ExactSizeIterator for DataIndices<'a> {}
