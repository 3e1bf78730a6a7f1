use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::slice;

use crate::alloc::{AllocStrategy, Region};
use crate::error::{Error, Result};

/// Capacity the store jumps to when it grows on its own from empty.
const MIN_STORE_CAPACITY: usize = 64;

/// Dense array of values addressed by a stable data index.
///
/// Every slot below `len` holds an initialized value, including the stale
/// values of deleted entries; those are dropped when the slot is reused,
/// cleared, or when the store itself is dropped.
pub(crate) struct ValueStore<V> {
    region: Option<Region>,
    strategy: AllocStrategy,
    reserve_bytes: usize,
    len: usize,
    cap: usize,
    marker: PhantomData<V>,
}

impl<V> ValueStore<V> {
    pub fn new(strategy: AllocStrategy, reserve_bytes: usize) -> ValueStore<V> {
        ValueStore {
            region: None,
            strategy,
            reserve_bytes,
            len: 0,
            cap: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Backend in use once memory has been allocated.
    pub fn strategy(&self) -> Option<AllocStrategy> {
        self.region.as_ref().map(Region::strategy)
    }

    /// Grows the store so it holds at least `capacity` values without moving
    /// existing indices. All-or-nothing.
    pub fn grow_to(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.cap {
            return Ok(());
        }
        let bytes = capacity
            .checked_mul(mem::size_of::<V>())
            .ok_or(Error::CapacityExceeded {
                requested: capacity,
                limit: isize::max_value() as usize / mem::size_of::<V>().max(1),
            })?;
        match self.region {
            Some(ref mut region) => region.grow(bytes)?,
            None => {
                let region = Region::allocate_initial(
                    self.strategy,
                    bytes,
                    mem::align_of::<V>(),
                    self.reserve_bytes,
                )?;
                self.region = Some(region);
            }
        }
        debug_assert!(self.region.as_ref().map_or(false, |region| region.size() >= bytes));
        self.cap = capacity;
        Ok(())
    }

    /// Appends `value`, growing when full, and returns its index.
    pub fn push(&mut self, value: V) -> Result<usize> {
        if self.len == self.cap {
            let doubled = self.cap.checked_mul(2).unwrap_or(usize::max_value());
            self.grow_to(doubled.max(MIN_STORE_CAPACITY))?;
        }
        let index = self.len;
        unsafe {
            ptr::write(self.base_ptr().add(index), value);
        }
        self.len += 1;
        Ok(index)
    }

    /// Overwrites the value at `index`, dropping the previous one.
    #[inline]
    pub fn replace(&mut self, index: usize, value: V) {
        self.as_mut_slice()[index] = value;
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&V> {
        self.as_slice().get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut V> {
        self.as_mut_slice().get_mut(index)
    }

    #[inline]
    pub fn as_slice(&self) -> &[V] {
        if self.region.is_none() {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.base_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [V] {
        if self.region.is_none() {
            return &mut [];
        }
        unsafe { slice::from_raw_parts_mut(self.base_ptr(), self.len) }
    }

    /// Drops every value, keeping the allocation.
    pub fn clear(&mut self) {
        let values: *mut [V] = self.as_mut_slice();
        // len first: a panicking destructor must not lead to a double drop
        self.len = 0;
        unsafe {
            ptr::drop_in_place(values);
        }
    }

    #[inline]
    fn base_ptr(&self) -> *mut V {
        match self.region {
            Some(ref region) => region.as_ptr() as *mut V,
            None => ptr::NonNull::dangling().as_ptr(),
        }
    }
}

impl<V> Drop for ValueStore<V> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Stack of data indices released by deletes, reused before the store grows.
#[derive(Debug, Default, Clone)]
pub(crate) struct FreeList {
    indices: Vec<u32>,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList::default()
    }

    #[inline]
    pub fn release(&mut self, index: usize) {
        debug_assert!(index <= u32::max_value() as usize);
        self.indices.push(index as u32);
    }

    #[inline]
    pub fn acquire(&mut self) -> Option<usize> {
        self.indices.pop().map(|index| index as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn clear(&mut self) {
        self.indices.clear();
    }
}
