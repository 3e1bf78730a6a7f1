//! Growable contiguous memory regions.
//!
//! Two backends sit behind [`Region`]:
//!
//! - `Heap` grows with `realloc`. The base address may change on every
//!   growth, so raw pointers into the region do not survive it.
//! - `Virtual` reserves a large range of address space up front and commits
//!   pages on demand. The base address never changes while the region lives.
//!   Where reserve-without-commit is unavailable the region silently becomes a
//!   `Heap` region (with a warning in the log).
//!
//! Growth is all-or-nothing. A failed `grow` leaves the region exactly as it
//! was and reports [`Error::AllocFailed`] or [`Error::CapacityExceeded`].

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Default address-space reservation (and byte budget) of a map: 1 GiB.
pub const MAX_ARENA_CAPACITY: usize = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// `alloc`/`realloc`; addresses may move on growth.
    Heap,
    /// Reserve/commit virtual memory; addresses never move.
    Virtual,
}

impl Default for AllocStrategy {
    fn default() -> AllocStrategy {
        AllocStrategy::Heap
    }
}

pub(crate) struct Region {
    backend: Backend,
}

enum Backend {
    Heap(HeapRegion),
    #[cfg(unix)]
    Virtual(VirtualRegion),
}

// A region exclusively owns its memory.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocates a region of at least `bytes` bytes aligned to `align`.
    ///
    /// `reserve_bytes` is the address space set aside by the virtual backend;
    /// the region can never grow past it.
    pub fn allocate_initial(
        strategy: AllocStrategy,
        bytes: usize,
        align: usize,
        reserve_bytes: usize,
    ) -> Result<Region> {
        let backend = match strategy {
            AllocStrategy::Heap => Backend::Heap(HeapRegion::new(bytes, align)?),
            AllocStrategy::Virtual => virtual_or_heap(bytes, align, reserve_bytes)?,
        };
        Ok(Region { backend })
    }

    /// Grows the usable size to at least `bytes`. Shrinking is a no-op.
    pub fn grow(&mut self, bytes: usize) -> Result<()> {
        match self.backend {
            Backend::Heap(ref mut heap) => heap.grow(bytes),
            #[cfg(unix)]
            Backend::Virtual(ref mut virt) => virt.commit(bytes),
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        match self.backend {
            Backend::Heap(ref heap) => heap.ptr.as_ptr(),
            #[cfg(unix)]
            Backend::Virtual(ref virt) => virt.base.as_ptr(),
        }
    }

    /// Usable bytes.
    #[inline]
    pub fn size(&self) -> usize {
        match self.backend {
            Backend::Heap(ref heap) => heap.size,
            #[cfg(unix)]
            Backend::Virtual(ref virt) => virt.committed,
        }
    }

    /// The backend actually in use, which differs from the requested one after a fallback.
    pub fn strategy(&self) -> AllocStrategy {
        match self.backend {
            Backend::Heap(_) => AllocStrategy::Heap,
            #[cfg(unix)]
            Backend::Virtual(_) => AllocStrategy::Virtual,
        }
    }
}

#[cfg(unix)]
fn virtual_or_heap(bytes: usize, align: usize, reserve_bytes: usize) -> Result<Backend> {
    match VirtualRegion::reserve(reserve_bytes.max(bytes), align) {
        Ok(mut virt) => {
            virt.commit(bytes)?;
            Ok(Backend::Virtual(virt))
        }
        Err(err) => {
            warn!("virtual reservation failed ({}), falling back to heap", err);
            Ok(Backend::Heap(HeapRegion::new(bytes, align)?))
        }
    }
}

#[cfg(not(unix))]
fn virtual_or_heap(bytes: usize, align: usize, _reserve_bytes: usize) -> Result<Backend> {
    warn!("reserve/commit is not supported on this target, falling back to heap");
    Ok(Backend::Heap(HeapRegion::new(bytes, align)?))
}

/// Aligned, non-null placeholder for regions that own no memory yet.
#[inline]
fn dangling(align: usize) -> NonNull<u8> {
    NonNull::new(align as *mut u8).unwrap_or_else(NonNull::dangling)
}

fn layout(bytes: usize, align: usize) -> Result<Layout> {
    Layout::from_size_align(bytes, align).map_err(|_| Error::CapacityExceeded {
        requested: bytes,
        limit: isize::max_value() as usize,
    })
}

struct HeapRegion {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

impl HeapRegion {
    fn new(bytes: usize, align: usize) -> Result<HeapRegion> {
        let mut region = HeapRegion {
            ptr: dangling(align),
            size: 0,
            align,
        };
        region.grow(bytes)?;
        Ok(region)
    }

    fn grow(&mut self, bytes: usize) -> Result<()> {
        if bytes <= self.size {
            return Ok(());
        }
        let new_layout = layout(bytes, self.align)?;
        let raw = unsafe {
            if self.size == 0 {
                alloc::alloc(new_layout)
            } else {
                alloc::realloc(self.ptr.as_ptr(), layout(self.size, self.align)?, bytes)
            }
        };
        // on failure realloc leaves the old block untouched
        let ptr = NonNull::new(raw).ok_or(Error::AllocFailed { bytes })?;
        debug!("heap region grown {} -> {} bytes", self.size, bytes);
        self.ptr = ptr;
        self.size = bytes;
        Ok(())
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        if self.size != 0 {
            unsafe {
                alloc::dealloc(
                    self.ptr.as_ptr(),
                    Layout::from_size_align_unchecked(self.size, self.align),
                );
            }
        }
    }
}

#[cfg(unix)]
struct VirtualRegion {
    base: NonNull<u8>,
    committed: usize,
    reserved: usize,
    page_size: usize,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const MAP_NORESERVE: libc::c_int = 0;

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(unix)]
#[inline]
fn round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to.is_power_of_two());
    n.checked_add(to - 1).map(|n| n & !(to - 1))
}

#[cfg(unix)]
impl VirtualRegion {
    fn reserve(bytes: usize, align: usize) -> Result<VirtualRegion> {
        let page_size = page_size();
        if align > page_size {
            return Err(Error::AllocFailed { bytes });
        }
        let reserved = round_up(bytes.max(page_size), page_size).ok_or(Error::CapacityExceeded {
            requested: bytes,
            limit: isize::max_value() as usize,
        })?;
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::AllocFailed { bytes: reserved });
        }
        let base = NonNull::new(raw as *mut u8).ok_or(Error::AllocFailed { bytes: reserved })?;
        debug!("reserved {} bytes of address space at {:p}", reserved, base);
        Ok(VirtualRegion {
            base,
            committed: 0,
            reserved,
            page_size,
        })
    }

    fn commit(&mut self, bytes: usize) -> Result<()> {
        if bytes <= self.committed {
            return Ok(());
        }
        let target = match round_up(bytes, self.page_size) {
            Some(target) if target <= self.reserved => target,
            _ => {
                return Err(Error::CapacityExceeded {
                    requested: bytes,
                    limit: self.reserved,
                })
            }
        };
        let additional = target - self.committed;
        let rc = unsafe {
            libc::mprotect(
                self.base.as_ptr().add(self.committed) as *mut libc::c_void,
                additional,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(Error::AllocFailed { bytes: additional });
        }
        trace!("committed {} bytes ({} of {} in use)", additional, target, self.reserved);
        self.committed = target;
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for VirtualRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.reserved);
        }
    }
}
