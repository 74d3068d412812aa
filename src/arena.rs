//! Arena: a page-aligned cache over the OS virtual-memory layer.
//!
//! Not an arena in the jemalloc sense. It exists to cut syscall counts: one
//! OS allocation serves many logical-page buffers. Only never-handed-out
//! bytes are released by the arena itself; pages that were handed out are
//! released by whoever owns them, which keeps the arena free of any
//! occupancy bitmap.

use core::cell::UnsafeCell;
use core::ptr::null_mut;

use crate::lock::Lock;
use crate::os;

/// The subset of arena behavior segments and heaps rely on. Implemented by
/// every [`Arena`] instantiation so compositions stay generic over the lock
/// and virtual-memory policies.
pub trait ArenaOps {
    fn new() -> Self
    where
        Self: Sized;
    fn create(&self, cache_capacity: usize, page_alignment: usize) -> bool;
    fn allocate(&self, size: usize) -> *mut u8;
    fn allocate_from_system(&self, size: usize) -> *mut u8;
    fn release_to_system(&self, address: *mut u8, size: usize);
    fn page_size(&self) -> usize;
    fn page_alignment(&self) -> usize;
}

/// Bookkeeping allocator for internal structures (deallocation-queue pages,
/// the thread-heap slot table). Maps straight to the OS, never through an
/// arena cache, so allocator bookkeeping can never recurse into the
/// allocator.
pub struct MetadataAllocator;

impl MetadataAllocator {
    pub fn allocate(size: usize) -> *mut u8 {
        unsafe { os::allocate(size, null_mut(), false, os::NO_NUMA, false) }
    }

    pub fn deallocate(address: *mut u8, size: usize) {
        unsafe {
            os::deallocate(address, size);
        }
    }
}

struct Cache {
    vm_page_size: usize,
    page_alignment: usize,
    buffer: *mut u8,
    size: usize,
    used: usize,
    numa_node: usize,
}

/// `HUGE_PAGES` requests huge pages from the OS and falls back to regular
/// ones when refused. `ZERO` zero-fills every allocation served from a fresh
/// cache. Both are type parameters so the checks vanish from the bump path.
pub struct Arena<L: Lock, const HUGE_PAGES: bool = false, const ZERO: bool = false> {
    lock: L,
    cache: UnsafeCell<Cache>,
}

unsafe impl<L: Lock, const HUGE_PAGES: bool, const ZERO: bool> Send
    for Arena<L, HUGE_PAGES, ZERO>
{
}
unsafe impl<L: Lock, const HUGE_PAGES: bool, const ZERO: bool> Sync
    for Arena<L, HUGE_PAGES, ZERO>
{
}

impl<L: Lock, const HUGE_PAGES: bool, const ZERO: bool> Arena<L, HUGE_PAGES, ZERO> {
    pub const fn new() -> Self {
        Self {
            lock: L::INIT,
            cache: UnsafeCell::new(Cache {
                vm_page_size: 0,
                page_alignment: os::PAGE_ALLOCATION_GRANULARITY,
                buffer: null_mut(),
                size: 0,
                used: 0,
                numa_node: os::NO_NUMA,
            }),
        }
    }

    /// Builds the initial cache. `page_alignment` must be a multiple of the
    /// OS page-allocation granularity; every address later returned by
    /// [`ArenaOps::allocate`] is aligned to it (callers request sizes that
    /// are multiples of it).
    pub fn create(&self, cache_capacity: usize, page_alignment: usize) -> bool {
        if cache_capacity == 0
            || page_alignment == 0
            || !os::is_size_granularity_multiple(page_alignment)
        {
            return false;
        }

        self.lock.acquire();
        let ret = unsafe {
            let cache = &mut *self.cache.get();
            cache.vm_page_size = os::page_size();
            cache.page_alignment = page_alignment;
            self.build_cache(cache, cache_capacity)
        };
        self.lock.release();

        ret
    }

    /// Binds future cache builds to a NUMA node. Call before `create`.
    pub fn set_numa_node(&self, numa_node: usize) {
        self.lock.acquire();
        unsafe { (*self.cache.get()).numa_node = numa_node };
        self.lock.release();
    }

    /// Releases the never-handed-out tail of the cache. Pages already handed
    /// out must be released by their owners.
    pub fn destroy(&self) {
        self.lock.acquire();
        unsafe { self.destroy_locked(&mut *self.cache.get()) };
        self.lock.release();
    }

    /// Pins every cache page into physical memory.
    pub fn lock_pages(&self) {
        self.for_each_cache_page(|address, page| unsafe {
            os::lock(address, page);
        });
    }

    pub fn unlock_pages(&self) {
        self.for_each_cache_page(|address, page| unsafe {
            os::unlock(address, page);
        });
    }

    fn for_each_cache_page(&self, mut callback: impl FnMut(*mut u8, usize)) {
        self.lock.acquire();
        unsafe {
            let cache = &*self.cache.get();
            let mut address = cache.buffer as usize;
            let end = address + cache.size;
            while address < end {
                callback(address as *mut u8, cache.vm_page_size);
                address += cache.vm_page_size;
            }
        }
        self.lock.release();
    }

    unsafe fn destroy_locked(&self, cache: &mut Cache) {
        if cache.size > cache.used {
            os::deallocate(cache.buffer.add(cache.used), cache.size - cache.used);
        }
        cache.buffer = null_mut();
        cache.size = 0;
        cache.used = 0;
    }

    // Replaces the cache with a fresh OS allocation of at least `size`
    // bytes, aligned to the arena's page alignment. Over-allocates by the
    // alignment and trims the misaligned prefix and the excess suffix.
    unsafe fn build_cache(&self, cache: &mut Cache, size: usize) -> bool {
        let alignment = cache.page_alignment;
        let oversized = size + alignment;

        let raw = self.system_allocate(cache, oversized);
        if raw.is_null() {
            return false;
        }

        let remainder = raw as usize & (alignment - 1);
        let delta = if remainder > 0 {
            let delta = alignment - remainder;
            os::deallocate(raw, delta);
            os::deallocate(raw.add(delta + size), alignment - delta);
            delta
        } else {
            os::deallocate(raw.add(size), alignment);
            0
        };

        cache.buffer = raw.add(delta);
        cache.size = size;
        cache.used = 0;

        true
    }

    unsafe fn system_allocate(&self, cache: &Cache, size: usize) -> *mut u8 {
        if HUGE_PAGES {
            let ptr = os::allocate(size, null_mut(), true, cache.numa_node, ZERO);
            if !ptr.is_null() {
                return ptr;
            }
            // Huge pages refused, regular ones will do.
        }
        os::allocate(size, null_mut(), false, cache.numa_node, ZERO)
    }
}

impl<L: Lock, const HUGE_PAGES: bool, const ZERO: bool> ArenaOps for Arena<L, HUGE_PAGES, ZERO> {
    fn new() -> Self {
        Arena::new()
    }

    fn create(&self, cache_capacity: usize, page_alignment: usize) -> bool {
        Arena::create(self, cache_capacity, page_alignment)
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        self.lock.acquire();

        let ret = unsafe {
            let cache = &mut *self.cache.get();

            if size + cache.page_alignment > cache.size - cache.used {
                // Cache exhausted for this request: drop the unused tail and
                // rotate to a fresh OS allocation sized for the request.
                self.destroy_locked(cache);
                if !self.build_cache(cache, size) {
                    self.lock.release();
                    return null_mut();
                }
            }

            let ret = cache.buffer.add(cache.used);
            cache.used += size;
            ret
        };

        self.lock.release();
        ret
    }

    fn allocate_from_system(&self, size: usize) -> *mut u8 {
        self.lock.acquire();
        let ret = unsafe { self.system_allocate(&*self.cache.get(), size) };
        self.lock.release();
        ret
    }

    fn release_to_system(&self, address: *mut u8, size: usize) {
        unsafe {
            os::deallocate(address, size);
        }
    }

    fn page_size(&self) -> usize {
        self.lock.acquire();
        let ret = unsafe { (*self.cache.get()).vm_page_size };
        self.lock.release();
        ret
    }

    fn page_alignment(&self) -> usize {
        self.lock.acquire();
        let ret = unsafe { (*self.cache.get()).page_alignment };
        self.lock.release();
        ret
    }
}

impl<L: Lock, const HUGE_PAGES: bool, const ZERO: bool> Drop for Arena<L, HUGE_PAGES, ZERO> {
    fn drop(&mut self) {
        self.destroy();
    }
}
