//! Scalable allocator: thread-local heaps with a central failover.
//!
//! Every thread's first allocation claims a heap slot out of a fixed
//! metadata buffer and parks the slot pointer in TLS; after that the thread
//! allocates with no shared state at all. When a local heap cannot serve a
//! request, or the slot table is full, the unbounded central heap takes
//! over. On thread exit the TLS destructor donates the dying thread's
//! logical pages to the central heap, so short-lived threads do not strand
//! memory.
//!
//! Deallocation probes the active thread-local heaps first. A bounded
//! heap's ownership test is one range check, so the probe is O(active
//! threads) with a tiny constant; a miss means the pointer came from the
//! central heap.

use core::cell::UnsafeCell;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arena::{ArenaOps, MetadataAllocator};
use crate::heap::{Heap, TransferPagesFrom};
use crate::lock::{Lock, SpinLock};
use crate::os;
use crate::tls::Tls;

pub struct AllocatorOptions {
    pub arena_capacity: usize,
    /// Page alignment of the arena; heap compositions typically require it
    /// to equal their logical page size.
    pub arena_page_alignment: usize,
    /// Backing for the thread-heap slot table. Slot count is
    /// `metadata_buffer_size / slot size`; threads beyond that fall through
    /// to the central heap for life.
    pub metadata_buffer_size: usize,
    /// Number of thread-local heaps to warm up during `create`.
    pub cached_heap_count: usize,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            arena_capacity: 128 * 1024 * 1024,
            arena_page_alignment: 65536,
            metadata_buffer_size: 131072,
            cached_heap_count: 0,
        }
    }
}

pub struct AllocatorFlags {
    initialised: AtomicBool,
    shutting_down: AtomicBool,
}

// One entry of the slot table. The heap comes first so the slot address
// doubles as the heap address; the trailing pointers give the TLS destructor
// its route back to the central heap without any process-global lookup.
#[repr(C)]
struct HeapSlot<CH, LH> {
    heap: LH,
    central: *const CH,
    flags: *const AllocatorFlags,
}

struct AllocatorState<P> {
    metadata_buffer: *mut u8,
    metadata_buffer_size: usize,
    max_heap_count: usize,
    cached_heap_count: usize,
    local_params: P,
    failure_handler: Option<fn()>,
}

pub struct ScalableAllocator<CH, LH, A>
where
    CH: Heap<A> + TransferPagesFrom<LH>,
    LH: Heap<A>,
    A: ArenaOps,
{
    central_heap: CH,
    state: UnsafeCell<AllocatorState<LH::Params>>,
    active_heap_count: AtomicUsize,
    flags: AllocatorFlags,
    tls: Tls,
    lock: SpinLock,
    // Dropped last: heaps release pages into it while being torn down.
    arena: A,
}

unsafe impl<CH, LH, A> Send for ScalableAllocator<CH, LH, A>
where
    CH: Heap<A> + TransferPagesFrom<LH>,
    LH: Heap<A>,
    A: ArenaOps,
{
}
unsafe impl<CH, LH, A> Sync for ScalableAllocator<CH, LH, A>
where
    CH: Heap<A> + TransferPagesFrom<LH>,
    LH: Heap<A>,
    A: ArenaOps,
{
}

#[cfg(unix)]
unsafe extern "C" fn slot_destructor<CH, LH>(value: *mut libc::c_void)
where
    CH: TransferPagesFrom<LH>,
{
    donate_slot_pages::<CH, LH>(value as *mut u8);
}

#[cfg(windows)]
unsafe extern "system" fn slot_destructor<CH, LH>(value: *mut winapi::ctypes::c_void)
where
    CH: TransferPagesFrom<LH>,
{
    donate_slot_pages::<CH, LH>(value as *mut u8);
}

// Runs on the dying thread with its slot pointer. The dying thread is the
// sole allocator into its heap, so the heap is quiescent here; splicing its
// pages into the central heap needs no coordination with the donor side.
unsafe fn donate_slot_pages<CH, LH>(slot: *mut u8)
where
    CH: TransferPagesFrom<LH>,
{
    if slot.is_null() {
        return;
    }
    let slot = slot as *mut HeapSlot<CH, LH>;
    let flags = &*(*slot).flags;

    if flags.initialised.load(Ordering::Acquire) && !flags.shutting_down.load(Ordering::Acquire) {
        (*(*slot).central).transfer_pages_from(&(*slot).heap);
    }
}

impl<CH, LH, A> ScalableAllocator<CH, LH, A>
where
    CH: Heap<A> + TransferPagesFrom<LH>,
    LH: Heap<A>,
    A: ArenaOps,
{
    pub fn new() -> Self {
        Self {
            central_heap: CH::new(),
            state: UnsafeCell::new(AllocatorState {
                metadata_buffer: null_mut(),
                metadata_buffer_size: 0,
                max_heap_count: 0,
                cached_heap_count: 0,
                local_params: LH::Params::default(),
                failure_handler: None,
            }),
            active_heap_count: AtomicUsize::new(0),
            flags: AllocatorFlags {
                initialised: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            },
            tls: Tls::new(),
            lock: SpinLock::new(),
            arena: A::new(),
        }
    }

    /// One-time setup. Every thread that allocated through this instance
    /// must have exited (or still be running) before the instance drops;
    /// TLS destructors firing after the drop would read freed slot memory.
    pub fn create(
        &self,
        params_central: &CH::Params,
        params_local: &LH::Params,
        options: &AllocatorOptions,
    ) -> bool {
        if options.arena_capacity == 0
            || options.arena_page_alignment == 0
            || options.metadata_buffer_size == 0
            || !os::is_size_granularity_multiple(options.arena_page_alignment)
            || !os::is_size_granularity_multiple(options.metadata_buffer_size)
        {
            return false;
        }

        if !self
            .arena
            .create(options.arena_capacity, options.arena_page_alignment)
        {
            return false;
        }

        let metadata_buffer = MetadataAllocator::allocate(options.metadata_buffer_size);
        if metadata_buffer.is_null() {
            return false;
        }

        let state = unsafe { &mut *self.state.get() };
        state.metadata_buffer = metadata_buffer;
        state.metadata_buffer_size = options.metadata_buffer_size;
        state.max_heap_count = options.metadata_buffer_size / core::mem::size_of::<HeapSlot<CH, LH>>();
        state.local_params = params_local.clone();

        if state.max_heap_count == 0 {
            return false;
        }

        if !self.central_heap.create(params_central, &self.arena) {
            return false;
        }

        if !self.tls.create(slot_destructor::<CH, LH>) {
            return false;
        }

        state.cached_heap_count = options
            .cached_heap_count
            .max(state.cached_heap_count)
            .min(state.max_heap_count);
        for index in 0..state.cached_heap_count {
            if unsafe { self.create_local_heap(state, index) }.is_null() {
                return false;
            }
        }

        self.flags.initialised.store(true, Ordering::Release);
        true
    }

    pub fn is_initialised(&self) -> bool {
        self.flags.initialised.load(Ordering::Acquire)
    }

    pub fn get_central_heap(&self) -> &CH {
        &self.central_heap
    }

    /// Number of slots claimed by threads so far.
    pub fn active_heap_count(&self) -> usize {
        self.active_heap_count.load(Ordering::Acquire)
    }

    /// The calling thread's heap, if it has claimed one.
    pub fn current_thread_heap(&self) -> *mut LH {
        self.tls.get() as *mut LH
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        let local_heap = self.get_thread_local_heap();
        if !local_heap.is_null() {
            let ret = unsafe { (*local_heap).allocate(size) };
            if !ret.is_null() {
                return ret;
            }
        }
        // Local heap exhausted or unavailable; the central heap only fails
        // when the arena itself is out of memory.
        self.central_heap.allocate(size)
    }

    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> *mut u8 {
        let local_heap = self.get_thread_local_heap();
        if !local_heap.is_null() {
            let ret = unsafe { (*local_heap).allocate_aligned(size, alignment) };
            if !ret.is_null() {
                return ret;
            }
        }
        self.central_heap.allocate_aligned(size, alignment)
    }

    pub fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // Each probe is a constant-time range check against one bounded
        // heap, so this stays linear in thread count with no inner search.
        let active = self.active_heap_count.load(Ordering::Acquire);
        let state = unsafe { &*self.state.get() };
        for index in 0..active {
            let heap = unsafe { &(*self.slot_at(state, index)).heap };
            if heap.owns_pointer(ptr) {
                heap.deallocate(ptr);
                return;
            }
        }

        self.central_heap.deallocate(ptr);
    }

    pub fn get_usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }

        let active = self.active_heap_count.load(Ordering::Acquire);
        let state = unsafe { &*self.state.get() };
        for index in 0..active {
            let heap = unsafe { &(*self.slot_at(state, index)).heap };
            if heap.owns_pointer(ptr) {
                return heap.get_usable_size(ptr);
            }
        }

        self.central_heap.get_usable_size(ptr)
    }

    /// calloc-style entry point: `count * size` zeroed bytes, null on
    /// overflow or exhaustion.
    pub fn allocate_and_zero(&self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return null_mut(),
        };

        let ret = self.allocate(total);
        if !ret.is_null() {
            unsafe { core::ptr::write_bytes(ret, 0, total) };
        }
        ret
    }

    pub fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.deallocate(ptr);
            return null_mut();
        }

        let new_ptr = self.allocate(size);
        if !new_ptr.is_null() {
            let old_size = self.get_usable_size(ptr);
            unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size)) };
            self.deallocate(ptr);
        }
        new_ptr
    }

    pub fn aligned_reallocate(&self, ptr: *mut u8, size: usize, alignment: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate_aligned(size, alignment);
        }
        if size == 0 {
            self.deallocate(ptr);
            return null_mut();
        }

        let new_ptr = self.allocate_aligned(size, alignment);
        if !new_ptr.is_null() {
            let old_size = self.get_usable_size(ptr);
            unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size)) };
            self.deallocate(ptr);
        }
        new_ptr
    }

    pub fn reallocate_and_zero(&self, ptr: *mut u8, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return null_mut(),
        };

        let ret = self.reallocate(ptr, total);
        if !ret.is_null() {
            unsafe { core::ptr::write_bytes(ret, 0, total) };
        }
        ret
    }

    /// Allocation for callers that cannot take null: on exhaustion the
    /// installed failure handler runs once; with no handler installed the
    /// process aborts through the standard allocation-failure path.
    pub fn allocate_or_handle(&self, size: usize) -> *mut u8 {
        let ret = self.allocate(size);
        if ret.is_null() {
            self.handle_allocation_failure(size, crate::heap::MINIMUM_ALIGNMENT);
        }
        ret
    }

    pub fn allocate_aligned_or_handle(&self, size: usize, alignment: usize) -> *mut u8 {
        let ret = self.allocate_aligned(size, alignment);
        if ret.is_null() {
            self.handle_allocation_failure(size, alignment);
        }
        ret
    }

    /// Installs the handler consulted by the `*_or_handle` entry points.
    pub fn set_failure_handler(&self, handler: Option<fn()>) {
        self.lock.acquire();
        unsafe { (*self.state.get()).failure_handler = handler };
        self.lock.release();
    }

    /// Number of thread-local heaps to pre-create; call before `create`.
    pub fn set_cached_heap_count(&self, count: usize) {
        self.lock.acquire();
        unsafe { (*self.state.get()).cached_heap_count = count };
        self.lock.release();
    }

    fn handle_allocation_failure(&self, size: usize, alignment: usize) {
        self.lock.acquire();
        let handler = unsafe { (*self.state.get()).failure_handler };
        self.lock.release();

        match handler {
            Some(handler) => handler(),
            None => {
                let layout = core::alloc::Layout::from_size_align(
                    size.max(1),
                    alignment.max(1).next_power_of_two(),
                )
                .unwrap_or_else(|_| core::alloc::Layout::new::<u8>());
                std::alloc::handle_alloc_error(layout);
            }
        }
    }

    fn slot_at(&self, state: &AllocatorState<LH::Params>, index: usize) -> *mut HeapSlot<CH, LH> {
        unsafe {
            state
                .metadata_buffer
                .add(index * core::mem::size_of::<HeapSlot<CH, LH>>()) as *mut HeapSlot<CH, LH>
        }
    }

    // Builds a heap in slot `index`. Returns null when the heap cannot be
    // created (arena exhausted); the slot stays unclaimed.
    unsafe fn create_local_heap(
        &self,
        state: &AllocatorState<LH::Params>,
        index: usize,
    ) -> *mut LH {
        let slot = self.slot_at(state, index);

        core::ptr::write(
            slot,
            HeapSlot {
                heap: LH::new(),
                central: &self.central_heap,
                flags: &self.flags,
            },
        );

        if !(*slot).heap.create(&state.local_params, &self.arena) {
            core::ptr::drop_in_place(slot);
            return null_mut();
        }

        core::ptr::addr_of_mut!((*slot).heap)
    }

    fn get_thread_local_heap(&self) -> *mut LH {
        if !self.is_initialised() {
            return null_mut();
        }

        let existing = self.tls.get();
        if !existing.is_null() {
            // The heap is the slot's first field.
            return existing as *mut LH;
        }

        // First allocation on this thread: claim a slot. The lock is only
        // ever taken here, once per thread (or on every call for threads
        // that lost the slot race for good).
        self.lock.acquire();

        let state = unsafe { &mut *self.state.get() };
        let active = self.active_heap_count.load(Ordering::Relaxed);

        if active + 1 >= state.max_heap_count {
            // Slot table saturated; this thread lives off the central heap.
            self.lock.release();
            return null_mut();
        }

        let heap = if active >= state.cached_heap_count {
            unsafe { self.create_local_heap(state, active) }
        } else {
            unsafe { core::ptr::addr_of_mut!((*self.slot_at(state, active)).heap) }
        };

        if heap.is_null() {
            self.lock.release();
            return null_mut();
        }

        self.active_heap_count.store(active + 1, Ordering::Release);
        self.tls.set(heap as *mut u8);

        self.lock.release();
        heap
    }
}

impl<CH, LH, A> Drop for ScalableAllocator<CH, LH, A>
where
    CH: Heap<A> + TransferPagesFrom<LH>,
    LH: Heap<A>,
    A: ArenaOps,
{
    fn drop(&mut self) {
        // TLS destructors that fire from here on become no-ops.
        self.flags.shutting_down.store(true, Ordering::Release);

        let state = unsafe { &mut *self.state.get() };

        if self.is_initialised() {
            let created = self
                .active_heap_count
                .load(Ordering::Acquire)
                .max(state.cached_heap_count);

            for index in 0..created {
                unsafe { core::ptr::drop_in_place(self.slot_at(state, index)) };
            }

            self.tls.destroy();
        }

        if !state.metadata_buffer.is_null() {
            MetadataAllocator::deallocate(state.metadata_buffer, state.metadata_buffer_size);
            state.metadata_buffer = null_mut();
        }
        // central_heap and arena are fields; they drop after this body, in
        // that order.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::lock::SpinLock;
    use crate::pow2::{Pow2Heap, Pow2HeapParams};
    use crate::segment::{Central, ThreadLocal};

    type TestArena = Arena<SpinLock>;
    type CentralHeap = Pow2Heap<TestArena, Central>;
    type LocalHeap = Pow2Heap<TestArena, ThreadLocal>;
    type TestAllocator = ScalableAllocator<CentralHeap, LocalHeap, TestArena>;

    fn options() -> AllocatorOptions {
        AllocatorOptions {
            arena_capacity: 64 * 1024 * 1024,
            arena_page_alignment: 65536,
            metadata_buffer_size: 131072,
            cached_heap_count: 0,
        }
    }

    fn allocator() -> TestAllocator {
        let allocator = TestAllocator::new();
        assert!(allocator.create(&Pow2HeapParams::new(), &Pow2HeapParams::new(), &options()));
        allocator
    }

    #[test]
    fn create_validations() {
        let allocator = TestAllocator::new();
        let mut bad = options();
        bad.arena_capacity = 0;
        assert!(!allocator.create(&Pow2HeapParams::new(), &Pow2HeapParams::new(), &bad));

        let allocator = TestAllocator::new();
        let mut bad = options();
        bad.metadata_buffer_size = 100; // not a granularity multiple
        assert!(!allocator.create(&Pow2HeapParams::new(), &Pow2HeapParams::new(), &bad));
    }

    #[test]
    fn uninitialised_allocator_returns_null() {
        let allocator = TestAllocator::new();
        assert!(allocator.allocate(100).is_null());
        allocator.deallocate(null_mut());
    }

    #[test]
    fn allocate_uses_the_thread_local_heap() {
        let allocator = allocator();

        let ptr = allocator.allocate(100);
        assert!(!ptr.is_null());
        assert_eq!(allocator.active_heap_count(), 1);

        let local = allocator.current_thread_heap();
        assert!(!local.is_null());
        assert!(unsafe { (*local).owns_pointer(ptr) });

        allocator.deallocate(ptr);
    }

    #[test]
    fn wrappers_round_trip() {
        let allocator = allocator();

        // calloc
        let zeroed = allocator.allocate_and_zero(16, 32);
        assert!(!zeroed.is_null());
        for offset in 0..16 * 32 {
            assert_eq!(unsafe { *zeroed.add(offset) }, 0);
        }

        // realloc grows and preserves content
        unsafe { core::ptr::write_bytes(zeroed, 0x7E, 64) };
        let grown = allocator.reallocate(zeroed, 4096);
        assert!(!grown.is_null());
        for offset in 0..64 {
            assert_eq!(unsafe { *grown.add(offset) }, 0x7E);
        }

        // realloc to zero frees
        assert!(allocator.reallocate(grown, 0).is_null());

        // overflow is rejected
        assert!(allocator.allocate_and_zero(usize::MAX, 2).is_null());

        // aligned realloc keeps alignment
        let aligned = allocator.allocate_aligned(200, 256);
        assert_eq!(aligned as usize % 256, 0);
        let aligned = allocator.aligned_reallocate(aligned, 500, 256);
        assert_eq!(aligned as usize % 256, 0);
        allocator.deallocate(aligned);
    }

    #[test]
    fn usable_size_covers_request() {
        let allocator = allocator();
        for size in [1usize, 100, 2048, 5000] {
            let ptr = allocator.allocate(size);
            assert!(allocator.get_usable_size(ptr) >= size);
            allocator.deallocate(ptr);
        }
        assert_eq!(allocator.get_usable_size(null_mut()), 0);
    }

    #[test]
    fn failure_handler_runs_on_exhaustion() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static HANDLER_RUNS: AtomicUsize = AtomicUsize::new(0);

        let allocator = allocator();
        allocator.set_failure_handler(Some(|| {
            HANDLER_RUNS.fetch_add(1, Ordering::SeqCst);
        }));

        // Oversized for every bin and for the arena: fails everywhere.
        let ret = allocator.allocate_or_handle(1 << 40);
        assert!(ret.is_null());
        assert_eq!(HANDLER_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn central_heap_serves_after_local_miss() {
        let allocator = allocator();

        // The first big block fills most of the local big-bin page; the
        // second cannot fit there (bounded, no growth) and must come from
        // the central heap.
        let first = allocator.allocate(100000);
        assert!(!first.is_null());
        let local = allocator.current_thread_heap();
        assert!(unsafe { (*local).owns_pointer(first) });

        let second = allocator.allocate(100000);
        assert!(!second.is_null());
        assert!(!unsafe { (*local).owns_pointer(second) });

        // Both route home on deallocation.
        allocator.deallocate(second);
        allocator.deallocate(first);
    }
}
