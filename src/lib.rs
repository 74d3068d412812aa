//! Composable, scalable general-purpose memory allocator.
//!
//! Two use cases from one codebase:
//!
//! * a single-threaded, bounded "local" allocator for latency-sensitive code
//!   with a known memory envelope: compose [`Segment`]s (or a
//!   [`Pow2Heap`]) over an [`Arena`] with the [`SingleThread`] policy;
//! * a process-wide allocator with per-thread caches and a shared central
//!   heap: [`ScalableAllocator`], also exposed ready-made through the
//!   [`Scalloc`] unit type implementing [`core::alloc::GlobalAlloc`].
//!
//! The building blocks, leaves first: an [`Arena`] caches OS virtual
//! memory; a logical page ([`FixedPage`] or [`AnyPage`]) runs one freelist
//! inside one buffer; a [`Segment`] chains pages of one kind under a
//! concurrency policy; a heap composes segments into a size-class policy;
//! the scalable allocator composes heaps. All policies (locking,
//! concurrency, recycling, coalescing, huge pages) are chosen at
//! type-construction time and monomorphize away from the hot path.
//!
//! Register the process-wide allocator the usual way:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: scalloc::Scalloc = scalloc::Scalloc;
//! ```
//!
//! Its knobs (arena capacity, page sizes, bin page counts, recycling
//! threshold, ...) read `SCALLOC_`-prefixed environment variables at first
//! touch; see [`config`].

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

pub mod arena;
pub mod config;
pub mod heap;
#[cfg(feature = "report-leaks")]
mod leak_report;
pub mod lock;
pub mod os;
pub mod page;
pub mod page_any;
pub mod pow2;
pub mod queue;
pub mod scalable;
pub mod segment;
pub mod tls;

pub use arena::{Arena, ArenaOps, MetadataAllocator};
pub use heap::{Heap, TransferPagesFrom, MINIMUM_ALIGNMENT};
pub use lock::{Lock, NoLock, OsLock, SpinLock};
pub use page::{FixedPage, PageHeader, PageOps, PAGE_HEADER_SIZE};
pub use page_any::AnyPage;
pub use pow2::{Pow2Heap, Pow2HeapParams};
pub use queue::DeallocationQueue;
pub use scalable::{AllocatorOptions, ScalableAllocator};
pub use segment::{Central, Concurrency, Segment, SegmentParams, SingleThread, ThreadLocal};
pub use tls::Tls;

/// The composition behind [`Scalloc`].
pub type DefaultArena = Arena<SpinLock>;
pub type DefaultCentralHeap = Pow2Heap<DefaultArena, Central>;
pub type DefaultLocalHeap = Pow2Heap<DefaultArena, ThreadLocal>;
pub type DefaultAllocator = ScalableAllocator<DefaultCentralHeap, DefaultLocalHeap, DefaultArena>;

// Lazily-initialized storage guarded by a flag and a spinlock; the one
// process-wide singleton. The C shim path may be entered during static
// initialization, before anyone had a chance to call create, hence the
// lazy first-touch construction.
struct GlobalStorage {
    value: UnsafeCell<MaybeUninit<DefaultAllocator>>,
}

unsafe impl Sync for GlobalStorage {}

static GLOBAL_STORAGE: GlobalStorage = GlobalStorage {
    value: UnsafeCell::new(MaybeUninit::uninit()),
};
static GLOBAL_READY: AtomicBool = AtomicBool::new(false);
static GLOBAL_GUARD: SpinLock = SpinLock::new();

/// The process-wide allocator instance, created on first use with
/// environment-configured parameters.
pub fn global() -> &'static DefaultAllocator {
    if !GLOBAL_READY.load(Ordering::Acquire) {
        GLOBAL_GUARD.acquire();
        if !GLOBAL_READY.load(Ordering::Relaxed) {
            let slot = GLOBAL_STORAGE.value.get();
            unsafe {
                (*slot).write(DefaultAllocator::new());
                let allocator = (*slot).assume_init_ref();
                let (params_central, params_local, options) = config::default_configuration();
                allocator.set_cached_heap_count(options.cached_heap_count);
                if !allocator.create(&params_central, &params_local, &options) {
                    // Entry points on an uninitialised allocator return
                    // null, which callers see as out-of-memory.
                    log::warn!("scalloc global instance creation failed");
                }
            }
            GLOBAL_READY.store(true, Ordering::Release);
        }
        GLOBAL_GUARD.release();
    }

    unsafe { (*GLOBAL_STORAGE.value.get()).assume_init_ref() }
}

/// Drop-in replacement for the system allocator.
pub struct Scalloc;

unsafe impl GlobalAlloc for Scalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        global().allocate_aligned(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        global().deallocate(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        global().aligned_reallocate(ptr, new_size, layout.align())
    }
}
