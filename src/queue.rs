//! Thread-safe LIFO of deferred deallocation pointers.
//!
//! Foreign threads freeing into a THREAD_LOCAL segment only ever touch this
//! queue; the owning thread drains it at the start of each allocation. The
//! queue is unbounded: pointers live in a doubly-linked list of 64-KiB
//! pointer pages allocated from the metadata allocator, so pushing never
//! recurses into the allocator being built on top of it.

use core::cell::UnsafeCell;
use core::ptr::null_mut;

use log::warn;

use crate::arena::MetadataAllocator;
use crate::lock::{Lock, SpinLock};

pub const POINTER_PAGE_BYTES: usize = 65536;
pub const POINTER_PAGE_CAPACITY: usize = (POINTER_PAGE_BYTES - 16) / 8;

#[repr(C)]
struct PointerPage {
    next: *mut PointerPage,
    prev: *mut PointerPage,
    pointers: [u64; POINTER_PAGE_CAPACITY],
}

const _: () = assert!(core::mem::size_of::<PointerPage>() == POINTER_PAGE_BYTES);

struct QueueState {
    head: *mut PointerPage,
    active: *mut PointerPage,
    active_used: usize,
    initial_page_count: usize,
    owns_backing: bool,
}

pub struct DeallocationQueue {
    lock: SpinLock,
    state: UnsafeCell<QueueState>,
}

unsafe impl Send for DeallocationQueue {}
unsafe impl Sync for DeallocationQueue {}

impl DeallocationQueue {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            state: UnsafeCell::new(QueueState {
                head: null_mut(),
                active: null_mut(),
                active_used: 0,
                initial_page_count: 0,
                owns_backing: true,
            }),
        }
    }

    /// Lays the queue out over `initial_page_count` pointer pages. With a
    /// null `external_buffer` the backing comes from the metadata allocator
    /// and is owned by the queue; otherwise the caller keeps ownership.
    pub fn create(&self, initial_page_count: usize, external_buffer: *mut u8) -> bool {
        if initial_page_count == 0 {
            return false;
        }

        let owns_backing = external_buffer.is_null();
        let buffer = if owns_backing {
            MetadataAllocator::allocate(initial_page_count * POINTER_PAGE_BYTES)
        } else {
            external_buffer
        };

        if buffer.is_null() {
            return false;
        }

        unsafe {
            core::ptr::write_bytes(buffer, 0, initial_page_count * POINTER_PAGE_BYTES);

            let pages = buffer as *mut PointerPage;
            for index in 0..initial_page_count {
                let page = pages.add(index);
                (*page).prev = if index == 0 {
                    null_mut()
                } else {
                    pages.add(index - 1)
                };
                (*page).next = if index + 1 < initial_page_count {
                    pages.add(index + 1)
                } else {
                    null_mut()
                };
            }

            let state = &mut *self.state.get();
            state.head = pages;
            state.active = pages;
            state.active_used = 0;
            state.initial_page_count = initial_page_count;
            state.owns_backing = owns_backing;
        }

        true
    }

    /// Thread-safe; called by any thread that frees a pointer owned by the
    /// queue's segment.
    pub fn push(&self, pointer: *mut u8) {
        self.lock.acquire();
        unsafe {
            let state = &mut *self.state.get();

            if state.active_used == POINTER_PAGE_CAPACITY {
                if (*state.active).next.is_null() {
                    let page = MetadataAllocator::allocate(POINTER_PAGE_BYTES) as *mut PointerPage;
                    if page.is_null() {
                        // Nowhere to record the pointer; the chunk stays
                        // unreachable until its page is recycled.
                        warn!("deallocation queue grow failed, dropping pointer {pointer:p}");
                        self.lock.release();
                        return;
                    }
                    (*page).next = null_mut();
                    (*page).prev = state.active;
                    (*state.active).next = page;
                    state.active = page;
                } else {
                    state.active = (*state.active).next;
                }
                state.active_used = 0;
            }

            (*state.active).pointers[state.active_used] = pointer as u64;
            state.active_used += 1;
        }
        self.lock.release();
    }

    /// Pops the most recently pushed pointer, or null when drained. Intended
    /// for the single owning consumer, though safe from any thread.
    pub fn pop(&self) -> *mut u8 {
        self.lock.acquire();
        let ret = unsafe {
            let state = &mut *self.state.get();

            if state.active_used == 0 {
                if state.head == state.active {
                    self.lock.release();
                    return null_mut();
                }
                state.active = (*state.active).prev;
                state.active_used = POINTER_PAGE_CAPACITY;
            }

            state.active_used -= 1;
            (*state.active).pointers[state.active_used] as *mut u8
        };
        self.lock.release();
        ret
    }
}

impl Drop for DeallocationQueue {
    fn drop(&mut self) {
        self.lock.acquire();
        unsafe {
            let state = &mut *self.state.get();
            let mut iter = state.head;

            if state.owns_backing {
                // The initial run is one contiguous metadata allocation;
                // grown pages were allocated one by one.
                if !iter.is_null() {
                    let mut remaining = state.initial_page_count;
                    while remaining > 1 {
                        iter = (*iter).next;
                        remaining -= 1;
                    }
                    let grown_start = if iter.is_null() { null_mut() } else { (*iter).next };
                    MetadataAllocator::deallocate(
                        state.head as *mut u8,
                        state.initial_page_count * POINTER_PAGE_BYTES,
                    );
                    iter = grown_start;
                }
            } else {
                // Skip the caller-owned initial run, free only grown pages.
                let mut remaining = state.initial_page_count;
                while !iter.is_null() && remaining > 0 {
                    iter = (*iter).next;
                    remaining -= 1;
                }
            }

            while !iter.is_null() {
                let next = (*iter).next;
                MetadataAllocator::deallocate(iter as *mut u8, POINTER_PAGE_BYTES);
                iter = next;
            }

            state.head = null_mut();
            state.active = null_mut();
            state.active_used = 0;
        }
        self.lock.release();
    }
}
