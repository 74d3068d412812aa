//! Locking policies selected at type-construction time.
//!
//! Components that may be shared between heaps (the arena, central segments,
//! the deallocation queue) are generic over [`Lock`], so single-threaded
//! compositions pay nothing for synchronization they do not need.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Raw acquire/release interface. `INIT` allows placing locks in statics and
/// in structs built by `const fn` constructors.
pub trait Lock {
    const INIT: Self;

    fn acquire(&self);
    fn release(&self);
}

/// For compositions with a single mutator.
pub struct NoLock;

impl Lock for NoLock {
    const INIT: Self = NoLock;

    #[inline]
    fn acquire(&self) {}

    #[inline]
    fn release(&self) {}
}

/// Compare-and-swap spinlock on a single 32-bit word.
///
/// Spins `SPIN_COUNT` times with a pause hint, then yields the thread and
/// starts over. Uncontended acquire is one CAS; that is the fast path every
/// THREAD_LOCAL deallocation queue rides on.
pub struct SpinLock {
    flag: AtomicU32,
}

const SPIN_COUNT: usize = 1024;
const PAUSE_COUNT: usize = 64;

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            flag: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.flag
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Lock for SpinLock {
    const INIT: Self = SpinLock::new();

    fn acquire(&self) {
        loop {
            for _ in 0..SPIN_COUNT {
                if self.try_acquire() {
                    return;
                }
                for _ in 0..PAUSE_COUNT {
                    spin_loop();
                }
            }
            std::thread::yield_now();
        }
    }

    #[inline]
    fn release(&self) {
        self.flag.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// Layout of the slim reader/writer lock: one pointer-sized word, zero
// initialized. Declared here so the lock can live in consts.
#[cfg(windows)]
#[repr(C)]
struct SrwLockWord {
    ptr: *mut winapi::ctypes::c_void,
}

/// OS mutex: pthread mutex on unix, slim reader/writer lock on windows.
/// Blocks instead of burning the core, for arenas shared by many heaps.
pub struct OsLock {
    #[cfg(unix)]
    inner: UnsafeCell<libc::pthread_mutex_t>,
    #[cfg(windows)]
    inner: UnsafeCell<SrwLockWord>,
}

unsafe impl Send for OsLock {}
unsafe impl Sync for OsLock {}

impl Lock for OsLock {
    #[cfg(unix)]
    const INIT: Self = OsLock {
        inner: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
    };
    #[cfg(windows)]
    const INIT: Self = OsLock {
        inner: UnsafeCell::new(SrwLockWord {
            ptr: core::ptr::null_mut(),
        }),
    };

    fn acquire(&self) {
        unsafe {
            #[cfg(unix)]
            libc::pthread_mutex_lock(self.inner.get());
            #[cfg(windows)]
            winapi::um::synchapi::AcquireSRWLockExclusive(self.inner.get() as *mut _);
        }
    }

    fn release(&self) {
        unsafe {
            #[cfg(unix)]
            libc::pthread_mutex_unlock(self.inner.get());
            #[cfg(windows)]
            winapi::um::synchapi::ReleaseSRWLockExclusive(self.inner.get() as *mut _);
        }
    }
}
