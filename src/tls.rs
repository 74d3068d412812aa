//! OS thread-local-storage slot with a thread-exit destructor.
//!
//! Rust's `thread_local!` cannot hand the dying thread's value to a plain
//! function pointer chosen at runtime, so the allocator talks to the OS
//! directly: pthread keys on unix, fiber-local storage on windows (FLS is
//! identical to TLS but supports destructors).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
pub type Destructor = unsafe extern "C" fn(*mut libc::c_void);
#[cfg(windows)]
pub type Destructor = unsafe extern "system" fn(*mut winapi::ctypes::c_void);

pub struct Tls {
    #[cfg(unix)]
    key: UnsafeCell<libc::pthread_key_t>,
    #[cfg(windows)]
    key: UnsafeCell<u32>,
    created: AtomicBool,
}

unsafe impl Send for Tls {}
unsafe impl Sync for Tls {}

impl Tls {
    pub const fn new() -> Self {
        Self {
            key: UnsafeCell::new(0),
            created: AtomicBool::new(false),
        }
    }

    /// Registers the key. Call once per instance, before any `get`/`set`.
    /// The destructor runs on thread exit with the last value set by that
    /// thread, if non-null.
    pub fn create(&self, destructor: Destructor) -> bool {
        #[cfg(unix)]
        let ok = unsafe { libc::pthread_key_create(self.key.get(), Some(destructor)) == 0 };
        #[cfg(windows)]
        let ok = unsafe {
            let index = winapi::um::fibersapi::FlsAlloc(Some(destructor));
            *self.key.get() = index;
            index != u32::MAX
        };

        if ok {
            self.created.store(true, Ordering::Release);
        }
        ok
    }

    pub fn destroy(&self) {
        if !self.created.swap(false, Ordering::AcqRel) {
            return;
        }
        unsafe {
            #[cfg(unix)]
            libc::pthread_key_delete(*self.key.get());
            #[cfg(windows)]
            winapi::um::fibersapi::FlsFree(*self.key.get());
        }
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub fn get(&self) -> *mut u8 {
        if !self.is_created() {
            return core::ptr::null_mut();
        }
        unsafe {
            #[cfg(unix)]
            {
                libc::pthread_getspecific(*self.key.get()) as *mut u8
            }
            #[cfg(windows)]
            {
                winapi::um::fibersapi::FlsGetValue(*self.key.get()) as *mut u8
            }
        }
    }

    pub fn set(&self, value: *mut u8) {
        if !self.is_created() {
            return;
        }
        unsafe {
            #[cfg(unix)]
            libc::pthread_setspecific(*self.key.get(), value as *const libc::c_void);
            #[cfg(windows)]
            winapi::um::fibersapi::FlsSetValue(*self.key.get(), value as *mut _);
        }
    }
}
