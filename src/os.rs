//! Virtual-memory primitives consumed by the arena.
//!
//! Thin wrappers over `mmap`/`munmap` on unix and `VirtualAlloc`/`VirtualFree`
//! on windows. Callers are expected to request sizes that are multiples of
//! [`PAGE_ALLOCATION_GRANULARITY`]; the OS only guarantees that much
//! alignment, anything coarser is handled by the arena via over-allocation.

#[cfg(unix)]
use libc::{
    c_void, madvise, mlock, mmap, munlock, munmap, sysconf, MADV_HUGEPAGE, MAP_ANONYMOUS,
    MAP_FAILED, MAP_HUGETLB, MAP_POPULATE, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE,
};

#[cfg(windows)]
use winapi::{
    shared::{minwindef::FALSE, winerror::ERROR_SUCCESS},
    um::{
        errhandlingapi::GetLastError,
        handleapi::CloseHandle,
        memoryapi::{
            GetLargePageMinimum, VirtualAlloc, VirtualAllocExNuma, VirtualFree, VirtualLock,
            VirtualUnlock,
        },
        processthreadsapi::{GetCurrentProcess, OpenProcessToken},
        securitybaseapi::AdjustTokenPrivileges,
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winbase::LookupPrivilegeValueA,
        winnt::{
            HANDLE, MEM_COMMIT, MEM_LARGE_PAGES, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
            SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
        },
    },
};

use core::ptr::null_mut;
#[cfg(unix)]
use core::sync::atomic::AtomicU8;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

/// Minimum alignment any OS VM allocation is guaranteed to have.
#[cfg(unix)]
pub const PAGE_ALLOCATION_GRANULARITY: usize = 4096;
#[cfg(windows)]
pub const PAGE_ALLOCATION_GRANULARITY: usize = 65536;

/// Sentinel for "no NUMA binding requested".
pub const NO_NUMA: usize = usize::MAX;

/// The system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let size = query_page_size();
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let ret = unsafe { sysconf(_SC_PAGESIZE) };
    if ret > 0 {
        ret as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut info);
        if info.dwPageSize > 0 {
            info.dwPageSize as usize
        } else {
            4096
        }
    }
}

pub fn is_size_granularity_multiple(size: usize) -> bool {
    size & (PAGE_ALLOCATION_GRANULARITY - 1) == 0
}

pub fn is_address_granularity_aligned(address: usize) -> bool {
    address & (PAGE_ALLOCATION_GRANULARITY - 1) == 0
}

/// Allocates `size` bytes of committed read-write memory from the OS.
///
/// `hint` is a placement suggestion the OS may ignore. With `huge` set, the
/// allocation is attempted with huge pages and fails rather than silently
/// degrading; falling back to regular pages is the arena's decision. A NUMA
/// node other than [`NO_NUMA`] binds the range to that node.
///
/// # Safety
///
/// The caller is responsible for eventually passing the exact range back to
/// [`deallocate`].
pub unsafe fn allocate(
    size: usize,
    hint: *mut u8,
    huge: bool,
    numa_node: usize,
    zero: bool,
) -> *mut u8 {
    let ptr = allocate_impl(size, hint, huge, numa_node);
    if !ptr.is_null() && zero {
        core::ptr::write_bytes(ptr, 0, size);
    }
    ptr
}

#[cfg(unix)]
unsafe fn allocate_impl(size: usize, hint: *mut u8, huge: bool, numa_node: usize) -> *mut u8 {
    let mut flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE;
    let thp = huge && thp_enabled();

    if huge && !thp {
        flags |= MAP_HUGETLB;
    }

    let ptr = mmap(
        hint as *mut c_void,
        size,
        PROT_READ | PROT_WRITE,
        flags,
        -1,
        0,
    );

    if ptr == MAP_FAILED || ptr.is_null() {
        warn!("mmap failed: {}, size {}", errno::errno(), size);
        return null_mut();
    }

    if thp {
        madvise(ptr, size, MADV_HUGEPAGE);
    }

    if numa_node != NO_NUMA && !bind_to_numa_node(ptr, size, numa_node) {
        munmap(ptr, size);
        return null_mut();
    }

    ptr as *mut u8
}

// mbind(2) constants; libc does not expose the numa policy interface.
#[cfg(unix)]
const MPOL_BIND: libc::c_long = 2;
#[cfg(unix)]
const MPOL_MF_MOVE: libc::c_long = 2;

#[cfg(unix)]
unsafe fn bind_to_numa_node(address: *mut c_void, size: usize, numa_node: usize) -> bool {
    let nodemask: libc::c_ulong = 1 << numa_node;
    let result = libc::syscall(
        libc::SYS_mbind,
        address,
        size,
        MPOL_BIND,
        &nodemask as *const libc::c_ulong,
        (8 * core::mem::size_of::<libc::c_ulong>()) as libc::c_ulong,
        MPOL_MF_MOVE,
    );
    result == 0
}

#[cfg(windows)]
unsafe fn allocate_impl(size: usize, hint: *mut u8, huge: bool, numa_node: usize) -> *mut u8 {
    let mut flags = MEM_RESERVE | MEM_COMMIT;

    if huge {
        flags |= MEM_LARGE_PAGES;
    }

    let ptr = if numa_node != NO_NUMA {
        VirtualAllocExNuma(
            GetCurrentProcess(),
            hint as *mut _,
            size,
            flags,
            PAGE_READWRITE,
            numa_node as u32,
        )
    } else {
        VirtualAlloc(hint as *mut _, size, flags, PAGE_READWRITE)
    };

    if ptr.is_null() {
        warn!("VirtualAlloc failed: {}, size {}", GetLastError(), size);
        return null_mut();
    }

    ptr as *mut u8
}

/// Returns a range obtained from [`allocate`] (or on unix, any sub-range of
/// one) back to the OS.
///
/// # Safety
///
/// The range must not contain any live allocation.
pub unsafe fn deallocate(address: *mut u8, size: usize) -> bool {
    if address.is_null() || size == 0 {
        return true;
    }
    deallocate_impl(address, size)
}

#[cfg(unix)]
unsafe fn deallocate_impl(address: *mut u8, size: usize) -> bool {
    if munmap(address as *mut c_void, size) == -1 {
        warn!(
            "munmap failed: {}, addr {:p}, size {}",
            errno::errno(),
            address,
            size
        );
        return false;
    }
    true
}

#[cfg(windows)]
unsafe fn deallocate_impl(address: *mut u8, size: usize) -> bool {
    // MEM_RELEASE frees the whole reservation and requires a zero size.
    let _ = size;
    if VirtualFree(address as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("VirtualFree failed: {}, addr {:p}", GetLastError(), address);
        return false;
    }
    true
}

/// Pins the range into physical memory so it cannot be swapped out.
///
/// # Safety
///
/// The range must lie within a live OS allocation.
pub unsafe fn lock(address: *mut u8, size: usize) -> bool {
    #[cfg(unix)]
    {
        mlock(address as *const c_void, size) == 0
    }
    #[cfg(windows)]
    {
        VirtualLock(address as *mut _, size) != 0
    }
}

/// Undoes [`lock`].
///
/// # Safety
///
/// Same requirements as [`lock`].
pub unsafe fn unlock(address: *mut u8, size: usize) -> bool {
    #[cfg(unix)]
    {
        munlock(address as *const c_void, size) == 0
    }
    #[cfg(windows)]
    {
        VirtualUnlock(address as *mut _, size) != 0
    }
}

/// Smallest huge page the system supports, in bytes. Zero when unknown.
pub fn minimum_huge_page_size() -> usize {
    #[cfg(unix)]
    {
        read_proc_meminfo(b"Hugepagesize:") * 1024
    }
    #[cfg(windows)]
    unsafe {
        GetLargePageMinimum()
    }
}

/// Whether a huge-page allocation has a chance of succeeding right now.
pub fn is_huge_page_available() -> bool {
    #[cfg(unix)]
    {
        if minimum_huge_page_size() == 0 {
            return false;
        }
        read_proc_meminfo(b"HugePages_Total:") > 0 || read_proc_meminfo(b"HugePages_Free:") > 0
    }
    #[cfg(windows)]
    unsafe {
        if GetLargePageMinimum() == 0 {
            return false;
        }
        // Large pages additionally need the SeLockMemoryPrivilege.
        let mut token: HANDLE = null_mut();
        if OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        ) == 0
        {
            return false;
        }

        let mut privileges: TOKEN_PRIVILEGES = core::mem::zeroed();
        let mut ok = LookupPrivilegeValueA(
            core::ptr::null(),
            b"SeLockMemoryPrivilege\0".as_ptr() as *const i8,
            &mut privileges.Privileges[0].Luid,
        ) != 0;

        if ok {
            privileges.PrivilegeCount = 1;
            privileges.Privileges[0].Attributes = SE_PRIVILEGE_ENABLED;
            ok = AdjustTokenPrivileges(token, FALSE, &mut privileges, 0, null_mut(), null_mut())
                != 0
                && GetLastError() == ERROR_SUCCESS;
        }

        CloseHandle(token);
        ok
    }
}

// Transparent huge pages change how we ask for huge pages on Linux:
// when THP is on, a plain mapping plus MADV_HUGEPAGE beats MAP_HUGETLB.
#[cfg(unix)]
fn thp_enabled() -> bool {
    // 0 = unknown, 1 = disabled, 2 = enabled
    static THP_STATE: AtomicU8 = AtomicU8::new(0);

    match THP_STATE.load(Ordering::Relaxed) {
        1 => false,
        2 => true,
        _ => {
            let enabled = probe_thp();
            THP_STATE.store(if enabled { 2 } else { 1 }, Ordering::Relaxed);
            enabled
        }
    }
}

#[cfg(unix)]
fn probe_thp() -> bool {
    let mut buffer = [0u8; 256];
    let read = read_file_raw(
        b"/sys/kernel/mm/transparent_hugepage/enabled\0",
        &mut buffer,
    );
    if read == 0 {
        return false;
    }
    let content = &buffer[..read];
    find_subslice(content, b"[always]").is_some() || find_subslice(content, b"[madvise]").is_some()
}

// Reads a numeric attribute out of /proc/meminfo. Runs inside allocation
// call stacks, so raw syscalls and stack buffers only.
#[cfg(unix)]
fn read_proc_meminfo(attribute: &[u8]) -> usize {
    let mut buffer = [0u8; 2048];
    let read = read_file_raw(b"/proc/meminfo\0", &mut buffer);
    if read == 0 {
        return 0;
    }
    let content = &buffer[..read];

    let start = match find_subslice(content, attribute) {
        Some(pos) => pos + attribute.len(),
        None => return 0,
    };

    let mut value = 0usize;
    let mut seen_digit = false;
    for &byte in &content[start..] {
        match byte {
            b'0'..=b'9' => {
                value = value * 10 + (byte - b'0') as usize;
                seen_digit = true;
            }
            b' ' | b'\t' if !seen_digit => {}
            _ => break,
        }
    }
    value
}

#[cfg(unix)]
fn read_file_raw(path: &[u8], buffer: &mut [u8]) -> usize {
    unsafe {
        let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY);
        if fd < 0 {
            return 0;
        }
        let read = libc::read(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len());
        libc::close(fd);
        if read > 0 {
            read as usize
        } else {
            0
        }
    }
}

#[cfg(unix)]
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
