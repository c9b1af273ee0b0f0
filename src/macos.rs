use core::cmp;
use core::ptr;

use crate::common::align_up;

/// Address space reserved for the heap arena in one go. Darwin commits
/// anonymous pages lazily, so the mapping itself is cheap.
const ARENA_RESERVE: usize = 1 << 30;

pub fn page_size() -> usize {
    0x4000
}

pub unsafe fn alloc(size: usize) -> (*mut u8, usize) {
    let len = align_up(cmp::max(size, ARENA_RESERVE), page_size());
    let addr = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_WRITE | libc::PROT_READ,
        libc::MAP_ANON | libc::MAP_PRIVATE,
        -1,
        0,
    );
    if addr == libc::MAP_FAILED {
        (ptr::null_mut(), 0)
    } else {
        (addr as *mut u8, len)
    }
}

/// The whole arena is reserved up front; there is nothing to extend into.
pub unsafe fn extend(_end: *mut u8, _size: usize) -> usize {
    0
}

pub unsafe fn free(ptr: *mut u8, size: usize) -> bool {
    libc::munmap(ptr as *mut _, size) == 0
}

#[cfg(feature = "global")]
static mut LOCK: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

#[cfg(feature = "global")]
pub fn acquire_global_lock() {
    unsafe { assert_eq!(libc::pthread_mutex_lock(&mut LOCK), 0) }
}

#[cfg(feature = "global")]
pub fn release_global_lock() {
    unsafe { assert_eq!(libc::pthread_mutex_unlock(&mut LOCK), 0) }
}
