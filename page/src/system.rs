use std::ptr::NonNull;

/// Request `len` bytes of zeroed, page-aligned memory from the OS.
///
/// Out-of-memory is observable as `None`, never a panic.
#[must_use]
pub fn map_memory(len: usize) -> Option<NonNull<u8>> {
    debug_assert!(len > 0);
    // SAFETY: anonymous private mapping, no file descriptor, zero offset.
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(p.cast::<u8>())
}

/// Return a mapping obtained from [`map_memory`] to the OS.
pub fn unmap_memory(ptr: NonNull<u8>, len: usize) {
    // SAFETY: ptr/len must describe exactly one prior map_memory call.
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        let p = map_memory(8192).expect("mapping 8 KiB should succeed");
        // Fresh anonymous mappings are zeroed and writable.
        unsafe {
            assert_eq!(*p.as_ptr(), 0);
            *p.as_ptr() = 0xAB;
            assert_eq!(*p.as_ptr(), 0xAB);
        }
        unmap_memory(p, 8192);
    }
}
