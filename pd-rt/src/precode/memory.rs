//! Page pairs backing the precode heaps.
//!
//! A pair is two adjacent pages mapped together: the first holds replicated
//! stub templates and ends up read + execute, the second holds the per-slot
//! data blocks and stays read + write for the life of the pair.

use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::error::RtResult;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(os::page_size)
}

pub(crate) struct PagePair {
    base: NonNull<u8>,
    page_size: usize,
}

// SAFETY: the pair is plain memory; slots handed out from it are only
// mutated through atomics.
unsafe impl Send for PagePair {}
unsafe impl Sync for PagePair {}

impl PagePair {
    /// Maps a fresh pair and fills its code page with back-to-back copies
    /// of `template`. The code page is executable when this returns.
    pub(crate) fn with_template(template: &[u8], page_size: usize) -> RtResult<Self> {
        let base = os::map_read_write(page_size * 2)?;
        let pair = Self { base, page_size };
        let copies = page_size / template.len().max(1);
        for copy in 0..copies {
            // SAFETY: `copies * template.len()` never exceeds the code page,
            // which is still writable here.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    template.as_ptr(),
                    pair.base.as_ptr().add(copy * template.len()),
                    template.len(),
                );
            }
        }
        // Dropping `pair` on failure unmaps both pages.
        os::protect_read_exec(pair.base, page_size)?;
        os::flush_icache(pair.base, page_size);
        Ok(pair)
    }

    pub(crate) fn code_start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn code_range(&self) -> std::ops::Range<usize> {
        self.code_start()..self.code_start() + self.page_size
    }
}

impl Drop for PagePair {
    fn drop(&mut self) {
        os::unmap(self.base, self.page_size * 2);
    }
}

#[cfg(unix)]
mod os {
    use std::ptr::NonNull;

    use crate::error::{RtError, RtResult};

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 4096,
        }
    }

    pub(super) fn map_read_write(len: usize) -> RtResult<NonNull<u8>> {
        // SAFETY: an anonymous private mapping at a kernel-chosen address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RtError::OutOfMemory("precode page pair"));
        }
        NonNull::new(ptr.cast()).ok_or(RtError::OutOfMemory("precode page pair"))
    }

    pub(super) fn protect_read_exec(code: NonNull<u8>, len: usize) -> RtResult<()> {
        // SAFETY: `code` is the page-aligned start of a mapping we own.
        if unsafe { libc::mprotect(code.as_ptr().cast(), len, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            return Err(RtError::ExecutableMemory(format!(
                "cannot make precode page executable: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub(super) fn unmap(base: NonNull<u8>, len: usize) {
        // SAFETY: `base..base + len` is exactly one mapping from `map_read_write`.
        let rc = unsafe { libc::munmap(base.as_ptr().cast(), len) };
        if rc != 0 {
            tracing::warn!(
                "unmapping precode page pair at {:p} failed: {}",
                base,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    pub(super) fn flush_icache(code: NonNull<u8>, len: usize) {
        unsafe extern "C" {
            fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
        }
        // SAFETY: the range lies within one live mapping.
        unsafe { __clear_cache(code.as_ptr().cast(), code.as_ptr().add(len).cast()) };
    }

    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    pub(super) fn flush_icache(code: NonNull<u8>, len: usize) {
        unsafe extern "C" {
            fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
        }
        // SAFETY: the range lies within one live mapping.
        unsafe { sys_icache_invalidate(code.as_ptr().cast(), len) };
    }

    // x86 keeps instruction fetch coherent with stores.
    #[cfg(not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))))]
    pub(super) fn flush_icache(_code: NonNull<u8>, _len: usize) {}
}

#[cfg(windows)]
mod os {
    use std::ptr::NonNull;

    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use crate::error::{RtError, RtResult};

    pub(super) fn page_size() -> usize {
        // SAFETY: SYSTEM_INFO is plain data and GetSystemInfo fills it in.
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        info.dwPageSize as usize
    }

    pub(super) fn map_read_write(len: usize) -> RtResult<NonNull<u8>> {
        // SAFETY: reserving and committing fresh memory at a system-chosen address.
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        NonNull::new(ptr.cast()).ok_or(RtError::OutOfMemory("precode page pair"))
    }

    pub(super) fn protect_read_exec(code: NonNull<u8>, len: usize) -> RtResult<()> {
        let mut previous = 0u32;
        // SAFETY: `code` is the start of an allocation we own.
        if unsafe { VirtualProtect(code.as_ptr() as *const _, len, PAGE_EXECUTE_READ, &mut previous) } == 0 {
            return Err(RtError::ExecutableMemory(format!(
                "cannot make precode page executable: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub(super) fn unmap(base: NonNull<u8>, _len: usize) {
        // SAFETY: `base` came from `VirtualAlloc` and is released once.
        if unsafe { VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE) } == 0 {
            tracing::warn!(
                "releasing precode page pair at {:p} failed: {}",
                base,
                std::io::Error::last_os_error()
            );
        }
    }

    pub(super) fn flush_icache(code: NonNull<u8>, len: usize) {
        // SAFETY: the range lies within one live allocation.
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), code.as_ptr() as *const _, len);
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use std::ptr::NonNull;

    use crate::error::{RtError, RtResult};

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn map_read_write(_len: usize) -> RtResult<NonNull<u8>> {
        Err(RtError::ExecutableMemory(
            "precode pages cannot be mapped on this platform".to_string(),
        ))
    }

    pub(super) fn protect_read_exec(_code: NonNull<u8>, _len: usize) -> RtResult<()> {
        Ok(())
    }

    pub(super) fn unmap(_base: NonNull<u8>, _len: usize) {}

    pub(super) fn flush_icache(_code: NonNull<u8>, _len: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_page_is_tiled_with_the_template() {
        let page = page_size();
        let template = [0xCCu8, 0x90, 0x90, 0xC3];
        let pair = PagePair::with_template(&template, page).expect("page pair");
        assert_eq!(pair.code_range().len(), page);
        assert_eq!(pair.code_start() % page, 0);
        // SAFETY: the code page is mapped readable.
        let code = unsafe { std::slice::from_raw_parts(pair.code_start() as *const u8, page) };
        assert!(code.chunks(template.len()).all(|chunk| chunk == template));
    }

    #[test]
    fn data_page_stays_writable() {
        let page = page_size();
        let pair = PagePair::with_template(&[0xCC; 32], page).expect("page pair");
        let data = (pair.code_start() + page) as *mut u64;
        // SAFETY: the second page of the pair is mapped read + write.
        unsafe {
            data.write(0x1234);
            assert_eq!(data.read(), 0x1234);
        }
    }
}
