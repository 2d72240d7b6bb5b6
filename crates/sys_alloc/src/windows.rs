use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the allocation granularity `VirtualAlloc` requires for placed
/// mappings (typically 64 KiB, larger than the 4 KiB page size).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MapInner {
    /// Creates an anonymous read-write mapping, optionally near `hint_addr`.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`; the caller owns the returned region and must not
    /// let references into it outlive the `MapInner`.
    pub unsafe fn map_anon(hint_addr: usize, len: usize) -> io::Result<MapInner> {
        let addr = if hint_addr == 0 {
            ptr::null()
        } else {
            hint_addr as *const std::ffi::c_void
        };

        // Reserve and commit together; the heaps touch their spaces eagerly.
        let mut ptr = unsafe { VirtualAlloc(addr, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

        // The hint is best effort: fall back to letting the OS place it.
        if ptr.is_null() && !addr.is_null() {
            ptr =
                unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        }

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(MapInner { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires the size argument to be 0.
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}
