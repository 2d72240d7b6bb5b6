//! Anonymous memory mappings for the heap spaces.
//!
//! The collector carves its young semispaces and mature chunks out of large
//! anonymous mappings rather than the global allocator, so that space
//! membership can be decided by address arithmetic and so that whole spaces
//! can be returned to the OS at once.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the granularity the OS requires for placed mappings.
///
/// On Windows this is the allocation granularity (usually 64 KiB); on Unix it
/// is the page size. Address hints should be multiples of this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An owned anonymous mapping, unmapped on drop.
pub struct Mapping {
    inner: os::MapInner,
}

impl Mapping {
    /// Base of the mapping as a raw pointer.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Base of the mapping as an address.
    pub fn base(&self) -> usize {
        self.inner.ptr() as usize
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the mapping is empty (zero length mappings cannot be created,
    /// so this is always false for a live mapping).
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Whether `addr` falls inside this mapping.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.len()
    }
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Builder for an anonymous mapping.
#[derive(Debug, Clone)]
pub struct MapOptions {
    len: usize,
    hint_addr: usize,
}

impl MapOptions {
    /// Start a mapping request of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { len, hint_addr: 0 }
    }

    /// Ask the OS to place the mapping at `addr`.
    ///
    /// The hint is best effort: the returned mapping may live elsewhere if
    /// the range is taken. `addr` should be a multiple of
    /// [`allocation_granularity`].
    pub fn hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Create the mapping. The memory is readable, writable, and
    /// zero-initialized by the OS.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when the mapping cannot be created,
    /// which the caller treats as heap exhaustion.
    pub fn map(&self) -> io::Result<Mapping> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MapInner::map_anon(self.hint_addr, self.len)? };
        Ok(Mapping { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn page_size_is_a_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn granularity_covers_page_size() {
        let ag = allocation_granularity();
        assert_eq!(ag & (ag - 1), 0);
        assert!(ag >= page_size());
    }

    #[test]
    fn map_and_touch() {
        let len = 4 * page_size();
        let mapping = MapOptions::new(len).map().expect("mapping failed");

        assert!(!mapping.ptr().is_null());
        assert_eq!(mapping.base() % page_size(), 0);
        assert_eq!(mapping.len(), len);
        assert!(mapping.contains(mapping.base() + len - 1));
        assert!(!mapping.contains(mapping.base() + len));

        unsafe {
            ptr::write_volatile(mapping.ptr(), 0xA5);
            assert_eq!(ptr::read_volatile(mapping.ptr()), 0xA5);
        }
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(MapOptions::new(0).map().is_err());
    }

    #[test]
    fn hint_is_best_effort() {
        let len = allocation_granularity();

        #[cfg(target_pointer_width = "64")]
        let hint = 0x7100_0000_0000usize;
        #[cfg(target_pointer_width = "32")]
        let hint = 0x4000_0000usize;

        // The OS may or may not honor the hint; either way the mapping must
        // be usable.
        if let Ok(mapping) = MapOptions::new(len).hint(hint).map() {
            unsafe {
                ptr::write_volatile(mapping.ptr(), 7);
                assert_eq!(ptr::read_volatile(mapping.ptr()), 7);
            }
        }
    }
}
