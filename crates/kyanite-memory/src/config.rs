//! Memory configuration.
//!
//! All tunables live on a plain struct handed to [`crate::ObjectMemory`] at
//! construction; nothing here is process global. The defaults mirror the
//! production runtime configuration.

/// Tunables for the object memory core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total bytes reserved for the young generation. Two equal halves
    /// alternate as from-space and to-space, so half of this is usable at
    /// any time.
    pub young_bytes: usize,
    /// Size of the per-thread young allocation slab.
    pub slab_size: usize,
    /// Number of young collections an object must survive before it is
    /// promoted to the mature space.
    pub promotion_age: u8,
    /// Allocation requests above this many bytes bypass the young and
    /// mature spaces and go straight to the large space.
    pub large_object_threshold: usize,
    /// Bytes of untracked foreign allocation permitted between mature
    /// collections.
    pub malloc_threshold: usize,
    /// Run mature marking on a dedicated thread, overlapped with mutation.
    pub immix_concurrent: bool,
    /// Blocks with at least this many holes after a sweep are evacuation
    /// candidates in the next mature collection.
    pub evacuation_hole_threshold: u32,
    /// Mark stack entry limit. Past this, tracing falls back to re-scanning
    /// dirty blocks instead of growing further.
    pub mark_stack_limit: usize,
    /// When set, allocation, promotion, and scanning of the object at this
    /// address is logged. Disabled (and free) when `None`.
    pub watch_address: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            young_bytes: 8 * 1024 * 1024,
            slab_size: 4096,
            promotion_age: 2,
            large_object_threshold: 2700,
            malloc_threshold: 100 * 1024 * 1024,
            immix_concurrent: false,
            evacuation_hole_threshold: 4,
            mark_stack_limit: 1 << 20,
            watch_address: None,
        }
    }
}

impl Config {
    /// Usable bytes in one young semispace half.
    pub fn young_half_bytes(&self) -> usize {
        self.young_bytes / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.slab_size <= config.young_half_bytes());
        assert!(config.large_object_threshold > 0);
        assert!(config.promotion_age >= 1);
        assert!(config.watch_address.is_none());
    }
}
