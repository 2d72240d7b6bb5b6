//! Low-level synchronization primitives and the lock ordering discipline.
//!
//! The memory core uses two kinds of locks: spinlocks for the short critical
//! sections on the allocation and inflation paths, and parking-lot mutexes
//! with condition variables where threads genuinely sleep (world state,
//! contention, inflated-record mutexes).
//!
//! ## Global lock order
//!
//! All locks must be acquired in increasing order:
//!
//! | Order | Lock                  | Guards                                 |
//! |-------|-----------------------|----------------------------------------|
//! | 1     | Allocation spinlock   | young bump pointer, immix cursors      |
//! | 1     | Inflation spinlock    | inflated-header installation           |
//! | 2     | Mark state            | mark stack, marker handoff             |
//! | 3     | World state           | safepoint protocol, thread registry    |
//!
//! Locks of equal order are never nested in each other. In debug builds the
//! order is validated on every spinlock acquisition.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lock order tags, lowest acquired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockOrder {
    /// Young bump pointer and immix allocation cursors.
    Allocation = 1,
    /// Inflated-header installation.
    Inflation = 2,
    /// Mark stack and concurrent-marker handoff.
    MarkState = 3,
    /// Safepoint protocol and thread registry.
    World = 4,
}

thread_local! {
    static HELD_ORDERS: RefCell<Vec<LockOrder>> = const { RefCell::new(Vec::new()) };
}

/// Record an acquisition, panicking on an ordering violation (debug only).
#[inline]
pub(crate) fn note_acquire(order: LockOrder) {
    if cfg!(debug_assertions) {
        HELD_ORDERS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.last() {
                assert!(
                    order > top,
                    "lock order violation: acquiring {order:?} while holding {top:?}"
                );
            }
            held.push(order);
        });
    }
}

/// Record a release (debug only).
#[inline]
pub(crate) fn note_release(order: LockOrder) {
    if cfg!(debug_assertions) {
        HELD_ORDERS.with(|held| {
            let mut held = held.borrow_mut();
            let top = held.pop();
            debug_assert_eq!(top, Some(order), "locks released out of order");
        });
    }
}

/// A test-and-test-and-set spinlock for short critical sections.
///
/// Holders must not block or allocate through the facade while the lock is
/// held; the collector never takes spinlocks on behalf of a stopped thread.
pub struct SpinLock {
    locked: AtomicBool,
    order: LockOrder,
}

impl SpinLock {
    pub const fn new(order: LockOrder) -> Self {
        Self {
            locked: AtomicBool::new(false),
            order,
        }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinGuard<'_> {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                break;
            }
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        note_acquire(self.order);
        SpinGuard { lock: self }
    }

    /// Force the lock back to the released state.
    ///
    /// Only valid after `fork`, when the sole surviving thread may have
    /// inherited a lock held by a thread that no longer exists.
    pub fn reinit(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard for [`SpinLock`]; releases on drop.
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        note_release(self.lock.order);
        self.lock.locked.store(false, Ordering::Release);
    }
}
