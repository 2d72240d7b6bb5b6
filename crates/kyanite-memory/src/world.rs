//! The stop-the-world protocol.
//!
//! Dependent threads are counted in `pending`. A driver raising the stop
//! flag waits until it is the only pending thread; every other dependent
//! thread either blocks at a checkpoint or has declared itself independent.
//! Restarting lowers the flag and broadcasts. The protocol is cooperative
//! throughout: there is no preemption, only polls.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::threads::{RunState, ThreadRecord};

struct WorldInner {
    /// Dependent threads, the would-be driver included.
    pending: usize,
    should_stop: bool,
}

pub struct WorldState {
    inner: Mutex<WorldInner>,
    /// Signalled each time `pending` drops; the driver waits here.
    waiting_to_stop: Condvar,
    /// Signalled when the world restarts; stopped threads wait here.
    waiting_to_run: Condvar,
    /// Mirror of `should_stop` for the lock-free poll fast path.
    stop_flag: AtomicBool,
}

impl WorldState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WorldInner {
                pending: 0,
                should_stop: false,
            }),
            waiting_to_stop: Condvar::new(),
            waiting_to_run: Condvar::new(),
            stop_flag: AtomicBool::new(false),
        }
    }

    /// Lock-free poll: does some driver want the world stopped?
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Number of dependent threads; for diagnostics.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    /// Enter the dependent set. Blocks while the world is stopped, so a
    /// thread returning from foreign code cannot touch managed objects
    /// mid-collection.
    pub fn become_dependent(&self, record: &ThreadRecord) {
        let mut inner = self.inner.lock();
        while inner.should_stop {
            self.waiting_to_run.wait(&mut inner);
        }
        inner.pending += 1;
        record.set_run_state(RunState::Dependent);
    }

    /// Leave the dependent set; the collector will no longer wait for this
    /// thread.
    pub fn become_independent(&self, record: &ThreadRecord) {
        self.leave(record, RunState::Independent);
    }

    /// Like independent, but recorded as parked on a condition variable.
    pub fn become_sleeping(&self, record: &ThreadRecord) {
        self.leave(record, RunState::Sleeping);
    }

    fn leave(&self, record: &ThreadRecord, state: RunState) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.pending > 0, "independent transition while not dependent");
        inner.pending -= 1;
        record.set_run_state(state);
        drop(inner);
        self.waiting_to_stop.notify_one();
    }

    /// The safepoint: if a driver wants the world stopped, step out of the
    /// pending set, block until the restart broadcast, and step back in.
    /// Returns true when the thread actually paused.
    pub fn checkpoint(&self, record: &ThreadRecord) -> bool {
        if !self.should_stop() {
            return false;
        }
        let mut inner = self.inner.lock();
        if !inner.should_stop {
            return false;
        }
        inner.pending -= 1;
        record.set_run_state(RunState::Sleeping);
        self.waiting_to_stop.notify_one();
        while inner.should_stop {
            self.waiting_to_run.wait(&mut inner);
        }
        inner.pending += 1;
        record.set_run_state(RunState::Dependent);
        true
    }

    /// Raise the stop flag and wait until every other dependent thread has
    /// reached a checkpoint or gone independent.
    ///
    /// Returns false without waiting when another driver already holds the
    /// stop flag; the caller must checkpoint (cooperating with that peer)
    /// and retry.
    pub fn stop_the_world(&self, _record: &ThreadRecord) -> bool {
        let mut inner = self.inner.lock();
        if inner.should_stop {
            return false;
        }
        inner.should_stop = true;
        self.stop_flag.store(true, Ordering::Release);
        while inner.pending > 1 {
            self.waiting_to_stop.wait(&mut inner);
        }
        true
    }

    /// Lower the stop flag and wake every thread blocked at a checkpoint
    /// or in `become_dependent`.
    pub fn restart_world(&self, _record: &ThreadRecord) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.should_stop, "restart without a stopped world");
        inner.should_stop = false;
        self.stop_flag.store(false, Ordering::Release);
        drop(inner);
        self.waiting_to_run.notify_all();
    }

    /// Reset after `fork`: the child has exactly one thread and no
    /// collection in flight. Any mutex state inherited from threads that
    /// no longer exist is discarded.
    pub(crate) fn reinit(&self) {
        // SAFETY: only called from the single surviving thread immediately
        // after fork, when no other thread can hold the lock.
        unsafe {
            if self.inner.is_locked() {
                self.inner.force_unlock();
            }
        }
        let mut inner = self.inner.lock();
        inner.pending = 1;
        inner.should_stop = false;
        self.stop_flag.store(false, Ordering::Release);
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}
