//! Inflated headers: the side records a packed header word grows into.
//!
//! When an object needs more than one of identity, a foreign handle, or a
//! real mutex — or a thin lock sees contention — its header word is promoted
//! to `Inflated` and the state moves into a record here. Records live in a
//! chunked slab with stable addresses and stable 32-bit indices: compaction
//! copies the index, never the record.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::header::HeaderWord;

/// Records per slab chunk.
const CHUNK_RECORDS: usize = 1024;

/// Outcome of a lock operation.
///
/// Timeout and interruption are expected outcomes of a contended acquire,
/// not faults; `Error` means the caller raced a state change (for example
/// an inflation that lost) and should re-read the header and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Locked,
    Unlocked,
    Timeout,
    Interrupted,
    Error,
}

struct MutexState {
    /// Owning thread id; 0 when unowned.
    owner: u32,
    recursion: u32,
}

/// A side record carrying everything a packed header cannot: the saved
/// identity, the foreign handle, and a recursive mutex with a real wait
/// queue. One per inflated object; address-stable for the object's
/// lifetime.
pub struct InflatedHeader {
    in_use: AtomicBool,
    /// Mark epoch of the owning object's last trace.
    mark: AtomicU8,
    /// Identity carried over from an `ObjId` header, or assigned later.
    /// Zero means unassigned.
    object_id: AtomicU64,
    /// Foreign handle cookie; zero means none.
    handle: AtomicUsize,
    mutex: Mutex<MutexState>,
    waiters: Condvar,
}

impl InflatedHeader {
    fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            mark: AtomicU8::new(0),
            object_id: AtomicU64::new(0),
            handle: AtomicUsize::new(0),
            mutex: Mutex::new(MutexState {
                owner: 0,
                recursion: 0,
            }),
            waiters: Condvar::new(),
        }
    }

    /// Return the record to its freshly allocated state.
    fn reset(&self) {
        self.object_id.store(0, Ordering::SeqCst);
        self.handle.store(0, Ordering::SeqCst);
        self.mark.store(0, Ordering::SeqCst);
        let mut state = self.mutex.lock();
        state.owner = 0;
        state.recursion = 0;
    }

    /// Absorb the state of the lightweight header this record replaces.
    pub fn absorb(&self, word: HeaderWord) {
        match word.meaning() {
            crate::header::Meaning::Empty => {}
            crate::header::Meaning::ObjId => {
                self.set_object_id(word.object_id());
            }
            crate::header::Meaning::ThinLock => {
                self.initialize_mutex(word.lock_owner(), word.lock_count());
            }
            crate::header::Meaning::Inflated => {
                unreachable!("absorbing an already inflated header")
            }
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id.load(Ordering::SeqCst)
    }

    pub fn set_object_id(&self, id: u64) {
        self.object_id.store(id, Ordering::SeqCst);
    }

    pub fn handle(&self) -> Option<usize> {
        match self.handle.load(Ordering::SeqCst) {
            0 => None,
            h => Some(h),
        }
    }

    pub fn set_handle(&self, handle: usize) {
        self.handle.store(handle, Ordering::SeqCst);
    }

    pub fn clear_handle(&self) {
        self.handle.store(0, Ordering::SeqCst);
    }

    /// Seed the mutex with the owner and recursion count carried over from
    /// a thin lock. Ownership must survive inflation exactly.
    pub fn initialize_mutex(&self, owner: u32, recursion: u32) {
        let mut state = self.mutex.lock();
        state.owner = owner;
        state.recursion = recursion;
    }

    /// Acquire the mutex for `tid`, recursively.
    ///
    /// `timeout` bounds the wait; `interrupt`, when it flips true, aborts
    /// it. Both exits leave the mutex state untouched.
    pub fn lock(
        &self,
        tid: u32,
        timeout: Option<std::time::Duration>,
        interrupt: Option<&AtomicBool>,
    ) -> LockStatus {
        debug_assert!(tid != 0);
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut state = self.mutex.lock();

        if state.owner == tid {
            state.recursion += 1;
            return LockStatus::Locked;
        }

        while state.owner != 0 {
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return LockStatus::Timeout;
                    }
                    let result = self.waiters.wait_until(&mut state, deadline);
                    if result.timed_out() && state.owner != 0 {
                        return LockStatus::Timeout;
                    }
                }
                None => {
                    if interrupt.is_some() {
                        // Bounded waits so a raised interrupt flag is
                        // noticed even without a wakeup.
                        let _ = self
                            .waiters
                            .wait_for(&mut state, std::time::Duration::from_millis(10));
                    } else {
                        self.waiters.wait(&mut state);
                    }
                }
            }
            if let Some(flag) = interrupt {
                if flag.swap(false, Ordering::SeqCst) {
                    return LockStatus::Interrupted;
                }
            }
        }

        state.owner = tid;
        state.recursion = 1;
        LockStatus::Locked
    }

    /// Release one recursion level held by `tid`.
    pub fn unlock(&self, tid: u32) -> LockStatus {
        let mut state = self.mutex.lock();
        if state.owner != tid {
            return LockStatus::Error;
        }
        state.recursion -= 1;
        if state.recursion == 0 {
            state.owner = 0;
            drop(state);
            self.waiters.notify_one();
        }
        LockStatus::Unlocked
    }

    /// Current owner and recursion count, for diagnostics and tests.
    pub fn lock_state(&self) -> (u32, u32) {
        let state = self.mutex.lock();
        (state.owner, state.recursion)
    }

    /// Stamp this record with the epoch of its owner's trace.
    pub fn mark(&self, epoch: u8) {
        self.mark.store(epoch, Ordering::SeqCst);
    }

    fn marked(&self, epoch: u8) -> bool {
        self.mark.load(Ordering::SeqCst) == epoch
    }
}

/// The slab of inflated records.
///
/// Single producer per object (installation runs under the inflation
/// spinlock), arbitrary readers. Chunks are only ever appended, so record
/// addresses handed out by [`InflatedHeaderTable::get`] stay valid until
/// the table itself is dropped.
pub struct InflatedHeaderTable {
    chunks: RwLock<Vec<Box<[InflatedHeader]>>>,
    free: Mutex<Vec<u32>>,
    in_use: AtomicUsize,
}

impl InflatedHeaderTable {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Number of live records.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Allocate a fresh record, growing the slab by a chunk if the free
    /// list is empty. The record is stamped with `epoch` so the collection
    /// that triggered the inflation does not immediately reap it.
    pub fn allocate(&self, epoch: u8) -> u32 {
        let index = {
            let mut free = self.free.lock();
            if let Some(index) = free.pop() {
                index
            } else {
                let mut chunks = self.chunks.write();
                let base = (chunks.len() * CHUNK_RECORDS) as u32;
                let chunk: Vec<InflatedHeader> =
                    (0..CHUNK_RECORDS).map(|_| InflatedHeader::new()).collect();
                chunks.push(chunk.into_boxed_slice());
                // Hand out the first record; the rest feed the free list.
                free.extend((1..CHUNK_RECORDS as u32).map(|i| base + i).rev());
                base
            }
        };
        let record = self.get(index);
        record.reset();
        record.mark(epoch);
        record.in_use.store(true, Ordering::SeqCst);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        index
    }

    /// Return a record whose installation lost its CAS. The caller must
    /// be the allocating thread and must not have published the index.
    pub fn release(&self, index: u32) {
        let record = self.get(index);
        record.in_use.store(false, Ordering::SeqCst);
        record.reset();
        self.free.lock().push(index);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Look up a record by index. O(1).
    pub fn get(&self, index: u32) -> &InflatedHeader {
        let chunks = self.chunks.read();
        let chunk = index as usize / CHUNK_RECORDS;
        let slot = index as usize % CHUNK_RECORDS;
        debug_assert!(chunk < chunks.len(), "inflated header index {index} out of range");
        let record: *const InflatedHeader = &chunks[chunk][slot];
        // SAFETY: chunks are append-only boxed slices; the record's address
        // is stable for the table's lifetime, so the reference may outlive
        // the read guard.
        unsafe { &*record }
    }

    /// Free every record whose owning object was not traced this epoch.
    /// Runs at the end of a mature collection, after every mark check.
    pub fn sweep(&self, epoch: u8) -> usize {
        // Free list before chunks, the same order `allocate` uses.
        let mut free = self.free.lock();
        let chunks = self.chunks.read();
        let mut reclaimed = 0;
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            for (slot, record) in chunk.iter().enumerate() {
                if record.in_use.load(Ordering::SeqCst) && !record.marked(epoch) {
                    record.in_use.store(false, Ordering::SeqCst);
                    record.reset();
                    free.push((chunk_index * CHUNK_RECORDS + slot) as u32);
                    reclaimed += 1;
                }
            }
        }
        self.in_use.fetch_sub(reclaimed, Ordering::Relaxed);
        reclaimed
    }
}

impl Default for InflatedHeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn allocate_get_and_reuse() {
        let table = InflatedHeaderTable::new();
        let a = table.allocate(2);
        let b = table.allocate(2);
        assert_ne!(a, b);
        assert_eq!(table.in_use(), 2);

        table.get(a).set_object_id(41);
        assert_eq!(table.get(a).object_id(), 41);
        assert_eq!(table.get(b).object_id(), 0);

        // Neither record was re-marked for epoch 3, so both are reclaimed.
        assert_eq!(table.sweep(3), 2);
        assert_eq!(table.in_use(), 0);

        let c = table.allocate(3);
        assert_eq!(table.get(c).object_id(), 0, "recycled record must be clean");
    }

    #[test]
    fn sweep_spares_marked_records() {
        let table = InflatedHeaderTable::new();
        let a = table.allocate(2);
        let b = table.allocate(2);
        table.get(a).mark(3);
        assert_eq!(table.sweep(3), 1);
        assert_eq!(table.in_use(), 1);
        let _ = b;
    }

    #[test]
    fn record_addresses_survive_growth() {
        let table = InflatedHeaderTable::new();
        let first = table.allocate(2);
        let first_addr = table.get(first) as *const InflatedHeader as usize;
        // Force several chunk growths.
        for _ in 0..3 * CHUNK_RECORDS {
            table.allocate(2);
        }
        assert_eq!(table.get(first) as *const InflatedHeader as usize, first_addr);
    }

    #[test]
    fn recursive_lock_and_unlock() {
        let record = InflatedHeader::new();
        assert_eq!(record.lock(7, None, None), LockStatus::Locked);
        assert_eq!(record.lock(7, None, None), LockStatus::Locked);
        assert_eq!(record.lock_state(), (7, 2));
        assert_eq!(record.unlock(7), LockStatus::Unlocked);
        assert_eq!(record.lock_state(), (7, 1));
        assert_eq!(record.unlock(7), LockStatus::Unlocked);
        assert_eq!(record.lock_state(), (0, 0));
        assert_eq!(record.unlock(7), LockStatus::Error);
    }

    #[test]
    fn thin_lock_state_survives_absorb() {
        let record = InflatedHeader::new();
        record.absorb(HeaderWord::thin_lock(9, 3, true));
        assert_eq!(record.lock_state(), (9, 3));

        let record = InflatedHeader::new();
        record.absorb(HeaderWord::with_object_id(512));
        assert_eq!(record.object_id(), 512);
    }

    #[test]
    fn lock_times_out() {
        let record = Arc::new(InflatedHeader::new());
        assert_eq!(record.lock(1, None, None), LockStatus::Locked);

        let contender = Arc::clone(&record);
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            contender.lock(2, Some(Duration::from_millis(50)), None)
        });
        assert_eq!(handle.join().unwrap(), LockStatus::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(record.lock_state(), (1, 1));
    }

    #[test]
    fn lock_hands_over() {
        let record = Arc::new(InflatedHeader::new());
        assert_eq!(record.lock(1, None, None), LockStatus::Locked);

        let contender = Arc::clone(&record);
        let handle = std::thread::spawn(move || contender.lock(2, None, None));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(record.unlock(1), LockStatus::Unlocked);
        assert_eq!(handle.join().unwrap(), LockStatus::Locked);
        assert_eq!(record.lock_state(), (2, 1));
    }
}
