//! Writer-preferring reader-writer lock for shared memory.
//!
//! The lock state is a fixed `#[repr(C)]` block embedded in the segment
//! header, driven from every process that maps it. A pending writer
//! announces itself by pulling `reader_count` negative; readers arriving
//! after the announce park on `reader_sem` instead of starving the writer,
//! and the last pre-announce reader hands the lock over via `writer_sem`.
//!
//! Lock and unlock are explicit calls rather than drop guards: a reader may
//! acquire the lock through one mapping and release it through another after
//! remapping a grown segment, which no borrowed guard can express.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::constants::MAX_READERS;
use crate::sem::Semaphore;

#[repr(C)]
pub struct RwLock {
    /// Held while a writer owns or is acquiring the lock.
    w: Semaphore,
    /// Writers park here until the last active reader departs.
    writer_sem: Semaphore,
    /// Readers that arrived behind a pending writer park here.
    reader_sem: Semaphore,
    reader_count: AtomicI32,
    reader_wait: AtomicI32,
}

const _: () = assert!(std::mem::size_of::<RwLock>() == 32);

impl RwLock {
    pub const fn new() -> Self {
        Self {
            w: Semaphore::new(1),
            writer_sem: Semaphore::new(0),
            reader_sem: Semaphore::new(0),
            reader_count: AtomicI32::new(0),
            reader_wait: AtomicI32::new(0),
        }
    }

    /// Initialize lock state in place. Only valid before the segment is
    /// visible to any other process.
    pub fn create(&self) {
        self.w.init(1);
        self.writer_sem.init(0);
        self.reader_sem.init(0);
        self.reader_count.store(0, Ordering::SeqCst);
        self.reader_wait.store(0, Ordering::SeqCst);
    }

    /// Acquire a shared (read) lock.
    pub fn rlock(&self) {
        if self.reader_count.fetch_add(1, Ordering::SeqCst) + 1 < 0 {
            // A writer is pending; wait our turn.
            self.writer_pending_park();
        }
    }

    #[cold]
    fn writer_pending_park(&self) {
        self.reader_sem
            .wait()
            .expect("reader semaphore wait failed");
    }

    /// Release a shared (read) lock.
    ///
    /// Panics when the lock is not read-held; that is a caller bug and the
    /// shared counters would be corrupt from here on.
    pub fn runlock(&self) {
        let r = self.reader_count.fetch_add(-1, Ordering::SeqCst) - 1;
        if r < 0 {
            if r + 1 == 0 || r + 1 == -MAX_READERS {
                panic!("runlock of unlocked RwLock");
            }
            // A writer is pending; the last departing reader unblocks it.
            if self.reader_wait.fetch_add(-1, Ordering::SeqCst) - 1 == 0 {
                self.writer_sem
                    .post()
                    .expect("writer semaphore post failed");
            }
        }
    }

    /// Acquire the exclusive (write) lock.
    ///
    /// Blocks new readers from the moment of the announce, then waits for
    /// the readers that were already active to drain.
    pub fn lock(&self) {
        self.w.wait().expect("writer mutex wait failed");

        // Announce: every reader arriving from here sees a negative count.
        let r = self.reader_count.fetch_add(-MAX_READERS, Ordering::SeqCst);

        // Wait for the r readers that were active at the announce.
        if r != 0 && self.reader_wait.fetch_add(r, Ordering::SeqCst) + r != 0 {
            self.writer_sem
                .wait()
                .expect("writer semaphore wait failed");
        }
    }

    /// Release the exclusive (write) lock.
    ///
    /// Panics when the lock is not write-held.
    pub fn unlock(&self) {
        let r = self.reader_count.fetch_add(MAX_READERS, Ordering::SeqCst) + MAX_READERS;
        if r >= MAX_READERS {
            panic!("unlock of unlocked RwLock");
        }

        // Unblock every reader that parked behind this writer.
        for _ in 0..r {
            self.reader_sem
                .post()
                .expect("reader semaphore post failed");
        }

        self.w.post().expect("writer mutex post failed");
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
