//! Process-shared counting semaphore.
//!
//! The whole state is two 32-bit words, so a semaphore can live at any
//! 4-byte-aligned offset inside a `MAP_SHARED` mapping and be driven from
//! every process that maps it. Waiting and waking go through the shared
//! futex on the value word; everything else is plain CAS traffic.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::constants::SEM_VALUE_MAX;
use crate::platform;

#[repr(C)]
pub struct Semaphore {
    value: AtomicU32,
    waiters: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<Semaphore>() == 8);
const _: () = assert!(std::mem::align_of::<Semaphore>() == 4);

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            waiters: AtomicU32::new(0),
        }
    }

    /// (Re)initialize in place. Only valid while no other process is using
    /// the semaphore, i.e. before the segment is published.
    pub fn init(&self, value: u32) {
        self.value.store(value, Ordering::SeqCst);
        self.waiters.store(0, Ordering::SeqCst);
    }

    /// Decrement the value unless it is zero; returns the observed value
    /// (zero means the decrement did not happen).
    fn decrement_if_positive(&self) -> u32 {
        loop {
            let old = self.value.load(Ordering::SeqCst);
            if old == 0 {
                return 0;
            }
            if self
                .value
                .compare_exchange_weak(old, old - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return old;
            }
        }
    }

    /// Block until the value is positive, then take one unit.
    ///
    /// Wakeups race with other waiters, so the decrement is re-attempted
    /// after every futex return; a caller never observes a spurious wakeup.
    pub fn wait(&self) -> io::Result<()> {
        if self.decrement_if_positive() > 0 {
            return Ok(());
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        loop {
            if let Err(err) = platform::futex_wait(&self.value, 0) {
                match err.raw_os_error() {
                    // EAGAIN: the value changed before we parked.
                    // EINTR: signal; re-check like sem_wait(3) would retry.
                    Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                    _ => {
                        self.waiters.fetch_sub(1, Ordering::SeqCst);
                        return Err(err);
                    }
                }
            }
            if self.decrement_if_positive() > 0 {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    /// Add one unit and wake a waiter if any process has one parked.
    ///
    /// Safe to call after the process that performed `wait` has exited.
    /// Fails with `EOVERFLOW` at the value cap.
    pub fn post(&self) -> io::Result<()> {
        loop {
            let cur = self.value.load(Ordering::SeqCst);
            if cur == SEM_VALUE_MAX {
                return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
            }
            if self
                .value
                .compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        if self.waiters.load(Ordering::SeqCst) > 0 {
            platform::futex_wake(&self.value, 1)?;
        }
        Ok(())
    }
}
