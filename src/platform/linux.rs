//! Linux syscall surface: futex wait/wake on shared words, `/dev/shm` name
//! handling and sysconf probes.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::AtomicU32;

use errno::errno;

/// POSIX shared-memory objects surface here on Linux.
const DEV_SHM: &str = "/dev/shm/";

/// Block until `*word != expected` or a wakeup arrives.
///
/// Uses a process-shared futex (no `FUTEX_PRIVATE_FLAG`): the word may live
/// in a `MAP_SHARED` mapping touched by other processes. Returns `EAGAIN`
/// when the word already differs and `EINTR` on signal delivery; callers
/// treat both as a cue to re-check the word.
pub fn futex_wait(word: &AtomicU32, expected: u32) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
        )
    };
    if rc == -1 {
        Err(io::Error::from_raw_os_error(errno().0))
    } else {
        Ok(())
    }
}

/// Wake up to `count` waiters parked on `word`.
pub fn futex_wake(word: &AtomicU32, count: i32) -> io::Result<usize> {
    let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count) };
    if rc == -1 {
        Err(io::Error::from_raw_os_error(errno().0))
    } else {
        Ok(rc as usize)
    }
}

/// Map a `/name` shared-memory identifier to its `/dev/shm` path.
///
/// The name must begin with `/` and contain at least one non-slash
/// character, mirroring `shm_open(3)` name rules.
pub fn shm_path(name: &str) -> io::Result<PathBuf> {
    if !name.starts_with('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "shared memory name must begin with '/'",
        ));
    }
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid shared memory name",
        ));
    }
    let mut path = PathBuf::from(DEV_SHM);
    path.push(trimmed);
    Ok(path)
}

/// Exclusively create a named shared-memory object.
pub fn shm_create_excl(name: &str, mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(mode)
        .custom_flags(libc::O_CLOEXEC)
        .open(shm_path(name)?)
}

/// Open an existing named shared-memory object read-write.
///
/// Read-write even for readers: taking the shared read lock mutates lock
/// state embedded in the segment.
pub fn shm_open(name: &str) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(shm_path(name)?)
}

/// Remove a shared-memory object name; existing mappings stay valid.
pub fn shm_unlink(name: &str) -> io::Result<()> {
    std::fs::remove_file(shm_path(name)?)
}

pub fn cacheline_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
    if size > 0 {
        size as usize
    } else {
        64
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_path_requires_leading_slash() {
        assert!(shm_path("no-slash").is_err());
        assert!(shm_path("/").is_err());
        assert!(shm_path("///").is_err());
        assert!(shm_path("/a/b").is_err());
        assert_eq!(
            shm_path("//name").unwrap(),
            PathBuf::from("/dev/shm/name")
        );
    }

    #[test]
    fn futex_wait_returns_eagain_on_changed_word() {
        let word = AtomicU32::new(1);
        let err = futex_wait(&word, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn futex_wake_with_no_waiters_wakes_nobody() {
        let word = AtomicU32::new(0);
        assert_eq!(futex_wake(&word, 1).unwrap(), 0);
    }
}
