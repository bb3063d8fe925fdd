//! Error taxonomy for writer, reader and set operations.

use std::fmt;
use std::io;
use std::net::IpAddr;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failure kinds surfaced by this crate.
#[derive(Debug)]
pub enum Error {
    /// Operation on a server or client whose shared memory was closed.
    Closed,
    /// `batch()` while a batch is already open.
    AlreadyBatching,
    /// `commit()` without a preceding `batch()`.
    NotBatching,
    /// The mapped segment fails header validation: wrong version sentinel,
    /// truncated file, or descriptors pointing outside the mapping.
    InvalidSharedMemory,
    /// An address that cannot be classified into a blockable family.
    InvalidAddress(IpAddr),
    /// A range operation covering more records than the platform allows.
    RangeTooLarge,
    /// Malformed persistence stream; load left the blocklist untouched.
    InvalidData(Option<io::Error>),
    /// A shared read lock could not be released. Serious: the segment may
    /// stay locked for every process until the writer is restarted.
    LockReleaseFailed(Option<io::Error>),
    /// OS error passthrough (`NotFound`, `AlreadyExists`, `InvalidInput`, …).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "shared memory closed"),
            Error::AlreadyBatching => write!(f, "already batching"),
            Error::NotBatching => write!(f, "not batching"),
            Error::InvalidSharedMemory => write!(f, "invalid shared memory"),
            Error::InvalidAddress(ip) => write!(f, "invalid address: {ip}"),
            Error::RangeTooLarge => write!(f, "range too large"),
            Error::InvalidData(None) => write!(f, "invalid data"),
            Error::InvalidData(Some(err)) => write!(f, "invalid data: {err}"),
            Error::LockReleaseFailed(None) => write!(f, "failed to release read lock"),
            Error::LockReleaseFailed(Some(err)) => {
                write!(f, "failed to release read lock: {err}")
            }
            Error::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidData(Some(err))
            | Error::LockReleaseFailed(Some(err))
            | Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_inner_error() {
        let inner = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err = Error::InvalidData(Some(inner));
        assert_eq!(err.to_string(), "invalid data: short read");
        assert_eq!(Error::InvalidData(None).to_string(), "invalid data");
    }

    #[test]
    fn io_errors_pass_through_their_kind() {
        let err = Error::from(io::Error::from(io::ErrorKind::NotFound));
        match err {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }
}
