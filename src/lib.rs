//! Cross-process shared-memory IP blocklist.
//!
//! One writer process ([`Server`]) owns the authoritative set of blocked
//! IPv4 addresses, IPv6 addresses and IPv6 /64 route prefixes. Any number
//! of reader processes ([`Client`]) map the same named POSIX shared-memory
//! object and answer membership queries with a binary search over sorted
//! payload bytes, holding a writer-preferring process-shared read lock for
//! the duration of the lookup.
//!
//! Updates are published with a two-phase commit: the writer lays a fresh
//! copy of the payloads past the end of the file, flips the header's
//! region descriptors to it under the write lock, rewrites the payloads at
//! their canonical offsets, flips again and only then shrinks the file.
//! Readers are never flipped to bytes outside the file's current length,
//! and detect growth through the header revision, remapping before the
//! next answer.
//!
//! ```no_run
//! use ip_blocker::{Client, Server};
//!
//! let server = Server::new("/my-blocklist", 0o600)?;
//! server.insert_range("192.0.2.0".parse()?, 24)?;
//!
//! let client = Client::open("/my-blocklist")?;
//! assert!(client.contains("192.0.2.7".parse()?)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod constants;
pub mod errors;
pub mod incr;
pub mod layout;
pub mod platform;
pub mod rwlock;
pub mod sem;
pub mod shm;
pub mod sorted_set;

mod addr;
mod client;
mod server;

pub use client::Client;
pub use errors::{Error, Result};
pub use server::Server;
pub use shm::unlink;
