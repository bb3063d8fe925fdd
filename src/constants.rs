//! Crate-wide constants and one-time probed system sizes.

use once_cell::sync::Lazy;

use crate::platform;

/// 31-bit layout sentinel stored in the shared header's `version` field.
///
/// Bit 31 carries the platform pointer-size bit (set on 64-bit targets), so
/// a 32-bit reader can never mistake a 64-bit segment for its own layout and
/// vice versa.
const VERSION_BASE: u32 = 0x0b10_c4ad;

/// The full version sentinel for this build.
pub const VERSION: u32 = VERSION_BASE | (((usize::BITS == 64) as u32) << 31);

/// Upper bound on concurrent readers of the shared RW-lock.
///
/// Doubles as the announce quantum a pending writer subtracts from the
/// reader count.
pub const MAX_READERS: i32 = 1 << 30;

/// Largest value a process-shared semaphore may hold.
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

/// Magic prefix of the save/load stream format.
pub const PERSIST_MAGIC: &[u8; 24] = b"ip-blocker-agent-v1\0\xb1\x0c\x11\x57";

/// Widest range operation allowed on this platform, in address bits.
pub const MAX_RANGE_BITS: u32 = if usize::BITS >= 64 { 62 } else { 30 };

/// Record widths of the three address families, in bytes.
pub const IPV4_LEN: usize = 4;
pub const IPV6_LEN: usize = 16;
pub const IPV6_ROUTE_LEN: usize = 8;

/// L1 data cache line size; payload regions are aligned to this.
pub static CACHELINE_SIZE: Lazy<usize> = Lazy::new(platform::cacheline_size);

/// System page size; the segment file size is aligned to this.
pub static PAGE_SIZE: Lazy<usize> = Lazy::new(platform::page_size);
