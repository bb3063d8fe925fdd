//! The blocklist reader.
//!
//! A `Client` maps the segment a writer created and answers membership
//! queries under the shared read lock. The header revision doubles as a
//! remap hint: when a lookup sees a revision newer than the one captured at
//! map time, the file may have grown, so the reader drops the shared lock,
//! remaps under its process-local lifecycle lock and retries. While the
//! shared read lock is held, the descriptors and the bytes they point at
//! are immutable and inside the mapping.

use std::fs::File;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::RwLock;

use log::debug;
use memmap2::MmapMut;
use metrics::counter;

use crate::addr::{canonicalize, route_prefix, CanonicalIp};
use crate::constants::{IPV4_LEN, IPV6_LEN, IPV6_ROUTE_LEN, VERSION};
use crate::errors::{Error, Result};
use crate::layout::{Descriptor, Header, HEADER_SIZE};
use crate::shm;
use crate::sorted_set::SortedView;

/// Shared-memory blocklist reader. Cheap to query from many threads; every
/// thread-visible state change goes through the internal lifecycle lock.
#[derive(Debug)]
pub struct Client {
    state: RwLock<State>,
}

#[derive(Debug)]
struct State {
    name: String,
    file: File,
    map: Option<MmapMut>,
    /// Header revision the current mapping was validated against.
    revision: u32,
    closed: bool,
}

impl Client {
    /// Open the named segment and validate it.
    ///
    /// Fails with a `NotFound` passthrough when no writer created the name
    /// and with `InvalidSharedMemory` when the segment is truncated, from a
    /// different layout version or pointer width, or internally
    /// inconsistent.
    pub fn open(name: &str) -> Result<Client> {
        let file = shm::open(name)?;
        let size = stat_len(&file)?;
        if size < HEADER_SIZE {
            return Err(Error::InvalidSharedMemory);
        }
        let map = shm::map(&file, size)?;

        let mut state = State {
            name: name.to_owned(),
            file,
            map: Some(map),
            revision: 0,
            closed: false,
        };

        let mut grown = false;
        {
            let map = state.map.as_ref().expect("mapping created above");
            let header = Header::from_bytes(map).ok_or(Error::InvalidSharedMemory)?;
            if header.version.load(Ordering::Acquire) != VERSION {
                return Err(Error::InvalidSharedMemory);
            }

            header.lock.rlock();
            state.revision = header.revision.load(Ordering::Acquire);

            // The writer may have resized between our stat and map.
            let now = match stat_len(&state.file) {
                Ok(now) => now,
                Err(err) => {
                    runlock_checked(map)?;
                    return Err(err);
                }
            };
            if now != size {
                grown = true;
            } else if !header.validate(size) {
                runlock_checked(map)?;
                return Err(Error::InvalidSharedMemory);
            }
            runlock_checked(map)?;
        }

        if grown {
            let stale = state.revision;
            remap_state(&mut state, stale)?;
        }

        debug!("opened blocklist segment {name} (revision {})", state.revision);
        Ok(Client {
            state: RwLock::new(state),
        })
    }

    /// Whether `ip` is blocked.
    ///
    /// IPv4 (and IPv4-mapped IPv6) addresses are searched in the v4 set;
    /// IPv6 addresses match if their /64 prefix is a route entry or the
    /// full address is in the v6 set.
    pub fn contains(&self, ip: IpAddr) -> Result<bool> {
        loop {
            let stale = {
                let state = self.read_state();
                if state.closed {
                    return Err(Error::Closed);
                }
                let map = state.map.as_ref().ok_or(Error::InvalidSharedMemory)?;
                let header = Header::from_bytes(map).ok_or(Error::InvalidSharedMemory)?;

                header.lock.rlock();
                if header.revision.load(Ordering::Acquire) == state.revision {
                    let result = lookup(map, header, ip);
                    runlock_checked(map)?;
                    return result;
                }
                // The segment moved under us; never remap while holding
                // the shared lock, the writer may be waiting on it.
                runlock_checked(map)?;
                state.revision
            };
            self.remap(stale)?;
        }
    }

    /// The three committed set sizes.
    pub fn count(&self) -> Result<(usize, usize, usize)> {
        loop {
            let stale = {
                let state = self.read_state();
                if state.closed {
                    return Err(Error::Closed);
                }
                let map = state.map.as_ref().ok_or(Error::InvalidSharedMemory)?;
                let header = Header::from_bytes(map).ok_or(Error::InvalidSharedMemory)?;

                header.lock.rlock();
                if header.revision.load(Ordering::Acquire) == state.revision {
                    let counts = (
                        header.ip4.len_bytes() / IPV4_LEN,
                        header.ip6.len_bytes() / IPV6_LEN,
                        header.ip6route.len_bytes() / IPV6_ROUTE_LEN,
                    );
                    runlock_checked(map)?;
                    return Ok(counts);
                }
                runlock_checked(map)?;
                state.revision
            };
            self.remap(stale)?;
        }
    }

    /// The segment name this client opened.
    pub fn name(&self) -> String {
        self.read_state().name.clone()
    }

    /// Unmap and stop using the segment.
    pub fn close(&self) -> Result<()> {
        let mut state = self.write_state();
        if state.closed {
            return Err(Error::Closed);
        }
        state.closed = true;
        state.map = None;
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().expect("client lifecycle lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().expect("client lifecycle lock poisoned")
    }

    fn remap(&self, stale_rev: u32) -> Result<()> {
        let mut state = self.write_state();
        remap_state(&mut state, stale_rev)
    }
}

fn stat_len(file: &File) -> Result<usize> {
    let len = file.metadata()?.len();
    usize::try_from(len).map_err(|_| Error::InvalidSharedMemory)
}

/// Release the shared read lock through `map`. A mapping too small to
/// address the lock struct cannot be unlocked; that leaves the segment
/// read-locked for every process and is surfaced as `LockReleaseFailed`.
fn runlock_checked(map: &[u8]) -> Result<()> {
    match Header::from_bytes(map) {
        Some(header) => {
            header.lock.runlock();
            Ok(())
        }
        None => Err(Error::LockReleaseFailed(None)),
    }
}

/// Remap `state` to the segment's current size and revalidate.
///
/// Callers hold the lifecycle lock exclusively and no shared lock. When
/// `state` already moved past `stale_rev`, another thread finished the
/// remap first and there is nothing to do. On any failure the old mapping
/// is already unreachable.
fn remap_state(state: &mut State, stale_rev: u32) -> Result<()> {
    if state.closed {
        return Err(Error::Closed);
    }
    if state.revision != stale_rev {
        return Ok(());
    }

    counter!("ip_blocker_client_remaps_total").increment(1);
    state.map = None;

    loop {
        let size = stat_len(&state.file)?;
        if size < HEADER_SIZE {
            return Err(Error::InvalidSharedMemory);
        }
        let map = shm::map(&state.file, size)?;
        let header = Header::from_bytes(&map).ok_or(Error::InvalidSharedMemory)?;

        // Validation needs the shared lock: without it a mid-commit writer
        // could be flipping the descriptors while we look at them.
        header.lock.rlock();
        if header.validate(size) {
            let revision = header.revision.load(Ordering::Acquire);
            runlock_checked(&map)?;

            // Mapping first, cached revision second: a lookup never
            // observes a revision newer than the mapping it searches.
            state.map = Some(map);
            state.revision = revision;

            debug!(
                "remapped {} at {size} bytes (revision {revision})",
                state.name
            );
            return Ok(());
        }
        runlock_checked(&map)?;

        // A region past our mapping is corruption only if the file is
        // still the size we mapped; otherwise the writer grew it between
        // our stat and lock, and a fresh mapping will cover it.
        if stat_len(&state.file)? == size {
            return Err(Error::InvalidSharedMemory);
        }
    }
}

fn payload<'a>(map: &'a [u8], desc: &Descriptor) -> Result<&'a [u8]> {
    let (base, len) = desc.load();
    let end = base.checked_add(len).ok_or(Error::InvalidSharedMemory)?;
    map.get(base..end).ok_or(Error::InvalidSharedMemory)
}

/// Search the live payload regions for `ip`. Runs under the shared read
/// lock; every slice is bounds-checked against the mapping before use.
fn lookup(map: &[u8], header: &Header, ip: IpAddr) -> Result<bool> {
    match canonicalize(ip) {
        CanonicalIp::V4(rec) => {
            let view = SortedView::<IPV4_LEN>::new(payload(map, &header.ip4)?)
                .ok_or(Error::InvalidSharedMemory)?;
            Ok(view.contains(&rec))
        }
        CanonicalIp::V6(rec) => {
            let routes = SortedView::<IPV6_ROUTE_LEN>::new(payload(map, &header.ip6route)?)
                .ok_or(Error::InvalidSharedMemory)?;
            if routes.contains(&route_prefix(&rec)) {
                return Ok(true);
            }
            let view = SortedView::<IPV6_LEN>::new(payload(map, &header.ip6)?)
                .ok_or(Error::InvalidSharedMemory)?;
            Ok(view.contains(&rec))
        }
    }
}
