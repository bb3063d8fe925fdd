//! The blocklist writer.
//!
//! One `Server` owns a named segment exclusively: it keeps the authoritative
//! sets in process memory and publishes them to readers with a two-phase
//! commit. Phase A writes a scratch copy past the current end of the file
//! and flips the descriptors to it; phase B rewrites the payloads at the
//! canonical low offsets, flips back and shrinks the file. The file never
//! shrinks while a reader's descriptors can point past the new length, so a
//! reader holding the read lock always sees bytes inside its mapping.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use memmap2::MmapMut;
use metrics::{counter, gauge};

use crate::addr::{canonicalize, mask_record, route_prefix, CanonicalIp};
use crate::constants::{
    IPV4_LEN, IPV6_LEN, IPV6_ROUTE_LEN, MAX_RANGE_BITS, PERSIST_MAGIC, VERSION,
};
use crate::errors::{Error, Result};
use crate::layout::{calculate_offsets, Header, Offsets, HEADER_SIZE};
use crate::shm;
use crate::sorted_set::SortedSet;

/// Shared-memory blocklist writer. All public operations serialize behind
/// one mutex; the single-writer assumption is part of the design.
pub struct Server {
    inner: Mutex<Inner>,
}

struct Inner {
    name: String,
    file: File,
    map: Option<MmapMut>,

    ip4s: SortedSet<IPV4_LEN>,
    ip6s: SortedSet<IPV6_LEN>,
    ip6rs: SortedSet<IPV6_ROUTE_LEN>,

    /// Highest payload byte in use at the canonical offsets, before page
    /// rounding. Scratch regions are laid out past this watermark.
    end: usize,

    batching: bool,
    closed: bool,
}

impl Server {
    /// Create a new blocklist segment with the given name and file mode.
    ///
    /// Fails with an `AlreadyExists` passthrough if the name is taken and
    /// has not been unlinked.
    pub fn new(name: &str, mode: u32) -> Result<Server> {
        let file = shm::create_excl(name, mode)?;
        let off = calculate_offsets(HEADER_SIZE, 0, 0, 0);
        file.set_len(off.size as u64)?;
        let map = shm::map(&file, off.size)?;

        {
            let header = Header::from_bytes(&map).ok_or(Error::InvalidSharedMemory)?;
            header.lock.create();
            header.lock.lock();
            header.set_blocks((off.ip4, 0), (off.ip6, 0), (off.ip6route, 0));
            header.revision.store(1, Ordering::Release);
            header.lock.unlock();
            // Published last: a reader that acquire-loads a matching
            // sentinel is guaranteed a fully initialized header.
            header.version.store(VERSION, Ordering::Release);
        }

        info!("created blocklist segment {name} ({} bytes)", off.size);

        Ok(Server {
            inner: Mutex::new(Inner {
                name: name.to_owned(),
                file,
                map: Some(map),
                ip4s: SortedSet::new(),
                ip6s: SortedSet::new(),
                ip6rs: SortedSet::new(),
                end: off.end,
                batching: false,
                closed: false,
            }),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("writer mutex poisoned")
    }

    /// Insert a single IP address. IPv4-mapped IPv6 addresses land in the
    /// v4 set.
    pub fn insert(&self, ip: IpAddr) -> Result<()> {
        self.update(ip, true)
    }

    /// Remove a single IP address.
    ///
    /// An IPv6 address covered only by a route entry is not removed by
    /// this; the whole range has to go through [`Server::remove_range`].
    pub fn remove(&self, ip: IpAddr) -> Result<()> {
        self.update(ip, false)
    }

    fn update(&self, ip: IpAddr, insert: bool) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }

        match canonicalize(ip) {
            CanonicalIp::V4(rec) => {
                if insert {
                    inner.ip4s.insert(&rec);
                } else {
                    inner.ip4s.remove(&rec);
                }
            }
            CanonicalIp::V6(rec) => {
                if insert {
                    inner.ip6s.insert(&rec);
                } else {
                    inner.ip6s.remove(&rec);
                }
            }
        }

        if inner.batching {
            return Ok(());
        }
        inner.commit()
    }

    /// Insert every address of `ip/prefix`.
    ///
    /// IPv6 ranges at /64 or wider become a single run of route records;
    /// anything narrower expands into its containing set.
    pub fn insert_range(&self, ip: IpAddr, prefix: u8) -> Result<()> {
        self.update_range(ip, prefix, true)
    }

    /// Remove every address of `ip/prefix`, using the same set split as
    /// [`Server::insert_range`].
    pub fn remove_range(&self, ip: IpAddr, prefix: u8) -> Result<()> {
        self.update_range(ip, prefix, false)
    }

    fn update_range(&self, ip: IpAddr, prefix: u8, insert: bool) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }

        match canonicalize(ip) {
            CanonicalIp::V4(rec) => {
                if prefix > 32 {
                    // CIDR parsing happens outside the core; an over-long
                    // prefix is malformed input, not a blockable address.
                    return Err(Error::Io(io::Error::from(io::ErrorKind::InvalidInput)));
                }
                let base = mask_record(rec, prefix);
                let n = range_records(32 - u32::from(prefix))?;
                if insert {
                    inner.ip4s.insert_range(&base, n)?;
                } else {
                    inner.ip4s.remove_range(&base, n);
                }
            }
            CanonicalIp::V6(rec) => {
                if prefix > 128 {
                    return Err(Error::Io(io::Error::from(io::ErrorKind::InvalidInput)));
                }
                if usize::from(prefix) <= IPV6_ROUTE_LEN * 8 {
                    let base = mask_record(route_prefix(&rec), prefix);
                    let n = range_records(64 - u32::from(prefix))?;
                    if insert {
                        inner.ip6rs.insert_range(&base, n)?;
                    } else {
                        inner.ip6rs.remove_range(&base, n);
                    }
                } else {
                    let base = mask_record(rec, prefix);
                    let n = range_records(128 - u32::from(prefix))?;
                    if insert {
                        inner.ip6s.insert_range(&base, n)?;
                    } else {
                        inner.ip6s.remove_range(&base, n);
                    }
                }
            }
        }

        if inner.batching {
            return Ok(());
        }
        inner.commit()
    }

    /// Drop every address and range from the blocklist.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }

        inner.ip4s.clear();
        inner.ip6s.clear();
        inner.ip6rs.clear();

        if inner.batching {
            return Ok(());
        }
        inner.commit()
    }

    /// Start withholding commits until [`Server::commit`] is called.
    pub fn batch(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.batching {
            return Err(Error::AlreadyBatching);
        }
        inner.batching = true;
        Ok(())
    }

    /// End a batch and publish all buffered changes at once.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }
        if !inner.batching {
            return Err(Error::NotBatching);
        }
        inner.commit()
    }

    /// The three committed set sizes, read back from the shared header.
    pub fn count(&self) -> Result<(usize, usize, usize)> {
        let inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }
        let map = inner.map.as_ref().ok_or(Error::InvalidSharedMemory)?;
        let header = Header::from_bytes(map).ok_or(Error::InvalidSharedMemory)?;
        Ok((
            header.ip4.len_bytes() / IPV4_LEN,
            header.ip6.len_bytes() / IPV6_LEN,
            header.ip6route.len_bytes() / IPV6_ROUTE_LEN,
        ))
    }

    /// Serialize the in-memory sets: magic, three big-endian u64 byte
    /// lengths, three payloads.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        let inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }

        out.write_all(PERSIST_MAGIC)?;
        for bytes in [
            inner.ip4s.as_bytes(),
            inner.ip6s.as_bytes(),
            inner.ip6rs.as_bytes(),
        ] {
            out.write_all(&(bytes.len() as u64).to_be_bytes())?;
        }
        out.write_all(inner.ip4s.as_bytes())?;
        out.write_all(inner.ip6s.as_bytes())?;
        out.write_all(inner.ip6rs.as_bytes())?;
        Ok(())
    }

    /// Replace the in-memory sets from a stream produced by
    /// [`Server::save`], then commit unless batching.
    ///
    /// The stream is validated in full before any state changes; on
    /// `InvalidData` the blocklist is untouched.
    pub fn load<R: Read>(&self, input: &mut R) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }

        let mut magic = [0u8; 24];
        input
            .read_exact(&mut magic)
            .map_err(|err| Error::InvalidData(Some(err)))?;
        if magic != *PERSIST_MAGIC {
            return Err(Error::InvalidData(None));
        }

        let widths = [IPV4_LEN, IPV6_LEN, IPV6_ROUTE_LEN];
        let mut lens = [0usize; 3];
        for (len, width) in lens.iter_mut().zip(widths) {
            let mut buf = [0u8; 8];
            input
                .read_exact(&mut buf)
                .map_err(|err| Error::InvalidData(Some(err)))?;
            *len = usize::try_from(u64::from_be_bytes(buf))
                .ok()
                .filter(|&bytes| bytes <= isize::MAX as usize && bytes % width == 0)
                .ok_or(Error::InvalidData(None))?;
        }

        let mut payloads = Vec::with_capacity(3);
        for &len in &lens {
            let mut buf = vec![0u8; len];
            input
                .read_exact(&mut buf)
                .map_err(|err| Error::InvalidData(Some(err)))?;
            payloads.push(buf);
        }
        let [v4, v6, v6r]: [Vec<u8>; 3] =
            payloads.try_into().expect("exactly three payloads read");

        inner.ip4s = SortedSet::from_sorted_bytes(v4);
        inner.ip6s = SortedSet::from_sorted_bytes(v6);
        inner.ip6rs = SortedSet::from_sorted_bytes(v6r);

        if inner.batching {
            return Ok(());
        }
        inner.commit()
    }

    /// Whether a batch is currently open.
    pub fn is_batching(&self) -> bool {
        let inner = self.lock_inner();
        !inner.closed && inner.batching
    }

    /// The segment name this server was created with.
    pub fn name(&self) -> String {
        self.lock_inner().name.clone()
    }

    /// Unmap and stop using the segment; the name stays allocated.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.closed = true;
        inner.map = None;
        Ok(())
    }

    /// Close (if still open) and remove the segment name. Existing reader
    /// mappings stay valid until they unmap.
    pub fn unlink(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if !inner.closed {
            inner.closed = true;
            inner.map = None;
        }
        shm::unlink(&inner.name)
    }
}

fn range_records(free_bits: u32) -> Result<usize> {
    if free_bits > MAX_RANGE_BITS {
        return Err(Error::RangeTooLarge);
    }
    Ok(1usize << free_bits)
}

impl Inner {
    fn commit(&mut self) -> Result<()> {
        self.batching = false;

        // One live mapping at a time; the remap below picks up the grown
        // file.
        self.map = None;

        let l4 = self.ip4s.as_bytes().len();
        let l6 = self.ip6s.as_bytes().len();
        let l6r = self.ip6rs.as_bytes().len();

        let canonical = calculate_offsets(HEADER_SIZE, l4, l6, l6r);
        let scratch = calculate_offsets(self.end.max(canonical.end), l4, l6, l6r);

        self.file.set_len(scratch.size as u64)?;
        let mut map = shm::map(&self.file, scratch.size)?;

        // Invisible to readers: their descriptors still point at the
        // previous live region.
        self.copy_payloads(&mut map, &scratch);

        // Phase A: flip every reader onto the scratch region.
        {
            let header = Header::from_bytes(&map).ok_or(Error::InvalidSharedMemory)?;
            header.lock.lock();
            header.set_blocks(
                (scratch.ip4, l4),
                (scratch.ip6, l6),
                (scratch.ip6route, l6r),
            );
            header.bump_revision();
            header.lock.unlock();
        }

        // Rewrite at the canonical low offsets. Readers that took the lock
        // after phase A are on the scratch region; readers from before
        // phase A drained while the write lock was held.
        self.copy_payloads(&mut map, &canonical);

        // Phase B: flip back to the canonical region and shrink. The
        // shrink happens only after the flip away from the scratch bytes,
        // so a reader mapped at the larger size keeps valid memory.
        {
            let header = Header::from_bytes(&map).ok_or(Error::InvalidSharedMemory)?;
            header.lock.lock();
            header.set_bases(canonical.ip4, canonical.ip6, canonical.ip6route);
            header.bump_revision();
            if let Err(err) = self.file.set_len(canonical.size as u64) {
                header.lock.unlock();
                return Err(err.into());
            }
            header.lock.unlock();
        }

        drop(map);
        self.map = Some(shm::map(&self.file, canonical.size)?);
        self.end = canonical.end;

        counter!("ip_blocker_commits_total").increment(1);
        gauge!("ip_blocker_ip4_entries").set(self.ip4s.len() as f64);
        gauge!("ip_blocker_ip6_entries").set(self.ip6s.len() as f64);
        gauge!("ip_blocker_ip6_route_entries").set(self.ip6rs.len() as f64);

        debug!(
            "committed {}: {} bytes ({} v4, {} v6, {} routes)",
            self.name,
            canonical.size,
            self.ip4s.len(),
            self.ip6s.len(),
            self.ip6rs.len()
        );
        Ok(())
    }

    fn copy_payloads(&self, map: &mut MmapMut, off: &Offsets) {
        let l4 = self.ip4s.as_bytes().len();
        let l6 = self.ip6s.as_bytes().len();
        let l6r = self.ip6rs.as_bytes().len();
        map[off.ip4..off.ip4 + l4].copy_from_slice(self.ip4s.as_bytes());
        map[off.ip6..off.ip6 + l6].copy_from_slice(self.ip6s.as_bytes());
        map[off.ip6route..off.ip6route + l6r].copy_from_slice(self.ip6rs.as_bytes());
    }
}
