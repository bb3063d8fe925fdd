//! Named shared-memory segments: create, open, unlink, map.

use std::fs::File;
use std::io;

use memmap2::{MmapMut, MmapOptions};

use crate::errors::Result;
use crate::platform;

/// Exclusively create the named segment with the given file mode.
/// Fails with an `AlreadyExists` passthrough when the name is taken.
pub fn create_excl(name: &str, mode: u32) -> io::Result<File> {
    platform::shm_create_excl(name, mode)
}

/// Open an existing named segment read-write.
/// Fails with a `NotFound` passthrough when the name does not exist.
pub fn open(name: &str) -> io::Result<File> {
    platform::shm_open(name)
}

/// Remove the name; existing mappings stay valid until unmapped.
pub fn unlink(name: &str) -> Result<()> {
    platform::shm_unlink(name)?;
    Ok(())
}

/// Map `len` bytes of the segment read-write, `MAP_SHARED`.
///
/// Unmapping is dropping the returned value; remapping after growth is
/// mapping afresh and then dropping the old mapping.
pub fn map(file: &File, len: usize) -> io::Result<MmapMut> {
    // SAFETY: the mapping is shared by design; all cross-process
    // synchronization happens through the lock embedded in the header.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
}
