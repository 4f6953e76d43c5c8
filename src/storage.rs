//! Region mapper and storage virtualization (`spec.md` §4.1).
//!
//! Presents the backing file as a contiguous byte-addressable space, grown in
//! chunks of at most [`FULL_REGION_SIZE`] and rounded up to [`MIN_REGION_SIZE`],
//! mirroring the teacher's chunked `StorageInner::expand`. Unlike the
//! teacher, growth never leaves more than one live window: when the last
//! window can't be grown in place (`mremap` unsupported or refused), the
//! whole mapped extent is re-mapped fresh rather than appending a second
//! window. This keeps the invariant that every allocation (never larger than
//! a region) is addressable through a single window, so `getro`/`getrw`
//! never need to service a read or write spanning two mappings.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions, MmapRaw, RemapOptions};

use crate::address::round_up;
use crate::error::Error;

/// Largest single memory-mapped window, in bytes.
pub const FULL_REGION_SIZE: u64 = 4 * 1024 * 1024;
/// Smallest unit of region growth, in bytes. A full region is always a
/// multiple of this.
pub const MIN_REGION_SIZE: u64 = 1 << 12;

/// A half-open byte range `[start, start + len)` in the virtual address
/// space presented by [`Storage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    pub const fn new(start: u64, len: u64) -> Self {
        ByteRange { start, len }
    }

    pub const fn end(self) -> u64 {
        self.start + self.len
    }
}

/// Tracks every memory-mapped window and the optional backing file. Windows
/// are always contiguous and sorted by offset (post-condition on `expand`).
pub(crate) struct Storage {
    maps: Vec<MmapRaw>,
    file: Option<File>,
    mapped_len: u64,
    /// Byte offset below which pages have been published (`protect`ed) and
    /// must not be written through `getrw`.
    protected_len: u64,
}

impl Storage {
    pub fn init(map: MmapRaw, file: Option<File>, mapped_len: u64) -> Self {
        Storage { maps: vec![map], file, mapped_len, protected_len: 0 }
    }

    pub fn mapped_len(&self) -> u64 {
        self.mapped_len
    }

    /// An independent handle onto the same backing file, if any, for use by
    /// callers that need to take an advisory lock without borrowing the
    /// storage itself.
    pub fn try_clone_file(&self) -> Option<File> {
        self.file.as_ref().and_then(|f| f.try_clone().ok())
    }

    /// Grow the mapped extent so that it covers at least `new_total_len`
    /// bytes, in chunks no larger than [`FULL_REGION_SIZE`] and rounded up to
    /// [`MIN_REGION_SIZE`] as `spec.md` §4.1 describes.
    pub fn grow_to(&mut self, new_total_len: u64) -> Result<(), Error> {
        if new_total_len <= self.mapped_len {
            return Ok(());
        }
        let target = round_up(new_total_len, MIN_REGION_SIZE);
        while self.mapped_len < target {
            let remaining = target - self.mapped_len;
            let chunk = remaining.min(FULL_REGION_SIZE);
            unsafe { self.expand(chunk)? };
        }
        Ok(())
    }

    /// Expand the backing storage by exactly `additional` bytes, always
    /// leaving exactly one live window afterward.
    ///
    /// Tries the Linux `mremap` fast path (which may move the mapping but
    /// never splits it) first; if that's unavailable or refused, falls back
    /// to mapping the whole new extent fresh from offset 0 and copying the
    /// live bytes across (anonymous storage) or letting the OS page them in
    /// again from the file (file-backed storage). Either way `self.maps`
    /// always holds exactly one entry on return — callers never need to
    /// reason about a read or write spanning two windows.
    ///
    /// # Safety
    /// The caller must ensure no other thread holds a live reference into the
    /// previous mapping when it is replaced.
    unsafe fn expand(&mut self, additional: u64) -> Result<(), Error> {
        let new_mapped_len = self.mapped_len + additional;
        if let Some(file) = self.file.as_ref() {
            let current_size = file.metadata()?.len();
            file.set_len(current_size + additional)?;
            file.sync_all()?;

            #[cfg(target_os = "linux")]
            {
                debug_assert_eq!(self.maps.len(), 1);
                let map = &mut self.maps[0];
                if map.remap(new_mapped_len as usize, RemapOptions::new().may_move(true)).is_ok() {
                    self.mapped_len = new_mapped_len;
                    return Ok(());
                }
            }

            let map = MmapOptions::new().offset(0).len(new_mapped_len as usize).map_raw(file)?;
            self.maps = vec![map];
            self.mapped_len = new_mapped_len;
            Ok(())
        } else {
            #[cfg(target_os = "linux")]
            {
                debug_assert_eq!(self.maps.len(), 1);
                let map = &mut self.maps[0];
                if map.remap(new_mapped_len as usize, RemapOptions::new().may_move(true)).is_ok() {
                    self.mapped_len = new_mapped_len;
                    return Ok(());
                }
            }

            let mut new_map = MmapMut::map_anon(new_mapped_len as usize)?;
            {
                let old = self.maps.last().expect("storage always has at least one map");
                new_map[..self.mapped_len as usize].copy_from_slice(&old[..self.mapped_len as usize]);
            }
            self.maps = vec![MmapRaw::from(new_map)];
            self.mapped_len = new_mapped_len;
            Ok(())
        }
    }

    /// Shrinks the mapped extent back down to `new_len`, discarding any bytes
    /// (and the underlying file growth, if file-backed) above it. Used by
    /// [`crate::transaction::Transaction::rollback`] to undo `grow_to` calls
    /// made during an aborted transaction, per `spec.md` §4.3's "truncate
    /// storage back to dbsize; discard region growth beyond snapshot".
    ///
    /// `new_len` must not exceed the current mapped length; a no-op if it
    /// already matches.
    pub fn truncate_to(&mut self, new_len: u64) -> Result<(), Error> {
        debug_assert!(new_len <= self.mapped_len);
        if new_len >= self.mapped_len {
            return Ok(());
        }
        if let Some(file) = self.file.as_ref() {
            file.set_len(new_len)?;
            file.sync_all()?;
            let map = MmapOptions::new().offset(0).len(new_len.max(1) as usize).map_raw(file)?;
            self.maps = vec![map];
        } else {
            let mut new_map = MmapMut::map_anon(new_len.max(1) as usize)?;
            {
                let old = self.maps.last().expect("storage always has at least one map");
                new_map[..new_len as usize].copy_from_slice(&old[..new_len as usize]);
            }
            self.maps = vec![MmapRaw::from(new_map)];
        }
        self.mapped_len = new_len;
        self.protected_len = self.protected_len.min(self.mapped_len);
        Ok(())
    }

    /// Marks `[0, new_protected_len)` as committed and read-only. Called once
    /// per commit after the new revision's bytes and trailer are durable.
    pub fn protect(&mut self, new_protected_len: u64) {
        debug_assert!(new_protected_len >= self.protected_len);
        self.protected_len = new_protected_len.min(self.mapped_len);
    }

    pub fn protected_len(&self) -> u64 {
        self.protected_len
    }

    /// A read-only view of `range`. Fails with `BadAddress` if the range
    /// falls outside the mapped extent or spans more than one window.
    pub fn getro(&self, range: ByteRange) -> Result<&[u8], Error> {
        self.slice_of(range)
    }

    /// A writable view of `range`. Fails with `ReadOnlyAddress` if any byte
    /// of the range has already been published by a commit.
    ///
    /// # Safety
    /// The caller must not alias this slice with any other live reference
    /// into the same bytes.
    pub unsafe fn getrw(&mut self, range: ByteRange) -> Result<&mut [u8], Error> {
        if range.start < self.protected_len {
            return Err(Error::ReadOnlyAddress { offset: range.start, len: range.len });
        }
        let slice = self.slice_of(range)?;
        Ok(std::slice::from_raw_parts_mut(slice.as_ptr() as *mut u8, slice.len()))
    }

    fn slice_of(&self, range: ByteRange) -> Result<&[u8], Error> {
        if range.end() > self.mapped_len {
            return Err(Error::BadAddress { offset: range.start, len: range.len });
        }
        // `expand`/`truncate_to` always collapse to exactly one window, so a
        // validated in-range access can never need to span two mappings.
        debug_assert_eq!(self.maps.len(), 1, "storage must always hold exactly one window");
        let map = &self.maps[0];
        unsafe {
            let ptr = map.as_ptr().add(range.start as usize);
            Ok(std::slice::from_raw_parts(ptr, range.len as usize))
        }
    }

    #[cfg(not(windows))]
    pub fn flush(&self) -> Result<(), Error> {
        if self.file.is_none() {
            return Ok(());
        }
        for map in &self.maps {
            map.flush()?;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn flush(&self) -> Result<(), Error> {
        if self.file.is_none() {
            return Ok(());
        }
        let (last, rest) = self.maps.split_last().expect("storage always has at least one map");
        for map in rest {
            map.flush_async()?;
        }
        last.flush()?;
        Ok(())
    }

    pub fn flush_range(&self, range: ByteRange) -> Result<(), Error> {
        if self.file.is_none() {
            return Ok(());
        }
        if range.end() > self.mapped_len {
            return Err(Error::BadAddress { offset: range.start, len: range.len });
        }
        debug_assert_eq!(self.maps.len(), 1, "storage must always hold exactly one window");
        self.maps[0].flush_range(range.start as usize, range.len as usize)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_storage(initial_len: u64) -> Storage {
        let map = MmapRaw::from(MmapMut::map_anon(initial_len as usize).unwrap());
        Storage::init(map, None, initial_len)
    }

    #[test]
    fn getrw_then_getro_round_trips() {
        let mut s = anon_storage(MIN_REGION_SIZE);
        let range = ByteRange::new(0, 8);
        unsafe {
            s.getrw(range).unwrap().copy_from_slice(&42u64.to_le_bytes());
        }
        let read = s.getro(range).unwrap();
        assert_eq!(u64::from_le_bytes(read.try_into().unwrap()), 42);
    }

    #[test]
    fn protect_rejects_writes_below_watermark() {
        let mut s = anon_storage(MIN_REGION_SIZE);
        s.protect(8);
        let err = unsafe { s.getrw(ByteRange::new(0, 8)) }.unwrap_err();
        assert!(matches!(err, Error::ReadOnlyAddress { .. }));
    }

    #[test]
    fn out_of_range_access_is_bad_address() {
        let s = anon_storage(MIN_REGION_SIZE);
        let err = s.getro(ByteRange::new(MIN_REGION_SIZE, 8)).unwrap_err();
        assert!(matches!(err, Error::BadAddress { .. }));
    }

    #[test]
    fn grow_to_extends_mapped_len() {
        let mut s = anon_storage(MIN_REGION_SIZE);
        s.grow_to(FULL_REGION_SIZE + 1).unwrap();
        assert!(s.mapped_len() >= FULL_REGION_SIZE + 1);
    }

    #[test]
    fn growth_never_leaves_more_than_one_window() {
        let mut s = anon_storage(MIN_REGION_SIZE);
        s.grow_to(FULL_REGION_SIZE + 1).unwrap();
        s.grow_to(3 * FULL_REGION_SIZE).unwrap();
        assert_eq!(s.maps.len(), 1);
    }

    #[test]
    fn read_spanning_original_region_boundary_succeeds() {
        let mut s = anon_storage(MIN_REGION_SIZE);
        // An allocation straddling the pre-growth mapped_len must still be
        // readable after a grow that would otherwise have appended a new
        // window.
        let straddle = ByteRange::new(MIN_REGION_SIZE - 4, 8);
        s.grow_to(MIN_REGION_SIZE + FULL_REGION_SIZE).unwrap();
        unsafe {
            s.getrw(straddle).unwrap().copy_from_slice(&99u64.to_le_bytes());
        }
        let read = s.getro(straddle).unwrap();
        assert_eq!(u64::from_le_bytes(read.try_into().unwrap()), 99);
    }

    #[test]
    fn truncate_to_shrinks_and_discards_growth() {
        let mut s = anon_storage(MIN_REGION_SIZE);
        unsafe {
            s.getrw(ByteRange::new(0, 8)).unwrap().copy_from_slice(&7u64.to_le_bytes());
        }
        s.grow_to(FULL_REGION_SIZE + MIN_REGION_SIZE).unwrap();
        s.truncate_to(MIN_REGION_SIZE).unwrap();
        assert_eq!(s.mapped_len(), MIN_REGION_SIZE);
        let read = s.getro(ByteRange::new(0, 8)).unwrap();
        assert_eq!(u64::from_le_bytes(read.try_into().unwrap()), 7);
        assert!(s.getro(ByteRange::new(MIN_REGION_SIZE, 8)).is_err());
    }
}
