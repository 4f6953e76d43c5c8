//! Database: header/footer management, revision navigation, and the
//! `getro`/`getrw`/`allocate` primitives (`spec.md` §4.2).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};
use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapOptions, MmapRaw};
use uuid::Uuid;

use crate::address::Address;
use crate::error::Error;
use crate::storage::{ByteRange, Storage, MIN_REGION_SIZE};

/// Size of the leader block. Large enough to hold the header plus the lock
/// block with headroom for future fields without relayout.
pub const LEADER_SIZE: u64 = 4096;

const LEADER_MAGIC1: [u8; 8] = *b"pstoreHD";
const LEADER_MAGIC2: [u8; 8] = *b"Leader02";
const CURRENT_VERSION: u32 = 1;

const TRAILER_MAGIC1: [u8; 8] = *b"trailer1";
const TRAILER_MAGIC2: [u8; 8] = *b"trailer2";

/// Size in bytes of the [`IndexHeaderRecord`] written just before every
/// revision's trailer (`spec.md` §3.5, §6.1).
pub const INDEX_HEADER_SIZE: u64 = 24;
pub const TRAILER_SIZE: u64 = 56;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Leader {
    magic1: [u8; 8],
    magic2: [u8; 8],
    uuid: [u8; 16],
    version: u32,
    _reserved0: u32,
    footer_pos: u64,
    transaction_lock: u8,
    _reserved1: [u8; 7],
    _pad: [u8; LEADER_PAD],
}

const LEADER_PAD: usize = 4096 - (8 + 8 + 16 + 4 + 4 + 8 + 1 + 7);

/// Per-revision trailer, as laid out in `spec.md` §6.1:
/// `magic1 | generation:u64 | size:u64 | prev_generation:address | time:u64 | checksum:u64 | magic2`.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Trailer {
    magic1: [u8; 8],
    generation: u64,
    size: u64,
    prev_generation: u64,
    time: u64,
    checksum: u64,
    magic2: [u8; 8],
}

impl Trailer {
    /// xxh3_64 over every other field, the same hash the teacher uses to
    /// checksum committed blocks.
    fn checksum(&self) -> u64 {
        let bytes = bytemuck::bytes_of(&Trailer { checksum: 0, ..*self });
        xxhash_rust::xxh3::xxh3_64(bytes)
    }
}

/// Configuration surface for opening a store (`spec.md` §4.2's `open`).
pub struct OpenOptions {
    read_only: bool,
    initial_size: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions { read_only: false, initial_size: MIN_REGION_SIZE }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    pub fn initial_size(&mut self, bytes: u64) -> &mut Self {
        self.initial_size = bytes;
        self
    }

    /// Opens an anonymous, in-memory store with no backing file. Useful for
    /// tests that want database semantics without filesystem setup.
    pub fn open_anon(&self) -> Result<Database, Error> {
        validate_os_page_size()?;
        let size = self.initial_size.max(LEADER_SIZE);
        let map = MmapRaw::from(MmapMut::map_anon(size as usize)?);
        let mut storage = Storage::init(map, None, size);
        init_new_database(&mut storage)?;
        Database::from_storage(storage, None)
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Database, Error> {
        validate_os_page_size()?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .create(!self.read_only)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let is_new = file_len == 0;
        if is_new && self.read_only {
            return Err(Error::HeaderCorrupt { reason: "cannot create a new database read-only" });
        }
        let map_len = file_len.max(self.initial_size).max(LEADER_SIZE);
        if !is_new {
            // Existing files are never shrunk; the map only needs to cover
            // what is already there.
        } else if !self.read_only {
            file.set_len(map_len)?;
        }

        let map = MmapOptions::new().len(map_len as usize).map_raw(&file)?;
        let mut storage = Storage::init(map, Some(file), map_len);

        if is_new {
            init_new_database(&mut storage)?;
        } else {
            validate_existing_database(&storage)?;
        }

        // `Storage` owns the only file handle that was opened above;
        // `Database` needs a second, independent handle purely for
        // advisory locking during transactions.
        let lock_file = storage.try_clone_file();
        Database::from_storage(storage, lock_file)
    }
}

fn init_new_database(storage: &mut Storage) -> Result<(), Error> {
    storage.grow_to(LEADER_SIZE + TRAILER_SIZE)?;
    let uuid = Uuid::new_v4();
    log::info!("initializing new database, uuid={uuid}");
    let leader = Leader {
        magic1: LEADER_MAGIC1,
        magic2: LEADER_MAGIC2,
        uuid: *uuid.as_bytes(),
        version: CURRENT_VERSION,
        _reserved0: 0,
        footer_pos: LEADER_SIZE,
        transaction_lock: 0,
        _reserved1: [0; 7],
        _pad: [0; LEADER_PAD],
    };
    unsafe {
        let dst = storage.getrw(ByteRange::new(0, LEADER_SIZE))?;
        dst.copy_from_slice(bytemuck::bytes_of(&leader));
    }
    let r0 = Trailer {
        magic1: TRAILER_MAGIC1,
        generation: 0,
        size: 0,
        prev_generation: 0,
        time: now_secs(),
        checksum: 0,
        magic2: TRAILER_MAGIC2,
    };
    let r0 = Trailer { checksum: r0.checksum(), ..r0 };
    unsafe {
        let dst = storage.getrw(ByteRange::new(LEADER_SIZE, TRAILER_SIZE))?;
        dst.copy_from_slice(bytemuck::bytes_of(&r0));
    }
    storage.protect(LEADER_SIZE + TRAILER_SIZE);
    storage.flush()?;
    Ok(())
}

fn validate_existing_database(storage: &Storage) -> Result<(), Error> {
    let header = storage.getro(ByteRange::new(0, LEADER_SIZE))?;
    let leader: &Leader = bytemuck::from_bytes(header);
    if leader.magic1 != LEADER_MAGIC1 || leader.magic2 != LEADER_MAGIC2 {
        return Err(Error::HeaderCorrupt { reason: "leader magic mismatch" });
    }
    if leader.version != CURRENT_VERSION {
        return Err(Error::HeaderVersionMismatch { found: leader.version, expected: CURRENT_VERSION });
    }
    Ok(())
}

/// Mappings are only ever placed at multiples of [`MIN_REGION_SIZE`], so the
/// OS page size (what `mmap` actually aligns offsets and lengths to) must
/// divide it evenly. Mirrors the teacher's own
/// `page_size::get() != PAGE_SIZE && page_size::get() != CLUSTER_SIZE`
/// sanity check before trusting a raw mapping.
fn validate_os_page_size() -> Result<(), Error> {
    let got = page_size::get() as u64;
    if got == 0 || MIN_REGION_SIZE % got != 0 {
        return Err(Error::UnsupportedPageSize { got: got as usize });
    }
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The open store: maps the file, exposes the current revision's footer,
/// and hands out transactions.
pub struct Database {
    pub(crate) storage: Storage,
    uuid: Uuid,
    footer_pos: Address,
    current_generation: u64,
    /// Independent file handle used only to take the cross-process write
    /// lock; `None` for anonymous (in-memory) databases, which need no
    /// cross-process coordination.
    lock_file: Option<std::fs::File>,
}

impl Database {
    fn from_storage(storage: Storage, lock_file: Option<std::fs::File>) -> Result<Self, Error> {
        let header = storage.getro(ByteRange::new(0, LEADER_SIZE))?;
        let leader: &Leader = bytemuck::from_bytes(header);
        let uuid = Uuid::from_bytes(leader.uuid);
        let footer_pos = Address::new(leader.footer_pos);
        let trailer = read_trailer(&storage, footer_pos)?;
        Ok(Database {
            storage,
            uuid,
            footer_pos,
            current_generation: trailer.generation,
            lock_file,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Reads the leader's live `footer_pos` field straight out of the mapped
    /// bytes with an `Acquire` load, mirroring `publish`'s `Release` store.
    /// This is what lets a long-lived `Database` handle observe a revision
    /// committed by a *different* process sharing the same file, per
    /// `spec.md` §1 and §5 ("readers observe revisions by loading
    /// `footer_pos`") — the cached `self.footer_pos` field only reflects
    /// what this process itself last opened or synced to.
    fn live_footer_pos(&self) -> Result<Address, Error> {
        let bytes = self.storage.getro(ByteRange::new(0, LEADER_SIZE))?;
        let field = &bytes[offset_of_footer_pos()..offset_of_footer_pos() + 8];
        let raw = unsafe {
            let atomic = &*(field.as_ptr() as *const AtomicU64);
            atomic.load(Ordering::Acquire)
        };
        Ok(Address::new(raw))
    }

    /// The current revision number, re-read from the live footer on every
    /// call so concurrent readers in other processes are visible. Falls
    /// back to the last-known value if the live footer can't be read (e.g.
    /// storage not yet grown past the leader, which never happens once a
    /// database is open).
    pub fn current_revision(&self) -> u64 {
        let live = match self.live_footer_pos() {
            Ok(addr) => addr,
            Err(_) => return self.current_generation,
        };
        if live == self.footer_pos {
            return self.current_generation;
        }
        match read_trailer(&self.storage, live) {
            Ok(trailer) => trailer.generation,
            Err(_) => self.current_generation,
        }
    }

    /// The current revision's trailer address, re-read from the live leader
    /// on every call (see [`Self::live_footer_pos`]).
    pub fn footer_pos(&self) -> Address {
        self.live_footer_pos().unwrap_or(self.footer_pos)
    }

    /// The file-resident header block for the primary HAMT index as of the
    /// current (live) revision, or [`Address::NULL`] for an empty (r0)
    /// database. By construction the header block for revision N is always
    /// written immediately before revision N's trailer.
    pub fn primary_index_header(&self) -> Address {
        if self.current_revision() == 0 {
            Address::NULL
        } else {
            Address::new(self.footer_pos().as_u64() - INDEX_HEADER_SIZE)
        }
    }

    /// Reads a previously-committed, permanently read-only byte range.
    pub fn getro(&self, addr: Address, len: u64) -> Result<&[u8], Error> {
        self.storage.getro(ByteRange::new(addr.as_u64(), len))
    }

    /// Navigates to a prior revision by following `prev_generation` links
    /// from the current footer. The database is otherwise unchanged.
    pub fn sync(&mut self, generation: u64) -> Result<(), Error> {
        log::debug!("sync: from generation {} to {generation}", self.current_generation);
        let mut addr = self.live_footer_pos().unwrap_or(self.footer_pos);
        loop {
            let trailer = read_trailer(&self.storage, addr)?;
            if trailer.generation == generation {
                self.footer_pos = addr;
                self.current_generation = generation;
                return Ok(());
            }
            if trailer.prev_generation == 0 && trailer.generation != 0 {
                log::warn!("sync: generation {generation} not found in this database's history");
                return Err(Error::UnknownRevision(generation));
            }
            if trailer.generation == 0 {
                log::warn!("sync: generation {generation} not found in this database's history");
                return Err(Error::UnknownRevision(generation));
            }
            addr = Address::new(trailer.prev_generation);
        }
    }

    /// Begins a writing transaction. Blocks until the cross-process write
    /// lock (a byte-range advisory lock standing in for the header's
    /// transaction-lock field) is acquired.
    pub fn begin(&mut self) -> Result<crate::transaction::Transaction<'_>, Error> {
        if let Some(file) = &self.lock_file {
            FileExt::lock_exclusive(file)?;
        }
        crate::transaction::Transaction::new(self)
    }

    pub(crate) fn release_write_lock(&self) -> Result<(), Error> {
        if let Some(file) = &self.lock_file {
            FileExt::unlock(file)?;
        }
        Ok(())
    }

    pub(crate) fn write_trailer(
        &mut self,
        generation: u64,
        size: u64,
        prev_generation: Address,
        addr: Address,
    ) -> Result<(), Error> {
        let trailer = Trailer {
            magic1: TRAILER_MAGIC1,
            generation,
            size,
            prev_generation: prev_generation.as_u64(),
            time: now_secs(),
            checksum: 0,
            magic2: TRAILER_MAGIC2,
        };
        let trailer = Trailer { checksum: trailer.checksum(), ..trailer };
        unsafe {
            let dst = self.storage.getrw(ByteRange::new(addr.as_u64(), TRAILER_SIZE))?;
            dst.copy_from_slice(bytemuck::bytes_of(&trailer));
        }
        Ok(())
    }

    /// Publishes `new_footer` as the current revision: flushes durable
    /// bytes, protects everything up to and including the new trailer, and
    /// atomically stores the new `footer_pos` in the leader.
    pub(crate) fn publish(&mut self, new_footer: Address, generation: u64) -> Result<(), Error> {
        self.storage.flush()?;
        self.storage.protect(new_footer.as_u64() + TRAILER_SIZE);
        unsafe {
            let leader_bytes = self.storage.getrw(ByteRange::new(0, LEADER_SIZE))?;
            let footer_field = &mut leader_bytes[offset_of_footer_pos()..offset_of_footer_pos() + 8];
            let atomic = &*(footer_field.as_mut_ptr() as *const AtomicU64);
            atomic.store(new_footer.as_u64(), Ordering::Release);
        }
        self.storage.flush_range(ByteRange::new(0, LEADER_SIZE))?;
        self.footer_pos = new_footer;
        self.current_generation = generation;
        log::info!("published generation {generation} at {new_footer:?}");
        Ok(())
    }
}

const fn offset_of_footer_pos() -> usize {
    8 + 8 + 16 + 4 + 4
}

fn read_trailer(storage: &Storage, addr: Address) -> Result<Trailer, Error> {
    let bytes = storage.getro(ByteRange::new(addr.as_u64(), TRAILER_SIZE))?;
    let trailer: &Trailer = bytemuck::from_bytes(bytes);
    if trailer.magic1 != TRAILER_MAGIC1 || trailer.magic2 != TRAILER_MAGIC2 {
        log::error!("trailer at {addr:?} has a bad magic, refusing to trust it");
        return Err(Error::FooterCorrupt { at: addr, reason: "trailer magic mismatch" });
    }
    if trailer.checksum() != trailer.checksum {
        log::error!("trailer at {addr:?} failed its checksum");
        return Err(Error::FooterCorrupt { at: addr, reason: "trailer checksum mismatch" });
    }
    Ok(*trailer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_page_size_divides_min_region_size() {
        // Sanity-checks the assumption `validate_os_page_size` relies on
        // holds on whatever host actually runs the test suite.
        validate_os_page_size().unwrap();
    }

    #[test]
    fn open_anon_creates_r0_at_generation_zero() {
        let db = OpenOptions::new().open_anon().unwrap();
        assert_eq!(db.current_revision(), 0);
        assert!(db.primary_index_header().is_null());
    }

    #[test]
    fn sync_to_unknown_revision_fails() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let err = db.sync(5).unwrap_err();
        assert!(matches!(err, Error::UnknownRevision(5)));
    }

    #[test]
    fn current_revision_observes_commit_from_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.pstore");
        let mut writer = OpenOptions::new().open(&path).unwrap();
        let reader = OpenOptions::new().open(&path).unwrap();
        assert_eq!(reader.current_revision(), 0);

        let txn = writer.begin().unwrap();
        txn.commit().unwrap();

        // `reader` never calls `sync`; it must still observe the commit by
        // re-reading the leader's live `footer_pos` on every call.
        assert_eq!(reader.current_revision(), 1);
        assert_ne!(reader.footer_pos(), Address::new(LEADER_SIZE));
    }
}
