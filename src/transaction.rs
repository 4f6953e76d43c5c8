//! Transaction: scoped allocation plus commit producing a new footer
//! (`spec.md` §4.3).

use crate::address::{round_up, Address, TypedAddress};
use crate::database::{Database, INDEX_HEADER_SIZE, TRAILER_SIZE};
use crate::error::Error;
use crate::storage::ByteRange;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Open,
    Committed,
    RolledBack,
}

/// A single writer's scoped allocation and commit. At most one
/// `Transaction` can be live per [`Database`] at a time; `begin` blocks
/// until the cross-process write lock is acquired.
pub struct Transaction<'db> {
    db: &'db mut Database,
    /// Logical end-of-data when the transaction began; also the start of
    /// this transaction's own allocations.
    dbsize_snapshot: u64,
    footer_pos_snapshot: Address,
    generation_snapshot: u64,
    /// Mapped storage length when the transaction began; `rollback`
    /// truncates growth performed since back down to this (`spec.md` §4.3).
    storage_len_snapshot: u64,
    cursor: u64,
    state: State,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(db: &'db mut Database) -> Result<Self, Error> {
        if db.storage.mapped_len() == 0 {
            return Err(Error::TransactionOnReadOnlyDatabase);
        }
        let dbsize = db.footer_pos().as_u64() + footer_trailer_len(db)?;
        let storage_len_snapshot = db.storage.mapped_len();
        Ok(Transaction {
            footer_pos_snapshot: db.footer_pos(),
            generation_snapshot: db.current_revision(),
            dbsize_snapshot: dbsize,
            storage_len_snapshot,
            cursor: dbsize,
            db,
            state: State::Open,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// The generation this transaction will publish on a successful commit.
    /// Used by [`crate::hamt::HamtIndex::flush`] to stamp its `revision_`
    /// before that generation actually exists on disk.
    pub fn pending_generation(&self) -> u64 {
        self.generation_snapshot + 1
    }

    /// Allocates `size` bytes at `align`, padding the write cursor forward
    /// from the previous write. Returns the first aligned address.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<Address, Error> {
        if self.state != State::Open {
            return Err(Error::CannotAllocateAfterCommit);
        }
        debug_assert!(align.is_power_of_two());
        let padded = round_up(self.cursor, align);
        let end = padded + size;
        self.db.storage.grow_to(end)?;
        self.cursor = end;
        Ok(Address::new(padded))
    }

    /// Allocates space for a leaf, padding to 4-byte alignment first so the
    /// two index-pointer tag bits are always clear (`spec.md` §9).
    pub fn allocate_leaf(&mut self, size: u64) -> Result<Address, Error> {
        self.allocate(0, 4)?;
        self.allocate(size, 4)
    }

    /// Writes `bytes` at a previously-`allocate`d address. Restricted, as
    /// `spec.md` requires, to this transaction's own allocations.
    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<(), Error> {
        if addr.as_u64() < self.dbsize_snapshot {
            return Err(Error::ReadOnlyAddress { offset: addr.as_u64(), len: bytes.len() as u64 });
        }
        unsafe {
            let dst = self.db.storage.getrw(ByteRange::new(addr.as_u64(), bytes.len() as u64))?;
            dst.copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Reads a byte range that may be either already-committed (any earlier
    /// revision) or allocated earlier within this same transaction.
    pub fn read(&self, addr: Address, len: u64) -> Result<&[u8], Error> {
        self.db.storage.getro(ByteRange::new(addr.as_u64(), len))
    }

    /// Convenience: allocate and zero-initialize space for a `Pod` value,
    /// returning a writable reference and its typed address.
    pub fn alloc_rw<T: bytemuck::Pod>(&mut self) -> Result<(&mut T, TypedAddress<T>), Error> {
        let size = std::mem::size_of::<T>() as u64;
        let align = std::mem::align_of::<T>() as u64;
        let addr = self.allocate(size, align)?;
        unsafe {
            let dst = self.db.storage.getrw(ByteRange::new(addr.as_u64(), size))?;
            let typed: &mut T = bytemuck::from_bytes_mut(dst);
            Ok((typed, TypedAddress::new(addr)))
        }
    }

    pub fn database(&self) -> &Database {
        self.db
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Serializes dirty heap nodes (the caller flushes its `HamtIndex`
    /// first and passes back the resulting header block), writes a new
    /// trailer referencing it, protects the newly written pages, and
    /// atomically publishes the new `footer_pos`.
    pub fn commit(mut self) -> Result<u64, Error> {
        if self.state != State::Open {
            return Err(Error::CannotAllocateAfterCommit);
        }
        let new_generation = self.generation_snapshot + 1;
        let trailer_addr = self.allocate(TRAILER_SIZE, 8)?;
        let total_size = self.cursor - self.dbsize_snapshot;
        self.db.write_trailer(new_generation, total_size, self.footer_pos_snapshot, trailer_addr)?;
        self.db.publish(trailer_addr, new_generation)?;
        self.db.release_write_lock()?;
        self.state = State::Committed;
        log::debug!("committed generation {new_generation} ({total_size} bytes written)");
        Ok(new_generation)
    }

    /// Writes the primary index's header block as the last thing before the
    /// trailer, keeping the `footer_pos - INDEX_HEADER_SIZE` addressing
    /// convention (`Database::primary_index_header`) intact.
    pub fn write_index_header(&mut self, root_raw: u64, size: u64) -> Result<Address, Error> {
        let addr = self.allocate(INDEX_HEADER_SIZE, 8)?;
        let mut bytes = [0u8; INDEX_HEADER_SIZE as usize];
        bytes[0..8].copy_from_slice(b"IndxHedr");
        bytes[8..16].copy_from_slice(&root_raw.to_le_bytes());
        bytes[16..24].copy_from_slice(&size.to_le_bytes());
        self.write(addr, &bytes)?;
        Ok(addr)
    }

    /// Discards this transaction's growth and releases the write lock.
    /// Always safe while the transaction is open; runs automatically if the
    /// transaction is dropped without a commit.
    pub fn rollback(mut self) -> Result<(), Error> {
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<(), Error> {
        if self.state != State::Open {
            return Ok(());
        }
        self.state = State::RolledBack;
        self.db.storage.truncate_to(self.storage_len_snapshot)?;
        self.db.release_write_lock()?;
        log::debug!("rolled back transaction begun at generation {}", self.generation_snapshot);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == State::Open {
            let _ = self.rollback_inner();
        }
    }
}

fn footer_trailer_len(db: &Database) -> Result<u64, Error> {
    let _ = db;
    Ok(TRAILER_SIZE)
}
