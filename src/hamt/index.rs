//! The public HAMT API: `insert`, `insert_or_assign`, `find`, `flush`, and
//! forward iteration (`spec.md` §4.4).

use byteorder::{ByteOrder, LittleEndian};

use crate::address::{Address, TypedAddress};
use crate::database::Database;
use crate::error::Error;
use crate::sstring::{fnv1a, SStringView};
use crate::transaction::Transaction;

use super::arena::Arena;
use super::node::{
    decode_leaf, encode_leaf, parse_node, slot_at, ChildPointer, FileNodeView, HeapBranch,
    HeapLinear, LeafRecord, BRANCH_SIGNATURE, HEADER_SIGNATURE, LINEAR_SIGNATURE,
    MAX_BRANCH_DEPTH,
};

/// Anything a read can be satisfied against: either the database's
/// committed, read-only view, or an open transaction's own mix of
/// committed and newly-allocated bytes.
pub trait Reader {
    fn read_bytes(&self, addr: Address, len: u64) -> Result<&[u8], Error>;
}

impl Reader for Database {
    fn read_bytes(&self, addr: Address, len: u64) -> Result<&[u8], Error> {
        self.getro(addr, len)
    }
}

impl Reader for Transaction<'_> {
    fn read_bytes(&self, addr: Address, len: u64) -> Result<&[u8], Error> {
        self.read(addr, len)
    }
}

/// Reads back a leaf's `(key, value)` pair as [`SStringView`]s (`spec.md`
/// §4.6). Each view owns its own copy of the bytes (`SStringView::owned`)
/// rather than borrowing directly from the mapped file: `Storage::expand`/
/// `truncate_to` can replace or shrink the underlying mapping while a
/// `HamtIndex` handle is still alive, so a `'static`-borrowed view into raw
/// mmap bytes would risk dangling. The `Arc<[u8]>` backing still makes
/// repeated clones of a looked-up key/value (e.g. while it travels through
/// `iter`/export) cheap.
fn read_leaf<R: Reader>(r: &R, addr: Address) -> Result<(SStringView, SStringView), Error> {
    let head = r.read_bytes(addr, 16)?;
    let key_len = LittleEndian::read_u64(&head[0..8]);
    let value_len = LittleEndian::read_u64(&head[8..16]);
    let total = 16 + key_len + value_len;
    let bytes = r.read_bytes(addr, total)?;
    let (k, v) = decode_leaf(bytes)?;
    Ok((SStringView::owned(k.to_vec()), SStringView::owned(v.to_vec())))
}

fn read_file_node<R: Reader>(r: &R, addr: Address) -> Result<FileNodeView, Error> {
    let head = r.read_bytes(addr, 16)?;
    let signature = &head[0..8];
    let full_len = if signature == BRANCH_SIGNATURE {
        let bitmap = LittleEndian::read_u64(&head[8..16]);
        16 + bitmap.count_ones() as u64 * 8
    } else if signature == LINEAR_SIGNATURE {
        let count = LittleEndian::read_u64(&head[8..16]);
        16 + count * 8
    } else {
        return Err(Error::IndexCorrupt { reason: "unrecognized node signature" });
    };
    let bytes = r.read_bytes(addr, full_len)?;
    parse_node(bytes, addr)
}

fn write_leaf(txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<TypedAddress<LeafRecord>, Error> {
    let bytes = encode_leaf(key, value);
    let addr = txn.allocate_leaf(bytes.len() as u64)?;
    txn.write(addr, &bytes)?;
    Ok(TypedAddress::new(addr))
}

/// A single trie, either freshly loaded from a committed header block or
/// under construction within an open transaction. `arena` only ever holds
/// live nodes while a transaction is in progress; it is emptied by
/// `flush`.
pub struct HamtIndex {
    root: ChildPointer,
    size: u64,
    arena: Arena,
    /// The revision this trie's root was resolved against (`spec.md` §4.4
    /// construction: "Record the database's current revision as the trie's
    /// `revision_`"). An insert or flush performed once a newer revision has
    /// since been committed fails with `IndexNotLatestRevision` rather than
    /// silently writing from a stale view of the file.
    revision: u64,
}

impl HamtIndex {
    /// A brand-new, empty trie anchored at `revision` (typically the
    /// database's current revision at construction time).
    pub fn new_empty(revision: u64) -> Self {
        HamtIndex { root: ChildPointer::Null, size: 0, arena: Arena::new(), revision }
    }

    /// Loads the index rooted at `header_addr`, or an empty index if it is
    /// null (an r0 database, `spec.md` §4.4).
    pub fn load(db: &Database, header_addr: Address) -> Result<Self, Error> {
        let revision = db.current_revision();
        if header_addr.is_null() {
            return Ok(Self::new_empty(revision));
        }
        let bytes = db.getro(header_addr, 24)?;
        if &bytes[0..8] != HEADER_SIGNATURE {
            return Err(Error::IndexCorrupt { reason: "index header signature mismatch" });
        }
        let root_raw = LittleEndian::read_u64(&bytes[8..16]);
        let size = LittleEndian::read_u64(&bytes[16..24]);
        let root = ChildPointer::from_raw(root_raw)?;
        let shape_ok = match (size, &root) {
            (0, ChildPointer::Null) => true,
            (1, ChildPointer::Leaf(_)) => true,
            (n, ChildPointer::FileNode(_)) => n > 1,
            _ => false,
        };
        if !shape_ok {
            return Err(Error::IndexCorrupt { reason: "index root shape inconsistent with its recorded size" });
        }
        Ok(HamtIndex { root, size, arena: Arena::new(), revision })
    }

    /// The revision this handle was constructed against.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn check_latest(&self, txn: &Transaction) -> Result<(), Error> {
        let current = txn.database().current_revision();
        if current != self.revision {
            log::warn!(
                "refusing to write through a stale index handle (captured revision {}, database is now at {current})",
                self.revision
            );
            return Err(Error::IndexNotLatestRevision { captured: self.revision, current });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn empty(&self) -> bool {
        self.size == 0
    }

    pub fn find<R: Reader>(&self, r: &R, key: &[u8]) -> Result<Option<SStringView>, Error> {
        let hash = fnv1a(key);
        self.find_in(r, &self.root, key, hash, 0)
    }

    pub fn contains<R: Reader>(&self, r: &R, key: &[u8]) -> Result<bool, Error> {
        Ok(self.find(r, key)?.is_some())
    }

    fn find_in<R: Reader>(
        &self,
        r: &R,
        node: &ChildPointer,
        key: &[u8],
        hash: u64,
        depth: u32,
    ) -> Result<Option<SStringView>, Error> {
        match node {
            ChildPointer::Null => Ok(None),
            ChildPointer::Leaf(addr) => {
                let (k, v) = read_leaf(r, addr.to_address())?;
                Ok(if k.as_bytes() == key { Some(v) } else { None })
            }
            ChildPointer::FileNode(addr) => match read_file_node(r, *addr)? {
                FileNodeView::Branch(b) => {
                    let slot = slot_at(hash, depth);
                    let bit = 1u64 << slot;
                    if b.bitmap & bit == 0 {
                        return Ok(None);
                    }
                    let idx = (b.bitmap & (bit - 1)).count_ones() as usize;
                    self.find_in(r, &b.children[idx], key, hash, depth + 1)
                }
                FileNodeView::Linear(l) => {
                    for leaf in &l.leaves {
                        let (k, v) = read_leaf(r, leaf.to_address())?;
                        if k.as_bytes() == key {
                            return Ok(Some(v));
                        }
                    }
                    Ok(None)
                }
            },
            ChildPointer::HeapBranch(id) => {
                let b = self.arena.get(*id);
                let slot = slot_at(hash, depth);
                match b.child(slot) {
                    None => Ok(None),
                    Some(child) => self.find_in(r, child, key, hash, depth + 1),
                }
            }
            ChildPointer::HeapLinear(l) => {
                for leaf in &l.leaves {
                    let (k, v) = read_leaf(r, leaf.to_address())?;
                    if k.as_bytes() == key {
                        return Ok(Some(v));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Inserts `key`/`value` only if `key` is not already present.
    /// Returns `true` if the key was newly inserted.
    pub fn insert(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        self.insert_impl(txn, key, value, false)
    }

    /// Inserts `key`/`value`, overwriting any existing value for `key`.
    /// Returns `true` if the key was newly inserted, `false` if an
    /// existing entry was updated.
    pub fn insert_or_assign(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        self.insert_impl(txn, key, value, true)
    }

    fn insert_impl(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8], overwrite: bool) -> Result<bool, Error> {
        self.check_latest(txn)?;
        let hash = fnv1a(key);
        let root = std::mem::replace(&mut self.root, ChildPointer::Null);
        let (new_root, inserted) = self.insert_node(txn, root, key, value, hash, 0, overwrite)?;
        self.root = new_root;
        if inserted {
            self.size += 1;
        }
        Ok(inserted)
    }

    fn insert_node(
        &mut self,
        txn: &mut Transaction,
        node: ChildPointer,
        key: &[u8],
        value: &[u8],
        hash: u64,
        depth: u32,
        overwrite: bool,
    ) -> Result<(ChildPointer, bool), Error> {
        match node {
            ChildPointer::Null => {
                let addr = write_leaf(txn, key, value)?;
                Ok((ChildPointer::Leaf(addr), true))
            }
            ChildPointer::Leaf(existing_addr) => {
                let (existing_key, _existing_value) = read_leaf(txn, existing_addr.to_address())?;
                if existing_key.as_bytes() == key {
                    if !overwrite {
                        return Ok((ChildPointer::Leaf(existing_addr), false));
                    }
                    let new_addr = write_leaf(txn, key, value)?;
                    return Ok((ChildPointer::Leaf(new_addr), false));
                }
                let existing_hash = fnv1a(existing_key.as_bytes());
                let combined = self.combine_leaves(txn, existing_addr, existing_hash, key, value, hash, depth)?;
                Ok((combined, true))
            }
            ChildPointer::FileNode(addr) => match read_file_node(txn, addr)? {
                FileNodeView::Branch(b) => {
                    let slot = slot_at(hash, depth);
                    let bit = 1u64 << slot;
                    if b.bitmap & bit == 0 {
                        let leaf_addr = write_leaf(txn, key, value)?;
                        let mut heap = HeapBranch { bitmap: b.bitmap, children: b.children };
                        heap.insert_child(slot, ChildPointer::Leaf(leaf_addr));
                        let id = self.arena.push(heap);
                        Ok((ChildPointer::HeapBranch(id), true))
                    } else {
                        let idx = (b.bitmap & (bit - 1)).count_ones() as usize;
                        let original_child = b.children[idx].clone();
                        let original_raw = original_child.to_raw();
                        let (new_child, inserted) =
                            self.insert_node(txn, original_child, key, value, hash, depth + 1, overwrite)?;
                        if !inserted && new_child.to_raw() == original_raw {
                            // The recursive call left this slot's child
                            // pointer unchanged (a no-op `insert` of an
                            // already-present key); stay file-resident
                            // rather than copying this branch onto the heap
                            // for nothing (`spec.md` §4.4.1, §4.4.2: a node
                            // is promoted to the heap iff it becomes dirty).
                            return Ok((ChildPointer::FileNode(addr), false));
                        }
                        let mut heap = HeapBranch { bitmap: b.bitmap, children: b.children };
                        heap.replace_child(slot, new_child);
                        let id = self.arena.push(heap);
                        Ok((ChildPointer::HeapBranch(id), inserted))
                    }
                }
                FileNodeView::Linear(l) => {
                    for (i, leaf) in l.leaves.iter().enumerate() {
                        let (existing_key, _) = read_leaf(txn, leaf.to_address())?;
                        if existing_key.as_bytes() == key {
                            if !overwrite {
                                return Ok((ChildPointer::FileNode(addr), false));
                            }
                            let new_addr = write_leaf(txn, key, value)?;
                            let mut leaves = l.leaves.clone();
                            leaves[i] = new_addr;
                            return Ok((ChildPointer::HeapLinear(Box::new(HeapLinear { leaves })), false));
                        }
                    }
                    let new_addr = write_leaf(txn, key, value)?;
                    let mut leaves = l.leaves;
                    leaves.push(new_addr);
                    Ok((ChildPointer::HeapLinear(Box::new(HeapLinear { leaves })), true))
                }
            },
            ChildPointer::HeapBranch(id) => {
                let slot = slot_at(hash, depth);
                let has = self.arena.get(id).has_slot(slot);
                if !has {
                    let leaf_addr = write_leaf(txn, key, value)?;
                    self.arena.get_mut(id).insert_child(slot, ChildPointer::Leaf(leaf_addr));
                    Ok((ChildPointer::HeapBranch(id), true))
                } else {
                    let child = self.arena.get_mut(id).replace_child(slot, ChildPointer::Null);
                    let (new_child, inserted) = self.insert_node(txn, child, key, value, hash, depth + 1, overwrite)?;
                    self.arena.get_mut(id).replace_child(slot, new_child);
                    Ok((ChildPointer::HeapBranch(id), inserted))
                }
            }
            ChildPointer::HeapLinear(mut linear) => {
                let mut found = None;
                for i in 0..linear.leaves.len() {
                    let (existing_key, _) = read_leaf(txn, linear.leaves[i].to_address())?;
                    if existing_key.as_bytes() == key {
                        found = Some(i);
                        break;
                    }
                }
                if let Some(i) = found {
                    if !overwrite {
                        return Ok((ChildPointer::HeapLinear(linear), false));
                    }
                    let new_addr = write_leaf(txn, key, value)?;
                    linear.leaves[i] = new_addr;
                    return Ok((ChildPointer::HeapLinear(linear), false));
                }
                let new_addr = write_leaf(txn, key, value)?;
                linear.leaves.push(new_addr);
                Ok((ChildPointer::HeapLinear(linear), true))
            }
        }
    }

    /// Builds the branch (or, past `MAX_BRANCH_DEPTH`, linear) node needed
    /// to hold both `existing_addr` (already on disk) and a freshly
    /// written leaf for `new_key`/`new_value`, descending one slot at a
    /// time while their hashes keep colliding.
    fn combine_leaves(
        &mut self,
        txn: &mut Transaction,
        existing_addr: TypedAddress<LeafRecord>,
        existing_hash: u64,
        new_key: &[u8],
        new_value: &[u8],
        new_hash: u64,
        depth: u32,
    ) -> Result<ChildPointer, Error> {
        if depth >= MAX_BRANCH_DEPTH {
            let new_addr = write_leaf(txn, new_key, new_value)?;
            return Ok(ChildPointer::HeapLinear(Box::new(HeapLinear {
                leaves: vec![existing_addr, new_addr],
            })));
        }
        let existing_slot = slot_at(existing_hash, depth);
        let new_slot = slot_at(new_hash, depth);
        if existing_slot != new_slot {
            let new_addr = write_leaf(txn, new_key, new_value)?;
            let branch = HeapBranch::two(
                existing_slot,
                ChildPointer::Leaf(existing_addr),
                new_slot,
                ChildPointer::Leaf(new_addr),
            );
            let id = self.arena.push(branch);
            Ok(ChildPointer::HeapBranch(id))
        } else {
            let child = self.combine_leaves(txn, existing_addr, existing_hash, new_key, new_value, new_hash, depth + 1)?;
            let branch = HeapBranch::single(existing_slot, child);
            let id = self.arena.push(branch);
            Ok(ChildPointer::HeapBranch(id))
        }
    }

    /// Serializes every heap-resident node reachable from the root in
    /// post-order, writes the index header block, and clears the arena.
    /// Returns the address of the header block to be referenced by the
    /// transaction's trailer.
    pub fn flush(&mut self, txn: &mut Transaction) -> Result<Address, Error> {
        self.check_latest(txn)?;
        let root = std::mem::replace(&mut self.root, ChildPointer::Null);
        self.root = self.flush_node(txn, root)?;
        self.arena.clear();
        let root_raw = self.root.to_raw().expect("flush_node leaves no heap-resident nodes");
        let header_addr = txn.write_index_header(root_raw, self.size)?;
        self.revision = txn.pending_generation();
        log::debug!("flushed index ({} entries) at {header_addr:?}", self.size);
        Ok(header_addr)
    }

    fn flush_node(&mut self, txn: &mut Transaction, node: ChildPointer) -> Result<ChildPointer, Error> {
        match node {
            ChildPointer::HeapBranch(id) => {
                let n = self.arena.get(id).children.len();
                for i in 0..n {
                    let child = std::mem::replace(&mut self.arena.get_mut(id).children[i], ChildPointer::Null);
                    let flushed = self.flush_node(txn, child)?;
                    self.arena.get_mut(id).children[i] = flushed;
                }
                let encoded_len = self.arena.get(id).encoded_len();
                let mut buf = vec![0u8; encoded_len];
                self.arena.get(id).encode_into(&mut buf);
                let addr = txn.allocate(encoded_len as u64, 8)?;
                txn.write(addr, &buf)?;
                Ok(ChildPointer::FileNode(addr))
            }
            ChildPointer::HeapLinear(linear) => {
                let mut buf = vec![0u8; linear.encoded_len()];
                linear.encode_into(&mut buf);
                let addr = txn.allocate(buf.len() as u64, 8)?;
                txn.write(addr, &buf)?;
                Ok(ChildPointer::FileNode(addr))
            }
            other => Ok(other),
        }
    }

    /// A snapshot of every `(key, value)` pair reachable from the root at
    /// the moment this is called, in trie traversal order. Materialized
    /// eagerly so that a later `flush` (which only appends) can never
    /// invalidate an iterator already in hand.
    pub fn iter<R: Reader>(&self, r: &R) -> Result<Iter, Error> {
        let mut items = Vec::new();
        self.collect_node(r, &self.root, &mut items)?;
        Ok(Iter { inner: items.into_iter() })
    }

    fn collect_node<R: Reader>(
        &self,
        r: &R,
        node: &ChildPointer,
        out: &mut Vec<(SStringView, SStringView)>,
    ) -> Result<(), Error> {
        match node {
            ChildPointer::Null => Ok(()),
            ChildPointer::Leaf(addr) => {
                out.push(read_leaf(r, addr.to_address())?);
                Ok(())
            }
            ChildPointer::FileNode(addr) => match read_file_node(r, *addr)? {
                FileNodeView::Branch(b) => {
                    for child in &b.children {
                        self.collect_node(r, child, out)?;
                    }
                    Ok(())
                }
                FileNodeView::Linear(l) => {
                    for leaf in &l.leaves {
                        out.push(read_leaf(r, leaf.to_address())?);
                    }
                    Ok(())
                }
            },
            ChildPointer::HeapBranch(id) => {
                let b = self.arena.get(*id);
                for child in &b.children {
                    self.collect_node(r, child, out)?;
                }
                Ok(())
            }
            ChildPointer::HeapLinear(l) => {
                for leaf in &l.leaves {
                    out.push(read_leaf(r, leaf.to_address())?);
                }
                Ok(())
            }
        }
    }
}

/// A materialized forward iterator over `(key, value)` pairs (`spec.md`
/// §4.4.4's `begin`/`end`).
pub struct Iter {
    inner: std::vec::IntoIter<(SStringView, SStringView)>,
}

impl Iterator for Iter {
    type Item = (SStringView, SStringView);
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::OpenOptions;

    #[test]
    fn insert_then_find_round_trips() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        {
            let mut txn = db.begin().unwrap();
            assert!(index.insert(&mut txn, b"hello", b"world").unwrap());
            assert_eq!(index.find(&txn, b"hello").unwrap().as_deref(), Some(&b"world"[..]));
            index.flush(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn insert_does_not_overwrite() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        assert!(index.insert(&mut txn, b"k", b"v1").unwrap());
        assert!(!index.insert(&mut txn, b"k", b"v2").unwrap());
        assert_eq!(index.find(&txn, b"k").unwrap().as_deref(), Some(&b"v1"[..]));
    }

    #[test]
    fn insert_or_assign_overwrites() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        assert!(index.insert_or_assign(&mut txn, b"k", b"v1").unwrap());
        assert!(!index.insert_or_assign(&mut txn, b"k", b"v2").unwrap());
        assert_eq!(index.find(&txn, b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn many_keys_survive_flush_and_reload() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let header_addr;
        {
            let mut txn = db.begin().unwrap();
            for i in 0..500u32 {
                let k = format!("key-{i}");
                let v = format!("value-{i}");
                index.insert(&mut txn, k.as_bytes(), v.as_bytes()).unwrap();
            }
            header_addr = index.flush(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        let reloaded = HamtIndex::load(&db, header_addr).unwrap();
        assert_eq!(reloaded.size(), 500);
        for i in 0..500u32 {
            let k = format!("key-{i}");
            let v = format!("value-{i}");
            assert_eq!(reloaded.find(&db, k.as_bytes()).unwrap().as_deref(), Some(v.as_bytes()));
        }
        let collected: Vec<_> = reloaded.iter(&db).unwrap().collect();
        assert_eq!(collected.len(), 500);
    }

    #[test]
    fn insert_on_stale_revision_fails() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let header_addr = {
            let mut txn = db.begin().unwrap();
            let mut index = HamtIndex::new_empty(db.current_revision());
            index.insert(&mut txn, b"a", b"1").unwrap();
            let addr = index.flush(&mut txn).unwrap();
            txn.commit().unwrap();
            addr
        };
        let mut stale = HamtIndex::load(&db, header_addr).unwrap();
        {
            // Advance the database to a newer revision behind the stale handle's back.
            let mut txn = db.begin().unwrap();
            let mut fresh = HamtIndex::load(&db, header_addr).unwrap();
            fresh.insert(&mut txn, b"b", b"2").unwrap();
            fresh.flush(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        let mut txn = db.begin().unwrap();
        let err = stale.insert(&mut txn, b"c", b"3").unwrap_err();
        assert!(matches!(err, Error::IndexNotLatestRevision { .. }));
    }

    /// Property 7: the multiset of (key, value) pairs a full iteration
    /// produces is identical before and after `flush`.
    #[test]
    fn iteration_is_stable_across_flush() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            index.insert(&mut txn, k.as_bytes(), v.as_bytes()).unwrap();
        }
        let mut before: Vec<_> = index.iter(&txn).unwrap().collect();
        before.sort();

        index.flush(&mut txn).unwrap();
        let mut after: Vec<_> = index.iter(&txn).unwrap().collect();
        after.sort();

        assert_eq!(before, after);
    }

    /// S6: inserted entries survive a flush and reload through a fresh
    /// `HamtIndex` rooted at the returned header address.
    #[test]
    fn s6_round_trip_through_flush_and_reload() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let header_addr = {
            let mut txn = db.begin().unwrap();
            for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
                index.insert(&mut txn, k.as_bytes(), v.as_bytes()).unwrap();
            }
            let addr = index.flush(&mut txn).unwrap();
            txn.commit().unwrap();
            addr
        };

        let reloaded = HamtIndex::load(&db, header_addr).unwrap();
        let mut pairs: Vec<_> = reloaded
            .iter(&db)
            .unwrap()
            .map(|(k, v)| (k.as_str().unwrap().to_string(), v.as_str().unwrap().to_string()))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
                ("d".to_string(), "4".to_string()),
            ]
        );
    }

    /// A no-op `insert` of an already-present key, once its branch path is
    /// file-resident, must not copy any branch onto the heap.
    #[test]
    fn idempotent_insert_does_not_dirty_a_file_resident_branch() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            index.insert(&mut txn, k.as_bytes(), v.as_bytes()).unwrap();
        }
        index.flush(&mut txn).unwrap();
        let root_before = index.root.to_raw();
        assert!(root_before.is_some(), "flush leaves only file-resident nodes");

        assert!(!index.insert(&mut txn, b"a", b"999").unwrap());

        assert_eq!(index.root.to_raw(), root_before, "a no-op insert must not dirty any branch");
        assert!(index.arena.is_empty());
        assert_eq!(index.find(&txn, b"a").unwrap().as_deref(), Some(&b"1"[..]));
    }

    /// S4: a collision at level 0 between hashes whose low 6 bits differ
    /// yields a root branch with exactly two bits set, ordered by slot.
    #[test]
    fn collision_at_level_zero_creates_two_child_branch() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut txn = db.begin().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let existing_addr = write_leaf(&mut txn, b"a", b"1").unwrap();
        let combined = index
            .combine_leaves(&mut txn, existing_addr, 0b000000, b"b", b"2", 0b000001, 0)
            .unwrap();
        let ChildPointer::HeapBranch(id) = combined else {
            panic!("expected a heap branch");
        };
        let branch = index.arena.get(id);
        assert_eq!(branch.bitmap.count_ones(), 2);
        assert_eq!(branch.slot_index(0), 0);
        assert_eq!(branch.slot_index(1), 1);
    }

    /// S5: hashes agreeing on every bit below the linear-node cutoff produce
    /// a chain of ten one-child branches terminating in a linear node
    /// holding both leaves.
    #[test]
    fn full_hash_collision_promotes_to_linear_node_at_max_depth() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut txn = db.begin().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let existing_addr = write_leaf(&mut txn, b"e", b"1").unwrap();
        let mut node = index.combine_leaves(&mut txn, existing_addr, 0, b"f", b"2", 0, 0).unwrap();
        for _ in 0..MAX_BRANCH_DEPTH {
            let ChildPointer::HeapBranch(id) = node else {
                panic!("expected a chain of single-child branches");
            };
            let branch = index.arena.get(id);
            assert_eq!(branch.bitmap.count_ones(), 1);
            assert!(branch.has_slot(0));
            node = branch.child(0).unwrap().clone();
        }
        let ChildPointer::HeapLinear(linear) = node else {
            panic!("expected a linear node at the depth cutoff");
        };
        assert_eq!(linear.leaves.len(), 2);
        assert_ne!(linear.leaves[0].to_address(), linear.leaves[1].to_address());
    }
}
