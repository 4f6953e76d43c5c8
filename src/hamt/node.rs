//! On-disk node record layouts and the tagged child pointer
//! (`spec.md` §3.3, §6.1).

use byteorder::{ByteOrder, LittleEndian};

use crate::address::{Address, TypedAddress};
use crate::error::Error;

/// Branch record signature, as stored on disk.
pub const BRANCH_SIGNATURE: [u8; 8] = *b"Internal";
/// Linear (collision) node signature.
pub const LINEAR_SIGNATURE: [u8; 8] = *b"IndxLner";
/// Index header block signature.
pub const HEADER_SIGNATURE: [u8; 8] = *b"IndxHedr";

/// Number of hash bits consumed per trie level (fan-out 64).
pub const HASH_INDEX_BITS: u32 = 6;
/// Depth at which hash bits are exhausted and collisions are resolved with a
/// linear node (`spec.md` §3.4).
pub const MAX_BRANCH_DEPTH: u32 = 10;

/// Marker type for a serialized `(key, value)` record addressed by a leaf.
pub struct LeafRecord;

/// A 64-bit tagged reference to any trie node: a leaf, a file-resident
/// branch/linear node (disambiguated on read by signature), or a
/// transaction-local heap node. The enum discriminant stands in for the
/// two on-disk tag bits; `to_raw`/`from_raw` bridge to the real bit-tagged
/// on-disk representation.
#[derive(Clone, Debug)]
pub enum ChildPointer {
    Null,
    /// File-resident leaf. Leaves are never heap-resident: every insert
    /// immediately serializes the new pair via the owning transaction.
    Leaf(TypedAddress<LeafRecord>),
    /// File-resident branch or linear node; the signature at `addr`
    /// disambiguates which.
    FileNode(Address),
    /// Heap-resident branch, owned by the transaction's [`super::arena::Arena`].
    HeapBranch(super::arena::NodeId),
    /// Heap-resident linear node, individually owned (boxed).
    HeapLinear(Box<HeapLinear>),
}

impl ChildPointer {
    pub fn is_null(&self) -> bool {
        matches!(self, ChildPointer::Null)
    }

    pub fn is_heap(&self) -> bool {
        matches!(self, ChildPointer::HeapBranch(_) | ChildPointer::HeapLinear(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, ChildPointer::Leaf(_))
    }

    /// Encodes this pointer as the raw on-disk 64-bit tagged value. Returns
    /// `None` for heap-resident variants: those must be flushed first.
    pub fn to_raw(&self) -> Option<u64> {
        match self {
            ChildPointer::Null => Some(0),
            ChildPointer::Leaf(addr) => {
                let v = addr.to_address().as_u64();
                debug_assert_eq!(v & 0b11, 0, "leaf addresses must be 4-byte aligned");
                Some(v)
            }
            ChildPointer::FileNode(addr) => Some(addr.as_u64() | 0b01),
            ChildPointer::HeapBranch(_) | ChildPointer::HeapLinear(_) => None,
        }
    }

    /// Decodes a raw on-disk tagged value, rejecting a set heap bit: disk
    /// values are untrusted until validated (`spec.md` §9).
    pub fn from_raw(raw: u64) -> Result<Self, Error> {
        if raw == 0 {
            return Ok(ChildPointer::Null);
        }
        let branch_bit = raw & 0b01;
        let heap_bit = raw & 0b10;
        if heap_bit != 0 {
            return Err(Error::IndexCorrupt { reason: "on-disk index pointer has the heap bit set" });
        }
        let addr = Address::new(raw & !0b11);
        if branch_bit == 0 {
            Ok(ChildPointer::Leaf(TypedAddress::new(addr)))
        } else {
            Ok(ChildPointer::FileNode(addr))
        }
    }
}

/// A heap-resident branch: the mutable, copy-on-write form of a branch node.
pub struct HeapBranch {
    pub bitmap: u64,
    pub children: Vec<ChildPointer>,
}

impl HeapBranch {
    pub fn single(slot: u32, child: ChildPointer) -> Self {
        HeapBranch { bitmap: 1u64 << slot, children: vec![child] }
    }

    pub fn two(slot_a: u32, child_a: ChildPointer, slot_b: u32, child_b: ChildPointer) -> Self {
        debug_assert_ne!(slot_a, slot_b);
        let (lo_slot, lo_child, hi_slot, hi_child) = if slot_a < slot_b {
            (slot_a, child_a, slot_b, child_b)
        } else {
            (slot_b, child_b, slot_a, child_a)
        };
        HeapBranch {
            bitmap: (1u64 << lo_slot) | (1u64 << hi_slot),
            children: vec![lo_child, hi_child],
        }
    }

    pub fn slot_index(&self, slot: u32) -> usize {
        let bit = 1u64 << slot;
        (self.bitmap & (bit - 1)).count_ones() as usize
    }

    pub fn has_slot(&self, slot: u32) -> bool {
        self.bitmap & (1u64 << slot) != 0
    }

    pub fn insert_child(&mut self, slot: u32, child: ChildPointer) {
        debug_assert!(!self.has_slot(slot));
        let idx = self.slot_index(slot);
        self.children.insert(idx, child);
        self.bitmap |= 1u64 << slot;
    }

    pub fn replace_child(&mut self, slot: u32, child: ChildPointer) -> ChildPointer {
        debug_assert!(self.has_slot(slot));
        let idx = self.slot_index(slot);
        std::mem::replace(&mut self.children[idx], child)
    }

    pub fn child(&self, slot: u32) -> Option<&ChildPointer> {
        if !self.has_slot(slot) {
            return None;
        }
        Some(&self.children[self.slot_index(slot)])
    }

    /// Serialized byte length: `sizeof(signature) + sizeof(bitmap) + N * 8`.
    pub fn encoded_len(&self) -> usize {
        16 + self.children.len() * 8
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&BRANCH_SIGNATURE);
        LittleEndian::write_u64(&mut out[8..16], self.bitmap);
        for (i, child) in self.children.iter().enumerate() {
            let raw = child.to_raw().expect("children must be flushed before encoding");
            LittleEndian::write_u64(&mut out[16 + i * 8..24 + i * 8], raw);
        }
    }
}

/// A heap-resident linear (collision) node: individually owned, never
/// shared via the arena.
#[derive(Clone)]
pub struct HeapLinear {
    pub leaves: Vec<TypedAddress<LeafRecord>>,
}

impl HeapLinear {
    pub fn encoded_len(&self) -> usize {
        16 + self.leaves.len() * 8
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&LINEAR_SIGNATURE);
        LittleEndian::write_u64(&mut out[8..16], self.leaves.len() as u64);
        for (i, leaf) in self.leaves.iter().enumerate() {
            LittleEndian::write_u64(&mut out[16 + i * 8..24 + i * 8], leaf.to_address().as_u64());
        }
    }
}

/// A parsed file-resident branch: `signature | bitmap:u64 | children[popcount]`.
pub struct BranchView {
    pub bitmap: u64,
    pub children: Vec<ChildPointer>,
}

/// A parsed file-resident linear node: `signature | count:u64 | leaves[count]`.
pub struct LinearView {
    pub leaves: Vec<TypedAddress<LeafRecord>>,
}

/// Either a parsed branch or linear node, read from the file by first
/// inspecting the 8-byte signature.
pub enum FileNodeView {
    Branch(BranchView),
    Linear(LinearView),
}

/// Parses the node at `bytes[..]` (already sized to the full record) after
/// validating its signature and popcount, per `spec.md` §4.4.5.
pub fn parse_node(bytes: &[u8], self_addr: Address) -> Result<FileNodeView, Error> {
    if bytes.len() < 16 {
        return Err(Error::IndexCorrupt { reason: "node record shorter than its fixed header" });
    }
    let signature = &bytes[0..8];
    if signature == BRANCH_SIGNATURE {
        let bitmap = LittleEndian::read_u64(&bytes[8..16]);
        if bitmap == 0 {
            return Err(Error::IndexCorrupt { reason: "branch bitmap is zero" });
        }
        let n = bitmap.count_ones() as usize;
        if bytes.len() < 16 + n * 8 {
            return Err(Error::IndexCorrupt { reason: "branch record truncated" });
        }
        let mut children = Vec::with_capacity(n);
        let mut seen = std::collections::HashSet::with_capacity(n);
        for i in 0..n {
            let raw = LittleEndian::read_u64(&bytes[16 + i * 8..24 + i * 8]);
            let child = ChildPointer::from_raw(raw)?;
            if let Some(addr) = child_address(&child) {
                if addr.as_u64() >= self_addr.as_u64() {
                    return Err(Error::IndexCorrupt {
                        reason: "child address is not strictly less than its parent's",
                    });
                }
                if !seen.insert(addr.as_u64()) {
                    return Err(Error::IndexCorrupt { reason: "duplicate child address in branch" });
                }
            }
            children.push(child);
        }
        Ok(FileNodeView::Branch(BranchView { bitmap, children }))
    } else if signature == LINEAR_SIGNATURE {
        let count = LittleEndian::read_u64(&bytes[8..16]) as usize;
        if bytes.len() < 16 + count * 8 {
            return Err(Error::IndexCorrupt { reason: "linear node record truncated" });
        }
        let mut leaves = Vec::with_capacity(count);
        for i in 0..count {
            let raw = LittleEndian::read_u64(&bytes[16 + i * 8..24 + i * 8]);
            if raw & 0b11 != 0 {
                return Err(Error::IndexCorrupt { reason: "linear node leaf address carries tag bits" });
            }
            if raw >= self_addr.as_u64() {
                return Err(Error::IndexCorrupt {
                    reason: "linear node leaf address is not strictly less than its parent's",
                });
            }
            leaves.push(TypedAddress::new(Address::new(raw)));
        }
        Ok(FileNodeView::Linear(LinearView { leaves }))
    } else {
        Err(Error::IndexCorrupt { reason: "unrecognized node signature" })
    }
}

fn child_address(child: &ChildPointer) -> Option<Address> {
    match child {
        ChildPointer::Leaf(a) => Some(a.to_address()),
        ChildPointer::FileNode(a) => Some(*a),
        _ => None,
    }
}

/// Serializes a `(key, value)` pair into a freshly allocated leaf record:
/// `key_len:u64 | value_len:u64 | key | value`.
pub fn encode_leaf(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u64).to_le_bytes());
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// Reads back the `(key, value)` pair from a serialized leaf record.
pub fn decode_leaf(bytes: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    if bytes.len() < 16 {
        return Err(Error::IndexCorrupt { reason: "leaf record shorter than its fixed header" });
    }
    let key_len = LittleEndian::read_u64(&bytes[0..8]) as usize;
    let value_len = LittleEndian::read_u64(&bytes[8..16]) as usize;
    if bytes.len() < 16 + key_len + value_len {
        return Err(Error::IndexCorrupt { reason: "leaf record truncated" });
    }
    let key = &bytes[16..16 + key_len];
    let value = &bytes[16 + key_len..16 + key_len + value_len];
    Ok((key, value))
}

/// `hash >> (HASH_INDEX_BITS * depth) & 0x3F`: the 6-bit slot at `depth`.
pub fn slot_at(hash: u64, depth: u32) -> u32 {
    ((hash >> (HASH_INDEX_BITS * depth)) & 0x3F) as u32
}
