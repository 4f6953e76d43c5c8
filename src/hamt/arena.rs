//! Arena for in-heap branch nodes with stable references (`spec.md` §4.5).
//!
//! A list of fixed-size chunks, each holding up to [`ELEMENTS_PER_CHUNK`]
//! branches. Appending is O(1) amortized and never invalidates a
//! previously-issued [`NodeId`] — unlike a single growing `Vec`, a new
//! chunk is appended rather than the existing storage being reallocated,
//! which is what makes it safe for one heap branch to hold a `NodeId`
//! naming a sibling in the same arena.

use super::node::HeapBranch;

/// Branch slots per chunk. Sized, as in the original, to keep one chunk's
/// backing storage on the order of a few hundred KiB under heavy insert
/// load.
pub const ELEMENTS_PER_CHUNK: usize = 512;

/// A stable reference to a [`HeapBranch`] inside an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    chunk: u32,
    slot: u32,
}

pub struct Arena {
    chunks: Vec<Vec<HeapBranch>>,
}

impl Arena {
    pub fn new() -> Self {
        Arena { chunks: vec![Vec::with_capacity(ELEMENTS_PER_CHUNK)] }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Vec::is_empty)
    }

    pub fn push(&mut self, node: HeapBranch) -> NodeId {
        if self.chunks.last().map_or(true, |c| c.len() == ELEMENTS_PER_CHUNK) {
            self.chunks.push(Vec::with_capacity(ELEMENTS_PER_CHUNK));
        }
        let chunk_idx = self.chunks.len() - 1;
        let chunk = self.chunks.last_mut().expect("just ensured a tail chunk exists");
        let slot = chunk.len() as u32;
        chunk.push(node);
        NodeId { chunk: chunk_idx as u32, slot }
    }

    pub fn get(&self, id: NodeId) -> &HeapBranch {
        &self.chunks[id.chunk as usize][id.slot as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut HeapBranch {
        &mut self.chunks[id.chunk as usize][id.slot as usize]
    }

    /// Destroys all elements in insertion order and releases every chunk.
    /// Called after a successful flush, and on rollback.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.chunks.push(Vec::with_capacity(ELEMENTS_PER_CHUNK));
    }

    /// Visits every branch in insertion (chunk, then slot) order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &HeapBranch)> {
        self.chunks.iter().enumerate().flat_map(|(chunk_idx, chunk)| {
            chunk.iter().enumerate().map(move |(slot, node)| {
                (NodeId { chunk: chunk_idx as u32, slot: slot as u32 }, node)
            })
        })
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
