//! The persistent, copy-on-write Hash Array-Mapped Trie (`spec.md` §3, §4.4).

pub mod arena;
pub mod index;
pub mod node;

pub use index::{HamtIndex, Iter, Reader};
