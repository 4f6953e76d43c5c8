//! `pstore`: a persistent, append-only, memory-mapped key/value store.
//!
//! The core is a copy-on-write Hash Array-Mapped Trie ([`hamt`]) addressed
//! through tagged 64-bit index pointers ([`address`]), backed by a
//! memory-mapped region mapper ([`storage`]) and exposed through a
//! [`database::Database`] that hands out scoped write [`transaction::Transaction`]s.
//! A single memory-mapped file may be shared by many reader processes and
//! at most one writer at a time; every committed write publishes a new
//! immutable revision that remains reachable forever.
//!
//! ```no_run
//! use pstore::database::OpenOptions;
//! use pstore::hamt::HamtIndex;
//!
//! let mut db = OpenOptions::new().open("example.pstore")?;
//! let mut index = HamtIndex::load(&db, db.primary_index_header())?;
//! {
//!     let mut txn = db.begin()?;
//!     index.insert_or_assign(&mut txn, b"key", b"value")?;
//!     index.flush(&mut txn)?;
//!     txn.commit()?;
//! }
//! assert_eq!(index.find(&db, b"key")?.as_deref(), Some(&b"value"[..]));
//! # Ok::<(), pstore::error::Error>(())
//! ```

pub mod address;
pub mod database;
pub mod error;
pub mod exchange;
pub mod hamt;
pub mod sstring;
pub mod storage;
pub mod transaction;

pub use database::{Database, OpenOptions};
pub use error::{Error, Result};
pub use hamt::HamtIndex;
