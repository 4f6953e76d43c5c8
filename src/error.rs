use crate::address::Address;

/// The crate's single error type. Every code in the external error taxonomy
/// is a distinct variant; each carries the context needed to diagnose it
/// without re-reading the file.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("header is corrupt: {reason}")]
    HeaderCorrupt { reason: &'static str },

    #[error("header version mismatch: found {found}, expected {expected}")]
    HeaderVersionMismatch { found: u32, expected: u32 },

    #[error("trailer at {at:?} is corrupt: {reason}")]
    FooterCorrupt { at: Address, reason: &'static str },

    #[error("index is corrupt: {reason}")]
    IndexCorrupt { reason: &'static str },

    #[error("revision {0} is not reachable from the current footer")]
    UnknownRevision(u64),

    #[error("address {addr:?} does not satisfy alignment {align}")]
    BadAlignment { addr: Address, align: u64 },

    #[error("address range [{offset}, {offset}+{len}) is outside the mapped extent")]
    BadAddress { offset: u64, len: u64 },

    #[error("address range [{offset}, {offset}+{len}) is read-only")]
    ReadOnlyAddress { offset: u64, len: u64 },

    #[error(
        "index was flushed against a stale revision (captured {captured}, current {current})"
    )]
    IndexNotLatestRevision { captured: u64, current: u64 },

    #[error("cannot open a writing transaction on a read-only database")]
    TransactionOnReadOnlyDatabase,

    #[error("cannot allocate from a transaction that has already committed")]
    CannotAllocateAfterCommit,

    #[error("short read at offset {offset}: wanted {wanted} bytes, got {got}")]
    DidNotReadNumberOfBytesRequested { offset: u64, wanted: usize, got: usize },

    #[error("could not parse database uuid: {0}")]
    UuidParseError(#[from] uuid::Error),

    #[error("the store has been closed")]
    StoreClosed,

    #[error("unrecognized key '{0}' in a transaction export object")]
    UnknownTransactionObjectKey(String),

    #[error("invalid uuid string in exchange document: {0}")]
    BadUuid(String),

    #[error("a root export object was missing required fields")]
    RootObjectWasIncomplete,

    #[error("malformed exchange document: {0}")]
    ExchangeCorrupt(String),

    #[error("another writer already holds the transaction lock")]
    WriteLockHeld,

    #[error("unsupported OS page size: got {got} bytes, storage requires a power of two no larger than the region size")]
    UnsupportedPageSize { got: usize },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
