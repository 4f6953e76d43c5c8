//! Segment/offset addressing into the store's flat byte space.

use std::fmt;
use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};

/// Size in bytes of a single addressing segment. Chosen to match the
/// region mapper's default window size (see [`crate::storage`]).
pub const SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// A 64-bit *(segment, offset)* address into the store's flat byte space.
/// The null address (`0`) is never dereferenced.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct Address(u64);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Address(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn segment(self) -> u64 {
        self.0 / SEGMENT_SIZE
    }

    #[inline]
    pub const fn offset_in_segment(self) -> u64 {
        self.0 % SEGMENT_SIZE
    }

    #[inline]
    pub fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{:x})", self.0)
    }
}

impl From<u64> for Address {
    fn from(raw: u64) -> Self {
        Address(raw)
    }
}

/// An address carrying a compile-time element type. Alignment of the
/// address must satisfy `align_of::<T>()`.
pub struct TypedAddress<T> {
    addr: Address,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedAddress<T> {
    #[inline]
    pub const fn new(addr: Address) -> Self {
        TypedAddress { addr, _marker: PhantomData }
    }

    #[inline]
    pub const fn null() -> Self {
        Self::new(Address::NULL)
    }

    #[inline]
    pub const fn to_address(self) -> Address {
        self.addr
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.addr.is_null()
    }
}

impl<T> Clone for TypedAddress<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for TypedAddress<T> {}
impl<T> PartialEq for TypedAddress<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for TypedAddress<T> {}
impl<T> fmt::Debug for TypedAddress<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedAddress({:?})", self.addr)
    }
}

/// A `(address, size_in_bytes)` pair naming a contiguous run of `T`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent<T> {
    pub addr: TypedAddress<T>,
    pub size: u64,
}

impl<T> Extent<T> {
    pub const fn new(addr: TypedAddress<T>, size: u64) -> Self {
        Extent { addr, size }
    }

    pub const fn null() -> Self {
        Extent { addr: TypedAddress::null(), size: 0 }
    }
}

#[inline]
pub const fn round_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}
