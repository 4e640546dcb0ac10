// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to read and write guest memory.
//!
//! Guest memory is shared with a concurrently running guest, so it is exposed
//! to the host only as slices of [`AtomicU8`]. The host never holds a plain
//! `&[u8]` or `&mut [u8]` into guest RAM, which keeps concurrent guest writes
//! from being undefined behavior on the host side.

use std::fmt::Debug;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Effective page size for [`HeapMemory`] allocations.
pub const PAGE_SIZE: usize = 4096;

/// A memory access error returned by one of the [`GuestMemory`] methods.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct GuestMemoryError(Box<GuestMemoryErrorInner>);

impl GuestMemoryError {
    fn new(
        debug_name: &Arc<str>,
        op: GuestMemoryOperation,
        gpa: u64,
        len: u64,
        kind: GuestMemoryErrorKind,
    ) -> Self {
        GuestMemoryError(Box::new(GuestMemoryErrorInner {
            op,
            debug_name: debug_name.clone(),
            gpa,
            len,
            kind,
        }))
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> GuestMemoryErrorKind {
        self.0.kind
    }

    /// Returns the guest address of the failed access, relative to the
    /// [`GuestMemory`] object the access was made through.
    pub fn gpa(&self) -> u64 {
        self.0.gpa
    }
}

#[derive(Debug, Copy, Clone)]
enum GuestMemoryOperation {
    Read,
    Write,
    Fill,
    Resolve,
    Subrange,
}

impl std::fmt::Display for GuestMemoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            GuestMemoryOperation::Read => "read",
            GuestMemoryOperation::Write => "write",
            GuestMemoryOperation::Fill => "fill",
            GuestMemoryOperation::Resolve => "resolve",
            GuestMemoryOperation::Subrange => "subrange",
        })
    }
}

#[derive(Debug, Error)]
#[error(
    "guest memory '{debug_name}': {op} error: failed to access {gpa:#x}+{len:#x}: {kind}"
)]
struct GuestMemoryErrorInner {
    op: GuestMemoryOperation,
    debug_name: Arc<str>,
    gpa: u64,
    len: u64,
    kind: GuestMemoryErrorKind,
}

/// The kind of memory access error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GuestMemoryErrorKind {
    /// The range extends past the end of the memory object.
    OutOfRange,
    /// The address plus length overflows the address space.
    Overflow,
    /// The range is within bounds but is not backed by host memory.
    Unmapped,
}

impl std::fmt::Display for GuestMemoryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            GuestMemoryErrorKind::OutOfRange => "address out of range",
            GuestMemoryErrorKind::Overflow => "address overflow",
            GuestMemoryErrorKind::Unmapped => "memory not mapped",
        })
    }
}

/// A guest memory backing: the capability that translates a guest physical
/// address range into a host-accessible view.
///
/// Implementations must return a slice of exactly `len` bytes or `None`. The
/// callers in this crate have already checked `gpa + len` against
/// [`GuestMemoryAccess::max_address`], but an implementation may still have
/// holes in its address space.
pub trait GuestMemoryAccess: 'static + Send + Sync {
    /// Resolves `gpa..gpa + len` to host memory.
    fn mapping(&self, gpa: u64, len: usize) -> Option<&[AtomicU8]>;

    /// The size of the guest address space covered by this backing.
    fn max_address(&self) -> u64;
}

impl<T: GuestMemoryAccess> GuestMemoryAccess for Arc<T> {
    fn mapping(&self, gpa: u64, len: usize) -> Option<&[AtomicU8]> {
        self.as_ref().mapping(gpa, len)
    }

    fn max_address(&self) -> u64 {
        self.as_ref().max_address()
    }
}

/// A heap allocation usable as flat guest RAM starting at address zero.
pub struct HeapMemory {
    bytes: Box<[AtomicU8]>,
}

impl Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMemory")
            .field("len", &self.len())
            .finish()
    }
}

impl HeapMemory {
    /// Allocates a new zeroed memory of `size` bytes, rounded up to a page
    /// size.
    pub fn new(size: usize) -> Self {
        let len = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let mut bytes = Vec::with_capacity(len);
        bytes.resize_with(len, || AtomicU8::new(0));
        Self {
            bytes: bytes.into(),
        }
    }

    /// Returns the length of the memory in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl GuestMemoryAccess for HeapMemory {
    fn mapping(&self, gpa: u64, len: usize) -> Option<&[AtomicU8]> {
        let start = usize::try_from(gpa).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }

    fn max_address(&self) -> u64 {
        self.bytes.len() as u64
    }
}

struct Empty;

impl GuestMemoryAccess for Empty {
    fn mapping(&self, _gpa: u64, _len: usize) -> Option<&[AtomicU8]> {
        None
    }

    fn max_address(&self) -> u64 {
        0
    }
}

/// A wrapper around a [`GuestMemoryAccess`] that provides bounds-checked
/// methods for reading and writing guest memory.
///
/// A `GuestMemory` may be a window onto a larger backing (see
/// [`GuestMemory::subrange`]). Addresses passed to its methods are relative to
/// the start of the window.
#[derive(Clone)]
pub struct GuestMemory {
    imp: Arc<dyn GuestMemoryAccess>,
    debug_name: Arc<str>,
    base: u64,
    len: u64,
}

impl Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("debug_name", &self.debug_name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}

/// The default implementation is [`GuestMemory::empty`].
impl Default for GuestMemory {
    fn default() -> Self {
        Self::empty()
    }
}

impl GuestMemory {
    /// Returns a new instance using `imp` as the backing.
    ///
    /// `debug_name` is used to specify which guest memory is being accessed in
    /// error messages.
    pub fn new(debug_name: impl Into<Arc<str>>, imp: impl GuestMemoryAccess) -> Self {
        let len = imp.max_address();
        Self {
            imp: Arc::new(imp),
            debug_name: debug_name.into(),
            base: 0,
            len,
        }
    }

    /// Allocates zeroed heap memory of `size` bytes and returns a
    /// `GuestMemory` backed by it.
    pub fn allocate(size: usize) -> Self {
        Self::new("heap", HeapMemory::new(size))
    }

    /// Returns an empty guest memory, which fails every access.
    pub fn empty() -> Self {
        Self::new("empty", Empty)
    }

    /// Returns the size of this memory object in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if no address is accessible through this object.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn error(
        &self,
        op: GuestMemoryOperation,
        gpa: u64,
        len: u64,
        kind: GuestMemoryErrorKind,
    ) -> GuestMemoryError {
        GuestMemoryError::new(&self.debug_name, op, gpa, len, kind)
    }

    /// Checks `gpa..gpa + len` against the window and returns the absolute
    /// backing address.
    fn check_range(
        &self,
        op: GuestMemoryOperation,
        gpa: u64,
        len: u64,
    ) -> Result<u64, GuestMemoryError> {
        let end = gpa
            .checked_add(len)
            .ok_or_else(|| self.error(op, gpa, len, GuestMemoryErrorKind::Overflow))?;
        if end > self.len {
            return Err(self.error(op, gpa, len, GuestMemoryErrorKind::OutOfRange));
        }
        // Cannot overflow: base + len was validated when the window was made.
        Ok(self.base + gpa)
    }

    fn resolve_op(
        &self,
        op: GuestMemoryOperation,
        gpa: u64,
        len: usize,
    ) -> Result<&[AtomicU8], GuestMemoryError> {
        let len64 = len as u64;
        let address = self.check_range(op, gpa, len64)?;
        self.imp
            .mapping(address, len)
            .filter(|mapping| mapping.len() == len)
            .ok_or_else(|| self.error(op, gpa, len64, GuestMemoryErrorKind::Unmapped))
    }

    /// Resolves `gpa..gpa + len` to a borrowed host view of guest memory.
    ///
    /// The returned slice aliases guest RAM; the guest may change its contents
    /// at any time.
    pub fn resolve(&self, gpa: u64, len: usize) -> Result<&[AtomicU8], GuestMemoryError> {
        self.resolve_op(GuestMemoryOperation::Resolve, gpa, len)
    }

    /// Returns a window onto `offset..offset + len` of this memory. Addresses
    /// passed to the returned object are relative to `offset`.
    pub fn subrange(&self, offset: u64, len: u64) -> Result<GuestMemory, GuestMemoryError> {
        let base = self.check_range(GuestMemoryOperation::Subrange, offset, len)?;
        Ok(Self {
            imp: self.imp.clone(),
            debug_name: self.debug_name.clone(),
            base,
            len,
        })
    }

    /// Reads from guest memory address `gpa` into `dest`.
    pub fn read_at(&self, gpa: u64, dest: &mut [u8]) -> Result<(), GuestMemoryError> {
        let src = self.resolve_op(GuestMemoryOperation::Read, gpa, dest.len())?;
        read_atomic(src, dest);
        Ok(())
    }

    /// Writes `src` into guest memory at address `gpa`.
    pub fn write_at(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let dest = self.resolve_op(GuestMemoryOperation::Write, gpa, src.len())?;
        write_atomic(dest, src);
        Ok(())
    }

    /// Fills `len` bytes of guest memory at address `gpa` with `val`.
    pub fn fill_at(&self, gpa: u64, val: u8, len: usize) -> Result<(), GuestMemoryError> {
        let dest = self.resolve_op(GuestMemoryOperation::Fill, gpa, len)?;
        for b in dest {
            b.store(val, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads an object from guest memory at address `gpa`.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, gpa: u64) -> Result<T, GuestMemoryError> {
        let mut value = T::new_zeroed();
        self.read_at(gpa, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Writes an object to guest memory at address `gpa`.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        gpa: u64,
        value: &T,
    ) -> Result<(), GuestMemoryError> {
        self.write_at(gpa, value.as_bytes())
    }
}

/// Copies guest memory into a host buffer. The lengths must match.
pub fn read_atomic(src: &[AtomicU8], dest: &mut [u8]) {
    assert_eq!(src.len(), dest.len());
    for (d, s) in dest.iter_mut().zip(src) {
        *d = s.load(Ordering::Relaxed);
    }
}

/// Copies a host buffer into guest memory. The lengths must match.
pub fn write_atomic(dest: &[AtomicU8], src: &[u8]) {
    assert_eq!(src.len(), dest.len());
    for (d, s) in dest.iter().zip(src) {
        d.store(*s, Ordering::Relaxed);
    }
}
