// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scatter/gather views of a descriptor chain.

use std::sync::atomic::AtomicU8;
use thiserror::Error;

/// One buffer of a descriptor chain, resolved to host memory.
///
/// The segment borrows guest RAM directly; the guest can modify it at any
/// time, so contents read from it must be treated as untrusted.
#[derive(Debug, Copy, Clone)]
pub struct IoSegment<'a> {
    address: u64,
    buf: &'a [AtomicU8],
}

impl<'a> IoSegment<'a> {
    pub(crate) fn new(address: u64, buf: &'a [AtomicU8]) -> Self {
        Self { address, buf }
    }

    /// The guest physical address of the buffer.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The host view of the buffer.
    pub fn as_atomic_slice(&self) -> &'a [AtomicU8] {
        self.buf
    }
}

#[derive(Debug, Error)]
pub enum VirtioWriteError {
    #[error("{0:#x} bytes not written")]
    NotAllWritten(usize),
}

/// The buffers of one descriptor chain, split by access direction from the
/// device's point of view.
///
/// Within each list, segments are in chain order.
#[derive(Debug, Default)]
pub struct IoVec<'a> {
    /// Buffers the device reads (the guest filled them in).
    pub readable: Vec<IoSegment<'a>>,
    /// Buffers the device writes (the descriptor had the write flag).
    pub writable: Vec<IoSegment<'a>>,
}

impl<'a> IoVec<'a> {
    /// Total number of segments in the chain.
    pub fn segment_count(&self) -> usize {
        self.readable.len() + self.writable.len()
    }

    // Total size of the readable buffers.
    pub fn readable_len(&self) -> u64 {
        self.readable.iter().map(|s| s.len() as u64).sum()
    }

    // Total size of the writable buffers.
    pub fn writable_len(&self) -> u64 {
        self.writable.iter().map(|s| s.len() as u64).sum()
    }

    /// Copies the readable buffers, in order, into `target`. Returns the
    /// number of bytes copied.
    pub fn read(&self, target: &mut [u8]) -> usize {
        let mut remaining = target;
        let mut read_bytes = 0;
        for segment in &self.readable {
            if remaining.is_empty() {
                break;
            }
            let size = std::cmp::min(segment.len(), remaining.len());
            let (current, next) = remaining.split_at_mut(size);
            guestmem::read_atomic(&segment.buf[..size], current);
            read_bytes += size;
            remaining = next;
        }
        read_bytes
    }

    /// Writes `source` into the writable buffers, starting `offset` bytes into
    /// the first one.
    pub fn write_at_offset(&self, offset: u64, source: &[u8]) -> Result<(), VirtioWriteError> {
        let mut skip_bytes = offset;
        let mut remaining = source;
        for segment in &self.writable {
            if remaining.is_empty() {
                break;
            }
            let segment_len = segment.len() as u64;
            if skip_bytes >= segment_len {
                skip_bytes -= segment_len;
                continue;
            }

            let start = skip_bytes as usize;
            let size = std::cmp::min(segment.len() - start, remaining.len());
            let (current, next) = remaining.split_at(size);
            guestmem::write_atomic(&segment.buf[start..start + size], current);
            remaining = next;
            skip_bytes = 0;
        }

        if !remaining.is_empty() {
            return Err(VirtioWriteError::NotAllWritten(remaining.len()));
        }

        Ok(())
    }

    pub fn write(&self, source: &[u8]) -> Result<(), VirtioWriteError> {
        self.write_at_offset(0, source)
    }
}

/// The same chain as [`IoVec`], named from the guest's point of view.
///
/// `guest_in` holds the buffers the guest receives data in (device-writable);
/// `guest_out` holds the buffers the guest sent (device-readable).
#[derive(Debug, Default)]
pub struct InOutIov<'a> {
    pub guest_in: Vec<IoSegment<'a>>,
    pub guest_out: Vec<IoSegment<'a>>,
}

impl<'a> From<IoVec<'a>> for InOutIov<'a> {
    fn from(iov: IoVec<'a>) -> Self {
        Self {
            guest_in: iov.writable,
            guest_out: iov.readable,
        }
    }
}
