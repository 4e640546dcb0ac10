// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core virtio queue implementation, without any notification mechanisms or
//! other transport-specific details.
//!
//! The rings live in guest memory and are shared with a guest that may be
//! running concurrently on another CPU. The host only ever writes the used
//! ring (and the `avail_event` trailer); every value read from the descriptor
//! table or the available ring is validated before it is used.

use crate::endian::RingEndian;
use crate::iovec::InOutIov;
use crate::iovec::IoSegment;
use crate::iovec::IoVec;
use crate::spec::queue as spec;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use std::fmt::Debug;
use std::sync::atomic;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InvalidQueueParams {
    #[error("queue size must be non-zero")]
    ZeroSize,
    #[error("queue size {0} is not a power of two")]
    NotPowerOfTwo(u16),
    #[error("queue size {0} exceeds the maximum of {max}", max = spec::MAX_QUEUE_SIZE)]
    TooLarge(u16),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue parameters")]
    InvalidParams(#[source] InvalidQueueParams),
    #[error("error accessing queue memory")]
    Memory(#[source] GuestMemoryError),
    #[error("the available ring is empty")]
    Empty,
    #[error("available index moved from {last} to {avail}, more than queue size {size}")]
    InvalidAvailIndex { last: u16, avail: u16, size: u16 },
    #[error("descriptor head {index} is out of range for queue size {size}")]
    InvalidHead { index: u16, size: u16 },
    #[error("descriptor {index} links to {next}, out of range for table size {size}")]
    InvalidNext { index: u16, next: u16, size: u32 },
    #[error("an indirect descriptor had the indirect flag set")]
    DoubleIndirect,
    #[error("descriptor {0} in the middle of a chain had the indirect flag set")]
    NestedIndirect(u16),
    #[error("indirect descriptor used but not negotiated")]
    IndirectNotNegotiated,
    #[error("indirect table length {0:#x} is not a non-zero multiple of the descriptor size")]
    InvalidIndirectLength(u32),
    #[error("indirect table has {0} entries, more than the maximum")]
    IndirectTooLarge(u32),
    #[error("a descriptor chain is too long or has a cycle")]
    TooLong,
    #[error("descriptor chain byte count overflows")]
    LengthOverflow,
    #[error("buffer {address:#x}+{length:#x} is not valid guest memory")]
    InvalidBuffer {
        address: u64,
        length: u32,
        #[source]
        source: GuestMemoryError,
    },
}

impl QueueError {
    /// Returns true if the error was caused by the guest handing the device
    /// ring contents that violate the protocol.
    pub fn is_guest_error(&self) -> bool {
        !matches!(self, QueueError::Empty | QueueError::InvalidParams(_))
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct QueueParams {
    pub size: u16,
    pub enable: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
}

impl QueueParams {
    /// Checks the parameters the guest programmed before a queue is built
    /// from them.
    pub fn validate(&self) -> Result<(), InvalidQueueParams> {
        if self.size == 0 {
            return Err(InvalidQueueParams::ZeroSize);
        }
        if self.size > spec::MAX_QUEUE_SIZE {
            return Err(InvalidQueueParams::TooLarge(self.size));
        }
        if !self.size.is_power_of_two() {
            return Err(InvalidQueueParams::NotPowerOfTwo(self.size));
        }
        Ok(())
    }
}

/// A point in the used ring update protocol at which earlier stores must
/// become visible to the guest before later ones.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPoint {
    /// The used element has been written. It must be visible before the used
    /// index moves past it, since the guest may consume it as soon as it
    /// observes the new index.
    UsedElementPublished,
    /// The used index has been written. It must be visible before the guest
    /// is signalled, and before the notification suppression fields are read.
    UsedIndexPublished,
}

/// Orders guest-visible stores at the [`SyncPoint`]s of the used ring update.
pub trait RingBarrier: Debug + Send + Sync {
    fn sync(&self, point: SyncPoint);
}

/// The [`RingBarrier`] for real guests: a memory fence per sync point.
#[derive(Debug, Default)]
pub struct FenceBarrier;

impl RingBarrier for FenceBarrier {
    fn sync(&self, point: SyncPoint) {
        match point {
            SyncPoint::UsedElementPublished => atomic::fence(atomic::Ordering::Release),
            // Store to the used index followed by a load of `used_event`, so
            // this has to be a full fence.
            SyncPoint::UsedIndexPublished => atomic::fence(atomic::Ordering::SeqCst),
        }
    }
}

/// Returns true if the guest asked to be notified when the used index moves
/// past `event`, given that it moved from `old` to `new` since the last
/// notification.
///
/// All arithmetic wraps at 2^16, matching the ring indices.
pub fn vring_need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

/// Guest memory views of the three rings of a queue, plus the negotiated
/// format. Stateless: the cursors live in [`VirtQueue`].
#[derive(Debug, Clone)]
pub(crate) struct QueueCore {
    queue_size: u16,
    queue_desc: GuestMemory,
    queue_avail: GuestMemory,
    queue_used: GuestMemory,
    endian: RingEndian,
    use_ring_event_index: bool,
    use_indirect: bool,
}

impl QueueCore {
    pub fn new(features: u64, mem: &GuestMemory, params: QueueParams) -> Result<Self, QueueError> {
        params.validate().map_err(QueueError::InvalidParams)?;
        let use_ring_event_index = features & crate::spec::VIRTIO_F_RING_EVENT_IDX != 0;
        let use_indirect = features & crate::spec::VIRTIO_F_RING_INDIRECT_DESC != 0;

        let queue_avail = mem
            .subrange(params.avail_addr, spec::avail_ring_size(params.size))
            .map_err(QueueError::Memory)?;

        let queue_used = mem
            .subrange(params.used_addr, spec::used_ring_size(params.size))
            .map_err(QueueError::Memory)?;

        let queue_desc = mem
            .subrange(params.desc_addr, spec::DESCRIPTOR_SIZE * params.size as u64)
            .map_err(QueueError::Memory)?;

        Ok(Self {
            queue_size: params.size,
            queue_desc,
            queue_avail,
            queue_used,
            endian: RingEndian::from_features(features),
            use_ring_event_index,
            use_indirect,
        })
    }

    fn get_available_index(&self) -> Result<u16, QueueError> {
        self.endian
            .read_u16(&self.queue_avail, spec::AVAIL_OFFSET_IDX)
            .map_err(QueueError::Memory)
    }

    fn get_available_descriptor_index(&self, avail_index: u16) -> Result<u16, QueueError> {
        let wrapped_index = (avail_index % self.queue_size) as u64;
        self.endian
            .read_u16(
                &self.queue_avail,
                spec::AVAIL_OFFSET_RING + spec::AVAIL_ELEMENT_SIZE * wrapped_index,
            )
            .map_err(QueueError::Memory)
    }

    fn get_available_flags(&self) -> Result<spec::AvailableFlags, QueueError> {
        Ok(self
            .endian
            .read_u16(&self.queue_avail, spec::AVAIL_OFFSET_FLAGS)
            .map_err(QueueError::Memory)?
            .into())
    }

    fn get_used_event(&self) -> Result<u16, QueueError> {
        let addr = spec::AVAIL_OFFSET_RING + spec::AVAIL_ELEMENT_SIZE * self.queue_size as u64;
        self.endian
            .read_u16(&self.queue_avail, addr)
            .map_err(QueueError::Memory)
    }

    fn set_available_event(&self, index: u16) -> Result<(), QueueError> {
        let addr = spec::USED_OFFSET_RING + spec::USED_ELEMENT_SIZE * self.queue_size as u64;
        self.endian
            .write_u16(&self.queue_used, addr, index)
            .map_err(QueueError::Memory)
    }

    fn set_used_flags(&self, flags: spec::UsedFlags) -> Result<(), QueueError> {
        self.endian
            .write_u16(&self.queue_used, spec::USED_OFFSET_FLAGS, flags.into())
            .map_err(QueueError::Memory)
    }

    fn set_used_descriptor(
        &self,
        used_index: u16,
        descriptor_index: u16,
        bytes_written: u32,
    ) -> Result<u16, QueueError> {
        let wrapped_index = used_index % self.queue_size;
        let addr = spec::USED_OFFSET_RING + spec::USED_ELEMENT_SIZE * wrapped_index as u64;
        self.queue_used
            .write_plain(
                addr,
                &spec::UsedElement {
                    id: self.endian.u32_to_guest(descriptor_index.into()),
                    len: self.endian.u32_to_guest(bytes_written),
                },
            )
            .map_err(QueueError::Memory)?;
        Ok(wrapped_index)
    }

    fn set_used_index(&self, index: u16) -> Result<(), QueueError> {
        self.endian
            .write_u16(&self.queue_used, spec::USED_OFFSET_IDX, index)
            .map_err(QueueError::Memory)
    }

    fn read_descriptor(
        &self,
        descriptor_table: &GuestMemory,
        index: u16,
    ) -> Result<RawDescriptor, QueueError> {
        let raw: spec::Descriptor = descriptor_table
            .read_plain(index as u64 * spec::DESCRIPTOR_SIZE)
            .map_err(QueueError::Memory)?;
        Ok(RawDescriptor {
            address: self.endian.u64_to_host(raw.address),
            length: self.endian.u32_to_host(raw.length),
            flags: self.endian.u16_to_host(raw.flags_raw).into(),
            next: self.endian.u16_to_host(raw.next),
        })
    }
}

/// A descriptor with its fields converted to host order but not yet
/// validated.
#[derive(Debug, Copy, Clone)]
struct RawDescriptor {
    address: u64,
    length: u32,
    flags: spec::DescriptorFlags,
    next: u16,
}

/// A completion record as written to the used ring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UsedRecord {
    /// Ring slot the element was written to.
    pub slot: u16,
    pub id: u16,
    pub len: u32,
    /// The used index after this completion was published.
    pub used_index: u16,
}

/// The host-side cursors of a queue, for save/restore.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
    pub last_avail_index: u16,
    pub used_index: u16,
    pub last_used_signalled: u16,
}

/// One virtqueue: views of the guest rings plus the host-local cursors.
///
/// A queue has a single host-side owner; the `&mut self` receivers serialize
/// host access. The guest runs concurrently and is only synchronized with
/// through the ring protocol.
#[derive(Debug)]
pub struct VirtQueue {
    core: QueueCore,
    last_avail_index: u16,
    used_index: u16,
    last_used_signalled: u16,
    barrier: Arc<dyn RingBarrier>,
}

impl VirtQueue {
    /// Builds a queue over the rings described by `params`. Fails if the
    /// parameters are invalid or the rings are not in guest memory.
    pub fn new(features: u64, mem: &GuestMemory, params: QueueParams) -> Result<Self, QueueError> {
        let core = QueueCore::new(features, mem, params)?;
        tracing::debug!(
            size = params.size,
            desc = params.desc_addr,
            avail = params.avail_addr,
            used = params.used_addr,
            endian = ?core.endian,
            event_idx = core.use_ring_event_index,
            "virtqueue created"
        );
        Ok(Self {
            core,
            last_avail_index: 0,
            used_index: 0,
            last_used_signalled: 0,
            barrier: Arc::new(FenceBarrier),
        })
    }

    /// Replaces the barrier used at the used ring [`SyncPoint`]s.
    pub fn with_barrier(mut self, barrier: Arc<dyn RingBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn size(&self) -> u16 {
        self.core.queue_size
    }

    pub fn endian(&self) -> RingEndian {
        self.core.endian
    }

    pub fn uses_event_index(&self) -> bool {
        self.core.use_ring_event_index
    }

    pub fn state(&self) -> QueueState {
        QueueState {
            last_avail_index: self.last_avail_index,
            used_index: self.used_index,
            last_used_signalled: self.last_used_signalled,
        }
    }

    /// Restores the host cursors, e.g. after migration. The used index is
    /// also written back to the used ring.
    pub fn restore(&mut self, state: QueueState) -> Result<(), QueueError> {
        self.core.set_used_index(state.used_index)?;
        self.last_avail_index = state.last_avail_index;
        self.used_index = state.used_index;
        self.last_used_signalled = state.last_used_signalled;
        Ok(())
    }

    /// Returns whether the guest has published chains the device has not
    /// popped yet.
    ///
    /// The guest's available index is re-read on every call.
    pub fn has_pending(&self) -> Result<bool, QueueError> {
        let avail_index = self.core.get_available_index()?;
        if avail_index == self.last_avail_index {
            return Ok(false);
        }
        if avail_index.wrapping_sub(self.last_avail_index) > self.core.queue_size {
            return Err(QueueError::InvalidAvailIndex {
                last: self.last_avail_index,
                avail: avail_index,
                size: self.core.queue_size,
            });
        }
        // Ensure available index read is ordered before subsequent ring and
        // descriptor reads.
        atomic::fence(atomic::Ordering::Acquire);
        Ok(true)
    }

    /// Pops the next chain head from the available ring.
    ///
    /// Fails with [`QueueError::Empty`] if there is nothing to pop.
    pub fn pop_chain_head(&mut self) -> Result<u16, QueueError> {
        if !self.has_pending()? {
            return Err(QueueError::Empty);
        }
        let head = self
            .core
            .get_available_descriptor_index(self.last_avail_index)?;
        if head >= self.core.queue_size {
            return Err(QueueError::InvalidHead {
                index: head,
                size: self.core.queue_size,
            });
        }
        self.last_avail_index = self.last_avail_index.wrapping_add(1);
        tracing::trace!(head, avail_index = self.last_avail_index, "popped chain");
        Ok(head)
    }

    /// Returns an iterator over the buffers of the chain starting at `head`.
    /// Buffers are resolved through `mem`.
    pub fn reader<'a>(&self, mem: &'a GuestMemory, head: u16) -> DescriptorReader<'_, 'a> {
        DescriptorReader {
            queue: &self.core,
            mem,
            indirect_table: None,
            descriptor_index: Some(head),
            bound: self.core.queue_size.into(),
            num_read: 0,
            total_length: 0,
        }
    }

    /// Walks the chain starting at `head` and returns its buffers.
    pub fn get_head_iov<'a>(
        &self,
        mem: &'a GuestMemory,
        head: u16,
    ) -> Result<IoVec<'a>, QueueError> {
        if head >= self.core.queue_size {
            return Err(QueueError::InvalidHead {
                index: head,
                size: self.core.queue_size,
            });
        }
        let mut iov = IoVec::default();
        for payload in self.reader(mem, head) {
            let payload = payload?;
            if payload.writeable {
                iov.writable.push(payload.segment);
            } else {
                iov.readable.push(payload.segment);
            }
        }
        Ok(iov)
    }

    /// Pops the next chain and returns its head and buffers.
    pub fn get_iov<'a>(&mut self, mem: &'a GuestMemory) -> Result<(u16, IoVec<'a>), QueueError> {
        let head = self.pop_chain_head()?;
        let iov = self.get_head_iov(mem, head)?;
        Ok((head, iov))
    }

    /// As [`Self::get_iov`], with the buffers named from the guest's point
    /// of view.
    pub fn get_inout_iov<'a>(
        &mut self,
        mem: &'a GuestMemory,
    ) -> Result<(u16, InOutIov<'a>), QueueError> {
        let (head, iov) = self.get_iov(mem)?;
        Ok((head, iov.into()))
    }

    /// Publishes the completion of chain `head`, which had `len` bytes
    /// written to its writable buffers.
    ///
    /// The used element is visible to the guest before the used index
    /// advances, and the new index is visible before this returns, so the
    /// caller may signal the guest immediately afterwards.
    pub fn post_used(&mut self, head: u16, len: u32) -> Result<UsedRecord, QueueError> {
        if head >= self.core.queue_size {
            return Err(QueueError::InvalidHead {
                index: head,
                size: self.core.queue_size,
            });
        }
        let slot = self.core.set_used_descriptor(self.used_index, head, len)?;
        self.barrier.sync(SyncPoint::UsedElementPublished);

        let used_index = self.used_index.wrapping_add(1);
        self.core.set_used_index(used_index)?;
        self.used_index = used_index;
        self.barrier.sync(SyncPoint::UsedIndexPublished);

        tracing::trace!(head, len, slot, used_index, "posted used element");
        Ok(UsedRecord {
            slot,
            id: head,
            len,
            used_index,
        })
    }

    /// Returns whether the guest must be notified of the used ring updates
    /// since the last notification. Returns true at most once per update.
    ///
    /// With event index negotiated, the guest is notified when the used index
    /// crosses the `used_event` value the guest published. Otherwise the guest
    /// is notified of any new completion unless it set the available ring's
    /// no-interrupt flag.
    pub fn should_signal(&mut self) -> Result<bool, QueueError> {
        let old = self.last_used_signalled;
        let new = self.used_index;
        let due = if self.core.use_ring_event_index {
            let event = self.core.get_used_event()?;
            vring_need_event(event, new, old)
        } else {
            new != old && !self.core.get_available_flags()?.no_interrupt()
        };
        if due {
            self.last_used_signalled = new;
        }
        Ok(due)
    }

    /// Asks the guest to notify the device of new available chains. Returns
    /// true if chains became available while notifications were off, in which
    /// case the caller must process them rather than wait.
    pub fn enable_kicks(&mut self) -> Result<bool, QueueError> {
        if self.core.use_ring_event_index {
            self.core.set_available_event(self.last_avail_index)?;
        } else {
            self.core.set_used_flags(spec::UsedFlags::new())?;
        }
        // Ensure the available event/used flags are visible before checking
        // the available index again.
        atomic::fence(atomic::Ordering::SeqCst);
        self.has_pending()
    }

    /// Asks the guest not to notify the device; used while the device is
    /// already busy draining the ring.
    pub fn disable_kicks(&mut self) -> Result<(), QueueError> {
        if self.core.use_ring_event_index {
            self.core
                .set_available_event(self.last_avail_index.wrapping_sub(1))
        } else {
            self.core
                .set_used_flags(spec::UsedFlags::new().with_no_notify(true))
        }
    }
}

/// One buffer produced by [`DescriptorReader`].
#[derive(Debug, Copy, Clone)]
pub struct VirtioQueuePayload<'a> {
    pub writeable: bool,
    pub segment: IoSegment<'a>,
}

/// Walks a descriptor chain, following at most one level of indirection.
///
/// Stops after the first error.
pub struct DescriptorReader<'q, 'a> {
    queue: &'q QueueCore,
    mem: &'a GuestMemory,
    indirect_table: Option<GuestMemory>,
    descriptor_index: Option<u16>,
    /// Entry count of the table being walked.
    bound: u32,
    num_read: u32,
    total_length: u32,
}

impl<'a> DescriptorReader<'_, 'a> {
    fn enter_indirect(&mut self, index: u16, descriptor: RawDescriptor) -> Result<(), QueueError> {
        if self.indirect_table.is_some() {
            return Err(QueueError::DoubleIndirect);
        }
        if self.num_read != 0 {
            return Err(QueueError::NestedIndirect(index));
        }
        if !self.queue.use_indirect {
            return Err(QueueError::IndirectNotNegotiated);
        }
        let length = descriptor.length;
        if length == 0 || length as u64 % spec::DESCRIPTOR_SIZE != 0 {
            return Err(QueueError::InvalidIndirectLength(length));
        }
        let count = length / spec::DESCRIPTOR_SIZE as u32;
        if count > spec::MAX_INDIRECT_DESCRIPTORS {
            return Err(QueueError::IndirectTooLarge(count));
        }
        let table = self
            .mem
            .subrange(descriptor.address, length.into())
            .map_err(|source| QueueError::InvalidBuffer {
                address: descriptor.address,
                length,
                source,
            })?;
        tracing::trace!(index, count, "entering indirect table");
        self.indirect_table = Some(table);
        self.bound = count;
        self.descriptor_index = Some(0);
        Ok(())
    }

    fn next_descriptor(&mut self) -> Result<Option<VirtioQueuePayload<'a>>, QueueError> {
        let Some(mut index) = self.descriptor_index else {
            return Ok(None);
        };
        let mut descriptor = self.read(index)?;
        if descriptor.flags.indirect() {
            self.enter_indirect(index, descriptor)?;
            index = 0;
            descriptor = self.read(index)?;
            if descriptor.flags.indirect() {
                return Err(QueueError::DoubleIndirect);
            }
        }

        self.num_read += 1;
        self.total_length = self
            .total_length
            .checked_add(descriptor.length)
            .ok_or(QueueError::LengthOverflow)?;

        let mem = self.mem;
        let buf = mem
            .resolve(descriptor.address, descriptor.length as usize)
            .map_err(|source| QueueError::InvalidBuffer {
                address: descriptor.address,
                length: descriptor.length,
                source,
            })?;

        if descriptor.flags.next() {
            let next = descriptor.next;
            if next as u32 >= self.bound {
                return Err(QueueError::InvalidNext {
                    index,
                    next,
                    size: self.bound,
                });
            }
            // A chain cannot be longer than its table; anything longer has a
            // cycle.
            if self.num_read >= self.bound {
                return Err(QueueError::TooLong);
            }
            self.descriptor_index = Some(next);
        } else {
            self.descriptor_index = None;
        }

        Ok(Some(VirtioQueuePayload {
            writeable: descriptor.flags.write(),
            segment: IoSegment::new(descriptor.address, buf),
        }))
    }

    fn read(&self, index: u16) -> Result<RawDescriptor, QueueError> {
        let table = self
            .indirect_table
            .as_ref()
            .unwrap_or(&self.queue.queue_desc);
        self.queue.read_descriptor(table, index)
    }
}

impl<'a> Iterator for DescriptorReader<'_, 'a> {
    type Item = Result<VirtioQueuePayload<'a>, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        let r = self.next_descriptor().transpose();
        if matches!(r, Some(Err(_))) {
            self.descriptor_index = None;
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::queue::DescriptorFlags;
    use crate::spec::VIRTIO_F_RING_EVENT_IDX;
    use crate::spec::VIRTIO_F_RING_INDIRECT_DESC;
    use crate::spec::VIRTIO_F_VERSION_1;
    use crate::test_guest::TestGuest;
    use crate::test_guest::BUFFER_BASE;
    use parking_lot::Mutex;
    use test_with_tracing::test;

    const ALL_FEATURES: u64 =
        VIRTIO_F_VERSION_1 | VIRTIO_F_RING_EVENT_IDX | VIRTIO_F_RING_INDIRECT_DESC;

    fn buffers(count: u64, writable_from: u64) -> Vec<(u64, u32, bool)> {
        (0..count)
            .map(|i| (BUFFER_BASE + i * 0x100, 0x10 + i as u32, i >= writable_from))
            .collect()
    }

    #[test]
    fn params_validation() {
        let params = |size| QueueParams {
            size,
            ..Default::default()
        };
        assert!(matches!(
            params(0).validate(),
            Err(InvalidQueueParams::ZeroSize)
        ));
        assert!(matches!(
            params(48).validate(),
            Err(InvalidQueueParams::NotPowerOfTwo(48))
        ));
        assert!(matches!(
            params(0xffff).validate(),
            Err(InvalidQueueParams::TooLarge(0xffff))
        ));
        params(1).validate().unwrap();
        params(spec::MAX_QUEUE_SIZE).validate().unwrap();
    }

    #[test]
    fn rings_must_be_in_guest_memory() {
        let guest = TestGuest::new(16, ALL_FEATURES);
        let params = QueueParams {
            used_addr: guest.mem().len() - 8,
            ..guest.params()
        };
        assert!(matches!(
            VirtQueue::new(ALL_FEATURES, guest.mem(), params),
            Err(QueueError::Memory(_))
        ));
    }

    #[test]
    fn need_event() {
        assert!(vring_need_event(3, 5, 0));
        assert!(!vring_need_event(3, 5, 5));
        assert!(!vring_need_event(100, 5, 0));
        // Event exactly at the old index is inside the window.
        assert!(vring_need_event(0, 1, 0));
        // Event at the new index has not been crossed yet.
        assert!(!vring_need_event(5, 5, 0));
        // Across the wrap.
        assert!(vring_need_event(0xffff, 2, 0xfffe));
        assert!(vring_need_event(1, 2, 0xfffe));
        assert!(!vring_need_event(2, 2, 0xfffe));
    }

    #[test]
    fn walk_visits_every_descriptor_in_order() {
        for features in [ALL_FEATURES, 0] {
            let mut guest = TestGuest::new(16, features);
            let mut queue = guest.queue();
            for n in 1..=16 {
                let bufs = buffers(n, n / 2);
                let head = guest.add_chain(&bufs);
                let (popped, iov) = queue.get_iov(guest.mem()).unwrap();
                assert_eq!(popped, head);
                assert_eq!(iov.segment_count() as u64, n);
                let addresses: Vec<_> = iov
                    .readable
                    .iter()
                    .chain(&iov.writable)
                    .map(|s| (s.address(), s.len() as u32))
                    .collect();
                let expected: Vec<_> = bufs.iter().map(|&(a, l, _)| (a, l)).collect();
                assert_eq!(addresses, expected);
                assert_eq!(iov.readable.len() as u64, n / 2);
                queue.post_used(head, 0).unwrap();
                guest.reclaim(head);
            }
        }
    }

    #[test]
    fn read_and_write_flags_may_interleave() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let queue = guest.queue();
        let bufs = [
            (BUFFER_BASE, 4, true),
            (BUFFER_BASE + 0x100, 4, false),
            (BUFFER_BASE + 0x200, 4, true),
            (BUFFER_BASE + 0x300, 4, false),
        ];
        let head = guest.add_chain(&bufs);
        let iov = queue.get_head_iov(guest.mem(), head).unwrap();
        let r: Vec<_> = iov.readable.iter().map(|s| s.address()).collect();
        let w: Vec<_> = iov.writable.iter().map(|s| s.address()).collect();
        assert_eq!(r, [BUFFER_BASE + 0x100, BUFFER_BASE + 0x300]);
        assert_eq!(w, [BUFFER_BASE, BUFFER_BASE + 0x200]);
    }

    #[test]
    fn head_iov_does_not_pop() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let head = guest.add_chain(&buffers(2, 1));
        let iov = queue.get_head_iov(guest.mem(), head).unwrap();
        assert_eq!(iov.segment_count(), 2);
        assert_eq!(queue.state().last_avail_index, 0);
        assert_eq!(queue.pop_chain_head().unwrap(), head);
    }

    #[test]
    fn zero_length_buffers() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        guest.add_chain(&[(BUFFER_BASE, 0, false)]);
        let (_, iov) = queue.get_iov(guest.mem()).unwrap();
        assert_eq!(iov.segment_count(), 1);
        assert!(iov.readable[0].is_empty());
    }

    #[test]
    fn indirect_table() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let bufs = buffers(5, 2);
        let head = guest.add_indirect_chain(&bufs);
        // Garbage in the main table after the head must not be consulted.
        guest.write_descriptor(head + 1, 0xdead_0000, 1, DescriptorFlags::new(), 7);
        let (popped, iov) = queue.get_iov(guest.mem()).unwrap();
        assert_eq!(popped, head);
        assert_eq!(iov.readable.len(), 2);
        assert_eq!(iov.writable.len(), 3);
        assert_eq!(iov.readable[0].address(), BUFFER_BASE);
        assert_eq!(iov.writable[2].address(), BUFFER_BASE + 0x400);
    }

    #[test]
    fn guest_error_classification() {
        assert!(!QueueError::Empty.is_guest_error());
        assert!(!QueueError::InvalidParams(InvalidQueueParams::ZeroSize).is_guest_error());
        assert!(QueueError::TooLong.is_guest_error());
        assert!(QueueError::InvalidHead { index: 9, size: 8 }.is_guest_error());
    }

    #[test]
    fn indirect_table_may_be_larger_than_queue() {
        let mut guest = TestGuest::new(2, ALL_FEATURES);
        let mut queue = guest.queue();
        guest.add_indirect_chain(&buffers(6, 0));
        let (_, iov) = queue.get_iov(guest.mem()).unwrap();
        assert_eq!(iov.segment_count(), 6);
        assert_eq!(iov.writable.len(), 6);
        assert!(iov.readable.is_empty());
    }

    #[test]
    fn indirect_requires_feature() {
        let mut guest = TestGuest::new(8, VIRTIO_F_VERSION_1);
        let mut queue = guest.queue();
        guest.add_indirect_chain(&buffers(2, 1));
        assert!(matches!(
            queue.get_iov(guest.mem()),
            Err(QueueError::IndirectNotNegotiated)
        ));
    }

    #[test]
    fn bad_indirect_lengths() {
        for length in [0, 17, 24] {
            let mut guest = TestGuest::new(8, ALL_FEATURES);
            let mut queue = guest.queue();
            let head = guest.add_chain(&[(BUFFER_BASE, 0, false)]);
            guest.write_descriptor(
                head,
                BUFFER_BASE,
                length,
                DescriptorFlags::new().with_indirect(true),
                0,
            );
            match queue.get_iov(guest.mem()) {
                Err(QueueError::InvalidIndirectLength(l)) => assert_eq!(l, length),
                r => panic!("unexpected {r:?}"),
            }
        }
    }

    #[test]
    fn indirect_table_size_is_capped() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let head = guest.add_chain(&[(BUFFER_BASE, 0, false)]);
        let length = (spec::MAX_INDIRECT_DESCRIPTORS + 1) * spec::DESCRIPTOR_SIZE as u32;
        guest.write_descriptor(
            head,
            0,
            length,
            DescriptorFlags::new().with_indirect(true),
            0,
        );
        assert!(matches!(
            queue.get_iov(guest.mem()),
            Err(QueueError::IndirectTooLarge(_))
        ));
    }

    #[test]
    fn nested_indirect_rejected() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let head = guest.add_indirect_chain(&buffers(3, 3));
        let table = guest.indirect_table_address(head);
        guest.write_descriptor_at(
            table + spec::DESCRIPTOR_SIZE,
            table,
            32,
            DescriptorFlags::new().with_indirect(true),
            0,
        );
        assert!(matches!(
            queue.get_iov(guest.mem()),
            Err(QueueError::DoubleIndirect)
        ));
    }

    #[test]
    fn indirect_in_middle_of_chain_rejected() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let head = guest.add_chain(&buffers(3, 3));
        let second = guest.next_of(head);
        guest.write_descriptor(
            second,
            BUFFER_BASE,
            32,
            DescriptorFlags::new().with_indirect(true),
            0,
        );
        match queue.get_iov(guest.mem()) {
            Err(QueueError::NestedIndirect(i)) => assert_eq!(i, second),
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn next_out_of_range() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let head = guest.add_chain(&buffers(1, 1));
        guest.write_descriptor(
            head,
            BUFFER_BASE,
            4,
            DescriptorFlags::new().with_next(true),
            8,
        );
        assert!(matches!(
            queue.get_iov(guest.mem()),
            Err(QueueError::InvalidNext {
                next: 8,
                size: 8,
                ..
            })
        ));
    }

    #[test]
    fn cycle_terminates() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let head = guest.add_chain(&buffers(2, 2));
        let second = guest.next_of(head);
        guest.write_descriptor(
            second,
            BUFFER_BASE,
            4,
            DescriptorFlags::new().with_next(true),
            head,
        );
        assert!(matches!(
            queue.get_iov(guest.mem()),
            Err(QueueError::TooLong)
        ));

        // A self-loop in an indirect table is bounded by the table size.
        let head = guest.add_indirect_chain(&buffers(4, 0));
        let table = guest.indirect_table_address(head);
        guest.write_descriptor_at(
            table + 3 * spec::DESCRIPTOR_SIZE,
            BUFFER_BASE,
            4,
            DescriptorFlags::new().with_next(true),
            3,
        );
        let mut reader_count = 0;
        let mut err = None;
        let head = queue.pop_chain_head().unwrap();
        for payload in queue.reader(guest.mem(), head) {
            match payload {
                Ok(_) => reader_count += 1,
                Err(e) => err = Some(e),
            }
        }
        // The looping descriptor itself is not returned.
        assert_eq!(reader_count, 3);
        assert!(matches!(err, Some(QueueError::TooLong)));
    }

    #[test]
    fn buffer_outside_guest_memory() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let end = guest.mem().len();
        guest.add_chain(&[(BUFFER_BASE, 4, false), (end - 2, 4, true)]);
        match queue.get_iov(guest.mem()) {
            Err(QueueError::InvalidBuffer {
                address, length, ..
            }) => {
                assert_eq!(address, end - 2);
                assert_eq!(length, 4);
            }
            r => panic!("unexpected {r:?}"),
        }
    }

    #[test]
    fn huge_buffer_rejected() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        guest.add_chain(&[(0, u32::MAX, false), (0, 1, false)]);
        assert!(matches!(
            queue.get_iov(guest.mem()),
            Err(QueueError::InvalidBuffer {
                length: u32::MAX,
                ..
            })
        ));
    }

    #[test]
    fn pop_validates_head_and_index() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        assert!(!queue.has_pending().unwrap());
        assert!(matches!(queue.pop_chain_head(), Err(QueueError::Empty)));

        guest.publish(9);
        assert!(queue.has_pending().unwrap());
        assert!(matches!(
            queue.pop_chain_head(),
            Err(QueueError::InvalidHead { index: 9, size: 8 })
        ));

        guest.set_avail_index(100);
        assert!(matches!(
            queue.has_pending(),
            Err(QueueError::InvalidAvailIndex {
                last: 0,
                avail: 100,
                size: 8
            })
        ));
    }

    #[test]
    fn pop_is_fifo_and_rereads_index() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        let a = guest.add_chain(&buffers(1, 1));
        assert!(queue.has_pending().unwrap());
        let b = guest.add_chain(&buffers(2, 1));
        let c = guest.add_chain(&buffers(1, 0));
        assert_eq!(queue.pop_chain_head().unwrap(), a);
        assert_eq!(queue.pop_chain_head().unwrap(), b);
        assert_eq!(queue.pop_chain_head().unwrap(), c);
        assert!(!queue.has_pending().unwrap());
    }

    #[test]
    fn post_used_round_trip() {
        for features in [ALL_FEATURES, 0] {
            let mut guest = TestGuest::new(4, features);
            let mut queue = guest.queue();
            for i in 0..10u16 {
                let head = guest.add_chain(&buffers(1, 0));
                assert_eq!(queue.pop_chain_head().unwrap(), head);
                let before = queue.state().used_index;
                let record = queue.post_used(head, 0x100 + i as u32).unwrap();
                assert_eq!(record.used_index, before.wrapping_add(1));
                assert_eq!(record.slot, before % 4);
                assert_eq!(guest.used_index(), record.used_index);
                assert_eq!(guest.used_element(record.slot), (head as u32, 0x100 + i as u32));
                guest.reclaim(head);
            }
        }
    }

    #[test]
    fn post_used_rejects_bad_head() {
        let guest = TestGuest::new(4, ALL_FEATURES);
        let mut queue = guest.queue();
        assert!(matches!(
            queue.post_used(4, 0),
            Err(QueueError::InvalidHead { index: 4, size: 4 })
        ));
        assert_eq!(queue.state().used_index, 0);
    }

    #[test]
    fn indices_wrap_at_16_bits() {
        let mut guest = TestGuest::new(4, ALL_FEATURES);
        let mut queue = guest.queue();
        guest.set_avail_index(65534);
        queue
            .restore(QueueState {
                last_avail_index: 65534,
                used_index: 65534,
                last_used_signalled: 65534,
            })
            .unwrap();

        let heads: Vec<_> = (0..3).map(|_| guest.add_chain(&buffers(1, 0))).collect();
        for &head in &heads {
            assert_eq!(queue.pop_chain_head().unwrap(), head);
        }
        assert_eq!(queue.state().last_avail_index, 1);
        assert!(!queue.has_pending().unwrap());

        let slots: Vec<_> = heads
            .iter()
            .map(|&head| queue.post_used(head, 1).unwrap().slot)
            .collect();
        assert_eq!(slots, [2, 3, 0]);
        assert_eq!(queue.state().used_index, 1);
        assert_eq!(guest.used_index(), 1);
        assert_eq!(guest.used_element(0).0, heads[2] as u32);
    }

    #[derive(Debug)]
    struct RecordingBarrier {
        guest: TestGuest,
        events: Mutex<Vec<(SyncPoint, u16, (u32, u32))>>,
    }

    impl RingBarrier for RecordingBarrier {
        fn sync(&self, point: SyncPoint) {
            let index = self.guest.used_index();
            let slot = if point == SyncPoint::UsedElementPublished {
                index
            } else {
                index.wrapping_sub(1)
            };
            let element = self.guest.used_element(slot % self.guest.queue_size());
            self.events.lock().push((point, index, element));
        }
    }

    #[test]
    fn used_ring_sync_points() {
        let mut guest = TestGuest::new(4, ALL_FEATURES);
        let barrier = Arc::new(RecordingBarrier {
            guest: guest.clone(),
            events: Default::default(),
        });
        let mut queue = guest.queue().with_barrier(barrier.clone());
        let head = guest.add_chain(&buffers(1, 0));
        queue.pop_chain_head().unwrap();
        queue.post_used(head, 77).unwrap();
        assert_eq!(
            *barrier.events.lock(),
            [
                // The element is complete while the index still hides it.
                (SyncPoint::UsedElementPublished, 0, (head as u32, 77)),
                (SyncPoint::UsedIndexPublished, 1, (head as u32, 77)),
            ]
        );
    }

    #[test]
    fn should_signal_event_index() {
        let guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();

        // old = 0, new = 5, event = 3.
        queue
            .restore(QueueState {
                used_index: 5,
                ..Default::default()
            })
            .unwrap();
        guest.set_used_event(3);
        assert!(queue.should_signal().unwrap());
        assert_eq!(queue.state().last_used_signalled, 5);
        // Same crossing is not signalled twice; no advance means no signal.
        assert!(!queue.should_signal().unwrap());

        // Event far ahead of new.
        guest.set_used_event(1000);
        queue.post_used(0, 0).unwrap();
        assert!(!queue.should_signal().unwrap());
    }

    #[test]
    fn should_signal_once_per_crossing() {
        let guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        guest.set_used_event(2);
        let mut signals = Vec::new();
        for _ in 0..6 {
            queue.post_used(0, 0).unwrap();
            signals.push(queue.should_signal().unwrap());
        }
        // Crossing happens when the index moves from 2 to 3.
        assert_eq!(signals, [false, false, true, false, false, false]);

        guest.set_used_event(6);
        queue.post_used(0, 0).unwrap();
        assert!(queue.should_signal().unwrap());
    }

    #[test]
    fn should_signal_without_event_index() {
        let guest = TestGuest::new(8, VIRTIO_F_VERSION_1);
        let mut queue = guest.queue();
        assert!(!queue.should_signal().unwrap());
        queue.post_used(0, 0).unwrap();
        assert!(queue.should_signal().unwrap());
        assert!(!queue.should_signal().unwrap());

        guest.set_avail_flags(spec::AvailableFlags::new().with_no_interrupt(true));
        queue.post_used(0, 0).unwrap();
        assert!(!queue.should_signal().unwrap());
        guest.set_avail_flags(spec::AvailableFlags::new());
        assert!(queue.should_signal().unwrap());
    }

    #[test]
    fn kick_suppression() {
        let mut guest = TestGuest::new(8, ALL_FEATURES);
        let mut queue = guest.queue();
        assert!(!queue.enable_kicks().unwrap());
        assert_eq!(guest.avail_event(), 0);
        guest.add_chain(&buffers(1, 0));
        queue.disable_kicks().unwrap();
        assert_eq!(guest.avail_event(), 0xffff);
        assert!(queue.enable_kicks().unwrap());
        queue.pop_chain_head().unwrap();
        assert!(!queue.enable_kicks().unwrap());
        assert_eq!(guest.avail_event(), 1);

        let guest = TestGuest::new(8, 0);
        let mut queue = guest.queue();
        queue.disable_kicks().unwrap();
        assert!(guest.used_flags().no_notify());
        queue.enable_kicks().unwrap();
        assert!(!guest.used_flags().no_notify());
    }

    #[test]
    fn legacy_ring_is_native_endian() {
        let mut guest = TestGuest::new(8, 0);
        let mut queue = guest.queue();
        assert_eq!(queue.endian(), RingEndian::Legacy);
        let head = guest.add_chain(&buffers(2, 1));
        let (popped, iov) = queue.get_iov(guest.mem()).unwrap();
        assert_eq!(popped, head);
        assert_eq!(iov.writable[0].len(), 0x11);
        queue.post_used(head, 0x1234).unwrap();
        let mut raw = [0; 4];
        guest
            .mem()
            .read_at(
                guest.params().used_addr + spec::USED_OFFSET_RING + 4,
                &mut raw,
            )
            .unwrap();
        assert_eq!(raw, 0x1234u32.to_ne_bytes());
    }
}
