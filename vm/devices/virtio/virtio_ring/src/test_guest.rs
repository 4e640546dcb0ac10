// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal guest-side driver for exercising queues in tests.
//!
//! Each queue gets a 64KiB region: descriptors at +0x1000, the available ring
//! at +0x2000, the used ring at +0x3000 and indirect tables from +0x4000.
//! Data buffers live at [`BUFFER_BASE`] and above and are shared by all
//! queues.

use crate::endian::RingEndian;
use crate::queue::QueueParams;
use crate::queue::VirtQueue;
use crate::spec::queue::AvailableFlags;
use crate::spec::queue::Descriptor;
use crate::spec::queue::DescriptorFlags;
use crate::spec::queue::UsedFlags;
use crate::spec::queue::AVAIL_ELEMENT_SIZE;
use crate::spec::queue::AVAIL_OFFSET_FLAGS;
use crate::spec::queue::AVAIL_OFFSET_IDX;
use crate::spec::queue::AVAIL_OFFSET_RING;
use crate::spec::queue::DESCRIPTOR_SIZE;
use crate::spec::queue::USED_ELEMENT_SIZE;
use crate::spec::queue::USED_OFFSET_FLAGS;
use crate::spec::queue::USED_OFFSET_IDX;
use crate::spec::queue::USED_OFFSET_RING;
use guestmem::GuestMemory;
use std::collections::BTreeMap;

pub const MEMORY_SIZE: usize = 0x10_0000;
pub const BUFFER_BASE: u64 = 0x8_0000;
const QUEUE_REGION_SIZE: u64 = 0x1_0000;
const INDIRECT_TABLE_STRIDE: u64 = 0x200;
const MAX_TEST_QUEUE_SIZE: u16 = 32;

#[derive(Debug, Clone)]
pub struct TestGuest {
    mem: GuestMemory,
    base: u64,
    size: u16,
    features: u64,
    endian: RingEndian,
    avail_index: u16,
    free: Vec<u16>,
    chains: BTreeMap<u16, Vec<u16>>,
}

impl TestGuest {
    /// A guest with its own memory and one queue.
    pub fn new(size: u16, features: u64) -> Self {
        Self::on(&GuestMemory::allocate(MEMORY_SIZE), 0, size, features)
    }

    /// A guest driving queue `index` in existing memory.
    pub fn on(mem: &GuestMemory, index: u16, size: u16, features: u64) -> Self {
        assert!(size <= MAX_TEST_QUEUE_SIZE);
        let base = QUEUE_REGION_SIZE * index as u64;
        assert!(base + QUEUE_REGION_SIZE <= BUFFER_BASE);
        Self {
            mem: mem.clone(),
            base,
            size,
            features,
            endian: RingEndian::from_features(features),
            avail_index: 0,
            free: (0..size).rev().collect(),
            chains: BTreeMap::new(),
        }
    }

    pub fn mem(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn queue_size(&self) -> u16 {
        self.size
    }

    pub fn params(&self) -> QueueParams {
        QueueParams {
            size: self.size,
            enable: true,
            desc_addr: self.base + 0x1000,
            avail_addr: self.base + 0x2000,
            used_addr: self.base + 0x3000,
        }
    }

    /// Builds a queue over this guest's rings with the guest's features.
    pub fn queue(&self) -> VirtQueue {
        VirtQueue::new(self.features, &self.mem, self.params()).unwrap()
    }

    pub fn write_descriptor_at(
        &self,
        gpa: u64,
        address: u64,
        length: u32,
        flags: DescriptorFlags,
        next: u16,
    ) {
        let e = self.endian;
        self.mem
            .write_plain(
                gpa,
                &Descriptor {
                    address: e.u64_to_guest(address),
                    length: e.u32_to_guest(length),
                    flags_raw: e.u16_to_guest(flags.into()),
                    next: e.u16_to_guest(next),
                },
            )
            .unwrap();
    }

    pub fn write_descriptor(
        &self,
        index: u16,
        address: u64,
        length: u32,
        flags: DescriptorFlags,
        next: u16,
    ) {
        let gpa = self.params().desc_addr + index as u64 * DESCRIPTOR_SIZE;
        self.write_descriptor_at(gpa, address, length, flags, next);
    }

    /// Returns the `next` field of a main table descriptor.
    pub fn next_of(&self, index: u16) -> u16 {
        let gpa = self.params().desc_addr + index as u64 * DESCRIPTOR_SIZE;
        let raw: Descriptor = self.mem.read_plain(gpa).unwrap();
        self.endian.u16_to_host(raw.next)
    }

    pub fn indirect_table_address(&self, head: u16) -> u64 {
        self.base + 0x4000 + head as u64 * INDIRECT_TABLE_STRIDE
    }

    fn write_chain(
        &self,
        indices: &[u16],
        buffers: &[(u64, u32, bool)],
        mut write: impl FnMut(u16, u64, u32, DescriptorFlags, u16),
    ) {
        for (i, &(address, length, writable)) in buffers.iter().enumerate() {
            let next = indices.get(i + 1).copied();
            let flags = DescriptorFlags::new()
                .with_write(writable)
                .with_next(next.is_some());
            write(indices[i], address, length, flags, next.unwrap_or(0));
        }
    }

    /// Writes a chain into the descriptor table and publishes it. Buffers are
    /// `(address, length, device_writable)`.
    pub fn add_chain(&mut self, buffers: &[(u64, u32, bool)]) -> u16 {
        let indices: Vec<u16> = (0..buffers.len())
            .map(|_| self.free.pop().expect("out of descriptors"))
            .collect();
        self.write_chain(&indices, buffers, |i, a, l, f, n| {
            self.write_descriptor(i, a, l, f, n)
        });
        let head = indices[0];
        self.chains.insert(head, indices);
        self.publish(head);
        head
    }

    /// Writes a chain into an indirect table referenced by a single main
    /// table descriptor, and publishes it.
    pub fn add_indirect_chain(&mut self, buffers: &[(u64, u32, bool)]) -> u16 {
        let head = self.free.pop().expect("out of descriptors");
        let table = self.indirect_table_address(head);
        let entries = buffers.len() as u64;
        assert!(entries * DESCRIPTOR_SIZE <= INDIRECT_TABLE_STRIDE);
        let indices: Vec<u16> = (0..buffers.len() as u16).collect();
        self.write_chain(&indices, buffers, |i, a, l, f, n| {
            self.write_descriptor_at(table + i as u64 * DESCRIPTOR_SIZE, a, l, f, n)
        });
        self.write_descriptor(
            head,
            table,
            (entries * DESCRIPTOR_SIZE) as u32,
            DescriptorFlags::new().with_indirect(true),
            0,
        );
        self.chains.insert(head, vec![head]);
        self.publish(head);
        head
    }

    /// Returns the descriptors of a completed chain to the free list.
    pub fn reclaim(&mut self, head: u16) {
        let indices = self.chains.remove(&head).expect("unknown chain");
        self.free.extend(indices.into_iter().rev());
    }

    /// Places `head` on the available ring and bumps the available index,
    /// whether or not it names a valid chain.
    pub fn publish(&mut self, head: u16) {
        let avail = self.params().avail_addr;
        let slot = (self.avail_index % self.size) as u64;
        self.endian
            .write_u16(
                &self.mem,
                avail + AVAIL_OFFSET_RING + AVAIL_ELEMENT_SIZE * slot,
                head,
            )
            .unwrap();
        self.set_avail_index(self.avail_index.wrapping_add(1));
    }

    pub fn set_avail_index(&mut self, index: u16) {
        self.avail_index = index;
        self.endian
            .write_u16(&self.mem, self.params().avail_addr + AVAIL_OFFSET_IDX, index)
            .unwrap();
    }

    pub fn set_avail_flags(&self, flags: AvailableFlags) {
        self.endian
            .write_u16(
                &self.mem,
                self.params().avail_addr + AVAIL_OFFSET_FLAGS,
                flags.into(),
            )
            .unwrap();
    }

    pub fn set_used_event(&self, event: u16) {
        let gpa =
            self.params().avail_addr + AVAIL_OFFSET_RING + AVAIL_ELEMENT_SIZE * self.size as u64;
        self.endian.write_u16(&self.mem, gpa, event).unwrap();
    }

    pub fn used_index(&self) -> u16 {
        self.endian
            .read_u16(&self.mem, self.params().used_addr + USED_OFFSET_IDX)
            .unwrap()
    }

    pub fn used_flags(&self) -> UsedFlags {
        self.endian
            .read_u16(&self.mem, self.params().used_addr + USED_OFFSET_FLAGS)
            .unwrap()
            .into()
    }

    /// Returns `(id, len)` of the used ring element in `slot`.
    pub fn used_element(&self, slot: u16) -> (u32, u32) {
        let gpa = self.params().used_addr + USED_OFFSET_RING + USED_ELEMENT_SIZE * slot as u64;
        let id = self.endian.read_u32(&self.mem, gpa).unwrap();
        let len = self.endian.read_u32(&self.mem, gpa + 4).unwrap();
        (id, len)
    }

    pub fn avail_event(&self) -> u16 {
        let gpa =
            self.params().used_addr + USED_OFFSET_RING + USED_ELEMENT_SIZE * self.size as u64;
        self.endian.read_u16(&self.mem, gpa).unwrap()
    }
}
