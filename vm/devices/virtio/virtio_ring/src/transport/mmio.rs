// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtio over MMIO: identification registers and the interrupt status
//! register.

use super::per_queue;
use super::BindError;
use super::DeviceIds;
use super::Transport;
use super::TransportResources;
use crate::interrupt::LineInterrupt;
use crate::spec::mmio::*;
use crate::spec::VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE;
use crate::spec::VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug)]
struct InterruptState {
    interrupt: LineInterrupt,
    status: u32,
}

impl InterruptState {
    fn update(&mut self, is_set: bool, bits: u32) {
        if is_set {
            self.status |= bits;
        } else {
            self.status &= !bits;
        }
        self.interrupt.set_level(self.status != 0);
    }
}

#[derive(Debug)]
pub struct MmioTransport {
    device_id: u32,
    interrupt_state: Mutex<InterruptState>,
    queue_signals: Vec<AtomicU64>,
}

impl MmioTransport {
    pub(super) fn new(
        ids: DeviceIds,
        resources: TransportResources,
        max_queues: u16,
    ) -> Result<Self, BindError> {
        let queue_signals = per_queue(max_queues.into(), || AtomicU64::new(0))?;
        Ok(Self {
            device_id: ids.device_id.into(),
            interrupt_state: Mutex::new(InterruptState {
                interrupt: resources.line,
                status: 0,
            }),
            queue_signals,
        })
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_state.lock().status
    }

    /// Handles a write to the interrupt acknowledge register.
    pub fn interrupt_ack(&self, bits: u32) {
        self.interrupt_state.lock().update(false, bits);
    }

    /// Number of used buffer notifications sent for `queue`.
    pub fn queue_signal_count(&self, queue: u16) -> u64 {
        self.queue_signals
            .get(queue as usize)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Reads one of the identification or interrupt registers. Other
    /// registers read as zero.
    pub fn read_u32(&self, offset: u16) -> u32 {
        match offset {
            VIRTIO_MMIO_OFFSET_MAGIC => VIRTIO_MMIO_MAGIC_VALUE,
            VIRTIO_MMIO_OFFSET_VERSION => VIRTIO_MMIO_VERSION,
            VIRTIO_MMIO_OFFSET_DEVICE_ID => self.device_id,
            VIRTIO_MMIO_OFFSET_VENDOR_ID => VIRTIO_MMIO_VENDOR_ID,
            VIRTIO_MMIO_OFFSET_INTERRUPT_STATUS => self.interrupt_status(),
            _ => {
                tracing::trace!(offset, "unhandled mmio read");
                0
            }
        }
    }

    pub fn write_u32(&self, offset: u16, val: u32) {
        match offset {
            VIRTIO_MMIO_OFFSET_INTERRUPT_ACK => self.interrupt_ack(val),
            _ => tracing::trace!(offset, val, "unhandled mmio write"),
        }
    }
}

impl Transport for MmioTransport {
    fn init(&mut self) {
        self.interrupt_state.get_mut().update(false, !0);
        for count in &self.queue_signals {
            count.store(0, Ordering::Relaxed);
        }
        tracing::debug!(
            device_id = self.device_id,
            queues = self.queue_signals.len(),
            "virtio-mmio transport initialized"
        );
    }

    fn exit(&mut self) {
        self.interrupt_state.get_mut().update(false, !0);
    }

    fn signal_queue(&self, index: u16) {
        if let Some(count) = self.queue_signals.get(index as usize) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.interrupt_state
            .lock()
            .update(true, VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER);
    }

    fn signal_config(&self) {
        self.interrupt_state
            .lock()
            .update(true, VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE);
    }
}
