// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtio over PCI: interrupt routing and identification.

use super::per_queue;
use super::BindError;
use super::DeviceIds;
use super::Transport;
use super::TransportResources;
use crate::interrupt::Interrupt;
use crate::interrupt::LineInterrupt;
use crate::spec::pci::VIRTIO_MSI_NO_VECTOR;
use crate::spec::pci::VIRTIO_PCI_DEVICE_ID_BASE;
use crate::spec::pci::VIRTIO_PCI_ISR_CONFIG;
use crate::spec::pci::VIRTIO_PCI_ISR_QUEUE;
use crate::spec::pci::VIRTIO_PCI_MSIX_REGISTERS_LEN;
use crate::spec::pci::VIRTIO_VENDOR_ID;
use parking_lot::Mutex;

/// The region a device config space offset falls in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigField {
    /// The MSI-X vector registers (config vector, queue vector).
    Msix { offset: u32 },
    /// Device-specific configuration, at `offset` from its start.
    Device { offset: u32 },
}

/// Classifies `offset` within the device config area. When MSI-X is enabled
/// the first [`VIRTIO_PCI_MSIX_REGISTERS_LEN`] bytes hold the vector
/// registers and device configuration follows them.
pub fn locate_config_field(offset: u32, msix_enabled: bool) -> ConfigField {
    if !msix_enabled {
        return ConfigField::Device { offset };
    }
    match offset.checked_sub(VIRTIO_PCI_MSIX_REGISTERS_LEN) {
        None => ConfigField::Msix { offset },
        Some(offset) => ConfigField::Device { offset },
    }
}

#[derive(Debug)]
pub struct PciTransport {
    ids: DeviceIds,
    msix: Vec<Interrupt>,
    msix_enabled: bool,
    config_vector: u16,
    queue_vectors: Vec<u16>,
    interrupt_status: Mutex<u32>,
    intx: LineInterrupt,
}

impl PciTransport {
    pub(super) fn new(
        ids: DeviceIds,
        resources: TransportResources,
        max_queues: u16,
    ) -> Result<Self, BindError> {
        let queue_vectors = per_queue(max_queues.into(), || VIRTIO_MSI_NO_VECTOR)?;
        Ok(Self {
            ids,
            msix: resources.msix,
            msix_enabled: false,
            config_vector: VIRTIO_MSI_NO_VECTOR,
            queue_vectors,
            interrupt_status: Mutex::new(0),
            intx: resources.line,
        })
    }

    pub fn vendor_id(&self) -> u16 {
        VIRTIO_VENDOR_ID
    }

    pub fn device_id(&self) -> u16 {
        VIRTIO_PCI_DEVICE_ID_BASE.wrapping_add(self.ids.device_id)
    }

    pub fn subsystem_id(&self) -> u16 {
        self.ids.subsystem_id
    }

    pub fn class_code(&self) -> u32 {
        self.ids.class & 0xff_ffff
    }

    pub fn msix_enabled(&self) -> bool {
        self.msix_enabled
    }

    /// Called when the guest toggles the MSI-X enable bit.
    pub fn set_msix_enabled(&mut self, enabled: bool) {
        self.msix_enabled = enabled;
    }

    /// Returns where `offset` lands in the device config area given the
    /// current MSI-X state.
    pub fn config_field(&self, offset: u32) -> ConfigField {
        locate_config_field(offset, self.msix_enabled)
    }

    pub fn config_vector(&self) -> u16 {
        self.config_vector
    }

    pub fn set_config_vector(&mut self, vector: u16) {
        self.config_vector = vector;
    }

    pub fn queue_vector(&self, queue: u16) -> Option<u16> {
        self.queue_vectors.get(queue as usize).copied()
    }

    /// Assigns an MSI-X vector to a queue. Returns false if the queue does
    /// not exist.
    pub fn set_queue_vector(&mut self, queue: u16, vector: u16) -> bool {
        match self.queue_vectors.get_mut(queue as usize) {
            Some(v) => {
                *v = vector;
                true
            }
            None => false,
        }
    }

    /// Reads the ISR status register, which clears it and deasserts INTx.
    pub fn read_isr(&self) -> u32 {
        let mut interrupt_status = self.interrupt_status.lock();
        let status = std::mem::take(&mut *interrupt_status);
        self.intx.set_level(false);
        status
    }

    fn deliver_msix(&self, vector: u16) {
        if vector == VIRTIO_MSI_NO_VECTOR {
            return;
        }
        match self.msix.get(vector as usize) {
            Some(interrupt) => interrupt.deliver(),
            None => tracing::debug!(vector, "msi-x vector out of range"),
        }
    }

    fn assert_intx(&self, bits: u32) {
        let mut interrupt_status = self.interrupt_status.lock();
        *interrupt_status |= bits;
        self.intx.set_level(true);
    }
}

impl Transport for PciTransport {
    fn init(&mut self) {
        self.msix_enabled = false;
        self.config_vector = VIRTIO_MSI_NO_VECTOR;
        self.queue_vectors.fill(VIRTIO_MSI_NO_VECTOR);
        *self.interrupt_status.get_mut() = 0;
        self.intx.set_level(false);
        tracing::debug!(
            device_id = self.device_id(),
            subsystem_id = self.ids.subsystem_id,
            class = self.class_code(),
            queues = self.queue_vectors.len(),
            "virtio-pci transport initialized"
        );
    }

    fn exit(&mut self) {
        *self.interrupt_status.get_mut() = 0;
        self.intx.set_level(false);
    }

    fn signal_queue(&self, index: u16) {
        if self.msix_enabled {
            if let Some(vector) = self.queue_vector(index) {
                self.deliver_msix(vector);
            }
        } else {
            self.assert_intx(VIRTIO_PCI_ISR_QUEUE);
        }
    }

    fn signal_config(&self) {
        if self.msix_enabled {
            self.deliver_msix(self.config_vector);
        } else {
            self.assert_intx(VIRTIO_PCI_ISR_CONFIG);
        }
    }
}
