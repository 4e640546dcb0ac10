// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Present virtio devices to the guest over different transports.
//!
//! The set of transports is closed: a device is bound to exactly one
//! [`VirtioTransport`] variant, chosen when the device is built.

mod mmio;
mod pci;

pub use mmio::MmioTransport;
pub use pci::locate_config_field;
pub use pci::ConfigField;
pub use pci::PciTransport;

use crate::device::VirtioDevice;
use crate::interrupt::Interrupt;
use crate::interrupt::LineInterrupt;
use std::collections::TryReserveError;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to allocate transport state")]
    OutOfMemory(#[source] TryReserveError),
    #[error("unsupported transport kind {0}")]
    UnsupportedTransport(u32),
    #[error("device is already bound to a transport")]
    AlreadyBound,
}

#[derive(Debug, Error)]
#[error("unknown transport '{0}'")]
pub struct UnknownTransport(String);

/// The wire-level presentation of a virtio device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportKind {
    Pci,
    Mmio,
}

impl TransportKind {
    /// Converts a raw transport selector, as stored in a device
    /// configuration, into a kind.
    pub fn from_raw(kind: u32) -> Result<Self, BindError> {
        match kind {
            0 => Ok(Self::Pci),
            1 => Ok(Self::Mmio),
            kind => Err(BindError::UnsupportedTransport(kind)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pci => "pci",
            Self::Mmio => "mmio",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pci" => Ok(Self::Pci),
            "mmio" => Ok(Self::Mmio),
            s => Err(UnknownTransport(s.to_owned())),
        }
    }
}

/// Identification the transport presents to the guest.
#[derive(Debug, Copy, Clone, Default)]
pub struct DeviceIds {
    /// The virtio device type (1 = net, 2 = block, ...).
    pub device_id: u16,
    pub subsystem_id: u16,
    /// PCI class code, in the low 24 bits.
    pub class: u32,
}

/// Interrupt resources the embedder wires to the transport.
#[derive(Debug)]
pub struct TransportResources {
    /// INTx for PCI, the device interrupt for MMIO.
    pub line: LineInterrupt,
    /// MSI-X table entries, indexed by vector. Ignored by MMIO.
    pub msix: Vec<Interrupt>,
}

impl Default for TransportResources {
    fn default() -> Self {
        Self {
            line: LineInterrupt::detached(),
            msix: Vec::new(),
        }
    }
}

/// The operations a device performs on its transport.
pub trait Transport {
    /// Brings the transport to its initial state.
    fn init(&mut self);
    /// Quiesces the transport: pending interrupt state is dropped and the
    /// line is lowered.
    fn exit(&mut self);
    /// Tells the guest that queue `index` has new used buffers.
    fn signal_queue(&self, index: u16);
    /// Tells the guest that the device configuration or status changed.
    fn signal_config(&self);
}

#[derive(Debug)]
pub enum VirtioTransport {
    Pci(PciTransport),
    Mmio(MmioTransport),
}

impl VirtioTransport {
    /// Builds the transport state for a device with `max_queues` queues.
    pub(crate) fn new(
        kind: TransportKind,
        ids: DeviceIds,
        resources: TransportResources,
        max_queues: u16,
    ) -> Result<Self, BindError> {
        Ok(match kind {
            TransportKind::Pci => Self::Pci(PciTransport::new(ids, resources, max_queues)?),
            TransportKind::Mmio => Self::Mmio(MmioTransport::new(ids, resources, max_queues)?),
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Pci(_) => TransportKind::Pci,
            Self::Mmio(_) => TransportKind::Mmio,
        }
    }

    pub fn as_pci(&self) -> Option<&PciTransport> {
        match self {
            Self::Pci(pci) => Some(pci),
            Self::Mmio(_) => None,
        }
    }

    pub fn as_pci_mut(&mut self) -> Option<&mut PciTransport> {
        match self {
            Self::Pci(pci) => Some(pci),
            Self::Mmio(_) => None,
        }
    }

    pub fn as_mmio(&self) -> Option<&MmioTransport> {
        match self {
            Self::Pci(_) => None,
            Self::Mmio(mmio) => Some(mmio),
        }
    }
}

impl Transport for VirtioTransport {
    fn init(&mut self) {
        match self {
            Self::Pci(t) => t.init(),
            Self::Mmio(t) => t.init(),
        }
    }

    fn exit(&mut self) {
        match self {
            Self::Pci(t) => t.exit(),
            Self::Mmio(t) => t.exit(),
        }
    }

    fn signal_queue(&self, index: u16) {
        match self {
            Self::Pci(t) => t.signal_queue(index),
            Self::Mmio(t) => t.signal_queue(index),
        }
    }

    fn signal_config(&self) {
        match self {
            Self::Pci(t) => t.signal_config(),
            Self::Mmio(t) => t.signal_config(),
        }
    }
}

/// Allocates per-queue transport state without aborting on allocation
/// failure.
pub(crate) fn per_queue<T>(count: usize, f: impl FnMut() -> T) -> Result<Vec<T>, BindError> {
    let mut v = Vec::new();
    v.try_reserve_exact(count).map_err(BindError::OutOfMemory)?;
    v.resize_with(count, f);
    Ok(v)
}

/// Binds `device` to the transport selected by the raw value `kind`.
///
/// On failure the device is left exactly as it was.
pub fn bind_transport(
    device: &mut VirtioDevice,
    kind: u32,
    ids: DeviceIds,
    resources: TransportResources,
) -> Result<(), BindError> {
    let kind = TransportKind::from_raw(kind)?;
    device.bind(kind, ids, resources)
}
