// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host side of the virtio split virtqueue.
//!
//! Turns descriptor chains the guest publishes on the available ring into
//! scatter/gather views of guest memory, posts completions to the used ring,
//! decides when the guest must be interrupted and delivers that interrupt
//! through a PCI or MMIO transport.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

pub mod device;
pub mod endian;
pub mod interrupt;
pub mod iovec;
pub mod queue;
pub mod spec;
pub mod transport;

#[cfg(test)]
mod test_guest;

pub use device::DeviceError;
pub use device::VirtioDevice;
pub use interrupt::Interrupt;
pub use interrupt::LineInterrupt;
pub use iovec::InOutIov;
pub use iovec::IoSegment;
pub use iovec::IoVec;
pub use queue::vring_need_event;
pub use queue::QueueError;
pub use queue::QueueParams;
pub use queue::UsedRecord;
pub use queue::VirtQueue;
pub use transport::bind_transport;
pub use transport::locate_config_field;
pub use transport::BindError;
pub use transport::ConfigField;
pub use transport::TransportKind;
