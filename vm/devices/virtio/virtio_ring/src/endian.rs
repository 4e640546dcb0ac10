// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest byte order handling for ring fields.
//!
//! Legacy (pre-1.0) virtio devices store ring fields in the guest's native
//! byte order, which for a hypervisor running guests of its own architecture
//! is the host's native order. Devices that negotiated `VIRTIO_F_VERSION_1`
//! store every field little-endian. Every ring field the engine touches is
//! converted here; nothing else in the crate interprets raw field bytes.

use crate::spec::VIRTIO_F_VERSION_1;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;

/// The byte order of the ring fields of a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RingEndian {
    /// Host-native byte order (legacy devices).
    Legacy,
    /// Little-endian (devices that negotiated `VIRTIO_F_VERSION_1`).
    Modern,
}

macro_rules! conversions {
    ($($ty:ident: $to_host:ident, $to_guest:ident, $read:ident, $write:ident;)*) => {
        $(
            /// Converts a raw field value, as loaded from guest memory in host
            /// order, into its logical value.
            pub fn $to_host(self, raw: $ty) -> $ty {
                match self {
                    RingEndian::Legacy => raw,
                    RingEndian::Modern => $ty::from_le(raw),
                }
            }

            /// Converts a logical value into the raw form to store into guest
            /// memory.
            pub fn $to_guest(self, value: $ty) -> $ty {
                match self {
                    RingEndian::Legacy => value,
                    RingEndian::Modern => value.to_le(),
                }
            }

            /// Reads a field from guest memory.
            pub fn $read(self, mem: &GuestMemory, gpa: u64) -> Result<$ty, GuestMemoryError> {
                Ok(self.$to_host(mem.read_plain::<$ty>(gpa)?))
            }

            /// Writes a field to guest memory.
            pub fn $write(
                self,
                mem: &GuestMemory,
                gpa: u64,
                value: $ty,
            ) -> Result<(), GuestMemoryError> {
                mem.write_plain(gpa, &self.$to_guest(value))
            }
        )*
    };
}

impl RingEndian {
    /// Returns the byte order implied by the negotiated feature bits.
    pub fn from_features(features: u64) -> Self {
        if features & VIRTIO_F_VERSION_1 != 0 {
            RingEndian::Modern
        } else {
            RingEndian::Legacy
        }
    }

    conversions! {
        u16: u16_to_host, u16_to_guest, read_u16, write_u16;
        u32: u32_to_host, u32_to_guest, read_u32, write_u32;
        u64: u64_to_host, u64_to_guest, read_u64, write_u64;
    }
}
