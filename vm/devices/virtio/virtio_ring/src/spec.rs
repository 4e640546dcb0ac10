// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants defined by the virtio spec

// Device features - first bank
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
// Device features - second bank
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

// Device status
pub const VIRTIO_ACKNOWLEDGE: u32 = 1;
pub const VIRTIO_DRIVER: u32 = 2;
pub const VIRTIO_DRIVER_OK: u32 = 4;
pub const VIRTIO_FEATURES_OK: u32 = 8;
pub const VIRTIO_DEVICE_NEEDS_RESET: u32 = 0x40;
pub const VIRTIO_FAILED: u32 = 0x80;

// Interrupt status bits, shared by the MMIO interrupt status register and the
// PCI ISR register.
pub const VIRTIO_MMIO_INTERRUPT_STATUS_USED_BUFFER: u32 = 1;
pub const VIRTIO_MMIO_INTERRUPT_STATUS_CONFIG_CHANGE: u32 = 2;

/// Virtio over PCI specific constants
pub mod pci {
    pub const VIRTIO_VENDOR_ID: u16 = 0x1af4;
    pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;

    pub const VIRTIO_PCI_ISR_QUEUE: u32 = 1;
    pub const VIRTIO_PCI_ISR_CONFIG: u32 = 2;

    /// Vector value meaning "no MSI-X vector assigned".
    pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

    /// Bytes of MSI-X vector registers (config vector, queue vector) that
    /// precede the device-specific config when MSI-X is enabled.
    pub const VIRTIO_PCI_MSIX_REGISTERS_LEN: u32 = 4;
}

/// Virtio over MMIO specific constants
pub mod mmio {
    pub const VIRTIO_MMIO_MAGIC_VALUE: u32 = u32::from_le_bytes(*b"virt");
    pub const VIRTIO_MMIO_VERSION: u32 = 2;
    pub const VIRTIO_MMIO_VENDOR_ID: u32 = 0x1af4;

    pub const VIRTIO_MMIO_OFFSET_MAGIC: u16 = 0x000;
    pub const VIRTIO_MMIO_OFFSET_VERSION: u16 = 0x004;
    pub const VIRTIO_MMIO_OFFSET_DEVICE_ID: u16 = 0x008;
    pub const VIRTIO_MMIO_OFFSET_VENDOR_ID: u16 = 0x00c;
    pub const VIRTIO_MMIO_OFFSET_INTERRUPT_STATUS: u16 = 0x060;
    pub const VIRTIO_MMIO_OFFSET_INTERRUPT_ACK: u16 = 0x064;
}

/// Virtio queue definitions.
///
/// Multi-byte fields of these structures are stored in guest byte order; read
/// and write them through [`crate::endian::RingEndian`].
pub mod queue {
    use bitfield_struct::bitfield;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Largest queue size allowed by the split ring format.
    pub const MAX_QUEUE_SIZE: u16 = 0x8000;

    /// Largest indirect descriptor table the device will walk.
    pub const MAX_INDIRECT_DESCRIPTORS: u32 = MAX_QUEUE_SIZE as u32;

    /*
    struct virtq_desc {
        le64 addr;
        le32 len;
        le16 flags;
        le16 next;
    };
    */
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Descriptor {
        pub address: u64,
        pub length: u32,
        pub flags_raw: u16,
        pub next: u16,
    }

    pub const DESCRIPTOR_SIZE: u64 = size_of::<Descriptor>() as u64;

    #[bitfield(u16)]
    pub struct DescriptorFlags {
        pub next: bool,
        pub write: bool,
        pub indirect: bool,
        #[bits(13)]
        _reserved: u16,
    }

    /*
    struct virtq_avail {
        le16 flags;
        le16 idx;
        le16 ring[ /* Queue Size */ ];
        le16 used_event;
    }
    */
    pub const AVAIL_OFFSET_FLAGS: u64 = 0;
    pub const AVAIL_OFFSET_IDX: u64 = 2;
    pub const AVAIL_OFFSET_RING: u64 = 4;
    pub const AVAIL_ELEMENT_SIZE: u64 = size_of::<u16>() as u64;

    #[bitfield(u16)]
    pub struct AvailableFlags {
        pub no_interrupt: bool,
        #[bits(15)]
        _reserved: u16,
    }

    /*
    struct virtq_used {
        le16 flags;
        le16 idx;
        struct virtq_used_elem ring[ /* Queue Size */];
        le16 avail_event;
    };
    */
    pub const USED_OFFSET_FLAGS: u64 = 0;
    pub const USED_OFFSET_IDX: u64 = 2;
    pub const USED_OFFSET_RING: u64 = 4;
    pub const USED_ELEMENT_SIZE: u64 = size_of::<UsedElement>() as u64;

    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct UsedElement {
        pub id: u32,
        pub len: u32,
    }

    #[bitfield(u16)]
    pub struct UsedFlags {
        pub no_notify: bool,
        #[bits(15)]
        _reserved: u16,
    }

    /// Size in bytes of the available ring, including the `used_event`
    /// trailer.
    pub const fn avail_ring_size(queue_size: u16) -> u64 {
        AVAIL_OFFSET_RING + AVAIL_ELEMENT_SIZE * queue_size as u64 + size_of::<u16>() as u64
    }

    /// Size in bytes of the used ring, including the `avail_event` trailer.
    pub const fn used_ring_size(queue_size: u16) -> u64 {
        USED_OFFSET_RING + USED_ELEMENT_SIZE * queue_size as u64 + size_of::<u16>() as u64
    }

    const _: () = assert!(DESCRIPTOR_SIZE == 16);
    const _: () = assert!(USED_ELEMENT_SIZE == 8);
}
