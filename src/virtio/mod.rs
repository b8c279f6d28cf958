//! Virtio 1.x over PCI: the transport and the split virtqueue engine.
//!
//! Device types plug in through [`VirtioDevice`]; the transport owns feature
//! negotiation, the status state machine and queue configuration, and hands
//! each well-formed descriptor chain to the device.

mod pci;
mod queue;

use axerrno::AxResult;

use crate::memory::GuestMemory;

pub use pci::{VirtioPciDevice, VIRTIO_PCI_BAR_SIZE};
pub use queue::{Descriptor, DescriptorChain, QueueConfig, Virtqueue};

/// The device conforms to virtio 1.x (non-legacy).
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
/// `used_event`/`avail_event` interrupt and notification suppression.
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;
/// Indirect descriptor tables. Never offered.
pub const VIRTIO_RING_F_INDIRECT_DESC: u64 = 1 << 28;

/// Device status bits written by the driver.
pub mod status {
    /// The guest noticed the device.
    pub const ACKNOWLEDGE: u8 = 1;
    /// The guest knows how to drive the device.
    pub const DRIVER: u8 = 2;
    /// The driver is set up and ready to drive the device.
    pub const DRIVER_OK: u8 = 4;
    /// Feature negotiation is complete.
    pub const FEATURES_OK: u8 = 8;
    /// The device hit an error it cannot recover from without a reset.
    pub const DEVICE_NEEDS_RESET: u8 = 0x40;
    /// The guest gave up on the device.
    pub const FAILED: u8 = 0x80;
}

/// ISR status: a used buffer was published.
pub const VIRTIO_ISR_QUEUE: u8 = 1;
/// ISR status: the device configuration changed.
pub const VIRTIO_ISR_CONFIG: u8 = 2;

/// PCI vendor ID shared by every virtio device.
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1af4;
/// Modern virtio PCI device IDs are this plus the virtio device type.
pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;

/// A virtio device model behind the PCI transport.
pub trait VirtioDevice {
    /// Virtio device type (1 = net, 2 = block, ...).
    fn device_type(&self) -> u16;

    /// Device-specific feature bits offered to the driver.
    fn features(&self) -> u64;

    /// Number of virtqueues.
    fn num_queues(&self) -> u16;

    /// Largest size the driver may give `queue`.
    fn queue_max_size(&self, queue: u16) -> u16;

    /// Length of the device-specific configuration structure.
    fn config_len(&self) -> usize {
        0
    }

    /// Read the device-specific configuration at `offset`.
    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let _ = offset;
        data.fill(0);
    }

    /// Write the device-specific configuration at `offset`.
    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let _ = (offset, data);
    }

    /// Called once the driver sets `DRIVER_OK`, with the negotiated features.
    fn activate(&mut self, features: u64) -> AxResult {
        let _ = features;
        Ok(())
    }

    /// Handle one request taken from `queue`.
    ///
    /// Returns the number of bytes written into the chain's device-writable
    /// buffers. `Err(InvalidData)` marks the request as malformed; it is
    /// skipped without a completion. Any other error stops the VM.
    fn process_chain(&mut self, queue: u16, chain: &DescriptorChain, mem: &GuestMemory)
        -> AxResult<u32>;

    /// Return to the initial state after the driver writes status 0.
    fn reset(&mut self) {}
}
