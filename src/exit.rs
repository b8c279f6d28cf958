use crate::bus::{AccessWidth, Port};
use crate::memory::GuestPhysAddr;

#[allow(unused_imports)] // used in doc
use super::AxArchVCpu;

/// The result of [`AxArchVCpu::run`].
///
/// Payloads are copied out of the hypervisor's shared run structure, so an
/// exit stays valid after the VCPU is resumed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxVCpuExitReason {
    /// The guest executed `in`/`ins` on `port`.
    ///
    /// The result is `count` values of `width` bytes, handed back with
    /// [`AxArchVCpu::set_read_data`] before the next run.
    IoRead {
        /// The port number of the I/O read.
        port: Port,
        /// The width of each transfer.
        width: AccessWidth,
        /// Number of repeated transfers (greater than one for `rep ins`).
        count: usize,
    },
    /// The guest executed `out`/`outs` on `port`.
    IoWrite {
        /// The port number of the I/O write.
        port: Port,
        /// The width of each transfer.
        width: AccessWidth,
        /// `count * width` bytes, in the order the transfers happened.
        data: Vec<u8>,
    },
    /// The guest read from an address that is not backed by RAM.
    MmioRead {
        /// The physical address of the MMIO read.
        addr: GuestPhysAddr,
        /// The width of the MMIO read.
        width: AccessWidth,
    },
    /// The guest wrote to an address that is not backed by RAM.
    MmioWrite {
        /// The physical address of the MMIO write.
        addr: GuestPhysAddr,
        /// The width of the MMIO write.
        width: AccessWidth,
        /// The data to be written, zero-extended.
        data: u64,
    },
    /// The guest can accept an interrupt now.
    IrqWindowOpen,
    /// The vcpu is halted.
    Halt,
    /// The guest shut the machine down (triple fault or reset).
    SystemDown,
    /// Nothing special happened, the vcpu has handled the exit itself.
    Nothing,
    /// Something bad happened during VM entry.
    /// Corresponds to `KVM_EXIT_FAIL_ENTRY`.
    FailEntry {
        /// Architecture related VM entry failure reasons.
        hardware_entry_failure_reason: u64,
    },
    /// The hypervisor hit an internal error emulating the guest.
    InternalError {
        /// Hypervisor-specific sub-error code.
        suberror: u32,
    },
    /// An exit this monitor has no handler for.
    Unknown {
        /// The raw exit reason number reported by the hypervisor.
        exit_reason: u32,
    },
}

impl AxVCpuExitReason {
    /// Number of result bytes the guest expects after this exit, if any.
    pub fn read_len(&self) -> Option<usize> {
        match self {
            Self::IoRead { width, count, .. } => Some(width.size() * count),
            Self::MmioRead { width, .. } => Some(width.size()),
            _ => None,
        }
    }
}
