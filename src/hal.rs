use std::sync::Arc;

use axerrno::AxResult;

use crate::arch_vcpu::AxArchVCpu;
use crate::memory::GuestMemory;

/// A guest interrupt controller input that devices can drive.
pub trait InterruptSink: Send + Sync {
    /// Set the level of interrupt line `irq`.
    fn set_irq_line(&self, irq: u32, level: bool) -> AxResult;

    /// Raise then lower `irq`, for edge-style notifications.
    fn pulse_irq_line(&self, irq: u32) -> AxResult {
        self.set_irq_line(irq, true)?;
        self.set_irq_line(irq, false)
    }
}

/// The interfaces which the underlying hypervisor must implement.
///
/// One instance represents one VM: creating it creates the VM.
pub trait AxVmHal {
    /// The VCPU type this hypervisor produces.
    type VCpu: AxArchVCpu;

    /// Install `mem` as guest physical memory starting at address 0.
    ///
    /// # Safety
    ///
    /// The hypervisor keeps referring to the host mapping of `mem`; the caller
    /// must keep `mem` alive and mapped for as long as this HAL exists.
    unsafe fn install_memory(&mut self, slot: u32, mem: &GuestMemory) -> AxResult;

    /// Create VCPU number `id`.
    fn create_vcpu(&mut self, id: usize) -> AxResult<Self::VCpu>;

    /// The interrupt controller devices of this VM raise their lines on.
    fn interrupt_sink(&self) -> Arc<dyn InterruptSink>;
}
