use axerrno::AxResult;

use crate::exit::AxVCpuExitReason;
use crate::memory::GuestPhysAddr;

/// Backend-specific virtual CPU.
///
/// Implemented once per hypervisor backend (KVM for the real monitor, a
/// scripted double in tests). Instances are created by
/// [`AxVmHal::create_vcpu`](crate::AxVmHal::create_vcpu) and driven through
/// [`AxVCpu`](crate::AxVCpu), which enforces the call order.
pub trait AxArchVCpu: Sized {
    /// Sets the guest entry point where vCPU execution will begin.
    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult;

    /// Sets the guest physical address of the boot parameters block handed
    /// to the kernel on entry.
    fn set_boot_params(&mut self, boot_params: GuestPhysAddr) -> AxResult;

    /// Completes vCPU initialization (registers, segments, CPUID) and
    /// prepares it for execution.
    fn setup(&mut self) -> AxResult;

    /// Executes the vCPU until it exits back to the monitor.
    ///
    /// Transient interruptions of the blocking run call are reported as
    /// `Err(AxError::WouldBlock)`; the caller is expected to retry.
    fn run(&mut self) -> AxResult<AxVCpuExitReason>;

    /// Hands the result of the last [`AxVCpuExitReason::IoRead`] or
    /// [`AxVCpuExitReason::MmioRead`] back to the guest.
    ///
    /// Must be called after the exit is handled and before the next
    /// [`run`](Self::run).
    fn set_read_data(&mut self, data: &[u8]) -> AxResult;
}
