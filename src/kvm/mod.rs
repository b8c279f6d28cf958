//! The Linux KVM backend.

mod vcpu;

pub use vcpu::{KvmVCpu, VcpuKicker};

use std::sync::Arc;

use axerrno::{AxError, AxResult};
use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VmFd};

use crate::hal::{AxVmHal, InterruptSink};
use crate::memory::GuestMemory;

const KVM_TSS_ADDRESS: usize = 0xffff_d000;
const KVM_IDENTITY_MAP_ADDRESS: u64 = 0xffff_c000;

/// Map a failed KVM ioctl to an [`AxError`], logging what was attempted.
pub(crate) fn kvm_error(what: &str, err: kvm_ioctls::Error) -> AxError {
    let kind = match err.errno() {
        libc::EINTR | libc::EAGAIN => AxError::WouldBlock,
        libc::EPERM | libc::EACCES => AxError::PermissionDenied,
        libc::ENOMEM => AxError::NoMemory,
        libc::EEXIST => AxError::AlreadyExists,
        libc::EINVAL => AxError::InvalidInput,
        _ => AxError::Io,
    };
    if kind != AxError::WouldBlock {
        error!("{}: {}", what, err);
    }
    kind
}

/// Raises interrupt lines on the in-kernel PIC/IOAPIC.
pub struct KvmIrqSink {
    vm: Arc<VmFd>,
}

impl InterruptSink for KvmIrqSink {
    fn set_irq_line(&self, irq: u32, level: bool) -> AxResult {
        trace!("irq {} -> {}", irq, level);
        self.vm
            .set_irq_line(irq, level)
            .map_err(|e| kvm_error("KVM_IRQ_LINE", e))
    }
}

/// A VM on `/dev/kvm` with an in-kernel IRQ chip and PIT.
pub struct KvmHal {
    vm: Arc<VmFd>,
    supported_cpuid: CpuId,
    // Keeps the `/dev/kvm` handle open as long as the VM.
    _kvm: Kvm,
}

impl KvmHal {
    /// Open `/dev/kvm` and create an empty x86 VM.
    pub fn new() -> AxResult<Self> {
        let kvm = Kvm::new().map_err(|e| kvm_error("open /dev/kvm", e))?;
        let api = kvm.get_api_version();
        if api != 12 {
            error!("unsupported KVM API version {}", api);
            return Err(AxError::Unsupported);
        }

        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| kvm_error("KVM_GET_SUPPORTED_CPUID", e))?;

        let vm = kvm.create_vm().map_err(|e| kvm_error("KVM_CREATE_VM", e))?;
        vm.set_tss_address(KVM_TSS_ADDRESS)
            .map_err(|e| kvm_error("KVM_SET_TSS_ADDR", e))?;
        vm.set_identity_map_address(KVM_IDENTITY_MAP_ADDRESS)
            .map_err(|e| kvm_error("KVM_SET_IDENTITY_MAP_ADDR", e))?;
        vm.create_irq_chip()
            .map_err(|e| kvm_error("KVM_CREATE_IRQCHIP", e))?;
        vm.create_pit2(kvm_pit_config::default())
            .map_err(|e| kvm_error("KVM_CREATE_PIT2", e))?;

        info!("KVM VM created");
        Ok(Self {
            vm: Arc::new(vm),
            supported_cpuid,
            _kvm: kvm,
        })
    }
}

impl AxVmHal for KvmHal {
    type VCpu = KvmVCpu;

    unsafe fn install_memory(&mut self, slot: u32, mem: &GuestMemory) -> AxResult {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: mem.size() as u64,
            userspace_addr: mem.host_base().as_usize() as u64,
        };
        // SAFETY: the caller keeps `mem` mapped for the lifetime of the VM.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(|e| kvm_error("KVM_SET_USER_MEMORY_REGION", e))?;
        debug!("memory slot {}: {:#x} bytes of guest RAM", slot, mem.size());
        Ok(())
    }

    fn create_vcpu(&mut self, id: usize) -> AxResult<KvmVCpu> {
        let fd = self
            .vm
            .create_vcpu(id as u64)
            .map_err(|e| kvm_error("KVM_CREATE_VCPU", e))?;
        KvmVCpu::new(fd, self.supported_cpuid.clone())
    }

    fn interrupt_sink(&self) -> Arc<dyn InterruptSink> {
        Arc::new(KvmIrqSink {
            vm: self.vm.clone(),
        })
    }
}
