use std::sync::Once;

use axerrno::{ax_err, AxResult};
use kvm_bindings::{kvm_run, CpuId, KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_MMIO};
use kvm_ioctls::{VcpuExit, VcpuFd};

use super::kvm_error;
use crate::bus::AccessWidth;
use crate::memory::GuestPhysAddr;
use crate::{AxArchVCpu, AxVCpuExitReason};

const KVM_CPUID_SIGNATURE: u32 = 0x4000_0000;
const KVM_CPUID_FEATURES: u32 = 0x4000_0001;
/// "KVMKVMKVM\0\0\0"
const KVM_SIGNATURE: [u32; 3] = [0x4b4d_564b, 0x564b_4d56, 0x0000_004d];

const X86_CR0_PE: u64 = 0x1;
const X86_RFLAGS_RESERVED: u64 = 0x2;

const VCPU_KICK_SIGNAL: libc::c_int = libc::SIGUSR1;

/// A KVM vcpu booted straight into 32-bit protected mode.
pub struct KvmVCpu {
    fd: VcpuFd,
    cpuid: CpuId,
    entry: Option<GuestPhysAddr>,
    boot_params: Option<GuestPhysAddr>,
}

impl KvmVCpu {
    pub(super) fn new(fd: VcpuFd, cpuid: CpuId) -> AxResult<Self> {
        Ok(Self {
            fd,
            cpuid,
            entry: None,
            boot_params: None,
        })
    }

    fn setup_cpuid(&mut self) -> AxResult {
        for entry in self.cpuid.as_mut_slice() {
            if entry.function == KVM_CPUID_SIGNATURE {
                entry.eax = KVM_CPUID_FEATURES;
                entry.ebx = KVM_SIGNATURE[0];
                entry.ecx = KVM_SIGNATURE[1];
                entry.edx = KVM_SIGNATURE[2];
            }
        }
        self.fd
            .set_cpuid2(&self.cpuid)
            .map_err(|e| kvm_error("KVM_SET_CPUID2", e))
    }

    fn setup_sregs(&self) -> AxResult {
        let mut sregs = self
            .fd
            .get_sregs()
            .map_err(|e| kvm_error("KVM_GET_SREGS", e))?;
        for seg in [
            &mut sregs.cs,
            &mut sregs.ds,
            &mut sregs.es,
            &mut sregs.fs,
            &mut sregs.gs,
            &mut sregs.ss,
        ] {
            seg.base = 0;
            seg.limit = !0;
            seg.g = 1;
        }
        sregs.cs.db = 1;
        sregs.ss.db = 1;
        sregs.cr0 |= X86_CR0_PE;
        self.fd
            .set_sregs(&sregs)
            .map_err(|e| kvm_error("KVM_SET_SREGS", e))
    }

    fn setup_regs(&self, entry: GuestPhysAddr, boot_params: GuestPhysAddr) -> AxResult {
        let mut regs = self
            .fd
            .get_regs()
            .map_err(|e| kvm_error("KVM_GET_REGS", e))?;
        regs.rflags = X86_RFLAGS_RESERVED;
        regs.rip = entry.as_usize() as u64;
        regs.rsi = boot_params.as_usize() as u64;
        self.fd
            .set_regs(&regs)
            .map_err(|e| kvm_error("KVM_SET_REGS", e))
    }

    /// Size of one transfer of the current I/O exit.
    fn io_size(&mut self) -> usize {
        let run = self.fd.get_kvm_run();
        // SAFETY: only called while `exit_reason` is `KVM_EXIT_IO`.
        unsafe { run.__bindgen_anon_1.io.size as usize }
    }
}

impl AxArchVCpu for KvmVCpu {
    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult {
        self.entry = Some(entry);
        Ok(())
    }

    fn set_boot_params(&mut self, boot_params: GuestPhysAddr) -> AxResult {
        self.boot_params = Some(boot_params);
        Ok(())
    }

    fn setup(&mut self) -> AxResult {
        let (Some(entry), Some(boot_params)) = (self.entry, self.boot_params) else {
            return ax_err!(BadState, "vcpu entry and boot parameters must be set first");
        };
        self.setup_cpuid()?;
        self.setup_sregs()?;
        self.setup_regs(entry, boot_params)?;
        debug!(
            "vcpu: entry {:#x}, boot params {:#x}",
            entry.as_usize(),
            boot_params.as_usize()
        );
        Ok(())
    }

    fn run(&mut self) -> AxResult<AxVCpuExitReason> {
        let exit = match self.fd.run() {
            Ok(VcpuExit::IoIn(port, data)) => {
                let len = data.len();
                let size = self.io_size();
                AxVCpuExitReason::IoRead {
                    port,
                    width: AccessWidth::try_from(size)?,
                    count: len / size,
                }
            }
            Ok(VcpuExit::IoOut(port, data)) => {
                let data = data.to_vec();
                AxVCpuExitReason::IoWrite {
                    port,
                    width: AccessWidth::try_from(self.io_size())?,
                    data,
                }
            }
            Ok(VcpuExit::MmioRead(addr, data)) => AxVCpuExitReason::MmioRead {
                addr: GuestPhysAddr::from(addr as usize),
                width: AccessWidth::try_from(data.len())?,
            },
            Ok(VcpuExit::MmioWrite(addr, data)) => {
                let mut bytes = [0u8; 8];
                bytes[..data.len()].copy_from_slice(data);
                AxVCpuExitReason::MmioWrite {
                    addr: GuestPhysAddr::from(addr as usize),
                    width: AccessWidth::try_from(data.len())?,
                    data: u64::from_le_bytes(bytes),
                }
            }
            Ok(VcpuExit::IrqWindowOpen) => AxVCpuExitReason::IrqWindowOpen,
            Ok(VcpuExit::Intr) => AxVCpuExitReason::Nothing,
            Ok(VcpuExit::Hlt) => AxVCpuExitReason::Halt,
            Ok(VcpuExit::Shutdown) => AxVCpuExitReason::SystemDown,
            Ok(VcpuExit::FailEntry(reason, _cpu)) => AxVCpuExitReason::FailEntry {
                hardware_entry_failure_reason: reason,
            },
            Ok(VcpuExit::InternalError) => {
                let run = self.fd.get_kvm_run();
                // SAFETY: `exit_reason` is `KVM_EXIT_INTERNAL_ERROR`.
                let suberror = unsafe { run.__bindgen_anon_1.internal.suberror };
                AxVCpuExitReason::InternalError { suberror }
            }
            Ok(_) => {
                let exit_reason = self.fd.get_kvm_run().exit_reason;
                AxVCpuExitReason::Unknown { exit_reason }
            }
            Err(e) => return Err(kvm_error("KVM_RUN", e)),
        };
        Ok(exit)
    }

    fn set_read_data(&mut self, data: &[u8]) -> AxResult {
        let run: &mut kvm_run = self.fd.get_kvm_run();
        match run.exit_reason {
            KVM_EXIT_IO => {
                // SAFETY: `exit_reason` selects the `io` member.
                let io = unsafe { run.__bindgen_anon_1.io };
                let len = io.size as usize * io.count as usize;
                if u32::from(io.direction) != KVM_EXIT_IO_IN || len != data.len() {
                    return ax_err!(InvalidInput, "read data does not match the I/O exit");
                }
                // SAFETY: the kernel places `len` bytes of I/O data at
                // `data_offset` inside the mapped `kvm_run` area.
                unsafe {
                    let dst = (run as *mut kvm_run as *mut u8).add(io.data_offset as usize);
                    core::ptr::copy_nonoverlapping(data.as_ptr(), dst, len);
                }
                Ok(())
            }
            KVM_EXIT_MMIO => {
                // SAFETY: `exit_reason` selects the `mmio` member.
                let mmio = unsafe { &mut run.__bindgen_anon_1.mmio };
                if mmio.is_write != 0 || mmio.len as usize != data.len() {
                    return ax_err!(InvalidInput, "read data does not match the MMIO exit");
                }
                mmio.data[..data.len()].copy_from_slice(data);
                Ok(())
            }
            reason => ax_err!(
                BadState,
                format!("exit {} takes no read data", reason)
            ),
        }
    }
}

extern "C" fn handle_kick(_: libc::c_int) {}

/// Forces the vcpu thread out of `KVM_RUN` from another thread.
///
/// The signal interrupts the ioctl with `EINTR`, which the run loop treats
/// as a transient interruption.
#[derive(Clone, Copy, Debug)]
pub struct VcpuKicker {
    thread: libc::pthread_t,
}

impl VcpuKicker {
    /// A kicker for the calling thread, which must be the one running the vcpu.
    pub fn current() -> AxResult<Self> {
        static INSTALL: Once = Once::new();
        let mut result = Ok(());
        INSTALL.call_once(|| {
            // SAFETY: the handler is async-signal-safe (it does nothing), and
            // SA_RESTART is left clear so KVM_RUN returns EINTR.
            unsafe {
                let mut action: libc::sigaction = core::mem::zeroed();
                action.sa_sigaction = handle_kick as extern "C" fn(libc::c_int) as usize;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(VCPU_KICK_SIGNAL, &action, core::ptr::null_mut()) != 0 {
                    result = ax_err!(Io, "failed to install the vcpu kick handler");
                }
            }
        });
        result?;
        Ok(Self {
            // SAFETY: always succeeds.
            thread: unsafe { libc::pthread_self() },
        })
    }

    /// Interrupt the vcpu thread.
    pub fn kick(&self) {
        // SAFETY: `thread` is the vcpu thread, alive for the whole VM lifetime.
        let ret = unsafe { libc::pthread_kill(self.thread, VCPU_KICK_SIGNAL) };
        if ret != 0 {
            warn!("failed to kick vcpu thread: errno {}", ret);
        }
    }
}
