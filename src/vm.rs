//! The virtual machine: guest memory, buses, devices and the VCPU run loop.

use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use axerrno::{ax_err_type, AxError, AxResult};

use crate::bus::{AccessWidth, Bus, Port};
use crate::config::VmConfig;
use crate::hal::{AxVmHal, InterruptSink};
use crate::loader::{load_bzimage, load_initrd};
use crate::memory::{GuestMemory, GuestPhysAddr};
use crate::pci::{PciRoot, PCI_CONFIG_PORT, PCI_CONFIG_PORT_LEN};
use crate::serial::{Serial, SerialInput, SERIAL_PORT_BASE, SERIAL_PORT_LEN};
use crate::virtio::{VirtioDevice, VirtioPciDevice, VIRTIO_PCI_BAR_SIZE};
use crate::{AxVCpu, AxVCpuExitReason};

/// Base of the BAR0 windows handed to virtio devices, one page per PCI slot.
pub const VIRTIO_MMIO_BASE: u32 = 0xd000_0000;

/// Why [`AxVm::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The guest shut the machine down.
    Shutdown,
    /// The guest stopped on an exit the monitor cannot handle.
    Fatal(AxVCpuExitReason),
}

/// A single-VCPU virtual machine.
pub struct AxVm<H: AxVmHal> {
    // Field order is drop order: the vcpu and devices go before the
    // hypervisor handle, and guest memory outlives both.
    vcpu: AxVCpu<H::VCpu>,
    io_bus: Bus,
    mmio_bus: Bus,
    pci_root: Rc<PciRoot>,
    serial: Serial,
    interrupt: Arc<dyn InterruptSink>,
    hal: H,
    memory: Arc<GuestMemory>,
}

impl<H: AxVmHal> AxVm<H> {
    /// Build a VM whose serial console writes to stdout.
    pub fn new(hal: H, config: &VmConfig) -> AxResult<Self> {
        Self::with_console(hal, config, Box::new(io::stdout()))
    }

    /// Build a VM whose serial console writes to `console`.
    pub fn with_console(mut hal: H, config: &VmConfig, console: Box<dyn Write>) -> AxResult<Self> {
        config.validate()?;

        let memory = Arc::new(GuestMemory::new(config.ram_size)?);
        // SAFETY: `memory` is owned by the returned VM and dropped after `hal`.
        unsafe { hal.install_memory(0, &memory)? };

        let vcpu = AxVCpu::new(0, hal.create_vcpu(0)?);
        let interrupt = hal.interrupt_sink();

        let pci_root = Rc::new(PciRoot::new());
        let mut io_bus = Bus::new("pio");
        io_bus.register(
            PCI_CONFIG_PORT as u64,
            PCI_CONFIG_PORT_LEN as u64,
            pci_root.clone(),
        )?;

        info!("VM created with {:#x} bytes of RAM", config.ram_size);
        Ok(Self {
            vcpu,
            io_bus,
            mmio_bus: Bus::new("mmio"),
            pci_root,
            serial: Serial::new(interrupt.clone(), console),
            interrupt,
            hal,
            memory,
        })
    }

    /// Plug a virtio device into the next free PCI slot.
    ///
    /// Returns the slot; BAR0 of the device sits at
    /// `VIRTIO_MMIO_BASE + slot * VIRTIO_PCI_BAR_SIZE`.
    pub fn attach_virtio_device(&mut self, device: Box<dyn VirtioDevice>, irq: u8) -> AxResult<u8> {
        let slot = self
            .pci_root
            .free_slot()
            .ok_or_else(|| ax_err_type!(NoMemory, "no free PCI slot"))?;
        let bar0 = VIRTIO_MMIO_BASE + slot as u32 * VIRTIO_PCI_BAR_SIZE;

        let dev = Rc::new(VirtioPciDevice::new(
            device,
            self.memory.clone(),
            self.interrupt.clone(),
            irq,
            bar0,
        )?);
        self.mmio_bus
            .register(bar0 as u64, VIRTIO_PCI_BAR_SIZE as u64, dev.clone())?;
        self.pci_root.add_device(dev)?;
        Ok(slot)
    }

    /// Load the kernel and initrd named by `config` and point the vcpu at them.
    pub fn load(&mut self, config: &VmConfig) -> AxResult {
        let kernel = read_image(&config.kernel)?;
        let initrd = config.initrd.as_deref().map(read_image).transpose()?;
        self.load_images(&kernel, initrd.as_deref(), &config.cmdline)
    }

    /// Load in-memory kernel and initrd images and set the vcpu up.
    pub fn load_images(&mut self, kernel: &[u8], initrd: Option<&[u8]>, cmdline: &str) -> AxResult {
        let boot = load_bzimage(&self.memory, kernel, cmdline)?;
        if let Some(initrd) = initrd {
            load_initrd(&self.memory, &boot, initrd)?;
        }
        self.vcpu.setup(boot.entry, boot.boot_params)
    }

    /// Guest RAM.
    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    /// The hypervisor backend.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The bus port I/O exits are dispatched on.
    pub fn io_bus(&self) -> &Bus {
        &self.io_bus
    }

    /// The bus MMIO exits are dispatched on.
    pub fn mmio_bus(&self) -> &Bus {
        &self.mmio_bus
    }

    /// The serial port receive FIFO.
    pub fn serial_input(&self) -> SerialInput {
        self.serial.input()
    }

    /// Run the vcpu until the guest shuts down or stops on an unhandled exit.
    ///
    /// Errors from devices or the hypervisor end the loop and are returned.
    pub fn run(&mut self) -> AxResult<ExitStatus> {
        info!("vcpu {} running", self.vcpu.id());
        loop {
            if self.serial.wants_interrupt_window() {
                self.serial.console()?;
            }

            let exit = match self.vcpu.run() {
                Ok(exit) => exit,
                Err(AxError::WouldBlock) => continue,
                Err(err) => {
                    error!("vcpu {} failed to run: {:?}", self.vcpu.id(), err);
                    return Err(err);
                }
            };

            match exit {
                AxVCpuExitReason::IoRead { port, width, count } => {
                    let mut data = vec![0u8; width.size() * count];
                    self.handle_io(port, false, &mut data, width)?;
                    self.vcpu.set_read_data(&data)?;
                }
                AxVCpuExitReason::IoWrite {
                    port,
                    width,
                    mut data,
                } => self.handle_io(port, true, &mut data, width)?,
                AxVCpuExitReason::MmioRead { addr, width } => {
                    let mut data = vec![0u8; width.size()];
                    self.handle_mmio(addr, false, &mut data)?;
                    self.vcpu.set_read_data(&data)?;
                }
                AxVCpuExitReason::MmioWrite { addr, width, data } => {
                    let mut data = data.to_le_bytes();
                    self.handle_mmio(addr, true, &mut data[..width.size()])?;
                }
                AxVCpuExitReason::IrqWindowOpen => self.serial.console()?,
                AxVCpuExitReason::Nothing => {}
                AxVCpuExitReason::SystemDown => {
                    info!("guest shut down");
                    return Ok(ExitStatus::Shutdown);
                }
                exit => {
                    error!("vcpu {} stopped on unhandled exit {:?}", self.vcpu.id(), exit);
                    return Ok(ExitStatus::Fatal(exit));
                }
            }
        }
    }

    fn handle_io(&mut self, port: Port, is_write: bool, data: &mut [u8], width: AccessWidth) -> AxResult {
        debug!(
            "pio {} {:#x} x{}",
            if is_write { "out" } else { "in" },
            port,
            data.len() / width.size()
        );
        if (SERIAL_PORT_BASE..SERIAL_PORT_BASE + SERIAL_PORT_LEN).contains(&port) {
            self.serial
                .access(port - SERIAL_PORT_BASE, is_write, data, width.size())
        } else {
            self.io_bus
                .dispatch(port as u64, is_write, data, width.size())
        }
    }

    fn handle_mmio(&self, addr: GuestPhysAddr, is_write: bool, data: &mut [u8]) -> AxResult {
        debug!(
            "mmio {} {:#x} ({} bytes)",
            if is_write { "write" } else { "read" },
            addr.as_usize(),
            data.len()
        );
        let size = data.len();
        self.mmio_bus
            .dispatch(addr.as_usize() as u64, is_write, data, size)
    }
}

fn read_image(path: &Path) -> AxResult<Vec<u8>> {
    std::fs::read(path).map_err(|err| {
        error!("failed to read {}: {}", path.display(), err);
        match err.kind() {
            io::ErrorKind::NotFound => AxError::NotFound,
            io::ErrorKind::PermissionDenied => AxError::PermissionDenied,
            _ => AxError::Io,
        }
    })
}
