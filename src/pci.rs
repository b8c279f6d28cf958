//! PCI configuration space and configuration mechanism #1.

use core::cell::{Cell, RefCell};
use std::rc::Rc;

use axerrno::{ax_err, AxResult};

use crate::bus::BusDevice;

/// First port of the configuration mechanism (`CONFIG_ADDRESS`).
pub const PCI_CONFIG_PORT: u16 = 0xcf8;
/// Ports claimed by the configuration mechanism (`CONFIG_ADDRESS` and `CONFIG_DATA`).
pub const PCI_CONFIG_PORT_LEN: u16 = 8;

/// Number of dword registers in a type 0 configuration space.
pub const NUM_CONFIGURATION_REGISTERS: usize = 64;
/// Size of a configuration space in bytes.
pub const PCI_CONFIG_SPACE_SIZE: usize = NUM_CONFIGURATION_REGISTERS * 4;
/// Device slots on the root bus.
pub const PCI_MAX_SLOTS: usize = 32;

/// Vendor-specific capability ID.
pub const PCI_CAP_ID_VNDR: u8 = 0x09;

const PCI_VENDOR_ID: usize = 0x00;
const PCI_COMMAND: usize = 0x04;
const PCI_STATUS: usize = 0x06;
const PCI_REVISION_ID: usize = 0x08;
const PCI_CLASS_PROG: usize = 0x09;
const PCI_HEADER_TYPE: usize = 0x0e;
const PCI_BAR0: usize = 0x10;
const PCI_SUBSYSTEM_VENDOR_ID: usize = 0x2c;
const PCI_CAPABILITY_LIST: usize = 0x34;
const PCI_INTERRUPT_LINE: usize = 0x3c;

const PCI_COMMAND_MASK: u32 = 0x0407;
const PCI_STATUS_CAP_LIST: u32 = 0x10 << 16;
const PCI_CAPABILITY_START: usize = 0x40;
const PCI_BAR_ADDRESS_MASK: u32 = 0xffff_fff0;

/// A function on the root bus, accessed through configuration cycles.
pub trait PciDevice {
    /// Read `data.len()` bytes of configuration space at `offset`.
    fn config_read(&self, offset: usize, data: &mut [u8]) -> AxResult;
    /// Write configuration space at `offset`.
    fn config_write(&self, offset: usize, data: &[u8]) -> AxResult;
}

/// Identity of a function, written into its header.
#[derive(Clone, Copy, Debug)]
pub struct PciHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

/// A type 0 configuration space: 64 registers, each with a mask of the bits
/// the guest may change.
///
/// BAR0 is a fixed 32-bit memory BAR. Writing all-ones to it makes the next
/// read return the size mask; any other value restores the fixed address.
pub struct PciConfiguration {
    registers: [u32; NUM_CONFIGURATION_REGISTERS],
    writable: [u32; NUM_CONFIGURATION_REGISTERS],
    bar0_size: u32,
    bar0_latch: u32,
    bar0_probing: bool,
    last_capability: Option<usize>,
    next_capability: usize,
}

impl PciConfiguration {
    pub fn new(header: &PciHeader) -> Self {
        let mut config = Self {
            registers: [0; NUM_CONFIGURATION_REGISTERS],
            writable: [0; NUM_CONFIGURATION_REGISTERS],
            bar0_size: 0,
            bar0_latch: 0,
            bar0_probing: false,
            last_capability: None,
            next_capability: PCI_CAPABILITY_START,
        };
        config.set_u16(PCI_VENDOR_ID, header.vendor_id);
        config.set_u16(PCI_VENDOR_ID + 2, header.device_id);
        config.set_u8(PCI_REVISION_ID, header.revision_id);
        config.set_u8(PCI_CLASS_PROG, header.prog_if);
        config.set_u8(PCI_CLASS_PROG + 1, header.subclass);
        config.set_u8(PCI_CLASS_PROG + 2, header.class_code);
        config.set_u8(PCI_HEADER_TYPE, 0);
        config.set_u16(PCI_SUBSYSTEM_VENDOR_ID, header.subsystem_vendor_id);
        config.set_u16(PCI_SUBSYSTEM_VENDOR_ID + 2, header.subsystem_id);
        config.writable[PCI_COMMAND / 4] = PCI_COMMAND_MASK;
        config.writable[PCI_INTERRUPT_LINE / 4] = 0xff;
        config
    }

    /// Place BAR0 at `addr`, decoding `size` bytes of memory space.
    pub fn set_bar0(&mut self, addr: u32, size: u32) -> AxResult {
        if size < 16 || !size.is_power_of_two() || addr & (size - 1) != 0 {
            return ax_err!(
                InvalidInput,
                format!("BAR0 {:#x} of size {:#x} is not naturally aligned", addr, size)
            );
        }
        self.registers[PCI_BAR0 / 4] = addr;
        self.bar0_size = size;
        self.bar0_latch = addr;
        self.bar0_probing = false;
        Ok(())
    }

    /// Address BAR0 decodes.
    pub fn bar0(&self) -> u32 {
        self.registers[PCI_BAR0 / 4] & PCI_BAR_ADDRESS_MASK
    }

    /// Route INTx pin A to interrupt line `irq`.
    pub fn set_interrupt(&mut self, irq: u8) {
        self.set_u8(PCI_INTERRUPT_LINE, irq);
        self.set_u8(PCI_INTERRUPT_LINE + 1, 1);
    }

    /// Append a capability with ID `id` and `body` following its `next` byte.
    ///
    /// Returns the configuration space offset of the new capability.
    pub fn add_capability(&mut self, id: u8, body: &[u8]) -> AxResult<usize> {
        let offset = self.next_capability;
        let end = offset + 2 + body.len();
        if end > PCI_CONFIG_SPACE_SIZE {
            return ax_err!(NoMemory, "PCI capability list full");
        }

        self.set_u8(offset, id);
        self.set_u8(offset + 1, 0);
        for (i, &b) in body.iter().enumerate() {
            self.set_u8(offset + 2 + i, b);
        }
        match self.last_capability {
            None => {
                self.set_u8(PCI_CAPABILITY_LIST, offset as u8);
                self.registers[PCI_STATUS / 4] |= PCI_STATUS_CAP_LIST;
            }
            Some(last) => self.set_u8(last + 1, offset as u8),
        }
        self.last_capability = Some(offset);
        self.next_capability = (end + 3) & !3;
        Ok(offset)
    }

    /// Let the guest change bytes `[offset, offset + len)`.
    pub fn set_writable(&mut self, offset: usize, len: usize) {
        for at in offset..(offset + len).min(PCI_CONFIG_SPACE_SIZE) {
            self.writable[at / 4] |= 0xff << (8 * (at % 4));
        }
    }

    fn reg_value(&self, reg: usize) -> u32 {
        if reg == PCI_BAR0 / 4 && self.bar0_probing {
            !(self.bar0_size - 1) & PCI_BAR_ADDRESS_MASK
        } else {
            self.registers[reg]
        }
    }

    /// Read configuration bytes. Offsets past the end read as all-ones.
    pub fn read(&self, offset: usize, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            let at = offset + i;
            *byte = if at < PCI_CONFIG_SPACE_SIZE {
                (self.reg_value(at / 4) >> (8 * (at % 4))) as u8
            } else {
                0xff
            };
        }
    }

    /// Write configuration bytes, keeping read-only bits.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let at = offset + i;
            if at >= PCI_CONFIG_SPACE_SIZE {
                break;
            }
            let (reg, shift) = (at / 4, 8 * (at % 4));
            if reg == PCI_BAR0 / 4 {
                self.write_bar0_byte(shift, byte);
                continue;
            }
            let mask = self.writable[reg] & (0xff << shift);
            self.registers[reg] = (self.registers[reg] & !mask) | (((byte as u32) << shift) & mask);
        }
    }

    // The address itself never moves; only the size probe is honoured.
    fn write_bar0_byte(&mut self, shift: usize, byte: u8) {
        self.bar0_latch = (self.bar0_latch & !(0xff << shift)) | ((byte as u32) << shift);
        self.bar0_probing =
            self.bar0_size != 0 && self.bar0_latch & PCI_BAR_ADDRESS_MASK == PCI_BAR_ADDRESS_MASK;
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.read(offset, &mut b);
        b[0]
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read(offset, &mut b);
        u32::from_le_bytes(b)
    }

    fn set_u8(&mut self, offset: usize, val: u8) {
        let (reg, shift) = (offset / 4, 8 * (offset % 4));
        self.registers[reg] = (self.registers[reg] & !(0xff << shift)) | ((val as u32) << shift);
    }

    fn set_u16(&mut self, offset: usize, val: u16) {
        self.set_u8(offset, val as u8);
        self.set_u8(offset + 1, (val >> 8) as u8);
    }
}

/// The i440FX-style host bridge in slot 0.
struct HostBridge {
    config: RefCell<PciConfiguration>,
}

impl HostBridge {
    fn new() -> Self {
        Self {
            config: RefCell::new(PciConfiguration::new(&PciHeader {
                vendor_id: 0x8086,
                device_id: 0x1237,
                revision_id: 0,
                class_code: 0x06,
                subclass: 0x00,
                prog_if: 0,
                subsystem_vendor_id: 0,
                subsystem_id: 0,
            })),
        }
    }
}

impl PciDevice for HostBridge {
    fn config_read(&self, offset: usize, data: &mut [u8]) -> AxResult {
        self.config.borrow().read(offset, data);
        Ok(())
    }

    fn config_write(&self, offset: usize, data: &[u8]) -> AxResult {
        self.config.borrow_mut().write(offset, data);
        Ok(())
    }
}

/// Bus 0 behind configuration mechanism #1, claiming ports `0xcf8..0xd00`.
///
/// Only function 0 of each slot exists; every other function, and every
/// other bus, reads as all-ones.
pub struct PciRoot {
    config_address: Cell<u32>,
    slots: RefCell<Vec<Option<Rc<dyn PciDevice>>>>,
}

impl Default for PciRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl PciRoot {
    pub fn new() -> Self {
        let mut slots: Vec<Option<Rc<dyn PciDevice>>> = vec![None; PCI_MAX_SLOTS];
        slots[0] = Some(Rc::new(HostBridge::new()));
        Self {
            config_address: Cell::new(0),
            slots: RefCell::new(slots),
        }
    }

    /// The slot the next [`add_device`](Self::add_device) will use.
    pub fn free_slot(&self) -> Option<u8> {
        self.slots
            .borrow()
            .iter()
            .position(Option::is_none)
            .map(|slot| slot as u8)
    }

    /// Plug `device` into the first free slot and return the slot number.
    pub fn add_device(&self, device: Rc<dyn PciDevice>) -> AxResult<u8> {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.iter().position(Option::is_none) else {
            return ax_err!(NoMemory, "no free PCI slot");
        };
        slots[slot] = Some(device);
        info!("pci: device in slot {}", slot);
        Ok(slot as u8)
    }

    /// The device selected by `CONFIG_ADDRESS`, with the register offset.
    fn selected(&self) -> Option<(Rc<dyn PciDevice>, usize)> {
        let addr = self.config_address.get();
        let enabled = addr & 0x8000_0000 != 0;
        let bus = (addr >> 16) & 0xff;
        let slot = ((addr >> 11) & 0x1f) as usize;
        let function = (addr >> 8) & 0x7;
        if !enabled || bus != 0 || function != 0 {
            return None;
        }
        let device = self.slots.borrow()[slot].clone()?;
        Some((device, (addr & 0xfc) as usize))
    }
}

impl BusDevice for PciRoot {
    fn read(&self, offset: u64, data: &mut [u8]) -> AxResult {
        let offset = offset as usize;
        if offset < 4 {
            let bytes = self.config_address.get().to_le_bytes();
            let end = (offset + data.len()).min(4);
            let (head, tail) = data.split_at_mut(end - offset);
            head.copy_from_slice(&bytes[offset..end]);
            tail.fill(0xff);
            return Ok(());
        }
        match self.selected() {
            Some((device, reg)) => device.config_read(reg + offset - 4, data),
            None => {
                data.fill(0xff);
                Ok(())
            }
        }
    }

    fn write(&self, offset: u64, data: &[u8]) -> AxResult {
        let offset = offset as usize;
        if offset < 4 {
            let mut bytes = self.config_address.get().to_le_bytes();
            let end = (offset + data.len()).min(4);
            bytes[offset..end].copy_from_slice(&data[..end - offset]);
            self.config_address.set(u32::from_le_bytes(bytes));
            return Ok(());
        }
        match self.selected() {
            Some((device, reg)) => device.config_write(reg + offset - 4, data),
            None => Ok(()),
        }
    }
}
