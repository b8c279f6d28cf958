//! The virtio 1.x PCI transport.
//!
//! All transport registers live in BAR0:
//!
//! | offset  | region                        |
//! |---------|-------------------------------|
//! | `0x000` | common configuration (`0x38`) |
//! | `0x038` | notify (one shared `u16`)     |
//! | `0x03c` | ISR status                    |
//! | `0x040` | device-specific configuration |

use core::cell::RefCell;
use std::sync::Arc;

use axerrno::{ax_err, AxResult};

use super::queue::{QueueConfig, Virtqueue, VIRTIO_MSI_NO_VECTOR};
use super::{
    status, VirtioDevice, VIRTIO_F_VERSION_1, VIRTIO_ISR_CONFIG, VIRTIO_ISR_QUEUE,
    VIRTIO_PCI_DEVICE_ID_BASE, VIRTIO_PCI_VENDOR_ID, VIRTIO_RING_F_EVENT_IDX,
    VIRTIO_RING_F_INDIRECT_DESC,
};
use crate::bus::BusDevice;
use crate::hal::InterruptSink;
use crate::memory::GuestMemory;
use crate::pci::{PciConfiguration, PciDevice, PciHeader, PCI_CAP_ID_VNDR};

/// Size of the memory window BAR0 decodes.
pub const VIRTIO_PCI_BAR_SIZE: u32 = 0x1000;

const COMMON_CFG_OFFSET: u64 = 0x000;
const COMMON_CFG_LEN: usize = 0x38;
const NOTIFY_OFFSET: u64 = 0x038;
const NOTIFY_LEN: u64 = 2;
const ISR_OFFSET: u64 = 0x03c;
const ISR_LEN: u64 = 1;
const DEVICE_CFG_OFFSET: u64 = 0x040;

// Capability `cfg_type` values.
const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;
const VIRTIO_PCI_CAP_PCI_CFG: u8 = 5;

// Common configuration field offsets.
const DFSELECT: usize = 0x00;
const DF: usize = 0x04;
const GFSELECT: usize = 0x08;
const GF: usize = 0x0c;
const MSIX: usize = 0x10;
const NUMQ: usize = 0x12;
const STATUS: usize = 0x14;
const CFGGENERATION: usize = 0x15;
const Q_SELECT: usize = 0x16;
const Q_SIZE: usize = 0x18;
const Q_MSIX: usize = 0x1a;
const Q_ENABLE: usize = 0x1c;
const Q_NOFF: usize = 0x1e;
const Q_DESC: usize = 0x20;
const Q_AVAIL: usize = 0x28;
const Q_USED: usize = 0x30;

/// `(bit, predecessor)`: a status bit may only be set once its predecessor is.
/// Checked in this order, so a refused bit also refuses its successors.
const STATUS_ORDER: [(u8, u8); 3] = [
    (status::DRIVER, status::ACKNOWLEDGE),
    (status::FEATURES_OK, status::DRIVER),
    (status::DRIVER_OK, status::FEATURES_OK),
];

/// `(offset, width)` of every common configuration field.
const COMMON_FIELDS: [(usize, usize); 16] = [
    (DFSELECT, 4),
    (DF, 4),
    (GFSELECT, 4),
    (GF, 4),
    (MSIX, 2),
    (NUMQ, 2),
    (STATUS, 1),
    (CFGGENERATION, 1),
    (Q_SELECT, 2),
    (Q_SIZE, 2),
    (Q_MSIX, 2),
    (Q_ENABLE, 2),
    (Q_NOFF, 2),
    (Q_DESC, 8),
    (Q_AVAIL, 8),
    (Q_USED, 8),
];

/// Length of `struct virtio_pci_cap`.
const CAP_LEN: u8 = 16;
/// Offsets inside `struct virtio_pci_cfg_cap`.
const PCI_CFG_BAR: usize = 4;
const PCI_CFG_OFFSET: usize = 8;
const PCI_CFG_LENGTH: usize = 12;
const PCI_CFG_DATA: usize = 16;

/// Build the body (everything after `cap_vndr`/`cap_next`) of a virtio capability.
fn virtio_cap(cfg_type: u8, offset: u64, length: u64, extra: &[u8]) -> Vec<u8> {
    let mut body = vec![CAP_LEN + extra.len() as u8, cfg_type, 0, 0, 0, 0];
    body.extend_from_slice(&(offset as u32).to_le_bytes());
    body.extend_from_slice(&(length as u32).to_le_bytes());
    body.extend_from_slice(extra);
    body
}

struct VirtioPciState {
    device: Box<dyn VirtioDevice>,
    pci: PciConfiguration,
    pci_cfg_cap: usize,

    device_feature: u64,
    device_feature_select: u32,
    guest_feature: u64,
    guest_feature_select: u32,
    msix_config: u16,
    status: u8,
    config_generation: u8,

    queue_select: u16,
    queues: Vec<QueueConfig>,
    active: Vec<Option<Virtqueue>>,

    isr: u8,
    irq_level: bool,
}

impl VirtioPciState {
    fn feature_window(features: u64, select: u32) -> u32 {
        match select {
            0 => features as u32,
            1 => (features >> 32) as u32,
            _ => 0,
        }
    }

    fn selected_queue(&self) -> Option<&QueueConfig> {
        self.queues.get(self.queue_select as usize)
    }

    /// A snapshot of the common configuration structure as the guest sees it.
    fn common_cfg(&self) -> [u8; COMMON_CFG_LEN] {
        let mut cfg = [0u8; COMMON_CFG_LEN];
        let mut put = |offset: usize, bytes: &[u8]| {
            cfg[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        put(DFSELECT, &self.device_feature_select.to_le_bytes());
        put(
            DF,
            &Self::feature_window(self.device_feature, self.device_feature_select).to_le_bytes(),
        );
        put(GFSELECT, &self.guest_feature_select.to_le_bytes());
        put(
            GF,
            &Self::feature_window(self.guest_feature, self.guest_feature_select).to_le_bytes(),
        );
        put(MSIX, &self.msix_config.to_le_bytes());
        put(NUMQ, &(self.queues.len() as u16).to_le_bytes());
        put(STATUS, &[self.status]);
        put(CFGGENERATION, &[self.config_generation]);
        put(Q_SELECT, &self.queue_select.to_le_bytes());
        // an out-of-range select reads as an absent, zero-sized queue
        if let Some(queue) = self.selected_queue() {
            put(Q_SIZE, &queue.size.to_le_bytes());
            put(Q_MSIX, &queue.msix_vector.to_le_bytes());
            put(Q_ENABLE, &(queue.enabled as u16).to_le_bytes());
            put(Q_NOFF, &0u16.to_le_bytes());
            put(Q_DESC, &queue.desc_table.to_le_bytes());
            put(Q_AVAIL, &queue.avail_ring.to_le_bytes());
            put(Q_USED, &queue.used_ring.to_le_bytes());
        }
        cfg
    }

    fn write_common(&mut self, offset: usize, data: &[u8], mem: &GuestMemory) -> AxResult {
        let field = COMMON_FIELDS
            .iter()
            .find(|&&(start, width)| offset >= start && offset + data.len() <= start + width);
        let Some(&(start, width)) = field else {
            warn!(
                "virtio-pci: common config write at {:#x} of {} bytes straddles fields",
                offset,
                data.len()
            );
            return Ok(());
        };

        // merge partial writes (e.g. the two halves of a queue address)
        let current = self.common_cfg();
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&current[start..start + width]);
        let at = offset - start;
        bytes[at..at + data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(bytes);
        trace!("virtio-pci: common[{:#x}] <- {:#x}", start, value);

        match start {
            DFSELECT => self.device_feature_select = value as u32,
            GFSELECT => self.guest_feature_select = value as u32,
            GF => self.accept_features(value as u32),
            MSIX => self.msix_config = value as u16,
            STATUS => self.write_status(value as u8, mem)?,
            Q_SELECT => self.queue_select = value as u16,
            Q_ENABLE if value != 0 => self.enable_queue(mem),
            Q_ENABLE => self.disable_queue(),
            Q_SIZE | Q_MSIX | Q_DESC | Q_AVAIL | Q_USED => self.write_queue_field(start, value),
            _ => debug!("virtio-pci: write to read-only common[{:#x}]", start),
        }
        Ok(())
    }

    fn accept_features(&mut self, value: u32) {
        if self.status & status::FEATURES_OK != 0 {
            warn!("virtio-pci: feature write after FEATURES_OK ignored");
            return;
        }
        let wanted = match self.guest_feature_select {
            0 => value as u64,
            1 => (value as u64) << 32,
            _ => return,
        };
        let unoffered = wanted & !self.device_feature;
        if unoffered != 0 {
            warn!("virtio-pci: driver accepted unoffered features {:#x}", unoffered);
        }
        self.guest_feature |= wanted & self.device_feature;
    }

    fn write_status(&mut self, value: u8, mem: &GuestMemory) -> AxResult {
        if value == 0 {
            self.reset();
            return Ok(());
        }

        let old = self.status & !status::DEVICE_NEEDS_RESET;
        let mut new = value & !status::DEVICE_NEEDS_RESET;
        if new & old != old {
            warn!(
                "virtio-pci: status {:#x} -> {:#x} clears bits, ignored",
                self.status, value
            );
            return Ok(());
        }
        for (bit, needs) in STATUS_ORDER {
            if new & bit == 0 || old & bit != 0 {
                continue;
            }
            if new & needs == 0 {
                warn!(
                    "virtio-pci: status bit {:#x} set before {:#x}, refused",
                    bit, needs
                );
                new &= !bit;
            } else if bit == status::FEATURES_OK && self.guest_feature & VIRTIO_F_VERSION_1 == 0 {
                warn!("virtio-pci: driver did not accept VERSION_1, refusing FEATURES_OK");
                new &= !bit;
            }
        }
        self.status = new | (self.status & status::DEVICE_NEEDS_RESET);
        debug!("virtio-pci: status {:#x}", self.status);

        if new & status::DRIVER_OK != 0 && old & status::DRIVER_OK == 0 {
            info!(
                "virtio-pci: device type {} live, features {:#x}",
                self.device.device_type(),
                self.guest_feature
            );
            if let Err(e) = self.device.activate(self.guest_feature) {
                warn!("virtio-pci: device activation failed: {:?}", e);
                self.needs_reset();
                return Ok(());
            }
            // buffers made available before DRIVER_OK
            for index in 0..self.queues.len() as u16 {
                self.process_queue(index, mem)?;
            }
        }
        Ok(())
    }

    fn needs_reset(&mut self) {
        self.status |= status::DEVICE_NEEDS_RESET;
        self.isr |= VIRTIO_ISR_CONFIG;
    }

    fn reset(&mut self) {
        debug!("virtio-pci: reset");
        self.device.reset();
        self.device_feature_select = 0;
        self.guest_feature = 0;
        self.guest_feature_select = 0;
        self.msix_config = VIRTIO_MSI_NO_VECTOR;
        self.status = 0;
        self.queue_select = 0;
        self.queues.iter_mut().for_each(QueueConfig::reset);
        self.active.iter_mut().for_each(|queue| *queue = None);
        self.isr = 0;
    }

    fn write_queue_field(&mut self, field: usize, value: u64) {
        let index = self.queue_select;
        let Some(queue) = self.queues.get_mut(index as usize) else {
            debug!("virtio-pci: write to absent queue {}", index);
            return;
        };
        if field == Q_MSIX {
            queue.msix_vector = value as u16;
            return;
        }
        if queue.enabled {
            warn!("virtio-pci: queue {} is enabled, config write ignored", index);
            return;
        }
        match field {
            Q_SIZE => queue.size = value as u16,
            Q_DESC => queue.desc_table = value,
            Q_AVAIL => queue.avail_ring = value,
            Q_USED => queue.used_ring = value,
            _ => {}
        }
    }

    fn enable_queue(&mut self, mem: &GuestMemory) {
        let index = self.queue_select;
        let Some(config) = self.queues.get_mut(index as usize) else {
            debug!("virtio-pci: enable of absent queue {}", index);
            return;
        };
        if config.enabled {
            return;
        }
        let event_idx = self.guest_feature & VIRTIO_RING_F_EVENT_IDX != 0;
        match Virtqueue::activate(index, config, mem, event_idx) {
            Ok(queue) => {
                config.enabled = true;
                self.active[index as usize] = Some(queue);
            }
            Err(e) => {
                warn!("virtio-pci: queue {} rejected: {:?}", index, e);
                self.needs_reset();
            }
        }
    }

    fn disable_queue(&mut self) {
        let index = self.queue_select as usize;
        if let Some(config) = self.queues.get_mut(index) {
            debug!("virtio-pci: queue {} disabled", index);
            config.enabled = false;
            self.active[index] = None;
        }
    }

    fn process_queue(&mut self, index: u16, mem: &GuestMemory) -> AxResult {
        let Self {
            device,
            active,
            isr,
            ..
        } = self;
        let Some(Some(queue)) = active.get_mut(index as usize) else {
            debug!("virtio-pci: notify for inactive queue {}", index);
            return Ok(());
        };
        if queue.process_avail(mem, |chain| device.process_chain(index, chain, mem))? {
            *isr |= VIRTIO_ISR_QUEUE;
        }
        Ok(())
    }

    fn notify(&mut self, index: u16, mem: &GuestMemory) -> AxResult {
        trace!("virtio-pci: notify queue {}", index);
        if self.status & status::DRIVER_OK == 0 {
            debug!("virtio-pci: notify before DRIVER_OK, deferred");
            return Ok(());
        }
        self.process_queue(index, mem)
    }
}

/// A virtio device exposed to the guest as a PCI function with its
/// transport registers in BAR0.
///
/// Registered twice: on the PCI root for configuration cycles and on the
/// MMIO bus for the BAR0 window.
pub struct VirtioPciDevice {
    state: RefCell<VirtioPciState>,
    mem: Arc<GuestMemory>,
    interrupt: Arc<dyn InterruptSink>,
    irq: u32,
}

impl VirtioPciDevice {
    /// Wrap `device` in a transport decoding BAR0 at `bar0` and raising `irq`.
    pub fn new(
        device: Box<dyn VirtioDevice>,
        mem: Arc<GuestMemory>,
        interrupt: Arc<dyn InterruptSink>,
        irq: u8,
        bar0: u32,
    ) -> AxResult<Self> {
        let device_type = device.device_type();
        let config_len = device.config_len() as u64;
        if DEVICE_CFG_OFFSET + config_len > VIRTIO_PCI_BAR_SIZE as u64 {
            return ax_err!(
                InvalidInput,
                format!("device config of {} bytes does not fit BAR0", config_len)
            );
        }

        let (class_code, subclass) = match device_type {
            1 => (0x02, 0x00),
            2 => (0x01, 0x80),
            _ => (0xff, 0x00),
        };
        let mut pci = PciConfiguration::new(&PciHeader {
            vendor_id: VIRTIO_PCI_VENDOR_ID,
            device_id: VIRTIO_PCI_DEVICE_ID_BASE + device_type,
            revision_id: 1,
            class_code,
            subclass,
            prog_if: 0,
            subsystem_vendor_id: VIRTIO_PCI_VENDOR_ID,
            subsystem_id: 0x40,
        });
        pci.set_bar0(bar0, VIRTIO_PCI_BAR_SIZE)?;
        pci.set_interrupt(irq);

        let common = virtio_cap(
            VIRTIO_PCI_CAP_COMMON_CFG,
            COMMON_CFG_OFFSET,
            COMMON_CFG_LEN as u64,
            &[],
        );
        // notify_off_multiplier 0: every queue shares one notify address
        let notify = virtio_cap(
            VIRTIO_PCI_CAP_NOTIFY_CFG,
            NOTIFY_OFFSET,
            NOTIFY_LEN,
            &0u32.to_le_bytes(),
        );
        let isr = virtio_cap(VIRTIO_PCI_CAP_ISR_CFG, ISR_OFFSET, ISR_LEN, &[]);
        let dev = virtio_cap(VIRTIO_PCI_CAP_DEVICE_CFG, DEVICE_CFG_OFFSET, config_len, &[]);
        let pci_cfg = virtio_cap(VIRTIO_PCI_CAP_PCI_CFG, 0, 0, &[0; 4]);
        for body in [common, notify, isr, dev] {
            pci.add_capability(PCI_CAP_ID_VNDR, &body)?;
        }
        let pci_cfg_cap = pci.add_capability(PCI_CAP_ID_VNDR, &pci_cfg)?;
        pci.set_writable(pci_cfg_cap + PCI_CFG_BAR, 1);
        pci.set_writable(pci_cfg_cap + PCI_CFG_OFFSET, 8);

        let device_feature =
            (device.features() | VIRTIO_F_VERSION_1 | VIRTIO_RING_F_EVENT_IDX)
                & !VIRTIO_RING_F_INDIRECT_DESC;
        let queues: Vec<_> = (0..device.num_queues())
            .map(|q| QueueConfig::new(device.queue_max_size(q)))
            .collect();
        let active = queues.iter().map(|_| None).collect();

        info!(
            "virtio-pci: type {} with {} queues at {:#x}, irq {}",
            device_type,
            queues.len(),
            bar0,
            irq
        );
        Ok(Self {
            state: RefCell::new(VirtioPciState {
                device,
                pci,
                pci_cfg_cap,
                device_feature,
                device_feature_select: 0,
                guest_feature: 0,
                guest_feature_select: 0,
                msix_config: VIRTIO_MSI_NO_VECTOR,
                status: 0,
                config_generation: 0,
                queue_select: 0,
                queues,
                active,
                isr: 0,
                irq_level: false,
            }),
            mem,
            interrupt,
            irq: irq as u32,
        })
    }

    /// Guest physical address of BAR0.
    pub fn bar0(&self) -> u32 {
        self.state.borrow().pci.bar0()
    }

    /// Current device status byte.
    pub fn status(&self) -> u8 {
        self.state.borrow().status
    }

    /// Features the driver has accepted so far.
    pub fn driver_features(&self) -> u64 {
        self.state.borrow().guest_feature
    }

    /// Tell the driver the device-specific configuration changed.
    pub fn notify_config_change(&self) -> AxResult {
        let mut state = self.state.borrow_mut();
        state.config_generation = state.config_generation.wrapping_add(1);
        state.isr |= VIRTIO_ISR_CONFIG;
        self.sync_irq(&mut state)
    }

    /// Drive the INTx line to match the ISR.
    fn sync_irq(&self, state: &mut VirtioPciState) -> AxResult {
        let level = state.isr != 0;
        if level != state.irq_level {
            state.irq_level = level;
            self.interrupt.set_irq_line(self.irq, level)?;
        }
        Ok(())
    }

    fn bar_read(&self, offset: u64, data: &mut [u8]) -> AxResult {
        let mut state = self.state.borrow_mut();
        let end = offset + data.len() as u64;
        data.fill(0);
        if end <= COMMON_CFG_LEN as u64 {
            let cfg = state.common_cfg();
            data.copy_from_slice(&cfg[offset as usize..end as usize]);
        } else if offset == ISR_OFFSET {
            data[0] = state.isr;
            state.isr = 0;
            trace!("virtio-pci: ISR read {:#x}", data[0]);
        } else if offset >= DEVICE_CFG_OFFSET {
            let config_len = state.device.config_len() as u64;
            if end <= DEVICE_CFG_OFFSET + config_len {
                state.device.read_config(offset - DEVICE_CFG_OFFSET, data);
            }
        }
        self.sync_irq(&mut state)
    }

    fn bar_write(&self, offset: u64, data: &[u8]) -> AxResult {
        let mut state = self.state.borrow_mut();
        let end = offset + data.len() as u64;
        if end <= COMMON_CFG_LEN as u64 {
            state.write_common(offset as usize, data, &self.mem)?;
        } else if offset == NOTIFY_OFFSET && end <= NOTIFY_OFFSET + NOTIFY_LEN {
            let mut index = [0u8; 2];
            index[..data.len()].copy_from_slice(data);
            state.notify(u16::from_le_bytes(index), &self.mem)?;
        } else if offset >= DEVICE_CFG_OFFSET {
            let config_len = state.device.config_len() as u64;
            if end <= DEVICE_CFG_OFFSET + config_len {
                state.device.write_config(offset - DEVICE_CFG_OFFSET, data);
            }
        } else {
            debug!("virtio-pci: write to reserved BAR0 offset {:#x}", offset);
        }
        self.sync_irq(&mut state)
    }

    /// The BAR0 access requested through the PCI-config-access capability, if
    /// `[offset, offset + len)` hits its data window.
    fn pci_cfg_access(&self, offset: usize, len: usize) -> Option<(u64, usize)> {
        let state = self.state.borrow();
        let window = state.pci_cfg_cap + PCI_CFG_DATA;
        if offset != window || len == 0 || len > 4 {
            return None;
        }
        let bar = state.pci.get_u8(state.pci_cfg_cap + PCI_CFG_BAR);
        let bar_offset = state.pci.get_u32(state.pci_cfg_cap + PCI_CFG_OFFSET) as u64;
        let length = state.pci.get_u32(state.pci_cfg_cap + PCI_CFG_LENGTH) as usize;
        if bar != 0 || !matches!(length, 1 | 2 | 4) || length > len {
            debug!("virtio-pci: unusable pci_cfg access bar {} len {}", bar, length);
            return Some((0, 0));
        }
        Some((bar_offset, length))
    }
}

impl BusDevice for VirtioPciDevice {
    fn read(&self, offset: u64, data: &mut [u8]) -> AxResult {
        self.bar_read(offset, data)
    }

    fn write(&self, offset: u64, data: &[u8]) -> AxResult {
        self.bar_write(offset, data)
    }
}

impl PciDevice for VirtioPciDevice {
    fn config_read(&self, offset: usize, data: &mut [u8]) -> AxResult {
        match self.pci_cfg_access(offset, data.len()) {
            Some((_, 0)) => {
                data.fill(0);
                Ok(())
            }
            Some((bar_offset, length)) => {
                data.fill(0);
                self.bar_read(bar_offset, &mut data[..length])
            }
            None => {
                self.state.borrow().pci.read(offset, data);
                Ok(())
            }
        }
    }

    fn config_write(&self, offset: usize, data: &[u8]) -> AxResult {
        match self.pci_cfg_access(offset, data.len()) {
            Some((_, 0)) => Ok(()),
            Some((bar_offset, length)) => self.bar_write(bar_offset, &data[..length]),
            None => {
                self.state.borrow_mut().pci.write(offset, data);
                Ok(())
            }
        }
    }
}
