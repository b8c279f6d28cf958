//! Port-I/O and MMIO bus routing.

use std::collections::BTreeMap;
use std::rc::Rc;

use axerrno::{ax_err, AxError, AxResult};
use memory_addr::AddrRange;

/// An x86 I/O port number.
pub type Port = u16;

/// A range of bus addresses claimed by one device.
pub type BusRange = AddrRange<usize>;

/// The width of a single device access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// Number of bytes moved by one access of this width.
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = AxError;

    fn try_from(size: usize) -> AxResult<Self> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            8 => Ok(Self::Qword),
            _ => ax_err!(InvalidInput, format!("unsupported access width {}", size)),
        }
    }
}

/// A device reachable through a [`Bus`].
///
/// Offsets are relative to the base of the range the device was registered
/// with, so the same device type can be placed anywhere on either bus.
/// Implementations keep their own interior mutability; the bus only ever
/// holds shared references.
pub trait BusDevice {
    /// Handle a read of `data.len()` bytes at `offset`.
    fn read(&self, offset: u64, data: &mut [u8]) -> AxResult;
    /// Handle a write of `data` at `offset`.
    fn write(&self, offset: u64, data: &[u8]) -> AxResult;
}

/// Value returned for every byte of a read that hits no device.
pub const UNMAPPED_READ_BYTE: u8 = 0xff;

/// A set of devices on disjoint address ranges.
pub struct Bus {
    name: &'static str,
    devices: BTreeMap<usize, (BusRange, Rc<dyn BusDevice>)>,
}

impl Bus {
    /// Create an empty bus. `name` only appears in log messages.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            devices: BTreeMap::new(),
        }
    }

    /// Claim `[base, base + len)` for `device`.
    ///
    /// Fails with `AlreadyExists` if the range overlaps any range already on
    /// this bus, and with `InvalidInput` if it is empty or wraps around.
    pub fn register(&mut self, base: u64, len: u64, device: Rc<dyn BusDevice>) -> AxResult {
        let range = (base as usize)
            .checked_add(len as usize)
            .filter(|_| len != 0)
            .and_then(|end| BusRange::try_new(base as usize, end));
        let Some(range) = range else {
            return ax_err!(
                InvalidInput,
                format!("{} bus: invalid range {:#x} + {:#x}", self.name, base, len)
            );
        };

        let prev = self.devices.range(..range.end).next_back();
        if let Some((_, (existing, _))) = prev {
            if existing.overlaps(range) {
                return ax_err!(
                    AlreadyExists,
                    format!(
                        "{} bus: {:#x?} overlaps registered {:#x?}",
                        self.name, range, existing
                    )
                );
            }
        }

        debug!("{} bus: register [{:#x}, {:#x})", self.name, range.start, range.end);
        self.devices.insert(range.start, (range, device));
        Ok(())
    }

    /// Find the device owning `addr`, with the offset of `addr` inside its range.
    fn resolve(&self, addr: u64, len: usize) -> Option<(u64, &Rc<dyn BusDevice>)> {
        let addr = addr as usize;
        let (_, (range, device)) = self.devices.range(..=addr).next_back()?;
        if !range.contains(addr) {
            return None;
        }
        if addr.checked_add(len).map_or(true, |end| end > range.end) {
            warn!(
                "{} bus: access {:#x} + {} straddles the end of {:#x?}",
                self.name, addr, len, range
            );
            return None;
        }
        Some(((addr - range.start) as u64, device))
    }

    /// Read `data.len()` bytes at `addr`. Unmapped bytes read as all-ones.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> AxResult {
        match self.resolve(addr, data.len()) {
            Some((offset, device)) => device.read(offset, data),
            None => {
                debug!("{} bus: unmapped read at {:#x}", self.name, addr);
                data.fill(UNMAPPED_READ_BYTE);
                Ok(())
            }
        }
    }

    /// Write `data` at `addr`. Unmapped writes are dropped.
    pub fn write(&self, addr: u64, data: &[u8]) -> AxResult {
        match self.resolve(addr, data.len()) {
            Some((offset, device)) => device.write(offset, data),
            None => {
                debug!("{} bus: unmapped write at {:#x}: {:x?}", self.name, addr, data);
                Ok(())
            }
        }
    }

    /// Forward an access of `data.len() / size` repetitions of `size` bytes.
    ///
    /// Repetition `i` goes to `addr + i * size`, in ascending order. Errors
    /// returned by a device stop the remaining repetitions.
    pub fn dispatch(&self, addr: u64, is_write: bool, data: &mut [u8], size: usize) -> AxResult {
        if size == 0 || data.len() % size != 0 {
            return ax_err!(
                InvalidInput,
                format!(
                    "{} bus: {} bytes is not a whole number of {}-byte accesses",
                    self.name,
                    data.len(),
                    size
                )
            );
        }

        trace!(
            "{} bus: {} {:#x} size {} count {}",
            self.name,
            if is_write { "write" } else { "read" },
            addr,
            size,
            data.len() / size
        );

        for (i, chunk) in data.chunks_exact_mut(size).enumerate() {
            let at = addr.wrapping_add((i * size) as u64);
            if is_write {
                self.write(at, chunk)?;
            } else {
                self.read(at, chunk)?;
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for Bus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("ranges", &self.devices.values().map(|(r, _)| *r).collect::<Vec<_>>())
            .finish()
    }
}
