//! Split virtqueues: driver-side configuration and the descriptor engine.

use core::num::Wrapping;
use core::sync::atomic::{fence, Ordering};

use axerrno::{ax_err, AxError, AxResult};

use crate::memory::{GuestMemory, GuestPhysAddr};

/// The buffer continues via the `next` field.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// The buffer is device write-only.
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
/// The buffer holds an indirect descriptor table.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;
/// Driver asks not to be interrupted when buffers are used.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// `queue_msix_vector` value meaning "no vector".
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

const DESC_SIZE: usize = 16;
const USED_ELEM_SIZE: usize = 8;
const RING_HEADER_SIZE: usize = 4;

/// Queue registers as programmed by the driver through the common config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Largest size the device accepts.
    pub max_size: u16,
    /// Size chosen by the driver.
    pub size: u16,
    /// `queue_enable` as last written.
    pub enabled: bool,
    /// `queue_msix_vector`; stored but unused without MSI-X.
    pub msix_vector: u16,
    /// Guest physical address of the descriptor table.
    pub desc_table: u64,
    /// Guest physical address of the available (driver) ring.
    pub avail_ring: u64,
    /// Guest physical address of the used (device) ring.
    pub used_ring: u64,
}

impl QueueConfig {
    /// A disabled queue offering `max_size` entries.
    pub const fn new(max_size: u16) -> Self {
        Self {
            max_size,
            size: max_size,
            enabled: false,
            msix_vector: VIRTIO_MSI_NO_VECTOR,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
        }
    }

    /// Back to the power-on register values.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_size);
    }
}

/// One entry of the descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// Guest physical address of the buffer.
    pub addr: GuestPhysAddr,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// `VIRTQ_DESC_F_*` flags.
    pub flags: u16,
    /// Index of the next descriptor when `VIRTQ_DESC_F_NEXT` is set.
    pub next: u16,
}

impl Descriptor {
    /// The device may write this buffer.
    pub const fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    /// The chain continues after this descriptor.
    pub const fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

/// A fully walked and validated descriptor chain.
///
/// Every buffer in it lies inside guest RAM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorChain {
    head: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    /// Index of the first descriptor, which identifies the request.
    pub const fn head(&self) -> u16 {
        self.head
    }

    /// All descriptors in chain order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Driver-to-device buffers.
    pub fn readable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| !d.is_write_only())
    }

    /// Device-to-driver buffers.
    pub fn writable(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.is_write_only())
    }
}

/// Runtime state of an enabled queue.
///
/// Ring contents are re-read from guest memory on every call; only the
/// device-private cursors live here.
#[derive(Debug)]
pub struct Virtqueue {
    index: u16,
    size: u16,
    desc_table: GuestPhysAddr,
    avail_ring: GuestPhysAddr,
    used_ring: GuestPhysAddr,
    event_idx: bool,
    last_avail_idx: Wrapping<u16>,
    next_used: Wrapping<u16>,
}

/// Whether the driver asked to be notified when `used.idx` moves from
/// `old` to `new`, given its `used_event`.
fn vring_need_event(event: Wrapping<u16>, new: Wrapping<u16>, old: Wrapping<u16>) -> bool {
    new - event - Wrapping(1) < new - old
}

impl Virtqueue {
    /// Validate `config` against guest RAM and start a queue on it.
    ///
    /// Fails with `InvalidInput` for a bad size or misaligned ring, and with
    /// `BadAddress` if any ring is not fully inside guest RAM.
    pub fn activate(
        index: u16,
        config: &QueueConfig,
        mem: &GuestMemory,
        event_idx: bool,
    ) -> AxResult<Self> {
        let size = config.size;
        if size == 0 || !size.is_power_of_two() || size > config.max_size {
            return ax_err!(
                InvalidInput,
                format!(
                    "queue {}: size {} (max {}) is not a power of two in range",
                    index, size, config.max_size
                )
            );
        }
        if config.desc_table % 16 != 0 || config.avail_ring % 2 != 0 || config.used_ring % 4 != 0
        {
            return ax_err!(InvalidInput, format!("queue {}: misaligned rings", index));
        }

        let n = size as usize;
        let desc_table = GuestPhysAddr::from(config.desc_table as usize);
        let avail_ring = GuestPhysAddr::from(config.avail_ring as usize);
        let used_ring = GuestPhysAddr::from(config.used_ring as usize);
        mem.translate(desc_table, DESC_SIZE * n)?;
        mem.translate(avail_ring, RING_HEADER_SIZE + 2 * n + 2)?;
        mem.translate(used_ring, RING_HEADER_SIZE + USED_ELEM_SIZE * n + 2)?;

        debug!(
            "queue {}: enabled, size {}, desc {:#x} avail {:#x} used {:#x}",
            index, size, config.desc_table, config.avail_ring, config.used_ring
        );
        Ok(Self {
            index,
            size,
            desc_table,
            avail_ring,
            used_ring,
            event_idx,
            last_avail_idx: Wrapping(0),
            next_used: Wrapping(0),
        })
    }

    /// Number of entries in each ring.
    pub const fn size(&self) -> u16 {
        self.size
    }

    /// How many available entries have been consumed, modulo 2^16.
    pub const fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx.0
    }

    fn avail_idx_addr(&self) -> GuestPhysAddr {
        self.avail_ring + 2
    }

    fn avail_entry_addr(&self, slot: u16) -> GuestPhysAddr {
        self.avail_ring + RING_HEADER_SIZE + 2 * slot as usize
    }

    fn used_event_addr(&self) -> GuestPhysAddr {
        self.avail_entry_addr(self.size)
    }

    fn used_idx_addr(&self) -> GuestPhysAddr {
        self.used_ring + 2
    }

    fn used_elem_addr(&self, slot: u16) -> GuestPhysAddr {
        self.used_ring + RING_HEADER_SIZE + USED_ELEM_SIZE * slot as usize
    }

    fn avail_event_addr(&self) -> GuestPhysAddr {
        self.used_elem_addr(self.size)
    }

    fn read_descriptor(&self, mem: &GuestMemory, index: u16) -> AxResult<Descriptor> {
        let base = self.desc_table + DESC_SIZE * index as usize;
        Ok(Descriptor {
            addr: GuestPhysAddr::from(mem.read_u64(base)? as usize),
            len: mem.read_u32(base + 8)?,
            flags: mem.read_u16(base + 12)?,
            next: mem.read_u16(base + 14)?,
        })
    }

    /// Walk the chain starting at `head`.
    ///
    /// The walk takes at most `size` steps. A chain that is longer, loops,
    /// leaves the table or uses indirect descriptors fails with
    /// `InvalidData`. A buffer outside guest RAM fails with `BadAddress`.
    pub fn read_chain(&self, mem: &GuestMemory, head: u16) -> AxResult<DescriptorChain> {
        if head >= self.size {
            return ax_err!(
                InvalidData,
                format!("queue {}: head {} out of range", self.index, head)
            );
        }

        let mut descriptors = Vec::new();
        let mut index = head;
        loop {
            if descriptors.len() == self.size as usize {
                return ax_err!(
                    InvalidData,
                    format!(
                        "queue {}: chain at {} exceeds {} descriptors",
                        self.index, head, self.size
                    )
                );
            }
            let desc = self.read_descriptor(mem, index)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return ax_err!(
                    InvalidData,
                    format!("queue {}: indirect descriptor {}", self.index, index)
                );
            }
            mem.translate(desc.addr, desc.len as usize)?;
            descriptors.push(desc);

            if !desc.has_next() {
                break;
            }
            if desc.next >= self.size {
                return ax_err!(
                    InvalidData,
                    format!(
                        "queue {}: descriptor {} links to {}",
                        self.index, index, desc.next
                    )
                );
            }
            index = desc.next;
        }
        Ok(DescriptorChain { head, descriptors })
    }

    fn push_used(&mut self, mem: &GuestMemory, head: u16, written: u32) -> AxResult {
        let elem = self.used_elem_addr(self.next_used.0 % self.size);
        mem.write_u32(elem, head as u32)?;
        mem.write_u32(elem + 4, written)?;
        self.next_used += 1;
        Ok(())
    }

    /// Consume every entry the driver has made available.
    ///
    /// Each well-formed chain goes to `handler`, which returns the number of
    /// bytes it wrote; completions are published in consumption order.
    /// Malformed chains are skipped without a completion.
    ///
    /// Returns whether the driver wants an interrupt for this round.
    pub fn process_avail<F>(&mut self, mem: &GuestMemory, mut handler: F) -> AxResult<bool>
    where
        F: FnMut(&DescriptorChain) -> AxResult<u32>,
    {
        let avail_idx = Wrapping(mem.read_u16(self.avail_idx_addr())?);
        fence(Ordering::Acquire);

        let pending = (avail_idx - self.last_avail_idx).0;
        if pending > self.size {
            warn!(
                "queue {}: avail.idx {} is {} entries ahead of {}, ignoring",
                self.index, avail_idx, pending, self.last_avail_idx
            );
            return Ok(false);
        }

        let old_used = self.next_used;
        while self.last_avail_idx != avail_idx {
            let slot = self.last_avail_idx.0 % self.size;
            let head = mem.read_u16(self.avail_entry_addr(slot))?;
            self.last_avail_idx += 1;

            let written = match self.read_chain(mem, head).and_then(|chain| handler(&chain)) {
                Ok(written) => written,
                Err(AxError::InvalidData) => {
                    warn!("queue {}: skipping malformed chain at {}", self.index, head);
                    continue;
                }
                Err(e) => return Err(e),
            };
            trace!("queue {}: used {} ({} bytes)", self.index, head, written);
            self.push_used(mem, head, written)?;
        }

        if self.next_used != old_used {
            fence(Ordering::Release);
            mem.write_u16(self.used_idx_addr(), self.next_used.0)?;
        }
        if self.event_idx {
            mem.write_u16(self.avail_event_addr(), self.last_avail_idx.0)?;
        }
        if self.next_used == old_used {
            return Ok(false);
        }

        fence(Ordering::SeqCst);
        if self.event_idx {
            let used_event = Wrapping(mem.read_u16(self.used_event_addr())?);
            Ok(vring_need_event(used_event, self.next_used, old_used))
        } else {
            let flags = mem.read_u16(self.avail_ring)?;
            Ok(flags & VRING_AVAIL_F_NO_INTERRUPT == 0)
        }
    }
}
