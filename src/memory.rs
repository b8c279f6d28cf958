//! Guest physical memory and the guest-to-host address translator.

use core::ptr::{self, NonNull};

use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::{AddrRange, PhysAddr, VirtAddr};

/// Guest physical address.
pub type GuestPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;
/// A range of host virtual addresses backing some guest physical range.
pub type HostVirtAddrRange = AddrRange<HostVirtAddr>;

/// Size of a page on the host and in the guest.
pub const PAGE_SIZE: usize = 0x1000;

/// One contiguous block of host memory presented to the guest as physical
/// RAM starting at guest physical address 0.
///
/// Every access made on behalf of the guest goes through [`GuestMemory::translate`],
/// which rejects any range that is not fully contained in `[0, size)`.
pub struct GuestMemory {
    host: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping is owned by this struct for its whole lifetime and only
// ever accessed through bounds-checked copies.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Map `size` bytes of anonymous, zero-filled memory for the guest.
    pub fn new(size: usize) -> AxResult<Self> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return ax_err!(
                InvalidInput,
                format!("guest memory size {:#x} is not a non-zero multiple of a page", size)
            );
        }

        // SAFETY: anonymous private mapping, no existing memory is aliased.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return ax_err!(NoMemory, "failed to map guest memory");
        }
        let host = NonNull::new(addr as *mut u8).ok_or_else(|| ax_err_type!(NoMemory))?;

        debug!("guest memory: {:#x} bytes at host {:p}", size, host);
        Ok(Self { host, size })
    }

    /// Size of guest RAM in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Host address of guest physical address 0.
    pub fn host_base(&self) -> HostVirtAddr {
        HostVirtAddr::from(self.host.as_ptr() as usize)
    }

    /// Translate the guest physical range `[guest_addr, guest_addr + len)` to
    /// the host range backing it.
    ///
    /// Fails with `BadAddress` if the range overflows or leaves guest RAM.
    pub fn translate(&self, guest_addr: GuestPhysAddr, len: usize) -> AxResult<HostVirtAddrRange> {
        let start = guest_addr.as_usize();
        let end = match start.checked_add(len) {
            Some(end) if end <= self.size => end,
            _ => {
                return ax_err!(
                    BadAddress,
                    format!(
                        "guest range [{:#x}, +{:#x}) outside of RAM size {:#x}",
                        start, len, self.size
                    )
                )
            }
        };
        let base = self.host.as_ptr() as usize;
        Ok(HostVirtAddrRange::new(
            HostVirtAddr::from(base + start),
            HostVirtAddr::from(base + end),
        ))
    }

    /// Copy guest memory at `addr` into `buf`.
    pub fn read(&self, addr: GuestPhysAddr, buf: &mut [u8]) -> AxResult {
        let range = self.translate(addr, buf.len())?;
        // SAFETY: `translate` guarantees the source lies inside our mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                range.start.as_usize() as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write(&self, addr: GuestPhysAddr, data: &[u8]) -> AxResult {
        let range = self.translate(addr, data.len())?;
        // SAFETY: `translate` guarantees the destination lies inside our mapping.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), range.start.as_usize() as *mut u8, data.len());
        }
        Ok(())
    }

    /// Set `len` bytes of guest memory at `addr` to `byte`.
    pub fn fill(&self, addr: GuestPhysAddr, byte: u8, len: usize) -> AxResult {
        let range = self.translate(addr, len)?;
        // SAFETY: see `write`.
        unsafe { ptr::write_bytes(range.start.as_usize() as *mut u8, byte, len) };
        Ok(())
    }
}

macro_rules! guest_int_accessors {
    ($($read:ident, $write:ident => $ty:ty;)*) => {
        impl GuestMemory {
            $(
                #[doc = concat!("Read a little-endian `", stringify!($ty), "` from guest memory.")]
                pub fn $read(&self, addr: GuestPhysAddr) -> AxResult<$ty> {
                    let mut bytes = [0u8; core::mem::size_of::<$ty>()];
                    self.read(addr, &mut bytes)?;
                    Ok(<$ty>::from_le_bytes(bytes))
                }

                #[doc = concat!("Write a little-endian `", stringify!($ty), "` to guest memory.")]
                pub fn $write(&self, addr: GuestPhysAddr, val: $ty) -> AxResult {
                    self.write(addr, &val.to_le_bytes())
                }
            )*
        }
    };
}

guest_int_accessors! {
    read_u8, write_u8 => u8;
    read_u16, write_u16 => u16;
    read_u32, write_u32 => u32;
    read_u64, write_u64 => u64;
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        // SAFETY: `host`/`size` describe exactly the mapping created in `new`.
        unsafe { libc::munmap(self.host.as_ptr() as *mut libc::c_void, self.size) };
    }
}

impl core::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("host", &self.host)
            .field("size", &self.size)
            .finish()
    }
}
