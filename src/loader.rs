//! Linux x86 boot protocol: bzImage, initrd and the E820 map.

use axerrno::{ax_err, AxResult};

use crate::memory::{GuestMemory, GuestPhysAddr};

/// Where the zero page (`struct boot_params`) is built.
pub const BOOT_PARAMS_ADDR: usize = 0x10000;
/// Where the kernel command line is written.
pub const CMDLINE_ADDR: usize = 0x20000;
/// Where the protected-mode kernel is loaded and entered.
pub const KERNEL_ADDR: usize = 0x100000;

const BOOT_PARAMS_SIZE: usize = 0x1000;
const SECTOR_SIZE: usize = 512;

/// Offsets into `struct boot_params`.
mod bp {
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const SETUP_SECTS: usize = 0x1f1;
    pub const VID_MODE: usize = 0x1fa;
    pub const HEADER_LEN: usize = 0x201;
    pub const HEADER: usize = 0x202;
    pub const VERSION: usize = 0x206;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const LOADFLAGS: usize = 0x211;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const HEAP_END_PTR: usize = 0x224;
    pub const EXT_LOADER_VER: usize = 0x226;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const INITRD_ADDR_MAX: usize = 0x22c;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const E820_TABLE: usize = 0x2d0;
}

const HDRS_MAGIC: u32 = 0x5372_6448;
const LOADED_HIGH: u8 = 0x01;
const KEEP_SEGMENTS: u8 = 0x40;
const CAN_USE_HEAP: u8 = 0x80;

const E820_RAM: u32 = 1;
const E820_ENTRY_SIZE: usize = 20;
const ISA_START_ADDRESS: u64 = 0xa0000;
const ISA_END_ADDRESS: u64 = 0x100000;

const INITRD_ALIGN: usize = 0x100000;
const DEFAULT_INITRD_ADDR_MAX: u32 = 0x37ff_ffff;

/// Where to start the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootInfo {
    /// First instruction of the protected-mode kernel.
    pub entry: GuestPhysAddr,
    /// The zero page, passed to the kernel in `rsi`.
    pub boot_params: GuestPhysAddr,
    /// First byte after the loaded kernel.
    pub kernel_end: GuestPhysAddr,
}

fn header_u8(image: &[u8], offset: usize) -> u8 {
    image[offset]
}

fn header_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

fn header_u32(image: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        image[offset],
        image[offset + 1],
        image[offset + 2],
        image[offset + 3],
    ])
}

/// Load a bzImage into `mem` and build its zero page, command line and E820 map.
pub fn load_bzimage(mem: &GuestMemory, image: &[u8], cmdline: &str) -> AxResult<BootInfo> {
    if image.len() < BOOT_PARAMS_SIZE || header_u32(image, bp::HEADER) != HDRS_MAGIC {
        return ax_err!(InvalidData, "kernel is not a bzImage (no HdrS magic)");
    }
    let version = header_u16(image, bp::VERSION);
    if version < 0x0204 {
        return ax_err!(
            InvalidData,
            format!("boot protocol {:#x} too old", version)
        );
    }

    let setup_sects = match header_u8(image, bp::SETUP_SECTS) {
        0 => 4,
        n => n as usize,
    };
    let setup_size = (setup_sects + 1) * SECTOR_SIZE;
    if image.len() <= setup_size {
        return ax_err!(InvalidData, "bzImage has no protected-mode kernel");
    }
    let kernel = &image[setup_size..];

    let cmdline_max = if version >= 0x0206 {
        header_u32(image, bp::CMDLINE_SIZE) as usize
    } else {
        255
    };
    if cmdline.len() > cmdline_max {
        return ax_err!(
            InvalidInput,
            format!("command line is {} bytes, kernel takes {}", cmdline.len(), cmdline_max)
        );
    }

    let boot = GuestPhysAddr::from(BOOT_PARAMS_ADDR);
    let header_end =
        (bp::HEADER + header_u8(image, bp::HEADER_LEN) as usize).min(BOOT_PARAMS_SIZE);
    mem.fill(boot, 0, BOOT_PARAMS_SIZE)?;
    mem.write(boot + bp::SETUP_SECTS, &image[bp::SETUP_SECTS..header_end])?;

    mem.write_u16(boot + bp::VID_MODE, 0xffff)?;
    mem.write_u8(boot + bp::TYPE_OF_LOADER, 0xff)?;
    let loadflags = mem.read_u8(boot + bp::LOADFLAGS)?;
    mem.write_u8(
        boot + bp::LOADFLAGS,
        loadflags | LOADED_HIGH | KEEP_SEGMENTS | CAN_USE_HEAP,
    )?;
    mem.write_u16(boot + bp::HEAP_END_PTR, 0xfe00)?;
    mem.write_u8(boot + bp::EXT_LOADER_VER, 0)?;
    mem.write_u32(boot + bp::CMD_LINE_PTR, CMDLINE_ADDR as u32)?;

    let cmdline_addr = GuestPhysAddr::from(CMDLINE_ADDR);
    mem.fill(cmdline_addr, 0, cmdline_max + 1)?;
    mem.write(cmdline_addr, cmdline.as_bytes())?;

    let kernel_addr = GuestPhysAddr::from(KERNEL_ADDR);
    mem.write(kernel_addr, kernel)?;

    let e820 = [
        (0, ISA_START_ADDRESS),
        (ISA_END_ADDRESS, mem.size() as u64 - ISA_END_ADDRESS),
    ];
    for (i, (addr, size)) in e820.iter().enumerate() {
        let entry = boot + bp::E820_TABLE + i * E820_ENTRY_SIZE;
        mem.write_u64(entry, *addr)?;
        mem.write_u64(entry + 8, *size)?;
        mem.write_u32(entry + 16, E820_RAM)?;
    }
    mem.write_u8(boot + bp::E820_ENTRIES, e820.len() as u8)?;

    info!(
        "loaded bzImage: protocol {:#x}, {} byte kernel at {:#x}",
        version,
        kernel.len(),
        KERNEL_ADDR
    );
    Ok(BootInfo {
        entry: kernel_addr,
        boot_params: boot,
        kernel_end: kernel_addr + kernel.len(),
    })
}

/// Place `initrd` as high as the kernel allows and record it in the zero page.
///
/// Returns the guest address the initrd was loaded at.
pub fn load_initrd(mem: &GuestMemory, boot: &BootInfo, initrd: &[u8]) -> AxResult<GuestPhysAddr> {
    let addr_max = match mem.read_u32(boot.boot_params + bp::INITRD_ADDR_MAX)? {
        0 => DEFAULT_INITRD_ADDR_MAX,
        max => max,
    };
    let limit = (addr_max as usize + 1).min(mem.size());
    let addr = limit
        .checked_sub(initrd.len())
        .map(|top| top & !(INITRD_ALIGN - 1))
        .filter(|&addr| addr >= boot.kernel_end.as_usize());
    let Some(addr) = addr else {
        return ax_err!(
            NoMemory,
            format!("no room for a {} byte initrd above the kernel", initrd.len())
        );
    };

    let addr = GuestPhysAddr::from(addr);
    mem.write(addr, initrd)?;
    mem.write_u32(boot.boot_params + bp::RAMDISK_IMAGE, addr.as_usize() as u32)?;
    mem.write_u32(boot.boot_params + bp::RAMDISK_SIZE, initrd.len() as u32)?;
    info!("loaded {} byte initrd at {:#x}", initrd.len(), addr.as_usize());
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    const RAM: usize = 4 << 20;

    fn bzimage(kernel_len: usize) -> Vec<u8> {
        let setup = 2 * SECTOR_SIZE;
        let mut image = vec![0u8; BOOT_PARAMS_SIZE.max(setup) + kernel_len];
        image[bp::SETUP_SECTS] = 1;
        image[bp::HEADER_LEN] = 0x66;
        image[bp::HEADER..bp::HEADER + 4].copy_from_slice(&HDRS_MAGIC.to_le_bytes());
        image[bp::VERSION..bp::VERSION + 2].copy_from_slice(&0x020fu16.to_le_bytes());
        image[bp::CMDLINE_SIZE..bp::CMDLINE_SIZE + 4].copy_from_slice(&255u32.to_le_bytes());
        image[bp::INITRD_ADDR_MAX..bp::INITRD_ADDR_MAX + 4]
            .copy_from_slice(&DEFAULT_INITRD_ADDR_MAX.to_le_bytes());
        for (i, b) in image[setup..].iter_mut().enumerate() {
            *b = i as u8;
        }
        image
    }

    fn gpa(addr: usize) -> GuestPhysAddr {
        GuestPhysAddr::from(addr)
    }

    #[test]
    fn bzimage_layout() {
        let mem = GuestMemory::new(RAM).unwrap();
        let image = bzimage(0x2000);
        let boot = load_bzimage(&mem, &image, "console=ttyS0").unwrap();

        assert_eq!(boot.entry, gpa(KERNEL_ADDR));
        assert_eq!(boot.boot_params, gpa(BOOT_PARAMS_ADDR));
        let kernel_len = image.len() - 2 * SECTOR_SIZE;
        assert_eq!(boot.kernel_end, gpa(KERNEL_ADDR + kernel_len));

        let mut kernel = vec![0u8; kernel_len];
        mem.read(gpa(KERNEL_ADDR), &mut kernel).unwrap();
        assert_eq!(kernel, &image[2 * SECTOR_SIZE..]);

        let mut cmdline = [0u8; 14];
        mem.read(gpa(CMDLINE_ADDR), &mut cmdline).unwrap();
        assert_eq!(&cmdline, b"console=ttyS0\0");

        let zp = boot.boot_params;
        assert_eq!(mem.read_u16(zp + bp::VID_MODE).unwrap(), 0xffff);
        assert_eq!(mem.read_u8(zp + bp::TYPE_OF_LOADER).unwrap(), 0xff);
        assert_eq!(
            mem.read_u8(zp + bp::LOADFLAGS).unwrap(),
            LOADED_HIGH | KEEP_SEGMENTS | CAN_USE_HEAP
        );
        assert_eq!(mem.read_u32(zp + bp::CMD_LINE_PTR).unwrap(), CMDLINE_ADDR as u32);
        assert_eq!(mem.read_u16(zp + bp::HEAP_END_PTR).unwrap(), 0xfe00);

        assert_eq!(mem.read_u8(zp + bp::E820_ENTRIES).unwrap(), 2);
        let e0 = zp + bp::E820_TABLE;
        let e1 = e0 + E820_ENTRY_SIZE;
        assert_eq!(mem.read_u64(e0).unwrap(), 0);
        assert_eq!(mem.read_u64(e0 + 8).unwrap(), 0xa0000);
        assert_eq!(mem.read_u32(e0 + 16).unwrap(), E820_RAM);
        assert_eq!(mem.read_u64(e1).unwrap(), 0x100000);
        assert_eq!(mem.read_u64(e1 + 8).unwrap(), (RAM - 0x100000) as u64);
    }

    #[test]
    fn rejects_bad_images() {
        let mem = GuestMemory::new(RAM).unwrap();
        assert_eq!(
            load_bzimage(&mem, &[0u8; 0x1000], ""),
            Err(AxError::InvalidData)
        );

        let mut old = bzimage(0x100);
        old[bp::VERSION..bp::VERSION + 2].copy_from_slice(&0x0200u16.to_le_bytes());
        assert_eq!(load_bzimage(&mem, &old, ""), Err(AxError::InvalidData));

        let long = "x".repeat(256);
        assert_eq!(
            load_bzimage(&mem, &bzimage(0x100), &long),
            Err(AxError::InvalidInput)
        );

        // kernel does not fit in RAM
        assert_eq!(
            load_bzimage(&mem, &bzimage(RAM), ""),
            Err(AxError::BadAddress)
        );
    }

    #[test]
    fn initrd_goes_high_and_aligned() {
        let mem = GuestMemory::new(RAM).unwrap();
        let boot = load_bzimage(&mem, &bzimage(0x2000), "").unwrap();
        let initrd = vec![0x5a; 0x1000];

        let addr = load_initrd(&mem, &boot, &initrd).unwrap();
        assert_eq!(addr, gpa(0x300000));
        assert_eq!(mem.read_u32(boot.boot_params + bp::RAMDISK_IMAGE).unwrap(), 0x300000);
        assert_eq!(mem.read_u32(boot.boot_params + bp::RAMDISK_SIZE).unwrap(), 0x1000);
        assert_eq!(mem.read_u8(addr + 0xfff).unwrap(), 0x5a);
    }

    #[test]
    fn initrd_without_room() {
        let mem = GuestMemory::new(RAM).unwrap();
        let boot = load_bzimage(&mem, &bzimage(0x2000), "").unwrap();
        let initrd = vec![0u8; RAM - 0x80000];
        assert_eq!(load_initrd(&mem, &boot, &initrd), Err(AxError::NoMemory));
    }
}
