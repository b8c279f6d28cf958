use std::path::PathBuf;

use axerrno::{ax_err, AxResult};

use crate::memory::PAGE_SIZE;

/// Start of the 32-bit PCI MMIO hole. Guest RAM must end below it.
pub const PCI_MMIO_HOLE_START: usize = 0xc000_0000;

const DEFAULT_RAM_SIZE: usize = 1 << 30;
const DEFAULT_CMDLINE: &str = "console=ttyS0";

fn default_ram_size() -> usize {
    DEFAULT_RAM_SIZE
}

fn default_cmdline() -> String {
    DEFAULT_CMDLINE.into()
}

fn default_console_input() -> bool {
    true
}

/// Everything needed to build and boot one VM.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    /// Bytes of guest RAM.
    #[serde(default = "default_ram_size")]
    pub ram_size: usize,
    /// Path of the bzImage to boot.
    pub kernel: PathBuf,
    /// Optional initial ramdisk.
    #[serde(default)]
    pub initrd: Option<PathBuf>,
    /// Kernel command line.
    #[serde(default = "default_cmdline")]
    pub cmdline: String,
    /// Forward host stdin to the guest serial port.
    #[serde(default = "default_console_input")]
    pub console_input: bool,
}

impl VmConfig {
    /// A configuration with default settings booting `kernel`.
    pub fn new(kernel: impl Into<PathBuf>) -> Self {
        Self {
            ram_size: DEFAULT_RAM_SIZE,
            kernel: kernel.into(),
            initrd: None,
            cmdline: default_cmdline(),
            console_input: default_console_input(),
        }
    }

    pub fn from_toml(raw_cfg_str: &str) -> AxResult<Self> {
        let config = toml::from_str(raw_cfg_str).map_err(|err| {
            axerrno::ax_err_type!(InvalidInput, format!("toml deserialize get err {err:?}"))
        })?;
        Ok(config)
    }

    /// Reject settings no VM could be built from.
    pub fn validate(&self) -> AxResult {
        if self.ram_size == 0 || self.ram_size % PAGE_SIZE != 0 {
            return ax_err!(
                InvalidInput,
                format!("ram_size {:#x} is not a non-zero multiple of a page", self.ram_size)
            );
        }
        if self.ram_size > PCI_MMIO_HOLE_START {
            return ax_err!(
                InvalidInput,
                format!(
                    "ram_size {:#x} runs into the PCI hole at {:#x}",
                    self.ram_size, PCI_MMIO_HOLE_START
                )
            );
        }
        if self.cmdline.as_bytes().contains(&0) {
            return ax_err!(InvalidInput, "kernel command line contains NUL");
        }
        Ok(())
    }
}
