#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process::ExitCode;

use axerrno::{ax_err, ax_err_type, AxResult};
use clap::Parser;

use axkvm::kvm::{KvmHal, VcpuKicker};
use axkvm::{AxVm, ExitStatus, VmConfig};

/// Boot a Linux kernel on KVM with its console on this terminal.
#[derive(Debug, Parser)]
#[command(name = "axkvm", version, about)]
struct Args {
    /// TOML file describing the VM.
    #[arg(short, long, conflicts_with_all = ["kernel", "initrd"])]
    config: Option<PathBuf>,

    /// bzImage to boot.
    #[arg(required_unless_present = "config")]
    kernel: Option<PathBuf>,

    /// Initial ramdisk.
    initrd: Option<PathBuf>,

    /// Guest RAM in MiB.
    #[arg(short, long)]
    mem: Option<usize>,

    /// Kernel command line.
    #[arg(long)]
    cmdline: Option<String>,
}

fn mib_to_bytes(mib: usize) -> AxResult<usize> {
    mib.checked_mul(1 << 20)
        .ok_or_else(|| ax_err_type!(InvalidInput, "--mem is too large"))
}

fn load_config(args: &Args) -> AxResult<VmConfig> {
    let mut config = match (&args.config, &args.kernel) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path).map_err(|err| {
                error!("failed to read {}: {}", path.display(), err);
                ax_err_type!(NotFound)
            })?;
            VmConfig::from_toml(&raw)?
        }
        (None, Some(kernel)) => {
            let mut config = VmConfig::new(kernel);
            config.initrd = args.initrd.clone();
            config
        }
        (None, None) => return ax_err!(InvalidInput, "no kernel given"),
    };
    if let Some(mib) = args.mem {
        config.ram_size = mib_to_bytes(mib)?;
    }
    if let Some(cmdline) = &args.cmdline {
        config.cmdline = cmdline.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> AxResult<ExitStatus> {
    let config = load_config(args)?;
    debug!("{:#?}", config);

    let mut vm = AxVm::new(KvmHal::new()?, &config)?;
    vm.load(&config)?;

    if config.console_input {
        let kicker = VcpuKicker::current()?;
        vm.serial_input()
            .spawn_reader(std::io::stdin(), move || kicker.kick())
            .map_err(|err| {
                error!("failed to start the console input thread: {}", err);
                ax_err_type!(Io)
            })?;
    }

    vm.run()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(ExitStatus::Shutdown) => ExitCode::SUCCESS,
        Ok(ExitStatus::Fatal(exit)) => {
            error!("guest stopped: {:?}", exit);
            ExitCode::from(2)
        }
        Err(err) => {
            error!("axkvm: {:?}", err);
            ExitCode::FAILURE
        }
    }
}
