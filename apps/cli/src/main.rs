mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use flashkit_core::{
    AppConfig, ChannelObserver, DeviceMode, Engine, FlashEvent, FlashJob, LockAction,
    PartitionOutcome, PartitionSelection, RebootTarget, ToolKind,
};
use tracing::{debug, info};

use ui::StdinConfirm;

#[derive(Parser, Debug)]
#[command(author, version, about = "Android device flashing and backup tool", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices in normal and bootloader mode
    Devices {
        /// Also show device properties
        #[arg(short, long)]
        long: bool,
    },
    /// Watch device transitions
    Watch {
        /// Arm one-shot mask-ROM detection
        #[arg(long)]
        mask_rom: bool,
        /// Stop after this many seconds
        #[arg(long = "for", value_name = "SECS")]
        duration: Option<u64>,
    },
    /// Flash firmware (archive or raw image) in bootloader mode
    Flash {
        /// Firmware archive (.zip, .tar.gz, .tgz) or raw image (.img, .bin)
        firmware: PathBuf,
        /// Partitions to flash, comma separated. Omit to flash every image
        #[arg(short, long, value_delimiter = ',')]
        partition: Vec<String>,
    },
    /// Read a partition back to a file
    Backup {
        partition: String,
        /// Output file (defaults to <partition>.img)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect or download the external tools
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
    /// Reboot the attached device
    Reboot {
        #[arg(default_value = "system")]
        target: String,
    },
    /// Unlock the bootloader (erases user data)
    Unlock,
    /// Lock the bootloader
    Lock,
    /// Mask-ROM vendor tool
    Maskrom {
        #[command(subcommand)]
        action: MaskRomAction,
    },
    /// Show or edit the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ToolsAction {
    /// Show where each tool resolved to
    Status,
    /// Download a tool from its mirrors
    Fetch { tool: ToolArg },
}

#[derive(Subcommand, Debug)]
enum MaskRomAction {
    /// Run detection once
    Detect,
    /// Run a vendor command, streaming its output
    Run {
        /// Ask for confirmation first (for data-wiping commands)
        #[arg(long)]
        confirm: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Path,
    /// Set a key, e.g. `tools.adb /opt/platform-tools/adb`
    Set { key: String, value: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ToolArg {
    Adb,
    Fastboot,
    MaskRom,
}

impl From<ToolArg> for ToolKind {
    fn from(arg: ToolArg) -> Self {
        match arg {
            ToolArg::Adb => ToolKind::Adb,
            ToolArg::Fastboot => ToolKind::Fastboot,
            ToolArg::MaskRom => ToolKind::MaskRom,
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

fn selection(partitions: Vec<String>) -> PartitionSelection {
    match partitions.len() {
        0 => PartitionSelection::All,
        1 => PartitionSelection::Named(partitions.into_iter().next().unwrap_or_default()),
        _ => PartitionSelection::List(partitions),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    debug!(path = %config_path.display(), "Loading configuration");
    let config = AppConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Commands::Config { action } = &cli.command {
        return run_config(action, config, &config_path);
    }

    let (observer, rx) = ChannelObserver::new();
    let engine = Arc::new(Engine::from_config(
        config,
        Arc::new(observer),
        Arc::new(StdinConfirm {
            assume_yes: cli.yes,
        }),
    ));

    let interrupted = install_interrupt_handler(&engine)?;
    let result = run(&engine, &rx, &interrupted, cli.command);
    engine.shutdown();
    ui::drain(&rx);
    result
}

/// Ctrl-C raises the returned flag and stops a running mask-ROM command.
/// Flash and backup workers run to completion.
fn install_interrupt_handler(engine: &Arc<Engine>) -> Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let engine = Arc::clone(engine);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        if !engine.stop_mask_rom_command() && engine.is_busy() {
            eprintln!("Interrupted, waiting for the running operation to finish");
        }
    })
    .context("installing Ctrl-C handler")?;
    Ok(interrupted)
}

fn run(
    engine: &Arc<Engine>,
    rx: &Receiver<FlashEvent>,
    interrupted: &AtomicBool,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Devices { long } => {
            let devices = engine.list_devices();
            if devices.is_empty() {
                println!("No devices found");
            }
            for (mode, device) in devices {
                println!("{}\t{}\t{}", device.id, mode, device.description);
                if long && mode == DeviceMode::NormalMode {
                    for (key, value) in engine.device_properties(&device.id) {
                        println!("  {:<34} {}", key, value);
                    }
                }
            }
        }
        Commands::Watch { mask_rom, duration } => {
            if mask_rom {
                engine.arm_mask_rom_detection()?;
            }
            engine.start_monitor()?;
            info!("Watching for devices, Ctrl-C to stop");
            let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
            ui::pump_until(rx, deadline, interrupted);
            engine.stop_monitor();
        }
        Commands::Flash {
            firmware,
            partition,
        } => {
            let session = engine.observe_once();
            ui::drain(rx);
            if session.mode != DeviceMode::BootloaderMode {
                bail!("no device in bootloader mode (current: {})", session);
            }

            let job = FlashJob::new(firmware, selection(partition));
            let worker = engine.spawn_flash(job)?;
            ui::pump_until_finished(rx, &worker);
            let report = worker
                .join()
                .map_err(|_| anyhow::anyhow!("flash worker panicked"))??;

            for result in &report.results {
                let status = match &result.outcome {
                    PartitionOutcome::Flashed { attempts } => {
                        format!("ok ({} attempt(s))", attempts)
                    }
                    PartitionOutcome::Failed { attempts, error } => {
                        format!("FAILED after {} attempt(s): {}", attempts, error)
                    }
                    PartitionOutcome::NotFound => "not in firmware".to_string(),
                };
                println!("  {:<16} {}", result.partition, status);
            }
            if !report.is_success() {
                bail!("{} partition(s) not flashed", report.failed().count());
            }
        }
        Commands::Backup { partition, output } => {
            let session = engine.observe_once();
            ui::drain(rx);
            if session.mode != DeviceMode::BootloaderMode {
                bail!("no device in bootloader mode (current: {})", session);
            }

            let out = output.unwrap_or_else(|| PathBuf::from(format!("{}.img", partition)));
            let worker = engine.spawn_backup(&partition, &out)?;
            ui::pump_until_finished(rx, &worker);
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("backup worker panicked"))??;
        }
        Commands::Tools { action } => match action {
            ToolsAction::Status => {
                let toolchain = engine.toolchain();
                for kind in [ToolKind::Adb, ToolKind::Fastboot, ToolKind::MaskRom] {
                    println!("{}", toolchain.tool(kind));
                }
                println!("tools dir: {}", toolchain.config.tools_dir().display());
            }
            ToolsAction::Fetch { tool } => {
                let worker = engine.spawn_acquire(tool.into())?;
                ui::pump_until_finished(rx, &worker);
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("download worker panicked"))??;
            }
        },
        Commands::Reboot { target } => {
            let target: RebootTarget = target.parse()?;
            engine.observe_once();
            ui::drain(rx);
            engine.reboot(target)?;
        }
        Commands::Unlock => set_lock(engine, rx, LockAction::Unlock)?,
        Commands::Lock => set_lock(engine, rx, LockAction::Lock)?,
        Commands::Maskrom { action } => match action {
            MaskRomAction::Detect => {
                let devices = engine.detect_mask_rom()?;
                if devices.is_empty() {
                    println!("No mask-ROM device found");
                }
                for device in devices {
                    println!("{}\t{}", device.id, device.description);
                }
            }
            MaskRomAction::Run { confirm, args } => {
                let worker = {
                    let engine = Arc::clone(engine);
                    thread::spawn(move || engine.run_mask_rom_command(&args, confirm))
                };
                ui::pump_until_finished(rx, &worker);
                let output = worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("mask-ROM worker panicked"))??;
                debug!(code = ?output.code, "Mask-ROM command exited");
            }
        },
        Commands::Config { .. } => unreachable!("handled before the engine is built"),
    }
    Ok(())
}

fn set_lock(engine: &Engine, rx: &Receiver<FlashEvent>, action: LockAction) -> Result<()> {
    engine.observe_once();
    ui::drain(rx);
    engine.set_bootloader_lock(action)?;
    Ok(())
}

fn run_config(action: &ConfigAction, mut config: AppConfig, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show => print!("{}", config.to_toml_string()?),
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Set { key, value } => {
            config.set_key(key, value)?;
            config
                .save_to_file(path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}
