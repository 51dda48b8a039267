//! Benchwarden CLI: recover a lab board from the command line
//!
//! Usage:
//!   benchwarden --config lab.toml recover
//!   benchwarden --config lab.toml recover-with-assets --system-top-bit <f> --boot-bin <f> --kernel <f> --devicetree <f>
//!   benchwarden --config lab.toml run-test [asset flags]
//!   benchwarden --config lab.toml check-config

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

use benchwarden_channels::{CommandVerifier, HttpPdu, NetconsoleMonitor, SshNetwork, TcpConsole};
use benchwarden_core::{
    cancel_pair, BoardHandle, BoardIdentity, BootAssetPaths, ConsoleLog, DriverVerifier,
    LabConfig, MonitorKind, RecoveryOrchestrator, RecoveryOutcome, RecoveryReport,
    TestRunCoordinator, Verification,
};

#[derive(Parser)]
#[command(name = "benchwarden")]
#[command(author = "Stevedores Org")]
#[command(version = benchwarden_core::VERSION)]
#[command(about = "Bring a hung lab board back to a network-reachable state", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Lab configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "BENCHWARDEN_CONFIG",
        default_value = "benchwarden.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reboot the board without redeploying firmware
    Recover,

    /// Deploy boot assets, forcing a loader boot if Linux is down
    RecoverWithAssets {
        #[command(flatten)]
        assets: AssetArgs,
    },

    /// Recover inside log capture, then run the driver checks
    RunTest {
        #[command(flatten)]
        assets: OptionalAssetArgs,
    },

    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
}

#[derive(Args, Debug)]
struct AssetArgs {
    /// FPGA bitstream
    #[arg(long)]
    system_top_bit: PathBuf,

    /// Boot image written to the boot partition
    #[arg(long)]
    boot_bin: PathBuf,

    /// Kernel image
    #[arg(long)]
    kernel: PathBuf,

    /// Device tree blob
    #[arg(long)]
    devicetree: PathBuf,
}

impl From<AssetArgs> for BootAssetPaths {
    fn from(args: AssetArgs) -> Self {
        BootAssetPaths {
            system_top_bit: args.system_top_bit,
            boot_bin: args.boot_bin,
            kernel_image: args.kernel,
            devicetree: args.devicetree,
        }
    }
}

/// Asset flags for `run-test`: all four or none.
#[derive(Args, Debug)]
struct OptionalAssetArgs {
    #[arg(long, requires = "boot_bin", requires = "kernel", requires = "devicetree")]
    system_top_bit: Option<PathBuf>,

    #[arg(long, requires = "system_top_bit")]
    boot_bin: Option<PathBuf>,

    #[arg(long, requires = "system_top_bit")]
    kernel: Option<PathBuf>,

    #[arg(long, requires = "system_top_bit")]
    devicetree: Option<PathBuf>,
}

impl OptionalAssetArgs {
    fn into_paths(self) -> Option<BootAssetPaths> {
        Some(BootAssetPaths {
            system_top_bit: self.system_top_bit?,
            boot_bin: self.boot_bin?,
            kernel_image: self.kernel?,
            devicetree: self.devicetree?,
        })
    }
}

/// What `run-test` prints.
#[derive(Serialize)]
struct TestRunSummary<'a> {
    passed: bool,
    recovery: &'a RecoveryReport,
    verification: &'a Verification,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    benchwarden_core::init_tracing(cli.json, level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Recover => cmd_recover(&config, None).await,
        Commands::RecoverWithAssets { assets } => cmd_recover(&config, Some(assets.into())).await,
        Commands::RunTest { assets } => cmd_run_test(&config, assets.into_paths()).await,
        Commands::CheckConfig => cmd_check_config(&config),
    }
}

fn load_config(path: &Path) -> Result<LabConfig> {
    LabConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

/// Orchestrator wired to Ctrl-C.
fn orchestrator(config: &LabConfig) -> RecoveryOrchestrator {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling at the next checkpoint");
            handle.cancel();
        }
    });
    RecoveryOrchestrator::from_config(&config.effective_recovery()).with_cancel(signal)
}

async fn connect_board(config: &LabConfig) -> Result<BoardHandle> {
    let timeout = config.recovery.timings.command_timeout();
    let console = TcpConsole::connect(config.console.clone(), timeout)
        .await
        .with_context(|| {
            format!(
                "Failed to reach console server {}:{}",
                config.console.host, config.console.port
            )
        })?;
    let network = SshNetwork::new(config.network.clone());
    let power = HttpPdu::new(config.pdu.clone()).context("Failed to set up PDU client")?;
    let identity = BoardIdentity::new(config.board.ip()?);

    Ok(BoardHandle::new(
        config.board.name.clone(),
        identity,
        Box::new(console),
        Box::new(network),
        Box::new(power),
    ))
}

fn monitors(config: &LabConfig) -> Vec<Box<dyn ConsoleLog>> {
    match config.console.monitor {
        MonitorKind::Uart => Vec::new(),
        MonitorKind::Netconsole => vec![
            Box::new(NetconsoleMonitor::bootloader(&config.netconsole)),
            Box::new(NetconsoleMonitor::kernel(&config.netconsole)),
        ],
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_recover(config: &LabConfig, assets: Option<BootAssetPaths>) -> Result<()> {
    let mut board = connect_board(config).await?;
    let orchestrator = orchestrator(config);

    let (outcome, report) = orchestrator
        .recover_reported(&mut board, assets.as_ref())
        .await;
    print_json(&report)?;

    match outcome {
        RecoveryOutcome::Failed { reason } => bail!("Recovery of {} failed: {reason}", board.name()),
        RecoveryOutcome::RecoveredDegraded { ip, notes } => {
            info!(ip = %ip, escalations = notes.len(), "board recovered after escalation");
            Ok(())
        }
        RecoveryOutcome::Recovered { ip } => {
            info!(ip = %ip, "board recovered");
            Ok(())
        }
    }
}

async fn cmd_run_test(config: &LabConfig, assets: Option<BootAssetPaths>) -> Result<()> {
    let mut board = connect_board(config).await?;
    let mut monitors = monitors(config);
    let verifier = config.driver.clone().map(CommandVerifier::new);
    let coordinator = TestRunCoordinator::new(orchestrator(config));

    let report = coordinator
        .run(
            &mut board,
            &mut monitors,
            verifier.as_ref().map(|v| v as &dyn DriverVerifier),
            assets.as_ref(),
        )
        .await;

    print_json(&TestRunSummary {
        passed: report.passed(),
        recovery: &report.recovery,
        verification: &report.verification,
    })?;

    if let Some(reason) = report.outcome.error() {
        bail!("Recovery of {} failed: {reason}", board.name());
    }
    if let Verification::Failed { reason } = &report.verification {
        bail!("Driver checks failed: {reason}");
    }
    Ok(())
}

fn cmd_check_config(config: &LabConfig) -> Result<()> {
    println!("{}", config_json(config)?);
    Ok(())
}

/// Effective configuration as printed by `check-config`, secrets masked.
fn config_json(config: &LabConfig) -> Result<String> {
    Ok(serde_json::to_string_pretty(&config.redacted())?)
}
