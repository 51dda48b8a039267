//! Side-channel contracts consumed by the recovery core.
//!
//! Every operation takes an explicit timeout or is short by nature; the
//! orchestrator additionally wraps each call in `tokio::time::timeout`, so an
//! adapter that ignores its deadline still cannot stall a run.
//!
//! Network operations receive the board address per call. Adapters must not
//! cache it: the only copy lives in [`crate::BoardIdentity`].

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::assets::BootAssetSet;
use crate::error::ChannelResult;

/// Output of a console command together with whether the marker was seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandEcho {
    pub output: String,
    pub found: bool,
}

/// A log capture that can be opened for a test run and closed afterwards.
#[async_trait]
pub trait ConsoleLog: Send {
    /// Human-readable name used in log lines ("uart", "netconsole-kernel", ...).
    fn label(&self) -> &str;

    /// Open the log file and begin appending captured output.
    async fn start_log(&mut self) -> ChannelResult<()>;

    /// Flush and close the log file. No-op if not started.
    async fn stop_log(&mut self) -> ChannelResult<()>;
}

/// Interactive session to the board's serial console.
///
/// Used both before the OS is up (boot-loader prompt) and after (shell).
#[async_trait]
pub trait ConsoleChannel: ConsoleLog {
    /// Drop anything already received so later matches only see fresh output.
    async fn discard_buffered(&mut self) -> ChannelResult<()>;

    /// Send `command` and collect output until `marker` appears or `timeout`.
    async fn run_command_expect(
        &mut self,
        command: &str,
        marker: &str,
        timeout: Duration,
    ) -> ChannelResult<CommandEcho>;

    /// Ask the running OS for its address. `Ok(None)` when none is assigned.
    async fn discover_ip(&mut self, timeout: Duration) -> ChannelResult<Option<IpAddr>>;

    /// Ask the running OS to (re)request a DHCP lease.
    async fn request_dhcp(&mut self, timeout: Duration) -> ChannelResult<()>;

    /// After a power cycle, stop autoboot and reach the boot-loader prompt.
    async fn enter_loader_from_power_cycle(&mut self, timeout: Duration) -> ChannelResult<()>;

    /// Upload the assets over the console itself and boot them.
    async fn load_boot_assets(&mut self, assets: &BootAssetSet, timeout: Duration)
        -> ChannelResult<()>;

    /// Have the boot loader fetch the assets from the TFTP server and boot them.
    async fn load_boot_assets_via_tftp(
        &mut self,
        assets: &BootAssetSet,
        timeout: Duration,
    ) -> ChannelResult<()>;

    /// Issue the loader's own boot command with whatever it already has.
    async fn boot_default(&mut self, timeout: Duration) -> ChannelResult<()>;

    /// Write bytes verbatim, e.g. keystrokes of a wake sequence.
    async fn write_raw(&mut self, bytes: &[u8]) -> ChannelResult<()>;
}

/// Network-side view of the board.
#[async_trait]
pub trait NetworkChannel: Send + Sync {
    async fn ping(&self, target: IpAddr, timeout: Duration) -> ChannelResult<bool>;

    /// `true` when an SSH session can be opened and a trivial command runs.
    async fn ssh_functional(&self, target: IpAddr, timeout: Duration) -> ChannelResult<bool>;

    /// Authenticated remote reboot.
    async fn reboot_board(&self, target: IpAddr, timeout: Duration) -> ChannelResult<()>;

    /// Confirm the OS has fully started, not merely that it answers pings.
    async fn check_board_booted(&self, target: IpAddr, timeout: Duration) -> ChannelResult<()>;

    /// Copy new boot assets onto the live board's boot partition and reboot it.
    async fn update_boot_partition(
        &self,
        target: IpAddr,
        assets: &BootAssetSet,
        timeout: Duration,
    ) -> ChannelResult<()>;
}

/// Power distribution unit outlet for one board.
#[async_trait]
pub trait PowerController: Send + Sync {
    /// Switch off, wait `off_duration`, switch on. Safe to repeat.
    async fn power_cycle(&self, off_duration: Duration) -> ChannelResult<()>;
}

/// Downstream device-driver verification run after a successful recovery.
#[async_trait]
pub trait DriverVerifier: Send + Sync {
    /// Run every check against the board reachable at `uri` (`ip:<addr>`).
    async fn run_all_checks(&self, uri: &str) -> ChannelResult<()>;
}
