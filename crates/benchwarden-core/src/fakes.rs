//! In-memory scripted fakes for the channel traits (testing only)
//!
//! Every fake writes into one shared [`Journal`], so a test can assert the
//! order of calls across console, network, power and driver channels.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::assets::BootAssetSet;
use crate::board::{BoardHandle, BoardIdentity};
use crate::channels::{
    CommandEcho, ConsoleChannel, ConsoleLog, DriverVerifier, NetworkChannel, PowerController,
};
use crate::error::{ChannelError, ChannelResult};

/// One recorded channel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartLog(String),
    StopLog(String),
    DiscardBuffered,
    RunCommand(String),
    DiscoverIp,
    RequestDhcp,
    EnterLoader,
    LoadBootAssets,
    LoadBootAssetsViaTftp,
    BootDefault,
    WriteRaw(Vec<u8>),
    Ping(IpAddr),
    SshCheck(IpAddr),
    Reboot(IpAddr),
    CheckBooted(IpAddr),
    UpdateBootPartition(IpAddr),
    PowerCycle(Duration),
    /// The outlet was switched back on at the end of a power cycle.
    PowerOn,
    DriverChecks(String),
}

impl Call {
    /// Board address a network call targeted, if any.
    pub fn target(&self) -> Option<IpAddr> {
        match self {
            Call::Ping(ip)
            | Call::SshCheck(ip)
            | Call::Reboot(ip)
            | Call::CheckBooted(ip)
            | Call::UpdateBootPartition(ip) => Some(*ip),
            _ => None,
        }
    }
}

/// Shared, ordered record of calls.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Index of the first matching call.
    pub fn first(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| pred(c))
    }

    /// Index of the last matching call.
    pub fn last(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.lock().unwrap().iter().rposition(|c| pred(c))
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().unwrap().is_empty()
    }
}

// ---------------------------------------------------------------------------
// FakeConsole
// ---------------------------------------------------------------------------

/// Console whose OS liveness and IP answers are scripted.
#[derive(Debug)]
pub struct FakeConsole {
    journal: Journal,
    label: String,
    linux: bool,
    hang_check: bool,
    ips: VecDeque<Option<IpAddr>>,
    fallback_ip: Option<IpAddr>,
    dhcp_ip: Option<IpAddr>,
    fail_loader: bool,
    fail_load: bool,
    fail_writes: bool,
    fail_log_stop: bool,
}

impl FakeConsole {
    /// Linux answers, no address until scripted.
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            label: "uart".to_string(),
            linux: true,
            hang_check: false,
            ips: VecDeque::new(),
            fallback_ip: None,
            dhcp_ip: None,
            fail_loader: false,
            fail_load: false,
            fail_writes: false,
            fail_log_stop: false,
        }
    }

    pub fn linux_alive(mut self, alive: bool) -> Self {
        self.linux = alive;
        self
    }

    /// The liveness check never returns.
    pub fn hang_on_liveness_check(mut self) -> Self {
        self.hang_check = true;
        self
    }

    /// Address reported once any scripted sequence is used up.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.fallback_ip = Some(ip);
        self
    }

    /// Answers for successive discoveries, before falling back.
    pub fn with_ip_sequence(mut self, seq: impl IntoIterator<Item = Option<IpAddr>>) -> Self {
        self.ips = seq.into_iter().collect();
        self
    }

    /// Address that appears once a DHCP lease is requested.
    pub fn with_dhcp_ip(mut self, ip: IpAddr) -> Self {
        self.dhcp_ip = Some(ip);
        self
    }

    pub fn failing_loader(mut self) -> Self {
        self.fail_loader = true;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn failing_log_stop(mut self) -> Self {
        self.fail_log_stop = true;
        self
    }

    fn load_result(&self) -> ChannelResult<()> {
        if self.fail_load {
            return Err(ChannelError::Transport("fake: load aborted".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsoleLog for FakeConsole {
    fn label(&self) -> &str {
        &self.label
    }

    async fn start_log(&mut self) -> ChannelResult<()> {
        self.journal.record(Call::StartLog(self.label.clone()));
        Ok(())
    }

    async fn stop_log(&mut self) -> ChannelResult<()> {
        self.journal.record(Call::StopLog(self.label.clone()));
        if self.fail_log_stop {
            return Err(ChannelError::Transport("fake: log flush failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConsoleChannel for FakeConsole {
    async fn discard_buffered(&mut self) -> ChannelResult<()> {
        self.journal.record(Call::DiscardBuffered);
        Ok(())
    }

    async fn run_command_expect(
        &mut self,
        command: &str,
        marker: &str,
        _timeout: Duration,
    ) -> ChannelResult<CommandEcho> {
        self.journal.record(Call::RunCommand(command.to_string()));
        if self.hang_check {
            std::future::pending::<()>().await;
        }
        let output = if self.linux {
            format!("{command}\r\nLinux analog 5.10.0-98248-g1bad4d5 #1 SMP PREEMPT armv7l GNU/Linux\r\n# ")
        } else {
            format!("{command}\r\nUnknown command '{command}' - try 'help'\r\nZynq> ")
        };
        let found = output
            .lines()
            .skip(1)
            .any(|line| line.contains(marker));
        Ok(CommandEcho { output, found })
    }

    async fn discover_ip(&mut self, _timeout: Duration) -> ChannelResult<Option<IpAddr>> {
        self.journal.record(Call::DiscoverIp);
        Ok(self.ips.pop_front().unwrap_or(self.fallback_ip))
    }

    async fn request_dhcp(&mut self, _timeout: Duration) -> ChannelResult<()> {
        self.journal.record(Call::RequestDhcp);
        if let Some(ip) = self.dhcp_ip {
            self.fallback_ip = Some(ip);
        }
        Ok(())
    }

    async fn enter_loader_from_power_cycle(&mut self, _timeout: Duration) -> ChannelResult<()> {
        self.journal.record(Call::EnterLoader);
        if self.fail_loader {
            return Err(ChannelError::UnexpectedOutput(
                "fake: autoboot banner not seen".into(),
            ));
        }
        Ok(())
    }

    async fn load_boot_assets(
        &mut self,
        _assets: &BootAssetSet,
        _timeout: Duration,
    ) -> ChannelResult<()> {
        self.journal.record(Call::LoadBootAssets);
        self.load_result()
    }

    async fn load_boot_assets_via_tftp(
        &mut self,
        _assets: &BootAssetSet,
        _timeout: Duration,
    ) -> ChannelResult<()> {
        self.journal.record(Call::LoadBootAssetsViaTftp);
        self.load_result()
    }

    async fn boot_default(&mut self, _timeout: Duration) -> ChannelResult<()> {
        self.journal.record(Call::BootDefault);
        self.load_result()
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> ChannelResult<()> {
        self.journal.record(Call::WriteRaw(bytes.to_vec()));
        if self.fail_writes {
            return Err(ChannelError::Transport("fake: console write failed".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeNetwork
// ---------------------------------------------------------------------------

/// Network channel with per-address reachability and scripted boot checks.
#[derive(Debug)]
pub struct FakeNetwork {
    journal: Journal,
    reachable: HashSet<IpAddr>,
    ssh: bool,
    reboot_fails: bool,
    update_fails: bool,
    boot_results: Mutex<VecDeque<bool>>,
    booted_default: bool,
}

impl FakeNetwork {
    /// Nothing answers pings, SSH works, boot checks pass.
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            reachable: HashSet::new(),
            ssh: true,
            reboot_fails: false,
            update_fails: false,
            boot_results: Mutex::new(VecDeque::new()),
            booted_default: true,
        }
    }

    pub fn reachable(mut self, ip: IpAddr) -> Self {
        self.reachable.insert(ip);
        self
    }

    pub fn ssh_working(mut self, working: bool) -> Self {
        self.ssh = working;
        self
    }

    pub fn failing_reboot(mut self) -> Self {
        self.reboot_fails = true;
        self
    }

    pub fn failing_update(mut self) -> Self {
        self.update_fails = true;
        self
    }

    /// Answers for successive boot checks, before falling back to `booted`.
    pub fn boot_results(mut self, results: impl IntoIterator<Item = bool>) -> Self {
        self.boot_results = Mutex::new(results.into_iter().collect());
        self
    }

    pub fn booted(mut self, booted: bool) -> Self {
        self.booted_default = booted;
        self
    }
}

#[async_trait]
impl NetworkChannel for FakeNetwork {
    async fn ping(&self, target: IpAddr, _timeout: Duration) -> ChannelResult<bool> {
        self.journal.record(Call::Ping(target));
        Ok(self.reachable.contains(&target))
    }

    async fn ssh_functional(&self, target: IpAddr, _timeout: Duration) -> ChannelResult<bool> {
        self.journal.record(Call::SshCheck(target));
        Ok(self.ssh)
    }

    async fn reboot_board(&self, target: IpAddr, _timeout: Duration) -> ChannelResult<()> {
        self.journal.record(Call::Reboot(target));
        if self.reboot_fails {
            return Err(ChannelError::CommandFailed {
                command: "reboot".into(),
                reason: "fake: connection refused".into(),
            });
        }
        Ok(())
    }

    async fn check_board_booted(&self, target: IpAddr, _timeout: Duration) -> ChannelResult<()> {
        self.journal.record(Call::CheckBooted(target));
        let booted = self
            .boot_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.booted_default);
        if booted {
            Ok(())
        } else {
            Err(ChannelError::NotBooted(format!("fake: {target} not booted")))
        }
    }

    async fn update_boot_partition(
        &self,
        target: IpAddr,
        _assets: &BootAssetSet,
        _timeout: Duration,
    ) -> ChannelResult<()> {
        self.journal.record(Call::UpdateBootPartition(target));
        if self.update_fails {
            return Err(ChannelError::CommandFailed {
                command: "scp".into(),
                reason: "fake: no space left on device".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakePower, FakeLogMonitor, FakeVerifier
// ---------------------------------------------------------------------------

/// PDU outlet that records power cycles.
///
/// `PowerCycle` is recorded when the outlet is switched off and `PowerOn`
/// once it is back on, so a cycle cut short shows up as an unmatched off.
#[derive(Debug)]
pub struct FakePower {
    journal: Journal,
    fails: bool,
    request_delay: Duration,
}

impl FakePower {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fails: false,
            request_delay: Duration::ZERO,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    /// Latency of each of the two outlet requests.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }
}

#[async_trait]
impl PowerController for FakePower {
    async fn power_cycle(&self, off_duration: Duration) -> ChannelResult<()> {
        self.journal.record(Call::PowerCycle(off_duration));
        if self.fails {
            return Err(ChannelError::Transport("fake: pdu unreachable".into()));
        }
        tokio::time::sleep(self.request_delay).await;
        tokio::time::sleep(off_duration).await;
        tokio::time::sleep(self.request_delay).await;
        self.journal.record(Call::PowerOn);
        Ok(())
    }
}

/// Log-only monitor, like a netconsole capture.
#[derive(Debug)]
pub struct FakeLogMonitor {
    journal: Journal,
    label: String,
}

impl FakeLogMonitor {
    pub fn new(journal: &Journal, label: &str) -> Self {
        Self {
            journal: journal.clone(),
            label: label.to_string(),
        }
    }
}

#[async_trait]
impl ConsoleLog for FakeLogMonitor {
    fn label(&self) -> &str {
        &self.label
    }

    async fn start_log(&mut self) -> ChannelResult<()> {
        self.journal.record(Call::StartLog(self.label.clone()));
        Ok(())
    }

    async fn stop_log(&mut self) -> ChannelResult<()> {
        self.journal.record(Call::StopLog(self.label.clone()));
        Ok(())
    }
}

/// Driver verifier with a fixed verdict.
#[derive(Debug)]
pub struct FakeVerifier {
    journal: Journal,
    passes: bool,
}

impl FakeVerifier {
    pub fn new(journal: &Journal, passes: bool) -> Self {
        Self {
            journal: journal.clone(),
            passes,
        }
    }
}

#[async_trait]
impl DriverVerifier for FakeVerifier {
    async fn run_all_checks(&self, uri: &str) -> ChannelResult<()> {
        self.journal.record(Call::DriverChecks(uri.to_string()));
        if self.passes {
            Ok(())
        } else {
            Err(ChannelError::CommandFailed {
                command: format!("iio_info -u {uri}"),
                reason: "fake: no iio devices found".into(),
            })
        }
    }
}

/// Assemble a board from fakes.
pub fn fake_board(
    ip: Option<IpAddr>,
    console: FakeConsole,
    network: FakeNetwork,
    power: FakePower,
) -> BoardHandle {
    BoardHandle::new(
        "fake-board",
        BoardIdentity::new(ip),
        Box::new(console),
        Box::new(network),
        Box::new(power),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_console_reports_linux_marker() {
        let journal = Journal::new();
        let mut console = FakeConsole::new(&journal);
        let echo = console
            .run_command_expect("uname -a", "Linux", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(echo.found);

        let mut down = FakeConsole::new(&journal).linux_alive(false);
        let echo = down
            .run_command_expect("uname -a", "Linux", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!echo.found);
        assert_eq!(journal.count(|c| matches!(c, Call::RunCommand(_))), 2);
    }

    #[tokio::test]
    async fn test_fake_console_dhcp_assigns_address() {
        let journal = Journal::new();
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let mut console = FakeConsole::new(&journal).with_dhcp_ip(ip);
        let t = Duration::from_secs(1);
        assert_eq!(console.discover_ip(t).await.unwrap(), None);
        console.request_dhcp(t).await.unwrap();
        assert_eq!(console.discover_ip(t).await.unwrap(), Some(ip));
    }

    #[tokio::test]
    async fn test_fake_network_boot_script_then_default() {
        let journal = Journal::new();
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let net = FakeNetwork::new(&journal).boot_results([false]);
        let t = Duration::from_secs(1);
        assert!(net.check_board_booted(ip, t).await.is_err());
        assert!(net.check_board_booted(ip, t).await.is_ok());
        assert_eq!(journal.first(|c| c.target() == Some(ip)), Some(0));
    }
}
