//! Serial console reached through a TCP console server.
//!
//! [`ConsoleSession`] is generic over the byte stream so the protocol logic
//! can be exercised against an in-memory duplex; [`TcpConsole`] is the
//! production instantiation over a `TcpStream`.
//!
//! Every byte read from the board is appended to the session log while it
//! is open, regardless of which operation consumed it.

use std::net::IpAddr;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use benchwarden_core::config::ConsoleConfig;
use benchwarden_core::{
    AssetKind, BootAssetSet, ChannelError, ChannelResult, CommandEcho, ConsoleChannel, ConsoleLog,
};
use regex::Regex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{remaining, xmodem};

/// Printed by the shell after every command; typed split so the echoed
/// command line never matches.
const SENTINEL: &str = "__BW_END__";
const SENTINEL_TYPED: &str = "__BW_''END__";
/// `loadx` announces itself with this before the receiver asks for data.
const LOADX_READY: &str = "Ready for binary";
/// Per-response wait inside an XMODEM transfer.
const XMODEM_WAIT: Duration = Duration::from_secs(10);
/// Quiet gap that ends a flush early.
const DRAIN_QUIET: Duration = Duration::from_millis(100);
/// Upper bound on a flush, for consoles that never go quiet.
const DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// Production console over TCP.
pub type TcpConsole = ConsoleSession<TcpStream>;

impl ConsoleSession<TcpStream> {
    /// Connect to `host:port` from the console settings.
    pub async fn connect(config: ConsoleConfig, timeout: Duration) -> ChannelResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        info!(addr = %addr, "connecting to console server");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ChannelError::Timeout {
                operation: "console.connect",
                limit_ms: timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, config))
    }
}

/// Line-oriented session on top of a raw console byte stream.
pub struct ConsoleSession<S> {
    stream: S,
    config: ConsoleConfig,
    label: String,
    /// Bytes read from the board but not yet consumed.
    pending: Vec<u8>,
    log: Option<File>,
}

impl<S> ConsoleSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, config: ConsoleConfig) -> Self {
        Self {
            stream,
            config,
            label: "uart".to_string(),
            pending: Vec::new(),
            log: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    async fn fill(&mut self) -> ChannelResult<()> {
        let mut chunk = [0u8; 1024];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ChannelError::Transport("console connection closed".into()));
        }
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.write_all(&chunk[..n]).await {
                warn!(error = %e, "console log write failed, closing log");
                self.log = None;
            }
        }
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Read until one of `markers` shows up. Returns everything up to and
    /// including the marker, plus which marker matched.
    async fn read_until_any(
        &mut self,
        markers: &[&str],
        operation: &'static str,
        limit: Duration,
    ) -> ChannelResult<(String, usize)> {
        match tokio::time::timeout(limit, self.scan(markers)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                operation,
                limit_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn scan(&mut self, markers: &[&str]) -> ChannelResult<(String, usize)> {
        loop {
            let hit = markers
                .iter()
                .enumerate()
                .filter_map(|(i, m)| find(&self.pending, m.as_bytes()).map(|at| (at + m.len(), i)))
                .min();
            if let Some((end, which)) = hit {
                let consumed: Vec<u8> = self.pending.drain(..end).collect();
                return Ok((String::from_utf8_lossy(&consumed).to_string(), which));
            }
            self.fill().await?;
        }
    }

    async fn read_until(
        &mut self,
        marker: &str,
        operation: &'static str,
        limit: Duration,
    ) -> ChannelResult<String> {
        self.read_until_any(&[marker], operation, limit)
            .await
            .map(|(text, _)| text)
    }

    /// Read (and log) whatever the board is sending until a quiet gap or
    /// `until`, whichever comes first.
    async fn drain(&mut self, until: Instant) -> ChannelResult<()> {
        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            match tokio::time::timeout(DRAIN_QUIET.min(left), self.fill()).await {
                Ok(result) => result?,
                Err(_) => return Ok(()),
            }
        }
    }

    async fn send_line(&mut self, line: &str) -> ChannelResult<()> {
        debug!(line, "console <<");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Issue a boot-loader command and wait for the prompt to come back.
    async fn loader_command(
        &mut self,
        command: &str,
        operation: &'static str,
        deadline: Instant,
    ) -> ChannelResult<String> {
        self.send_line(command).await?;
        let prompt = self.config.loader_prompt.clone();
        self.read_until(&prompt, operation, remaining(deadline, operation)?)
            .await
    }

    /// `loadx` one asset into RAM at `address`.
    async fn upload(
        &mut self,
        assets: &BootAssetSet,
        kind: AssetKind,
        address: u64,
        deadline: Instant,
    ) -> ChannelResult<()> {
        let path = assets.path(kind);
        let image = tokio::fs::read(path).await?;
        info!(asset = %kind, bytes = image.len(), address = %format!("{address:#x}"), "uploading over console");

        self.send_line(&format!("loadx {address:#x}")).await?;
        self.read_until(LOADX_READY, "console.loadx", remaining(deadline, "console.loadx")?)
            .await?;
        let buffered = std::mem::take(&mut self.pending);
        let limit = remaining(deadline, "console.xmodem")?;
        let blocks = tokio::time::timeout(
            limit,
            xmodem::send(&mut self.stream, &buffered, &image, XMODEM_WAIT),
        )
        .await
        .map_err(|_| ChannelError::Timeout {
            operation: "console.xmodem",
            limit_ms: limit.as_millis() as u64,
        })??;
        debug!(asset = %kind, blocks, "xmodem transfer complete");

        let prompt = self.config.loader_prompt.clone();
        self.read_until(&prompt, "console.loadx", remaining(deadline, "console.loadx")?)
            .await?;
        Ok(())
    }

    /// `tftpboot` one asset into RAM at `address`.
    async fn fetch(
        &mut self,
        assets: &BootAssetSet,
        kind: AssetKind,
        address: u64,
        deadline: Instant,
    ) -> ChannelResult<()> {
        let name = remote_name(assets.path(kind))?;
        info!(asset = %kind, file = %name, "fetching over tftp");
        let output = self
            .loader_command(
                &format!("tftpboot {address:#x} {name}"),
                "console.tftpboot",
                deadline,
            )
            .await?;
        if !output.contains("Bytes transferred") {
            return Err(ChannelError::UnexpectedOutput(format!(
                "tftpboot of {name} did not complete: {}",
                output.trim()
            )));
        }
        Ok(())
    }

    /// Program the bitstream and hand the kernel over to `bootm`.
    async fn program_and_boot(
        &mut self,
        assets: &BootAssetSet,
        deadline: Instant,
    ) -> ChannelResult<()> {
        let addresses = self.config.load_addresses;
        let size = assets.size(AssetKind::SystemTopBit);
        let output = self
            .loader_command(
                &format!("fpga loadb 0 {:#x} {size:#x}", addresses.bitstream),
                "console.fpga_loadb",
                deadline,
            )
            .await?;
        if output.contains("ERROR") || output.contains("error") {
            return Err(ChannelError::UnexpectedOutput(format!(
                "fpga programming failed: {}",
                output.trim()
            )));
        }

        self.send_line(&format!(
            "bootm {:#x} - {:#x}",
            addresses.kernel, addresses.devicetree
        ))
        .await?;
        let marker = self.config.kernel_start_marker.clone();
        self.read_until(&marker, "console.bootm", remaining(deadline, "console.bootm")?)
            .await?;
        info!("kernel started");
        Ok(())
    }
}

#[async_trait]
impl<S> ConsoleLog for ConsoleSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn label(&self) -> &str {
        &self.label
    }

    async fn start_log(&mut self) -> ChannelResult<()> {
        if self.log.is_some() {
            return Ok(());
        }
        let mut file = open_log(&self.config.log_path).await?;
        file.write_all(session_banner(&self.label).as_bytes())
            .await?;
        info!(path = %self.config.log_path.display(), "console log started");
        self.log = Some(file);
        Ok(())
    }

    async fn stop_log(&mut self) -> ChannelResult<()> {
        if let Some(mut file) = self.log.take() {
            file.flush().await?;
            info!(path = %self.config.log_path.display(), "console log stopped");
        }
        Ok(())
    }
}

#[async_trait]
impl<S> ConsoleChannel for ConsoleSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn discard_buffered(&mut self) -> ChannelResult<()> {
        let drained = self.drain(Instant::now() + DRAIN_LIMIT).await;
        self.pending.clear();
        drained
    }

    async fn run_command_expect(
        &mut self,
        command: &str,
        marker: &str,
        timeout: Duration,
    ) -> ChannelResult<CommandEcho> {
        self.send_line(&format!("{command}; echo {SENTINEL_TYPED}"))
            .await?;
        let prompt = self.config.loader_prompt.clone();
        let (output, which) = self
            .read_until_any(&[SENTINEL, prompt.as_str()], "console.command", timeout)
            .await?;
        // The first line is the echoed command.
        let body = output.split_once('\n').map_or("", |(_, rest)| rest);
        let found = which == 0 && body.contains(marker);
        if which == 1 {
            debug!("boot loader prompt answered instead of a shell");
        }
        Ok(CommandEcho { output, found })
    }

    async fn discover_ip(&mut self, timeout: Duration) -> ChannelResult<Option<IpAddr>> {
        let command = format!("ip -4 addr show {}", self.config.interface);
        let echo = self.run_command_expect(&command, "inet ", timeout).await?;
        if !echo.found {
            return Ok(None);
        }
        Ok(parse_ipv4(&echo.output))
    }

    async fn request_dhcp(&mut self, timeout: Duration) -> ChannelResult<()> {
        let command = self.config.dhcp_command.clone();
        info!(command = %command, "requesting DHCP lease");
        self.run_command_expect(&command, "", timeout).await?;
        Ok(())
    }

    async fn enter_loader_from_power_cycle(&mut self, timeout: Duration) -> ChannelResult<()> {
        let deadline = Instant::now() + timeout;
        let banner = self.config.autoboot_banner.clone();
        self.read_until(&banner, "console.autoboot", timeout).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await?;
        let prompt = self.config.loader_prompt.clone();
        self.read_until(&prompt, "console.loader_prompt", remaining(deadline, "console.loader_prompt")?)
            .await?;
        info!("stopped autoboot at boot loader prompt");
        Ok(())
    }

    async fn load_boot_assets(
        &mut self,
        assets: &BootAssetSet,
        timeout: Duration,
    ) -> ChannelResult<()> {
        let deadline = Instant::now() + timeout;
        let addresses = self.config.load_addresses;
        self.upload(assets, AssetKind::SystemTopBit, addresses.bitstream, deadline)
            .await?;
        self.upload(assets, AssetKind::KernelImage, addresses.kernel, deadline)
            .await?;
        self.upload(assets, AssetKind::Devicetree, addresses.devicetree, deadline)
            .await?;
        self.program_and_boot(assets, deadline).await
    }

    async fn load_boot_assets_via_tftp(
        &mut self,
        assets: &BootAssetSet,
        timeout: Duration,
    ) -> ChannelResult<()> {
        let deadline = Instant::now() + timeout;
        if let Some(server) = self.config.tftp_server.clone() {
            self.loader_command(&format!("setenv serverip {server}"), "console.setenv", deadline)
                .await?;
        }
        let addresses = self.config.load_addresses;
        self.fetch(assets, AssetKind::SystemTopBit, addresses.bitstream, deadline)
            .await?;
        self.fetch(assets, AssetKind::KernelImage, addresses.kernel, deadline)
            .await?;
        self.fetch(assets, AssetKind::Devicetree, addresses.devicetree, deadline)
            .await?;
        self.program_and_boot(assets, deadline).await
    }

    async fn boot_default(&mut self, timeout: Duration) -> ChannelResult<()> {
        let command = self.config.boot_command.clone();
        self.send_line(&command).await?;
        let marker = self.config.kernel_start_marker.clone();
        self.read_until(&marker, "console.boot", timeout).await?;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> ChannelResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn remote_name(path: &Path) -> ChannelResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ChannelError::Transport(format!("no file name in {}", path.display())))
}

/// First non-loopback IPv4 address in `ip addr` output.
pub fn parse_ipv4(output: &str) -> Option<IpAddr> {
    static INET: OnceLock<Option<Regex>> = OnceLock::new();
    let re = INET
        .get_or_init(|| Regex::new(r"inet (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").ok())
        .as_ref()?;
    re.captures_iter(output)
        .filter_map(|c| c[1].parse::<IpAddr>().ok())
        .find(|ip| !ip.is_loopback())
}

pub(crate) async fn open_log(path: &Path) -> ChannelResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

pub(crate) fn session_banner(label: &str) -> String {
    format!(
        "\n===== {label} log started {} =====\n",
        chrono::Utc::now().to_rfc3339()
    )
}
