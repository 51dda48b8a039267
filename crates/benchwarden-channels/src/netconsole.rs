//! UDP netconsole capture.
//!
//! The boot loader and the kernel each stream their console over UDP to a
//! fixed port; one monitor per port appends every datagram to its log file.

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use benchwarden_core::config::NetconsoleConfig;
use benchwarden_core::{ChannelError, ChannelResult, ConsoleLog};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tcp_console::{open_log, session_banner};

struct Capture {
    stop: oneshot::Sender<()>,
    task: JoinHandle<ChannelResult<u64>>,
}

/// Log-only monitor bound to one UDP port.
pub struct NetconsoleMonitor {
    label: String,
    bind: String,
    port: u16,
    log_path: PathBuf,
    local_addr: Option<SocketAddr>,
    capture: Option<Capture>,
}

impl NetconsoleMonitor {
    pub fn new(label: impl Into<String>, bind: impl Into<String>, port: u16, log_path: PathBuf) -> Self {
        Self {
            label: label.into(),
            bind: bind.into(),
            port,
            log_path,
            local_addr: None,
            capture: None,
        }
    }

    /// Boot-loader stream (port 6666 by default).
    pub fn bootloader(config: &NetconsoleConfig) -> Self {
        Self::new(
            "netconsole-bootloader",
            config.bind.clone(),
            config.bootloader_port,
            config.bootloader_log.clone(),
        )
    }

    /// Kernel stream (port 6669 by default).
    pub fn kernel(config: &NetconsoleConfig) -> Self {
        Self::new(
            "netconsole-kernel",
            config.bind.clone(),
            config.kernel_port,
            config.kernel_log.clone(),
        )
    }

    /// Address actually bound while capturing.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl ConsoleLog for NetconsoleMonitor {
    fn label(&self) -> &str {
        &self.label
    }

    async fn start_log(&mut self) -> ChannelResult<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let socket = UdpSocket::bind((self.bind.as_str(), self.port)).await?;
        let mut file = open_log(&self.log_path).await?;
        file.write_all(session_banner(&self.label).as_bytes()).await?;
        self.local_addr = Some(socket.local_addr()?);

        let (stop, mut stopped) = oneshot::channel();
        let label = self.label.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut received = 0u64;
            loop {
                tokio::select! {
                    biased;
                    recv = socket.recv_from(&mut buf) => {
                        let (n, from) = recv?;
                        debug!(monitor = %label, from = %from, bytes = n, "netconsole datagram");
                        file.write_all(&buf[..n]).await?;
                        received += n as u64;
                    }
                    _ = &mut stopped => break,
                }
            }
            file.flush().await?;
            Ok::<_, ChannelError>(received)
        });

        info!(monitor = %self.label, addr = ?self.local_addr, path = %self.log_path.display(), "netconsole capture started");
        self.capture = Some(Capture { stop, task });
        Ok(())
    }

    async fn stop_log(&mut self) -> ChannelResult<()> {
        let Some(capture) = self.capture.take() else {
            return Ok(());
        };
        if capture.stop.send(()).is_err() {
            warn!(monitor = %self.label, "netconsole capture already ended");
        }
        let received = capture
            .task
            .await
            .map_err(|e| ChannelError::Transport(format!("netconsole task failed: {e}")))??;
        self.local_addr = None;
        info!(monitor = %self.label, bytes = received, "netconsole capture stopped");
        Ok(())
    }
}
