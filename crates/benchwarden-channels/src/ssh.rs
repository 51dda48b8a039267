//! Network channel over the system `ping`, `ssh` and `scp` binaries.
//!
//! Key-based batch mode by default; `sshpass` wraps each call when a
//! password is configured. The board address arrives with every call.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use benchwarden_core::config::NetworkConfig;
use benchwarden_core::{
    AssetKind, BootAssetSet, ChannelError, ChannelResult, NetworkChannel,
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::process::{run_process, ProcessOutput};
use crate::remaining;

/// One subprocess to run: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    async fn run(&self, operation: &'static str, timeout: Duration) -> ChannelResult<ProcessOutput> {
        run_process(operation, &self.program, &self.args, timeout).await
    }
}

pub struct SshNetwork {
    config: NetworkConfig,
}

impl SshNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    /// `ping` exactly once, waiting at most `timeout` for the reply.
    pub fn ping_invocation(&self, target: IpAddr, timeout: Duration) -> Invocation {
        let wait = timeout.as_secs().max(1);
        Invocation::new("ping")
            .args(["-c", "1", "-W"])
            .arg(wait.to_string())
            .arg(target.to_string())
    }

    fn common_options(&self, timeout: Duration) -> Vec<String> {
        let mut opts: Vec<String> = vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ConnectTimeout={}", timeout.as_secs().max(1)),
        ];
        if self.config.password.is_none() {
            opts.push("-o".into());
            opts.push("BatchMode=yes".into());
        }
        if let Some(identity) = &self.config.identity_file {
            opts.push("-i".into());
            opts.push(identity.display().to_string());
        }
        opts
    }

    fn wrap(&self, program: &str) -> Invocation {
        match &self.config.password {
            Some(password) => Invocation::new("sshpass").args(["-p", password.as_str(), program]),
            None => Invocation::new(program),
        }
    }

    /// Run `remote` on the board through `ssh`.
    pub fn ssh_invocation(&self, target: IpAddr, remote: &str, timeout: Duration) -> Invocation {
        self.wrap("ssh")
            .args(self.common_options(timeout))
            .arg("-p")
            .arg(self.config.ssh_port.to_string())
            .arg(format!("{}@{}", self.config.user, target))
            .arg(remote)
    }

    /// Copy `local` to `remote_path` on the board through `scp`.
    pub fn scp_invocation(
        &self,
        target: IpAddr,
        local: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Invocation {
        self.wrap("scp")
            .args(self.common_options(timeout))
            .arg("-P")
            .arg(self.config.ssh_port.to_string())
            .arg(local.display().to_string())
            .arg(format!("{}@{}:{}", self.config.user, target, remote_path))
    }

    async fn ssh(
        &self,
        target: IpAddr,
        remote: &str,
        operation: &'static str,
        timeout: Duration,
    ) -> ChannelResult<ProcessOutput> {
        debug!(target = %target, remote, "ssh");
        self.ssh_invocation(target, remote, timeout)
            .run(operation, timeout)
            .await
    }

    /// Send a command that ends with `reboot`; the connection dropping is
    /// the expected answer.
    async fn ssh_reboot(
        &self,
        target: IpAddr,
        remote: &str,
        timeout: Duration,
    ) -> ChannelResult<()> {
        let out = self.ssh(target, remote, "network.reboot", timeout).await?;
        if out.success() || connection_dropped(&out) {
            return Ok(());
        }
        out.checked(remote).map(|_| ())
    }
}

fn connection_dropped(out: &ProcessOutput) -> bool {
    out.exit_code == Some(255) && out.stderr.contains("closed by remote host")
}

#[async_trait]
impl NetworkChannel for SshNetwork {
    async fn ping(&self, target: IpAddr, timeout: Duration) -> ChannelResult<bool> {
        // Leave ping's own wait room to exit before the process is killed.
        let out = self
            .ping_invocation(target, timeout)
            .run("network.ping", timeout + Duration::from_secs(1))
            .await?;
        Ok(out.success())
    }

    async fn ssh_functional(&self, target: IpAddr, timeout: Duration) -> ChannelResult<bool> {
        let out = self.ssh(target, "true", "network.ssh", timeout).await?;
        Ok(out.success())
    }

    async fn reboot_board(&self, target: IpAddr, timeout: Duration) -> ChannelResult<()> {
        info!(target = %target, "rebooting board over ssh");
        self.ssh_reboot(target, "reboot", timeout).await
    }

    async fn check_board_booted(&self, target: IpAddr, timeout: Duration) -> ChannelResult<()> {
        let deadline = Instant::now() + timeout;
        if !self.ping(target, remaining(deadline, "network.ping")?).await? {
            return Err(ChannelError::NotBooted(format!("{target} does not answer ping")));
        }
        let out = self
            .ssh(
                target,
                "uname -a",
                "network.check_booted",
                remaining(deadline, "network.check_booted")?,
            )
            .await?;
        if !out.success() || !out.stdout.contains("Linux") {
            return Err(ChannelError::NotBooted(format!(
                "{target} answers ping but no Linux shell: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn update_boot_partition(
        &self,
        target: IpAddr,
        assets: &BootAssetSet,
        timeout: Duration,
    ) -> ChannelResult<()> {
        let deadline = Instant::now() + timeout;
        let mount = &self.config.mount_point;
        let partition = &self.config.boot_partition;
        info!(target = %target, partition = %partition, "updating boot partition");

        let mount_cmd = format!("mkdir -p {mount} && (mountpoint -q {mount} || mount {partition} {mount})");
        self.ssh(target, &mount_cmd, "network.mount", remaining(deadline, "network.mount")?)
            .await?
            .checked(&mount_cmd)?;

        for kind in AssetKind::ALL {
            let local = assets.path(kind);
            let name = local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ChannelError::Transport(format!("no file name in {}", local.display())))?;
            let remote_path = format!("{mount}/{name}");
            debug!(asset = %kind, remote = %remote_path, "copying");
            let scp = self.scp_invocation(target, local, &remote_path, timeout);
            scp.run("network.scp", remaining(deadline, "network.scp")?)
                .await?
                .checked("scp")?;
        }

        let finish = format!("sync && umount {mount} && reboot");
        self.ssh_reboot(target, &finish, remaining(deadline, "network.reboot")?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ip() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn test_key_based_ssh_uses_batch_mode() {
        let net = SshNetwork::new(NetworkConfig {
            identity_file: Some(PathBuf::from("/home/lab/.ssh/id_ed25519")),
            ..NetworkConfig::default()
        });
        let inv = net.ssh_invocation(ip(), "true", Duration::from_secs(10));
        assert_eq!(inv.program, "ssh");
        assert!(inv.args.contains(&"BatchMode=yes".to_string()));
        assert!(inv.args.contains(&"/home/lab/.ssh/id_ed25519".to_string()));
        assert!(inv.args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(inv.args[inv.args.len() - 2], "root@10.0.0.5");
        assert_eq!(inv.args.last().unwrap(), "true");
    }

    #[test]
    fn test_password_wraps_in_sshpass() {
        let net = SshNetwork::new(NetworkConfig {
            password: Some("analog".into()),
            ssh_port: 2222,
            ..NetworkConfig::default()
        });
        let inv = net.scp_invocation(
            ip(),
            Path::new("/tmp/assets/BOOT.BIN"),
            "/tmp/sdcard/BOOT.BIN",
            Duration::from_secs(30),
        );
        assert_eq!(inv.program, "sshpass");
        assert_eq!(&inv.args[..3], &["-p", "analog", "scp"]);
        assert!(!inv.args.contains(&"BatchMode=yes".to_string()));
        let port = inv.args.iter().position(|a| a == "-P").unwrap();
        assert_eq!(inv.args[port + 1], "2222");
        assert_eq!(inv.args.last().unwrap(), "root@10.0.0.5:/tmp/sdcard/BOOT.BIN");
    }

    #[test]
    fn test_ping_waits_at_least_one_second() {
        let net = SshNetwork::new(NetworkConfig::default());
        let inv = net.ping_invocation(ip(), Duration::from_millis(200));
        assert_eq!(inv.args, vec!["-c", "1", "-W", "1", "10.0.0.5"]);
    }

    #[test]
    fn test_dropped_connection_counts_as_rebooting() {
        let out = ProcessOutput {
            exit_code: Some(255),
            stdout: String::new(),
            stderr: "Connection to 10.0.0.5 closed by remote host.".into(),
            duration_ms: 20,
        };
        assert!(connection_dropped(&out));
        let refused = ProcessOutput {
            stderr: "ssh: connect to host 10.0.0.5 port 22: Connection refused".into(),
            ..out
        };
        assert!(!connection_dropped(&refused));
    }
}
