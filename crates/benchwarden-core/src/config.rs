//! Lab configuration document.
//!
//! One TOML file with an optional section per component. A missing section
//! means defaults for that component; the orchestrator itself only ever sees
//! [`RecoveryConfig`].
//!
//! ```toml
//! [board]
//! name = "zed-fmcomms2"
//! ip = "192.168.86.35"
//!
//! [console]
//! host = "lab-console-01"
//! port = 7001
//! log_path = "logs/uart.log"
//!
//! [network]
//! user = "root"
//! identity_file = "~/.ssh/lab_ed25519"
//!
//! [pdu]
//! base_url = "http://pdu-03.lab"
//! outlet = 4
//!
//! [recovery]
//! tftp = false
//!
//! [recovery.timings]
//! settle_after_power_cycle_ms = 45000
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::budget::RecoveryTimings;
use crate::error::{ConfigError, ConfigResult};

/// The whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub board: BoardConfig,
    pub console: ConsoleConfig,
    pub netconsole: NetconsoleConfig,
    pub network: NetworkConfig,
    pub pdu: PduConfig,
    pub recovery: RecoveryConfig,
    pub driver: Option<DriverConfig>,
}

impl LabConfig {
    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: LabConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.board.ip()?;
        if self.board.name.trim().is_empty() {
            return Err(ConfigError::Invalid("board.name must not be empty".into()));
        }
        if self.console.host.trim().is_empty() {
            return Err(ConfigError::Invalid("console.host must not be empty".into()));
        }
        if self.console.port == 0 {
            return Err(ConfigError::Invalid("console.port must not be 0".into()));
        }
        if self.pdu.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pdu.request_timeout_ms must be greater than 0".into(),
            ));
        }
        self.recovery.timings.validate()
    }

    /// Recovery options as the orchestrator should see them: the power-cycle
    /// bound follows the PDU's own request timeout.
    pub fn effective_recovery(&self) -> RecoveryConfig {
        let mut recovery = self.recovery.clone();
        recovery.timings.power_request_timeout_ms = self.pdu.request_timeout_ms;
        recovery
    }

    /// Copy with every password masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for secret in [&mut config.network.password, &mut config.pdu.password] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        config
    }
}

/// Stands in for a secret in printed configuration.
pub const REDACTED: &str = "********";

/// Identity of the board under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub name: String,
    /// Last-known address; discovery over the console overrides it.
    pub ip: Option<String>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: "board".to_string(),
            ip: None,
        }
    }
}

impl BoardConfig {
    pub fn ip(&self) -> ConfigResult<Option<IpAddr>> {
        self.ip
            .as_deref()
            .map(|raw| {
                raw.parse::<IpAddr>()
                    .map_err(|_| ConfigError::Invalid(format!("board.ip is not an address: {raw}")))
            })
            .transpose()
    }
}

/// What captures console output during a test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    /// The interactive serial console is also the log source.
    #[default]
    Uart,
    /// Additionally capture UDP netconsole streams (boot loader and kernel).
    Netconsole,
}

/// Boot-loader load addresses for the forced console/TFTP load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadAddresses {
    pub bitstream: u64,
    pub kernel: u64,
    pub devicetree: u64,
}

impl Default for LoadAddresses {
    fn default() -> Self {
        Self {
            bitstream: 0x0100_0000,
            kernel: 0x0300_0000,
            devicetree: 0x02A0_0000,
        }
    }
}

/// Serial console reached through a console server (ser2net or similar).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub monitor: MonitorKind,
    pub host: String,
    pub port: u16,
    pub log_path: PathBuf,
    /// Network interface whose address is reported.
    pub interface: String,
    pub autoboot_banner: String,
    pub loader_prompt: String,
    pub dhcp_command: String,
    /// Loader command used when booting with whatever it already has.
    pub boot_command: String,
    /// Marker printed once the loader hands over to the kernel.
    pub kernel_start_marker: String,
    pub load_addresses: LoadAddresses,
    /// Overrides the loader's `serverip` in TFTP mode.
    pub tftp_server: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorKind::Uart,
            host: "127.0.0.1".to_string(),
            port: 2000,
            log_path: PathBuf::from("uart.log"),
            interface: "eth0".to_string(),
            autoboot_banner: "Hit any key to stop autoboot".to_string(),
            loader_prompt: "Zynq>".to_string(),
            dhcp_command: "udhcpc -i eth0 -n -q".to_string(),
            boot_command: "boot".to_string(),
            kernel_start_marker: "Starting kernel".to_string(),
            load_addresses: LoadAddresses::default(),
            tftp_server: None,
        }
    }
}

/// UDP netconsole capture, used when `console.monitor = "netconsole"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetconsoleConfig {
    pub bind: String,
    pub bootloader_port: u16,
    pub bootloader_log: PathBuf,
    pub kernel_port: u16,
    pub kernel_log: PathBuf,
}

impl Default for NetconsoleConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            bootloader_port: 6666,
            bootloader_log: PathBuf::from("uboot.log"),
            kernel_port: 6669,
            kernel_log: PathBuf::from("kernel.log"),
        }
    }
}

/// SSH access to the running board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub user: String,
    /// Used through `sshpass` when set; key-based batch mode otherwise.
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub ssh_port: u16,
    pub boot_partition: String,
    pub mount_point: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: None,
            identity_file: None,
            ssh_port: 22,
            boot_partition: "/dev/mmcblk0p1".to_string(),
            mount_point: "/tmp/sdcard".to_string(),
        }
    }
}

/// HTTP-switched PDU outlet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PduConfig {
    pub base_url: String,
    pub outlet: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Path templates; `{outlet}` is substituted.
    pub off_path: String,
    pub on_path: String,
    pub request_timeout_ms: u64,
}

impl Default for PduConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".to_string(),
            outlet: 1,
            username: None,
            password: None,
            off_path: "/outlet/{outlet}/off".to_string(),
            on_path: "/outlet/{outlet}/on".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// The only options the recovery core reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Forced loads fetch over TFTP instead of uploading over the console.
    pub tftp: bool,
    pub timings: RecoveryTimings,
}

/// Post-recovery driver verification command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Shell command; `{uri}` becomes the board's `ip:<addr>` URI.
    pub command: String,
    pub timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: "iio_info -u {uri}".to_string(),
            timeout_ms: 60_000,
        }
    }
}
