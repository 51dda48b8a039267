//! Error taxonomy for board recovery.
//!
//! Two layers:
//! - [`ChannelError`] is what a console, network, power or driver adapter
//!   reports. It is deliberately coarse; adapters do not classify.
//! - [`RecoveryError`] is the classified failure handed back to the caller of
//!   a recovery run. Exactly one of these ends a failed run.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::assets::AssetKind;

/// Errors produced by a side-channel adapter.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{operation} timed out after {limit_ms}ms")]
    Timeout {
        operation: &'static str,
        limit_ms: u64,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("unexpected console output: {0}")]
    UnexpectedOutput(String),

    #[error("board has not booted: {0}")]
    NotBooted(String),

    #[error("no IP address discovered for the board")]
    NoAddress,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for channel operations.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Classified failure of a whole recovery run.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("boot asset {asset} not found or unreadable: {}", path.display())]
    AssetMissing { asset: AssetKind, path: PathBuf },

    #[error("network not functional: no IP address after DHCP request")]
    NetworkNotFunctional,

    #[error("network not functional after boot file update")]
    NetworkNotFunctionalAfterBootFileUpdate,

    #[error("ssh not functional after boot file update (board at {ip})")]
    SshNotFunctionalAfterBootFileUpdate { ip: IpAddr },

    #[error("getting board back failed: {last}")]
    RecoveryExhausted {
        #[source]
        last: ChannelError,
    },

    #[error("{step} failed: {source}")]
    Channel {
        step: &'static str,
        #[source]
        source: ChannelError,
    },

    #[error("recovery cancelled at {checkpoint}")]
    Cancelled { checkpoint: &'static str },

    #[error("recovery deadline of {limit_ms}ms exceeded at {checkpoint}")]
    DeadlineExceeded {
        checkpoint: &'static str,
        limit_ms: u64,
    },
}

impl RecoveryError {
    /// Stable snake_case tag used in reports and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryError::AssetMissing { .. } => "asset_missing",
            RecoveryError::NetworkNotFunctional => "network_not_functional",
            RecoveryError::NetworkNotFunctionalAfterBootFileUpdate => {
                "network_not_functional_after_boot_file_update"
            }
            RecoveryError::SshNotFunctionalAfterBootFileUpdate { .. } => {
                "ssh_not_functional_after_boot_file_update"
            }
            RecoveryError::RecoveryExhausted { .. } => "recovery_exhausted",
            RecoveryError::Channel { .. } => "channel",
            RecoveryError::Cancelled { .. } => "cancelled",
            RecoveryError::DeadlineExceeded { .. } => "deadline_exceeded",
        }
    }

    pub(crate) fn channel(step: &'static str, source: ChannelError) -> Self {
        RecoveryError::Channel { step, source }
    }
}

/// Result type for recovery runs.
pub type RecoveryResult<T> = std::result::Result<T, RecoveryError>;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
