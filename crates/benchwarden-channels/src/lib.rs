//! Benchwarden Channels: concrete side-channel adapters
//!
//! Implementations of the `benchwarden-core` channel traits for a typical
//! bench: a serial console behind a TCP console server, UDP netconsole
//! capture, SSH over the system OpenSSH client, an HTTP-switched PDU and a
//! command-line driver check.

pub mod driver;
pub mod netconsole;
pub mod pdu;
pub mod process;
pub mod ssh;
pub mod tcp_console;
pub mod xmodem;

use std::time::Duration;

use benchwarden_core::{ChannelError, ChannelResult};
use tokio::time::Instant;

pub use driver::CommandVerifier;
pub use netconsole::NetconsoleMonitor;
pub use pdu::HttpPdu;
pub use ssh::SshNetwork;
pub use tcp_console::{ConsoleSession, TcpConsole};

/// Time left before `deadline`, or a timeout for `operation` if none.
pub(crate) fn remaining(deadline: Instant, operation: &'static str) -> ChannelResult<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(ChannelError::Timeout {
            operation,
            limit_ms: 0,
        });
    }
    Ok(left)
}
