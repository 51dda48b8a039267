//! Board identity and the bundle of channels that reach one board.

use std::fmt;
use std::net::IpAddr;

use crate::channels::{ConsoleChannel, NetworkChannel, PowerController};

/// Last-known network identity of a board.
///
/// The IP and the driver URI derived from it are private and change only
/// together through [`BoardIdentity::rebind`], so no reader can observe one
/// without the other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardIdentity {
    ip: Option<IpAddr>,
    driver_uri: Option<String>,
}

impl BoardIdentity {
    pub fn new(ip: Option<IpAddr>) -> Self {
        Self {
            ip,
            driver_uri: ip.map(driver_uri_for),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Address in the `ip:<addr>` form used by driver tooling.
    pub fn driver_uri(&self) -> Option<&str> {
        self.driver_uri.as_deref()
    }

    /// Point the identity at `ip`. Returns `true` if it changed.
    pub fn rebind(&mut self, ip: IpAddr) -> bool {
        if self.ip == Some(ip) {
            return false;
        }
        self.ip = Some(ip);
        self.driver_uri = Some(driver_uri_for(ip));
        true
    }
}

fn driver_uri_for(ip: IpAddr) -> String {
    format!("ip:{ip}")
}

/// Everything needed to act on one board.
///
/// Recovery borrows this mutably for the whole run, so two runs can never
/// drive the same board's channels at once. Separate boards are separate
/// values and recover independently.
pub struct BoardHandle {
    name: String,
    identity: BoardIdentity,
    pub(crate) console: Box<dyn ConsoleChannel>,
    pub(crate) network: Box<dyn NetworkChannel>,
    pub(crate) power: Box<dyn PowerController>,
}

impl BoardHandle {
    pub fn new(
        name: impl Into<String>,
        identity: BoardIdentity,
        console: Box<dyn ConsoleChannel>,
        network: Box<dyn NetworkChannel>,
        power: Box<dyn PowerController>,
    ) -> Self {
        Self {
            name: name.into(),
            identity,
            console,
            network,
            power,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &BoardIdentity {
        &self.identity
    }

    pub(crate) fn identity_mut(&mut self) -> &mut BoardIdentity {
        &mut self.identity
    }

    pub fn console_mut(&mut self) -> &mut dyn ConsoleChannel {
        self.console.as_mut()
    }
}

impl fmt::Debug for BoardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardHandle")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
