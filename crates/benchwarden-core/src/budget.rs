//! Bounded waits: retry budgets and the fixed timings of a recovery run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Attempt count paired with a wall-clock bound. Whichever runs out first ends
/// the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub attempts: u32,
    pub timeout_ms: u64,
}

impl RetryBudget {
    /// Base delay of the exponential poll between attempts.
    pub const BACKOFF_BASE_MS: u64 = 500;

    pub fn new(attempts: u32, timeout_ms: u64) -> Self {
        Self {
            attempts,
            timeout_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before poll number `attempt` (1-based): 500ms, 1s, 2s, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(Self::BACKOFF_BASE_MS.saturating_mul(1u64 << exp))
    }
}

/// Timeouts and settle periods of a recovery run, in milliseconds.
///
/// Settle periods model hardware start-up time, not backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryTimings {
    /// Bound for a single console command or network check.
    pub command_timeout_ms: u64,
    /// IP discovery polling after a DHCP request.
    pub ip_discovery: RetryBudget,
    /// Waiting for the boot-loader prompt after a power cycle.
    pub loader_entry_timeout_ms: u64,
    /// Asset upload over console, TFTP or SSH, and console boot.
    pub transfer_timeout_ms: u64,
    /// Outlet off time during a power cycle.
    pub power_off_ms: u64,
    /// Bound on one outlet request (off or on) of the power controller.
    pub power_request_timeout_ms: u64,
    pub settle_after_update_ms: u64,
    pub settle_after_reboot_ms: u64,
    pub settle_after_forced_load_ms: u64,
    pub settle_after_power_cycle_ms: u64,
    pub settle_after_console_boot_ms: u64,
    /// Keystrokes sent to force a console prompt.
    pub wake_keystrokes: u32,
    pub wake_interval_ms: u64,
    /// Hard bound on a whole recovery run.
    pub deadline_ms: u64,
}

impl Default for RecoveryTimings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            ip_discovery: RetryBudget::new(3, 15_000),
            loader_entry_timeout_ms: 90_000,
            transfer_timeout_ms: 300_000,
            power_off_ms: 5_000,
            power_request_timeout_ms: 10_000,
            settle_after_update_ms: 30_000,
            settle_after_reboot_ms: 60_000,
            settle_after_forced_load_ms: 30_000,
            settle_after_power_cycle_ms: 60_000,
            settle_after_console_boot_ms: 20_000,
            wake_keystrokes: 60,
            wake_interval_ms: 100,
            deadline_ms: 900_000,
        }
    }
}

impl RecoveryTimings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn loader_entry_timeout(&self) -> Duration {
        Duration::from_millis(self.loader_entry_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn power_off(&self) -> Duration {
        Duration::from_millis(self.power_off_ms)
    }

    /// Bound on a whole power cycle: both outlet requests, the off time and
    /// one second of slack. Never clipped to the run deadline, so a cycle
    /// that switched the outlet off always gets the time to switch it on.
    pub fn power_cycle_limit(&self) -> Duration {
        self.power_off()
            + Duration::from_millis(self.power_request_timeout_ms.saturating_mul(2))
            + Duration::from_secs(1)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Reject zero bounds; a zero timeout would turn every check into a failure
    /// and a zero attempt count would skip discovery altogether.
    pub fn validate(&self) -> ConfigResult<()> {
        let bounds = [
            ("command_timeout_ms", self.command_timeout_ms),
            ("ip_discovery.timeout_ms", self.ip_discovery.timeout_ms),
            ("loader_entry_timeout_ms", self.loader_entry_timeout_ms),
            ("transfer_timeout_ms", self.transfer_timeout_ms),
            ("power_request_timeout_ms", self.power_request_timeout_ms),
            ("deadline_ms", self.deadline_ms),
        ];
        for (name, value) in bounds {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.ip_discovery.attempts == 0 {
            return Err(ConfigError::Invalid(
                "ip_discovery.attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Millisecond-scale timings for tests and bench rigs with fast boards.
    pub fn quick() -> Self {
        Self {
            command_timeout_ms: 1_000,
            ip_discovery: RetryBudget::new(3, 5_000),
            loader_entry_timeout_ms: 2_000,
            transfer_timeout_ms: 5_000,
            power_off_ms: 10,
            power_request_timeout_ms: 1_000,
            settle_after_update_ms: 100,
            settle_after_reboot_ms: 100,
            settle_after_forced_load_ms: 100,
            settle_after_power_cycle_ms: 100,
            settle_after_console_boot_ms: 100,
            wake_keystrokes: 5,
            wake_interval_ms: 10,
            deadline_ms: 60_000,
        }
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
