//! Escalation tiers and the named states of the reboot state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Recovery tiers of the forced-load path, in escalation order.
///
/// The derived `Ord` is the escalation order; a run only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Live update over SSH from a running OS.
    SshReboot,
    /// Power cycle, then load assets over the console transport.
    PowerCycleAndUartLoad,
    /// Power cycle, then have the boot loader pull assets over TFTP.
    PowerCycleAndUartLoadWithTftp,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::SshReboot => "ssh_reboot",
            Tier::PowerCycleAndUartLoad => "power_cycle_and_uart_load",
            Tier::PowerCycleAndUartLoadWithTftp => "power_cycle_and_uart_load_with_tftp",
        };
        f.write_str(name)
    }
}

/// Named states of the lightweight reboot path.
///
/// `Idle → SshRebootAttempt → {Success | PowerCycle1 → BootCheck → {Success |
/// PowerCycle2 → ForcedConsoleWake → ConsoleBoot → BootCheck2 → {Success |
/// Fatal}}}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SshRebootAttempt,
    PowerCycle1,
    BootCheck,
    PowerCycle2,
    ForcedConsoleWake,
    ConsoleBoot,
    BootCheck2,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SshRebootAttempt => "ssh_reboot_attempt",
            Stage::PowerCycle1 => "power_cycle_1",
            Stage::BootCheck => "boot_check",
            Stage::PowerCycle2 => "power_cycle_2",
            Stage::ForcedConsoleWake => "forced_console_wake",
            Stage::ConsoleBoot => "console_boot",
            Stage::BootCheck2 => "boot_check_2",
        };
        f.write_str(name)
    }
}

/// Why a tier hands over to the next one. Never leaves the orchestrator.
#[derive(Debug)]
pub(crate) enum Escalation {
    /// Console did not confirm a running OS.
    LinuxNotReached,
    /// Remote reboot over the network channel failed.
    RebootFailed(ChannelError),
    /// Has-booted check (or what it depends on) failed.
    NotBooted(ChannelError),
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::LinuxNotReached => f.write_str("linux not reached over console"),
            Escalation::RebootFailed(e) => write!(f, "ssh reboot failed: {e}"),
            Escalation::NotBooted(e) => write!(f, "board not booted: {e}"),
        }
    }
}

/// Result of one tier: finished, or escalate to the next tier.
///
/// Terminal failures travel separately as `Err(RecoveryError)`, which keeps
/// the single escalation edge visible in the types.
#[derive(Debug)]
pub(crate) enum TierStep<T> {
    Done(T),
    Escalate(Escalation),
}

/// Forward-only record of the tiers and stages a run visited.
#[derive(Debug, Default, Clone)]
pub(crate) struct Trail {
    tiers: Vec<Tier>,
    stages: Vec<Stage>,
}

impl Trail {
    pub(crate) fn enter_tier(&mut self, tier: Tier) {
        debug_assert!(
            self.tiers.last().map_or(true, |last| *last < tier),
            "tier {tier} revisited"
        );
        self.tiers.push(tier);
    }

    pub(crate) fn enter_stage(&mut self, stage: Stage) {
        debug_assert!(
            self.stages.last().map_or(true, |last| *last < stage),
            "stage {stage} revisited"
        );
        self.stages.push(stage);
    }

    pub(crate) fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub(crate) fn stages(&self) -> &[Stage] {
        &self.stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order_is_escalation_order() {
        assert!(Tier::SshReboot < Tier::PowerCycleAndUartLoad);
        assert!(Tier::PowerCycleAndUartLoad < Tier::PowerCycleAndUartLoadWithTftp);
    }

    #[test]
    fn test_trail_records_forward_moves() {
        let mut trail = Trail::default();
        trail.enter_stage(Stage::SshRebootAttempt);
        trail.enter_stage(Stage::PowerCycle1);
        trail.enter_stage(Stage::BootCheck);
        assert_eq!(trail.stages().len(), 3);
        assert!(trail.tiers().is_empty());
    }

    #[test]
    #[should_panic(expected = "revisited")]
    #[cfg(debug_assertions)]
    fn test_trail_rejects_going_back() {
        let mut trail = Trail::default();
        trail.enter_tier(Tier::PowerCycleAndUartLoad);
        trail.enter_tier(Tier::SshReboot);
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::ForcedConsoleWake).unwrap();
        assert_eq!(json, "\"forced_console_wake\"");
    }
}
