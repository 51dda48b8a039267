//! The recovery escalation state machine.
//!
//! Two entry points:
//!
//! - [`RecoveryOrchestrator::recover_with_assets`] deploys boot assets. It
//!   first tries a live update from a running OS; only a failed console
//!   liveness check (`LinuxNotReached`) escalates to a power cycle plus a
//!   forced console or TFTP load. Everything after that is verified with a
//!   ping and an SSH check, and any failure there is terminal.
//! - [`RecoveryOrchestrator::recover`] reboots without redeploying:
//!   SSH reboot, then at most two power-cycle tiers, the second of which
//!   wakes the console and issues the loader's own boot command.
//!
//! Channel calls run strictly one after another. Each is bounded by its own
//! timeout (clipped to the run deadline), and cancellation/deadline are
//! checked after every call returns and around every settle period.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::assets::{AssetDigest, BootAssetPaths, BootAssetSet};
use crate::board::BoardHandle;
use crate::budget::{millis, RecoveryTimings};
use crate::cancel::CancelSignal;
use crate::channels::PowerController;
use crate::config::RecoveryConfig;
use crate::error::{ChannelError, ChannelResult, RecoveryError, RecoveryResult};
use crate::obs::{
    emit_escalation, emit_ip_rebound, emit_recovery_finished, emit_recovery_started,
    emit_stage_entered, emit_tier_entered, recovery_span,
};
use crate::outcome::{RecoveryOutcome, RecoveryPath, RecoveryReport};
use crate::tier::{Escalation, Stage, Tier, TierStep, Trail};

/// Benign command whose output proves a Linux shell is answering.
pub const LINUX_CHECK_COMMAND: &str = "uname -a";
/// Marker expected in the liveness check output.
pub const LINUX_MARKER: &str = "Linux";
/// One keystroke of the console wake sequence.
pub const WAKE_KEYSTROKE: &[u8] = b"\r\n";

/// How assets are forced onto a board whose OS is unreachable.
///
/// Chosen by configuration; a single run never mixes the two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// Upload over the console transport.
    #[default]
    Console,
    /// Boot loader pulls from the TFTP server.
    Tftp,
}

impl LoadStrategy {
    pub fn from_tftp_flag(tftp: bool) -> Self {
        if tftp {
            LoadStrategy::Tftp
        } else {
            LoadStrategy::Console
        }
    }

    pub fn tier(self) -> Tier {
        match self {
            LoadStrategy::Console => Tier::PowerCycleAndUartLoad,
            LoadStrategy::Tftp => Tier::PowerCycleAndUartLoadWithTftp,
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategy::Console => f.write_str("console"),
            LoadStrategy::Tftp => f.write_str("tftp"),
        }
    }
}

/// Drives one board back to a reachable state.
///
/// Holds only configuration; all per-run state lives in the run itself, so
/// one orchestrator can serve many boards, each through its own
/// `&mut BoardHandle`.
#[derive(Debug, Clone)]
pub struct RecoveryOrchestrator {
    timings: RecoveryTimings,
    strategy: LoadStrategy,
    cancel: CancelSignal,
}

impl RecoveryOrchestrator {
    pub fn new(timings: RecoveryTimings, strategy: LoadStrategy) -> Self {
        Self {
            timings,
            strategy,
            cancel: CancelSignal::never(),
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(
            config.timings.clone(),
            LoadStrategy::from_tftp_flag(config.tftp),
        )
    }

    /// Abort runs at their next checkpoint once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn timings(&self) -> &RecoveryTimings {
        &self.timings
    }

    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    /// Lightweight path: reboot without redeploying firmware.
    pub async fn recover(&self, board: &mut BoardHandle) -> RecoveryOutcome {
        self.recover_reported(board, None).await.0
    }

    /// Forced path: deploy `assets`, power cycling into a forced load if the
    /// OS does not answer on the console.
    pub async fn recover_with_assets(
        &self,
        board: &mut BoardHandle,
        assets: &BootAssetPaths,
    ) -> RecoveryOutcome {
        self.recover_reported(board, Some(assets)).await.0
    }

    /// Forced path when assets are supplied, lightweight path otherwise.
    pub async fn recover_auto(
        &self,
        board: &mut BoardHandle,
        assets: Option<&BootAssetPaths>,
    ) -> RecoveryOutcome {
        self.recover_reported(board, assets).await.0
    }

    /// Run recovery and also return the audit report.
    pub async fn recover_reported(
        &self,
        board: &mut BoardHandle,
        assets: Option<&BootAssetPaths>,
    ) -> (RecoveryOutcome, RecoveryReport) {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = recovery_span(&run_id, board.name());
        self.drive(run_id, board, assets).instrument(span).await
    }

    async fn drive(
        &self,
        run_id: String,
        board: &mut BoardHandle,
        assets: Option<&BootAssetPaths>,
    ) -> (RecoveryOutcome, RecoveryReport) {
        let path = match assets {
            Some(_) => RecoveryPath::ForcedLoad,
            None => RecoveryPath::Lightweight,
        };
        let started_at = Utc::now();
        let mut run = Run::new(run_id, &self.timings, self.cancel.clone());
        emit_recovery_started(&run.id, path, board.identity().ip());

        let result = match run.checkpoint("start") {
            Err(e) => Err(e),
            Ok(()) => match assets {
                Some(paths) => self.run_forced(&mut run, board, paths).await,
                None => self.run_lightweight(&mut run, board).await,
            },
        };

        let outcome = RecoveryOutcome::from_result(result, run.notes.clone());
        emit_recovery_finished(&run.id, &outcome, millis(run.started.elapsed()));

        let report = RecoveryReport::new(
            run.id,
            board.name().to_string(),
            path,
            &outcome,
            board.identity().driver_uri().map(str::to_string),
            run.trail.tiers().to_vec(),
            run.trail.stages().to_vec(),
            run.power_cycles,
            run.notes,
            run.assets,
            started_at,
        );
        (outcome, report)
    }

    // ------------------------------------------------------------------
    // Forced path
    // ------------------------------------------------------------------

    async fn run_forced(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
        paths: &BootAssetPaths,
    ) -> RecoveryResult<IpAddr> {
        let assets = BootAssetSet::validate(paths)?;
        run.assets = assets.digests().to_vec();

        run.enter_tier(Tier::SshReboot);
        match self.live_update(run, board, &assets).await? {
            TierStep::Done(()) => {}
            TierStep::Escalate(reason) => {
                emit_escalation(&Tier::SshReboot, &reason);
                run.notes.push(format!(
                    "{reason}; escalating to power cycle and forced {} load",
                    self.strategy
                ));
                self.forced_load(run, board, &assets).await?;
            }
        }

        self.verify_after_update(run, board).await
    }

    async fn live_update(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
        assets: &BootAssetSet,
    ) -> RecoveryResult<TierStep<()>> {
        let t = self.timings.command_timeout();

        if let Err(e) = self
            .call(run, "console.discard_buffered", t, board.console.discard_buffered())
            .await?
        {
            warn!(error = %e, "could not flush console buffer");
        }

        info!("checking if Linux is accessible over console");
        let liveness = self
            .call(
                run,
                "console.run_command_expect",
                t,
                board
                    .console
                    .run_command_expect(LINUX_CHECK_COMMAND, LINUX_MARKER, t),
            )
            .await?;
        match liveness {
            Ok(echo) if echo.found => {}
            Ok(echo) => {
                debug!(output = %echo.output, "liveness marker absent");
                return Ok(TierStep::Escalate(Escalation::LinuxNotReached));
            }
            Err(e) => {
                warn!(error = %e, "console liveness check failed");
                return Ok(TierStep::Escalate(Escalation::LinuxNotReached));
            }
        }

        let ip = self
            .discover_ip(run, board)
            .await?
            .ok_or(RecoveryError::NetworkNotFunctional)?;
        rebind(board, ip);

        let tt = self.timings.transfer_timeout();
        self.call(
            run,
            "network.update_boot_partition",
            tt,
            board.network.update_boot_partition(ip, assets, tt),
        )
        .await?
        .map_err(|e| RecoveryError::channel("update_boot_partition", e))?;

        info!("waiting for reboot to complete");
        self.settle(run, "live_update", ms(self.timings.settle_after_update_ms))
            .await?;
        Ok(TierStep::Done(()))
    }

    async fn forced_load(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
        assets: &BootAssetSet,
    ) -> RecoveryResult<()> {
        run.enter_tier(self.strategy.tier());
        info!(strategy = %self.strategy, "forcing console override on power cycle");

        self.power_cycle(run, board.power.as_ref())
            .await?
            .map_err(|e| RecoveryError::channel("power_cycle", e))?;

        // The loader wait doubles as the post-power-cycle settle; the autoboot
        // countdown must be caught while it runs.
        let lt = self.timings.loader_entry_timeout();
        self.call(
            run,
            "console.enter_loader_from_power_cycle",
            lt,
            board.console.enter_loader_from_power_cycle(lt),
        )
        .await?
        .map_err(|e| RecoveryError::channel("enter_loader", e))?;

        let tt = self.timings.transfer_timeout();
        let loaded = match self.strategy {
            LoadStrategy::Console => {
                self.call(
                    run,
                    "console.load_boot_assets",
                    tt,
                    board.console.load_boot_assets(assets, tt),
                )
                .await?
            }
            LoadStrategy::Tftp => {
                self.call(
                    run,
                    "console.load_boot_assets_via_tftp",
                    tt,
                    board.console.load_boot_assets_via_tftp(assets, tt),
                )
                .await?
            }
        };
        loaded.map_err(|e| RecoveryError::channel("load_boot_assets", e))?;

        info!("waiting for boot to complete");
        self.settle(run, "forced_load", ms(self.timings.settle_after_forced_load_ms))
            .await
    }

    async fn verify_after_update(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<IpAddr> {
        if !self.ping_current(run, board).await? {
            info!("board not answering at last-known address, rediscovering over console");
            let ip = self
                .discover_ip(run, board)
                .await?
                .ok_or(RecoveryError::NetworkNotFunctionalAfterBootFileUpdate)?;
            rebind(board, ip);
            if !self.ping_current(run, board).await? {
                return Err(RecoveryError::NetworkNotFunctionalAfterBootFileUpdate);
            }
        }

        let ip = board
            .identity()
            .ip()
            .ok_or(RecoveryError::NetworkNotFunctionalAfterBootFileUpdate)?;
        let t = self.timings.command_timeout();
        match self
            .call(run, "network.ssh_functional", t, board.network.ssh_functional(ip, t))
            .await?
        {
            Ok(true) => {
                info!(ip = %ip, "board reachable over ssh");
                Ok(ip)
            }
            Ok(false) => Err(RecoveryError::SshNotFunctionalAfterBootFileUpdate { ip }),
            Err(e) => {
                warn!(error = %e, "ssh check failed");
                Err(RecoveryError::SshNotFunctionalAfterBootFileUpdate { ip })
            }
        }
    }

    async fn ping_current(&self, run: &mut Run, board: &mut BoardHandle) -> RecoveryResult<bool> {
        let Some(ip) = board.identity().ip() else {
            return Ok(false);
        };
        let t = self.timings.command_timeout();
        match self
            .call(run, "network.ping", t, board.network.ping(ip, t))
            .await?
        {
            Ok(reachable) => Ok(reachable),
            Err(e) => {
                warn!(ip = %ip, error = %e, "ping failed");
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Lightweight path
    // ------------------------------------------------------------------

    async fn run_lightweight(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<IpAddr> {
        run.enter_stage(Stage::SshRebootAttempt);
        let t = self.timings.command_timeout();
        let rebooted = match board.identity().ip() {
            Some(ip) => {
                self.call(run, "network.reboot_board", t, board.network.reboot_board(ip, t))
                    .await?
            }
            None => Err(ChannelError::NoAddress),
        };

        let escalation = match rebooted {
            Ok(()) => {
                self.settle(run, "ssh_reboot", ms(self.timings.settle_after_reboot_ms))
                    .await?;
                match self.boot_check(run, board).await? {
                    Ok(ip) => return Ok(ip),
                    Err(e) => Escalation::NotBooted(e),
                }
            }
            Err(e) => Escalation::RebootFailed(e),
        };
        emit_escalation(&Stage::SshRebootAttempt, &escalation);
        run.notes.push(format!("{escalation}; escalating to power cycle"));

        let last = match self.power_cycle_tier(run, board).await? {
            Ok(ip) => return Ok(ip),
            Err(e) => e,
        };
        let escalation = Escalation::NotBooted(last);
        emit_escalation(&Stage::BootCheck, &escalation);
        run.notes.push(format!(
            "{escalation}; escalating to second power cycle and console boot"
        ));

        self.console_boot_tier(run, board)
            .await?
            .map_err(|last| RecoveryError::RecoveryExhausted { last })
    }

    /// `PowerCycle1 → BootCheck`.
    async fn power_cycle_tier(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<ChannelResult<IpAddr>> {
        run.enter_stage(Stage::PowerCycle1);
        if let Err(e) = self.power_cycle(run, board.power.as_ref()).await? {
            run.notes.push(format!("power cycle failed: {e}"));
            return Ok(Err(e));
        }
        self.settle(
            run,
            "power_cycle_1",
            ms(self.timings.settle_after_power_cycle_ms),
        )
        .await?;

        run.enter_stage(Stage::BootCheck);
        self.boot_check(run, board).await
    }

    /// `PowerCycle2 → ForcedConsoleWake → ConsoleBoot → BootCheck2`. There is
    /// no tier after this one.
    async fn console_boot_tier(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<ChannelResult<IpAddr>> {
        run.enter_stage(Stage::PowerCycle2);
        if let Err(e) = self.power_cycle(run, board.power.as_ref()).await? {
            run.notes.push(format!("power cycle failed: {e}"));
            return Ok(Err(e));
        }

        run.enter_stage(Stage::ForcedConsoleWake);
        info!(
            keystrokes = self.timings.wake_keystrokes,
            "sending wake sequence to get a console prompt"
        );
        let t = self.timings.command_timeout();
        for _ in 0..self.timings.wake_keystrokes {
            if let Err(e) = self
                .call(run, "console.write_raw", t, board.console.write_raw(WAKE_KEYSTROKE))
                .await?
            {
                return Ok(Err(e));
            }
            self.pause(run, "console_wake", self.timings.wake_interval())
                .await?;
        }

        run.enter_stage(Stage::ConsoleBoot);
        let tt = self.timings.transfer_timeout();
        if let Err(e) = self
            .call(run, "console.boot_default", tt, board.console.boot_default(tt))
            .await?
        {
            return Ok(Err(e));
        }
        self.settle(
            run,
            "console_boot",
            ms(self.timings.settle_after_console_boot_ms),
        )
        .await?;

        run.enter_stage(Stage::BootCheck2);
        self.boot_check(run, board).await
    }

    /// Rediscover the IP over console, rebind, then ask the network channel
    /// whether the OS is up.
    async fn boot_check(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<ChannelResult<IpAddr>> {
        let Some(ip) = self.discover_ip(run, board).await? else {
            return Ok(Err(ChannelError::NoAddress));
        };
        info!(ip = %ip, "IP address found");
        rebind(board, ip);

        let t = self.timings.command_timeout();
        let booted = self
            .call(
                run,
                "network.check_board_booted",
                t,
                board.network.check_board_booted(ip, t),
            )
            .await?;
        Ok(booted.map(|()| ip))
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    /// Console IP discovery: one look, then a DHCP request and bounded
    /// polling. A failed look counts as "no address yet".
    async fn discover_ip(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<Option<IpAddr>> {
        if let Some(ip) = self.look_for_ip(run, board).await? {
            return Ok(Some(ip));
        }

        info!("no IP over console, requesting DHCP lease");
        let t = self.timings.command_timeout();
        if let Err(e) = self
            .call(run, "console.request_dhcp", t, board.console.request_dhcp(t))
            .await?
        {
            warn!(error = %e, "DHCP request failed");
        }

        let budget = self.timings.ip_discovery;
        let started = Instant::now();
        for attempt in 1..=budget.attempts {
            if let Some(ip) = self.look_for_ip(run, board).await? {
                return Ok(Some(ip));
            }
            let elapsed = started.elapsed();
            if attempt == budget.attempts || elapsed >= budget.timeout() {
                break;
            }
            let delay = budget.backoff(attempt).min(budget.timeout() - elapsed);
            self.pause(run, "ip_discovery", delay).await?;
        }

        warn!(attempts = budget.attempts, "IP discovery exhausted");
        Ok(None)
    }

    async fn look_for_ip(
        &self,
        run: &mut Run,
        board: &mut BoardHandle,
    ) -> RecoveryResult<Option<IpAddr>> {
        let t = self.timings.command_timeout();
        match self
            .call(run, "console.discover_ip", t, board.console.discover_ip(t))
            .await?
        {
            Ok(ip) => Ok(ip),
            Err(e) => {
                warn!(error = %e, "IP discovery over console failed");
                Ok(None)
            }
        }
    }

    async fn power_cycle(
        &self,
        run: &mut Run,
        power: &dyn PowerController,
    ) -> RecoveryResult<ChannelResult<()>> {
        run.power_cycles += 1;
        info!(count = run.power_cycles, "power cycling board");
        let off = self.timings.power_off();
        // Off and on belong together: the run deadline is only checked once
        // the cycle returns, so the outlet is never left switched off.
        self.call_unclipped(
            run,
            "power.power_cycle",
            self.timings.power_cycle_limit(),
            power.power_cycle(off),
        )
        .await
    }

    /// Await one channel call under `limit` (clipped to the run deadline),
    /// then checkpoint.
    ///
    /// The outer `Err` is a run-level stop (cancel or deadline); the inner
    /// result is the channel's own answer for the caller to classify.
    async fn call<T, F>(
        &self,
        run: &Run,
        operation: &'static str,
        limit: Duration,
        fut: F,
    ) -> RecoveryResult<ChannelResult<T>>
    where
        F: Future<Output = ChannelResult<T>>,
    {
        let limit = limit.min(run.remaining());
        self.call_unclipped(run, operation, limit, fut).await
    }

    /// Like [`Self::call`], but `limit` is used as is.
    async fn call_unclipped<T, F>(
        &self,
        run: &Run,
        operation: &'static str,
        limit: Duration,
        fut: F,
    ) -> RecoveryResult<ChannelResult<T>>
    where
        F: Future<Output = ChannelResult<T>>,
    {
        let result = match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                operation,
                limit_ms: millis(limit),
            }),
        };
        if let Err(e) = &result {
            debug!(operation, error = %e, "channel call failed");
        }
        run.checkpoint(operation)?;
        Ok(result)
    }

    /// Fixed hardware settle period, logged.
    async fn settle(&self, run: &mut Run, what: &'static str, period: Duration) -> RecoveryResult<()> {
        info!(event = "recovery.settle", what, period_ms = millis(period));
        self.pause(run, what, period).await
    }

    /// Sleep for `period`, cut short by cancellation or the run deadline.
    async fn pause(&self, run: &mut Run, at: &'static str, period: Duration) -> RecoveryResult<()> {
        run.checkpoint(at)?;
        let until = (Instant::now() + period).min(run.deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(until) => {}
            _ = run.cancel.cancelled() => {}
        }
        run.checkpoint(at)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Point the board at `ip`, keeping IP and driver URI in step.
fn rebind(board: &mut BoardHandle, ip: IpAddr) {
    let previous = board.identity().ip();
    if board.identity_mut().rebind(ip) {
        emit_ip_rebound(previous, ip);
    }
}

/// Per-call state. Created fresh by every entry point and dropped at return.
struct Run {
    id: String,
    started: Instant,
    deadline: Instant,
    deadline_ms: u64,
    cancel: CancelSignal,
    trail: Trail,
    power_cycles: u32,
    notes: Vec<String>,
    assets: Vec<AssetDigest>,
}

impl Run {
    fn new(id: String, timings: &RecoveryTimings, cancel: CancelSignal) -> Self {
        let started = Instant::now();
        Self {
            id,
            started,
            deadline: started + timings.deadline(),
            deadline_ms: timings.deadline_ms,
            cancel,
            trail: Trail::default(),
            power_cycles: 0,
            notes: Vec::new(),
            assets: Vec::new(),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn checkpoint(&self, at: &'static str) -> RecoveryResult<()> {
        if self.cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled { checkpoint: at });
        }
        if Instant::now() >= self.deadline {
            return Err(RecoveryError::DeadlineExceeded {
                checkpoint: at,
                limit_ms: self.deadline_ms,
            });
        }
        Ok(())
    }

    fn enter_tier(&mut self, tier: Tier) {
        emit_tier_entered(tier);
        self.trail.enter_tier(tier);
    }

    fn enter_stage(&mut self, stage: Stage) {
        emit_stage_entered(stage);
        self.trail.enter_stage(stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_flag() {
        assert_eq!(LoadStrategy::from_tftp_flag(false), LoadStrategy::Console);
        assert_eq!(LoadStrategy::from_tftp_flag(true), LoadStrategy::Tftp);
        assert_eq!(
            LoadStrategy::Tftp.tier(),
            Tier::PowerCycleAndUartLoadWithTftp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_reports_deadline() {
        let timings = RecoveryTimings {
            deadline_ms: 1_000,
            ..RecoveryTimings::quick()
        };
        let run = Run::new("run".into(), &timings, CancelSignal::never());
        assert!(run.checkpoint("early").is_ok());
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert!(matches!(
            run.checkpoint("late"),
            Err(RecoveryError::DeadlineExceeded {
                checkpoint: "late",
                limit_ms: 1_000
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_converts_elapsed_into_channel_timeout() {
        let orchestrator = RecoveryOrchestrator::new(RecoveryTimings::quick(), LoadStrategy::Console);
        let run = Run::new("run".into(), orchestrator.timings(), CancelSignal::never());
        let result = orchestrator
            .call(
                &run,
                "console.hang",
                Duration::from_millis(50),
                std::future::pending::<ChannelResult<()>>(),
            )
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(ChannelError::Timeout {
                operation: "console.hang",
                limit_ms: 50
            })
        ));
    }
}
