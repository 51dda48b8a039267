//! Structured observability hooks for recovery runs.
//!
//! Intermediate escalation is visible only here, never as a partial result.
//! Events are emitted at `info!` (escalations and IP changes at `warn!`);
//! filter with `BENCHWARDEN_LOG` or `RUST_LOG`.

use std::net::IpAddr;

use tracing::{info, warn};

use crate::outcome::{RecoveryOutcome, RecoveryPath};
use crate::tier::{Stage, Tier};

/// Span tagging every event of a run with its run id and board.
///
/// Attach with `tracing::Instrument::instrument` so it survives `.await`.
pub fn recovery_span(run_id: &str, board: &str) -> tracing::Span {
    tracing::info_span!("benchwarden.recovery", run_id = %run_id, board = %board)
}

/// Emit event: run started.
pub fn emit_recovery_started(run_id: &str, path: RecoveryPath, known_ip: Option<IpAddr>) {
    info!(
        event = "recovery.started",
        run_id = %run_id,
        path = ?path,
        known_ip = ?known_ip,
    );
}

/// Emit event: run finished with its outcome.
pub fn emit_recovery_finished(run_id: &str, outcome: &RecoveryOutcome, duration_ms: u64) {
    match outcome {
        RecoveryOutcome::Recovered { ip } => info!(
            event = "recovery.finished",
            run_id = %run_id,
            status = "recovered",
            ip = %ip,
            duration_ms = duration_ms,
        ),
        RecoveryOutcome::RecoveredDegraded { ip, notes } => info!(
            event = "recovery.finished",
            run_id = %run_id,
            status = "recovered_degraded",
            ip = %ip,
            escalations = notes.len(),
            duration_ms = duration_ms,
        ),
        RecoveryOutcome::Failed { reason } => warn!(
            event = "recovery.finished",
            run_id = %run_id,
            status = "failed",
            error_kind = reason.kind(),
            error = %reason,
            duration_ms = duration_ms,
        ),
    }
}

pub fn emit_tier_entered(tier: Tier) {
    info!(event = "recovery.tier_entered", tier = %tier);
}

pub fn emit_stage_entered(stage: Stage) {
    info!(event = "recovery.stage_entered", stage = %stage);
}

/// Emit event: a tier gave up and the next one takes over.
pub fn emit_escalation(from: &dyn std::fmt::Display, reason: &dyn std::fmt::Display) {
    warn!(event = "recovery.escalated", from = %from, reason = %reason);
}

/// Emit event: console discovery moved the board to a new address.
pub fn emit_ip_rebound(previous: Option<IpAddr>, current: IpAddr) {
    warn!(event = "board.ip_changed", previous = ?previous, current = %current);
}

/// Emit event: closing a log capture failed (warning level).
pub fn emit_log_stop_error(label: &str, error: &dyn std::fmt::Display) {
    warn!(event = "console.log_stop_failed", monitor = %label, error = %error);
}
