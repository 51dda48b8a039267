//! Test-run wrapper: log capture around recovery and driver verification.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::assets::BootAssetPaths;
use crate::board::BoardHandle;
use crate::channels::{ConsoleLog, DriverVerifier};
use crate::obs::emit_log_stop_error;
use crate::orchestrator::RecoveryOrchestrator;
use crate::outcome::{RecoveryOutcome, RecoveryReport};

/// Result of the post-recovery driver checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    /// Recovery failed or no verifier was configured.
    Skipped,
    Passed,
    Failed { reason: String },
}

/// Everything one test run produced.
#[derive(Debug)]
pub struct TestRunReport {
    pub outcome: RecoveryOutcome,
    pub recovery: RecoveryReport,
    pub verification: Verification,
}

impl TestRunReport {
    /// Recovered and, if a verifier ran, it passed.
    pub fn passed(&self) -> bool {
        self.outcome.is_success() && !matches!(self.verification, Verification::Failed { .. })
    }
}

/// Runs recovery inside a log-capture scope.
pub struct TestRunCoordinator {
    orchestrator: RecoveryOrchestrator,
}

impl TestRunCoordinator {
    pub fn new(orchestrator: RecoveryOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Start every log, recover, verify drivers on success, stop every log.
    ///
    /// Logs are stopped on every path; a failure to start or stop a log is
    /// reported but never replaces the recovery result.
    pub async fn run(
        &self,
        board: &mut BoardHandle,
        monitors: &mut [Box<dyn ConsoleLog>],
        verifier: Option<&dyn DriverVerifier>,
        assets: Option<&BootAssetPaths>,
    ) -> TestRunReport {
        if let Err(e) = board.console_mut().start_log().await {
            warn!(monitor = board.console_mut().label(), error = %e, "could not start console log");
        }
        for monitor in monitors.iter_mut() {
            if let Err(e) = monitor.start_log().await {
                warn!(monitor = monitor.label(), error = %e, "could not start log");
            }
        }

        let (outcome, recovery) = self.orchestrator.recover_reported(board, assets).await;
        let uri = board.identity().driver_uri().map(str::to_string);
        let verification = verify(uri, &outcome, verifier).await;

        for monitor in monitors.iter_mut() {
            if let Err(e) = monitor.stop_log().await {
                emit_log_stop_error(monitor.label(), &e);
            }
        }
        let console = board.console_mut();
        if let Err(e) = console.stop_log().await {
            emit_log_stop_error(console.label(), &e);
        }

        TestRunReport {
            outcome,
            recovery,
            verification,
        }
    }
}

async fn verify(
    uri: Option<String>,
    outcome: &RecoveryOutcome,
    verifier: Option<&dyn DriverVerifier>,
) -> Verification {
    let Some(verifier) = verifier else {
        return Verification::Skipped;
    };
    if !outcome.is_success() {
        return Verification::Skipped;
    }
    let Some(uri) = uri else {
        return Verification::Failed {
            reason: "board has no driver uri".to_string(),
        };
    };

    info!(uri = %uri, "running driver checks");
    match verifier.run_all_checks(&uri).await {
        Ok(()) => Verification::Passed,
        Err(e) => Verification::Failed {
            reason: e.to_string(),
        },
    }
}
