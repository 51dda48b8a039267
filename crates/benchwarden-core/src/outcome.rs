//! What a recovery run hands back: the outcome and its audit report.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assets::AssetDigest;
use crate::error::{RecoveryError, RecoveryResult};
use crate::tier::{Stage, Tier};

/// Final result of one recovery run. Produced exactly once per call.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Board reachable without any power cycle.
    Recovered { ip: IpAddr },
    /// Board reachable, but only after escalation. `notes` lists each one.
    RecoveredDegraded { ip: IpAddr, notes: Vec<String> },
    /// Classified failure.
    Failed { reason: RecoveryError },
}

impl RecoveryOutcome {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            RecoveryOutcome::Recovered { ip } | RecoveryOutcome::RecoveredDegraded { ip, .. } => {
                Some(*ip)
            }
            RecoveryOutcome::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, RecoveryOutcome::Failed { .. })
    }

    pub fn error(&self) -> Option<&RecoveryError> {
        match self {
            RecoveryOutcome::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Collapse to the confirmed IP or the classified error.
    pub fn into_result(self) -> RecoveryResult<IpAddr> {
        match self {
            RecoveryOutcome::Recovered { ip } | RecoveryOutcome::RecoveredDegraded { ip, .. } => {
                Ok(ip)
            }
            RecoveryOutcome::Failed { reason } => Err(reason),
        }
    }

    pub(crate) fn from_result(result: RecoveryResult<IpAddr>, notes: Vec<String>) -> Self {
        match result {
            Ok(ip) if notes.is_empty() => RecoveryOutcome::Recovered { ip },
            Ok(ip) => RecoveryOutcome::RecoveredDegraded { ip, notes },
            Err(reason) => RecoveryOutcome::Failed { reason },
        }
    }

    fn status(&self) -> OutcomeStatus {
        match self {
            RecoveryOutcome::Recovered { .. } => OutcomeStatus::Recovered,
            RecoveryOutcome::RecoveredDegraded { .. } => OutcomeStatus::RecoveredDegraded,
            RecoveryOutcome::Failed { .. } => OutcomeStatus::Failed,
        }
    }
}

/// Which entry point ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPath {
    /// Reboot without redeploying firmware.
    Lightweight,
    /// Deploy boot assets, forcing a console/TFTP load if the OS is down.
    ForcedLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Recovered,
    RecoveredDegraded,
    Failed,
}

/// Serializable audit record of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub run_id: String,
    pub board: String,
    pub path: RecoveryPath,
    pub status: OutcomeStatus,
    pub ip: Option<IpAddr>,
    pub driver_uri: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub tiers: Vec<Tier>,
    pub stages: Vec<Stage>,
    pub power_cycles: u32,
    pub notes: Vec<String>,
    pub assets: Vec<AssetDigest>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RecoveryReport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        board: String,
        path: RecoveryPath,
        outcome: &RecoveryOutcome,
        driver_uri: Option<String>,
        tiers: Vec<Tier>,
        stages: Vec<Stage>,
        power_cycles: u32,
        notes: Vec<String>,
        assets: Vec<AssetDigest>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            board,
            path,
            status: outcome.status(),
            ip: outcome.ip(),
            driver_uri,
            error_kind: outcome.error().map(|e| e.kind().to_string()),
            error: outcome.error().map(|e| e.to_string()),
            tiers,
            stages,
            power_cycles,
            notes,
            assets,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
