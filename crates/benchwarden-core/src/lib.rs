//! Benchwarden Core: board recovery for hardware-in-the-loop test benches
//!
//! Brings an embedded Linux board that has stopped answering back to a known,
//! network-reachable state, escalating through progressively heavier
//! interventions.
//!
//! ## Key Components
//!
//! - [`RecoveryOrchestrator`]: the escalation state machine
//! - [`BoardHandle`]: one board's identity plus its console, network and
//!   power channels
//! - [`channels`]: the async traits adapters implement
//! - [`TestRunCoordinator`]: log capture and driver checks around a recovery
//! - [`fakes`]: scripted in-memory channels for tests

pub mod assets;
pub mod board;
pub mod budget;
pub mod cancel;
pub mod channels;
pub mod config;
pub mod coordinator;
mod error;
pub mod fakes;
pub mod obs;
pub mod orchestrator;
pub mod outcome;
pub mod telemetry;
pub mod tier;

pub use assets::{AssetDigest, AssetKind, BootAssetPaths, BootAssetSet};
pub use board::{BoardHandle, BoardIdentity};
pub use budget::{RecoveryTimings, RetryBudget};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use channels::{
    CommandEcho, ConsoleChannel, ConsoleLog, DriverVerifier, NetworkChannel, PowerController,
};
pub use config::{LabConfig, MonitorKind, RecoveryConfig};
pub use coordinator::{TestRunCoordinator, TestRunReport, Verification};
pub use error::{
    ChannelError, ChannelResult, ConfigError, ConfigResult, RecoveryError, RecoveryResult,
};
pub use orchestrator::{LoadStrategy, RecoveryOrchestrator};
pub use outcome::{OutcomeStatus, RecoveryOutcome, RecoveryPath, RecoveryReport};
pub use telemetry::init_tracing;
pub use tier::{Stage, Tier};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
