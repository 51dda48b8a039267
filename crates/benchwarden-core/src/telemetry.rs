//! Tracing initialisation for Benchwarden binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored; the
//! global subscriber can only be installed once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "BENCHWARDEN_LOG";

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON, for lab log aggregation.
/// * `level` - verbosity when neither `BENCHWARDEN_LOG` nor `RUST_LOG` is set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = build_filter(level);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

fn build_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
