//! Driver verification through an external command.

use std::time::Duration;

use async_trait::async_trait;
use benchwarden_core::config::DriverConfig;
use benchwarden_core::{ChannelResult, DriverVerifier};
use tracing::info;

use crate::process::run_process;

/// Runs the configured shell command with `{uri}` replaced by the board URI.
pub struct CommandVerifier {
    config: DriverConfig,
}

impl CommandVerifier {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn render(&self, uri: &str) -> String {
        self.config.command.replace("{uri}", uri)
    }
}

#[async_trait]
impl DriverVerifier for CommandVerifier {
    async fn run_all_checks(&self, uri: &str) -> ChannelResult<()> {
        let command = self.render(uri);
        info!(command = %command, "running driver checks");
        let out = run_process(
            "driver.checks",
            "sh",
            &["-c".to_string(), command.clone()],
            Duration::from_millis(self.config.timeout_ms),
        )
        .await?
        .checked(&command)?;
        info!(duration_ms = out.duration_ms, "driver checks passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchwarden_core::ChannelError;

    fn verifier(command: &str) -> CommandVerifier {
        CommandVerifier::new(DriverConfig {
            command: command.to_string(),
            timeout_ms: 10_000,
        })
    }

    #[test]
    fn test_render_substitutes_uri() {
        assert_eq!(
            verifier("iio_info -u {uri}").render("ip:10.0.0.5"),
            "iio_info -u ip:10.0.0.5"
        );
    }

    #[tokio::test]
    async fn test_checks_pass_on_zero_exit() {
        verifier("test '{uri}' = 'ip:10.0.0.5'")
            .run_all_checks("ip:10.0.0.5")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_checks_fail_on_non_zero_exit() {
        let err = verifier("echo 'no iio devices' >&2; exit 3")
            .run_all_checks("ip:10.0.0.5")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::CommandFailed { ref reason, .. } if reason == "no iio devices"));
    }
}
