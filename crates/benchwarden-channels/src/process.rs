//! Bounded subprocess execution shared by the SSH and driver adapters.

use std::process::Stdio;
use std::time::{Duration, Instant};

use benchwarden_core::{ChannelError, ChannelResult};
use tokio::process::Command;
use tracing::debug;

/// Captured result of one subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code; `None` if killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`ChannelError::CommandFailed`].
    pub fn checked(self, command: &str) -> ChannelResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let reason = match self.stderr.trim() {
            "" => match self.exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
            stderr => stderr.to_string(),
        };
        Err(ChannelError::CommandFailed {
            command: command.to_string(),
            reason,
        })
    }
}

/// Run `program args...` to completion, killing it once `timeout` elapses.
pub async fn run_process(
    operation: &'static str,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> ChannelResult<ProcessOutput> {
    let start = Instant::now();
    debug!(operation, program, "spawning");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ChannelError::Timeout {
            operation,
            limit_ms: timeout.as_millis() as u64,
        })??;

    Ok(ProcessOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_simple_command() {
        let out = run_process("test.echo", "echo", &args(&["hello"]), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_failing_command_is_checked() {
        let out = run_process("test.false", "false", &[], Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!out.success());
        let err = out.checked("false").unwrap_err();
        assert!(matches!(err, ChannelError::CommandFailed { ref reason, .. } if reason == "exit status 1"));
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let err = run_process("test.sleep", "sleep", &args(&["5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Timeout {
                operation: "test.sleep",
                limit_ms: 100
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let err = run_process(
            "test.missing",
            "benchwarden-no-such-binary",
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChannelError::Io(_)));
    }
}
