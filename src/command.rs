//! External capability-query command execution.
//!
//! All interaction with the query utility (`v4l2-ctl` by default) goes
//! through [`CommandExecutor`] so tests and other platforms can substitute
//! the whole surface. The real implementation builds an argument vector
//! (never a shell string) and classifies failures into [`ExecError`] kinds
//! by exit status and stderr content, since the utility folds most failure
//! modes into exit code 1.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ExecError;

/// Capability: run the external query utility against one device.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `<program> --device <device_path> <args…>` under `timeout`.
    ///
    /// `args` is tokenized on whitespace before reaching the child; no
    /// shell is ever involved. Successful output is returned verbatim.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        device_path: &str,
        args: &str,
        timeout: Duration,
    ) -> Result<String, ExecError>;
}

/// Executor invoking the configured utility as a child process.
#[derive(Debug, Clone)]
pub struct V4l2Executor {
    program: String,
}

impl V4l2Executor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for V4l2Executor {
    fn default() -> Self {
        Self::new("v4l2-ctl")
    }
}

#[async_trait]
impl CommandExecutor for V4l2Executor {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        device_path: &str,
        args: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        debug!(program = %self.program, device = device_path, ?tokens, "executing device command");

        let mut command = Command::new(&self.program);
        command
            .arg("--device")
            .arg(device_path)
            .args(&tokens)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ExecError::ExecutableMissing(self.program.clone()),
            std::io::ErrorKind::PermissionDenied => {
                ExecError::PermissionDenied(self.program.clone())
            }
            _ => ExecError::Generic {
                message: err.to_string(),
                exit_code: None,
            },
        })?;

        // Dropping the wait future kills the child (kill_on_drop), so both
        // the cancellation and timeout branches terminate it.
        let wait = child.wait_with_output();
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            outcome = tokio::time::timeout(timeout, wait) => match outcome {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    return Err(ExecError::Generic {
                        message: err.to_string(),
                        exit_code: None,
                    })
                }
                Err(_) => {
                    return Err(ExecError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            return Ok(stdout);
        }

        Err(classify_failure(
            device_path,
            &stdout,
            &stderr,
            output.status.code(),
        ))
    }
}

/// Map a non-zero exit into an error kind by inspecting stderr.
///
/// The utility reports most device-level failures with exit code 1 and a
/// human-readable reason on stderr, so substrings carry the signal.
pub(crate) fn classify_failure(
    device_path: &str,
    stdout: &str,
    stderr: &str,
    exit_code: Option<i32>,
) -> ExecError {
    let lowered = stderr.to_lowercase();

    if lowered.contains("permission denied") {
        return ExecError::PermissionDenied(device_path.to_string());
    }
    if lowered.contains("no such file or directory") || lowered.contains("no such device") {
        return ExecError::DeviceMissing(device_path.to_string());
    }
    if lowered.contains("device or resource busy") || lowered.contains("resource busy") {
        return ExecError::DeviceBusy(device_path.to_string());
    }
    if lowered.contains("cannot open") || lowered.contains("failed to open") {
        return ExecError::DeviceCannotOpen(device_path.to_string());
    }

    let message = if stdout.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    };
    ExecError::Generic { message, exit_code }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_stderr_substrings() {
        let err = classify_failure("/dev/video0", "", "VIDIOC_QUERYCAP: Permission denied", Some(1));
        assert_eq!(err, ExecError::PermissionDenied("/dev/video0".into()));

        let err = classify_failure(
            "/dev/video3",
            "",
            "Cannot open device /dev/video3: No such file or directory",
            Some(1),
        );
        assert_eq!(err, ExecError::DeviceMissing("/dev/video3".into()));

        let err = classify_failure("/dev/video0", "", "Device or resource busy", Some(1));
        assert_eq!(err, ExecError::DeviceBusy("/dev/video0".into()));

        let err = classify_failure("/dev/video0", "", "Failed to open /dev/video0", Some(1));
        assert_eq!(err, ExecError::DeviceCannotOpen("/dev/video0".into()));
    }

    #[test]
    fn generic_failure_prefers_stdout_then_stderr() {
        let err = classify_failure("/dev/video0", "partial dump", "unknown ioctl", Some(255));
        match err {
            ExecError::Generic { message, exit_code } => {
                assert_eq!(message, "partial dump");
                assert_eq!(exit_code, Some(255));
            }
            other => panic!("unexpected kind: {other:?}"),
        }

        let err = classify_failure("/dev/video0", "", "unknown ioctl", Some(255));
        match err {
            ExecError::Generic { message, .. } => assert_eq!(message, "unknown ioctl"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_executable_is_classified() {
        let executor = V4l2Executor::new("v4l2-ctl-definitely-not-installed");
        let cancel = CancellationToken::new();
        let err = executor
            .execute(&cancel, "/dev/video0", "--all", Duration::from_secs(1))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, ExecError::ExecutableMissing(_)));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_execution() {
        // `sleep` stands in for a wedged utility; /dev/null keeps the
        // argument shape without touching real hardware.
        let executor = V4l2Executor::new("sleep");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute(&cancel, "5", "", Duration::from_secs(10))
            .await
            .expect_err("cancelled before completion");
        assert_eq!(err, ExecError::Cancelled);
    }
}
