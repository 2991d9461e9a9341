//! Command execution with timeouts.
//!
//! Each invocation drives a `tokio::process::Command` to completion on a
//! current-thread runtime so the caller stays synchronous. The child is
//! killed when the timeout future drops it.

use std::time::Duration;

use log::debug;
use tokio::process::Command;

use super::{CommandOutput, CommandRunner, render_command};
use crate::error::{DeployError, Result};

pub struct SystemCommandRunner {
    rt: tokio::runtime::Runtime,
}

impl SystemCommandRunner {
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DeployError::system(format!("Failed to create command runtime: {e}")))?;
        Ok(Self { rt })
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let rendered = render_command(program, args);
        debug!("exec: {rendered} (timeout {}s)", timeout.as_secs());

        let output = self.rt.block_on(async {
            let child = Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output();
            tokio::time::timeout(timeout, child).await
        });

        match output {
            Err(_elapsed) => Err(DeployError::CommandTimedOut {
                command: rendered,
                timeout,
            }),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                DeployError::command_failed(rendered, format!("{program} not found on PATH")),
            ),
            Ok(Err(e)) => Err(DeployError::command_failed(
                rendered,
                format!("failed to execute: {e}"),
            )),
            Ok(Ok(out)) => Ok(CommandOutput {
                code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_exit_code_and_output() {
        let runner = SystemCommandRunner::new().unwrap();
        let out = runner
            .run("sh", &["-c", "echo hello; exit 3"], Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.success());
    }

    #[test]
    fn slow_command_times_out() {
        let runner = SystemCommandRunner::new().unwrap();
        let err = runner
            .run("sleep", &["5"], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandTimedOut { .. }));
    }

    #[test]
    fn missing_program_is_command_failure() {
        let runner = SystemCommandRunner::new().unwrap();
        let err = runner
            .run("rkos-definitely-not-a-binary", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandFailed { .. }));
    }
}
