//! Host capabilities consumed by the orchestrators.
//!
//! The orchestrators never touch sockets, the process table or child
//! processes directly. They go through these traits so that every decision
//! can be exercised against scripted fakes.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

mod command;
pub mod packages;
mod ports;
pub mod privilege;
mod process;

#[cfg(test)]
pub(crate) mod fakes;

pub use command::SystemCommandRunner;
pub use ports::TcpPortProbe;
pub use process::SysinfoProcessTable;

/// Answers "is something bound to this port?"
pub trait PortProbe {
    fn in_use(&self, port: u16) -> bool;
}

/// A running process as seen by the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessInfo {
    /// Whole command line joined with spaces.
    pub fn command_line(&self) -> String {
        self.cmdline.join(" ")
    }
}

/// Read access to running processes plus graceful termination.
pub trait ProcessTable {
    fn processes(&self) -> Vec<ProcessInfo>;

    /// Ask a process to exit. Returns `Ok(false)` if it was already gone.
    fn terminate(&self, pid: u32) -> Result<bool>;
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external commands with a bounded wait.
pub trait CommandRunner {
    /// Run `program` with `args`. A command that outlives `timeout` is killed
    /// and reported as `DeployError::CommandTimedOut`; a non-zero exit is
    /// returned as output, not as an error.
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// Run a command and turn a non-zero exit into `CommandFailed`.
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput> {
    let output = runner.run(program, args, timeout)?;
    if !output.success() {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        return Err(crate::error::DeployError::command_failed(
            render_command(program, args),
            detail,
        ));
    }
    Ok(output)
}

pub(crate) fn render_command(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}
