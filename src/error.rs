//! Deployer error taxonomy.
//!
//! Most of these never escape an orchestration run: each step converts its
//! error into a failed `StepResult`. Only port exhaustion, a held lock and a
//! declined confirmation abort a run early.

use std::path::PathBuf;
use std::time::Duration;

/// Errors produced by the deployer library
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// No usable init system; callers degrade to manual instructions.
    #[error("platform not supported: {0}")]
    PlatformUnsupported(String),

    /// A required package is absent and could not be installed.
    #[error("missing dependency `{name}`: {reason}")]
    DependencyMissing { name: String, reason: String },

    /// Requested port is in use and the conflict was not acknowledged.
    #[error("port {0} is already in use")]
    PortConflict(u16),

    /// Operator supplied a port outside 1..=65535.
    #[error("invalid port {0}: expected 1-65535")]
    InvalidPort(u32),

    /// No free port found after the bounded random search.
    #[error("no free port found after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    /// Privileged operation attempted without elevation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// External command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// External command exceeded its timeout and was killed.
    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    CommandTimedOut { command: String, timeout: Duration },

    /// Generated proxy configuration was rejected by the proxy's syntax check.
    #[error("proxy configuration {} rejected: {reason}", path.display())]
    ProxyInvalid { path: PathBuf, reason: String },

    /// Another deployer run holds the lock.
    #[error("another deployment is in progress (lock: {})", .0.display())]
    LockHeld(PathBuf),

    /// Operator declined a confirmation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    System(String),
}

impl DeployError {
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn dependency(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DependencyMissing {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn command_failed(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Attach the path being operated on to an I/O error.
    pub fn io_at(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::System(format!("{}: {err}", path.display()))
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_command_and_duration() {
        let err = DeployError::CommandTimedOut {
            command: "systemctl start rkos.service".to_string(),
            timeout: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("systemctl start rkos.service"));
        assert!(msg.contains("30s"));
    }

    #[test]
    fn dependency_helper_fills_fields() {
        let err = DeployError::dependency("python3", "no package manager");
        assert!(matches!(err, DeployError::DependencyMissing { ref name, .. } if name == "python3"));
        assert!(err.to_string().contains("no package manager"));
    }
}
