//! Runtime dependency checks and package installation.

use std::time::Duration;

use log::{info, warn};

use super::{CommandRunner, run_checked};
use crate::error::{DeployError, Result};
use crate::platform::PackageManager;

/// An executable the service needs at runtime, and the package providing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub executable: String,
    pub package: String,
}

impl Requirement {
    /// Interpreter requirement with the package name each manager uses.
    pub fn interpreter(executable: &str, manager: PackageManager) -> Self {
        let package = match (executable, manager) {
            ("python3", PackageManager::Pacman) => "python",
            ("python3", PackageManager::Brew) => "python@3",
            ("python3", PackageManager::Choco) => "python3",
            ("python3", PackageManager::Winget) => "Python.Python.3.12",
            (exe, _) => exe,
        };
        Self {
            executable: executable.to_string(),
            package: package.to_string(),
        }
    }
}

/// Outcome of checking one requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Present,
    Installed,
}

/// Looks executables up on PATH; swappable for tests.
pub trait ExecutableLookup {
    fn exists(&self, executable: &str) -> bool;
}

/// Resolves executables through `which`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathLookup;

impl ExecutableLookup for PathLookup {
    fn exists(&self, executable: &str) -> bool {
        which::which(executable).is_ok()
    }
}

/// Installs missing packages with the host package manager.
pub struct PackageInstaller<'a> {
    manager: PackageManager,
    runner: &'a dyn CommandRunner,
    lookup: &'a dyn ExecutableLookup,
    timeout: Duration,
    elevated: bool,
}

impl<'a> PackageInstaller<'a> {
    pub fn new(
        manager: PackageManager,
        runner: &'a dyn CommandRunner,
        lookup: &'a dyn ExecutableLookup,
        timeout: Duration,
        elevated: bool,
    ) -> Self {
        Self {
            manager,
            runner,
            lookup,
            timeout,
            elevated,
        }
    }

    /// Command line installing `package`, or `None` when no manager is known.
    pub fn install_command(manager: PackageManager, package: &str) -> Option<(&'static str, Vec<String>)> {
        let p = package.to_string();
        let cmd = match manager {
            PackageManager::Apt => ("apt-get", vec!["install".into(), "-y".into(), p]),
            PackageManager::Dnf => ("dnf", vec!["install".into(), "-y".into(), p]),
            PackageManager::Yum => ("yum", vec!["install".into(), "-y".into(), p]),
            PackageManager::Pacman => (
                "pacman",
                vec!["-S".into(), "--noconfirm".into(), "--needed".into(), p],
            ),
            PackageManager::Brew => ("brew", vec!["install".into(), p]),
            PackageManager::Choco => ("choco", vec!["install".into(), "-y".into(), p]),
            PackageManager::Winget => (
                "winget",
                vec![
                    "install".into(),
                    "--silent".into(),
                    "--accept-package-agreements".into(),
                    "--id".into(),
                    p,
                ],
            ),
            PackageManager::None => return None,
        };
        Some(cmd)
    }

    fn needs_root(&self) -> bool {
        matches!(
            self.manager,
            PackageManager::Apt | PackageManager::Dnf | PackageManager::Yum | PackageManager::Pacman
        )
    }

    /// Make sure `req` is available, installing its package if needed.
    pub fn ensure(&self, req: &Requirement) -> Result<DependencyStatus> {
        if self.lookup.exists(&req.executable) {
            return Ok(DependencyStatus::Present);
        }

        let Some((program, args)) = Self::install_command(self.manager, &req.package) else {
            return Err(DeployError::dependency(
                &req.executable,
                "not on PATH and no supported package manager was found",
            ));
        };

        if self.needs_root() && !self.elevated {
            return Err(DeployError::dependency(
                &req.executable,
                format!(
                    "not on PATH; install it with `sudo {program} {}`",
                    args.join(" ")
                ),
            ));
        }

        info!("Installing {} with {program}", req.package);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked(self.runner, program, &args, self.timeout)
            .map_err(|e| DeployError::dependency(&req.executable, e.to_string()))?;

        if !self.lookup.exists(&req.executable) {
            warn!("{program} succeeded but {} is still not on PATH", req.executable);
            return Err(DeployError::dependency(
                &req.executable,
                format!("{} installed but `{}` is not on PATH", req.package, req.executable),
            ));
        }
        Ok(DependencyStatus::Installed)
    }
}
