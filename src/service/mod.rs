//! Init-system adapters.
//!
//! One adapter is chosen per run from the platform profile and every
//! lifecycle operation goes through it. Adapters never fail a `register`
//! because of missing privilege: the rendered descriptor is written to the
//! staging directory and the caller gets instructions instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;
use crate::context::DeployContext;
use crate::error::{DeployError, Result};
use crate::platform::{InitSystem, PlatformProfile};
use crate::system::{CommandOutput, CommandRunner, packages::ExecutableLookup};

mod descriptor;
pub(crate) mod file_ops;
mod launchd;
mod startup;
mod supervisor;
mod systemd;

pub use descriptor::{RestartPolicy, ServiceDescriptor, port_flag};
pub use launchd::Launchd;
pub use startup::{ScriptFlavour, StartupScript};
pub use supervisor::Supervisor;
pub use systemd::Systemd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceManagerKind {
    SystemdUnit,
    LaunchdPlist,
    WindowsStartup,
    StartupScript,
    SupervisorConf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    Active,
    Inactive,
    Unknown,
}

/// Result of writing a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Live with the init system. `instructions` carries anything the
    /// operator still has to know to run it.
    Installed {
        path: PathBuf,
        instructions: Option<String>,
    },
    /// Written to the staging directory; the operator finishes by hand.
    Staged { path: PathBuf, instructions: String },
}

impl Registration {
    pub fn path(&self) -> &Path {
        match self {
            Self::Installed { path, .. } | Self::Staged { path, .. } => path,
        }
    }
}

/// Effect of a lifecycle verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Applied,
    /// Nothing to do; the reason is shown to the operator.
    Unchanged(String),
}

/// What a registered (or staged) descriptor says about the installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledService {
    pub descriptor: PathBuf,
    pub port: Option<u16>,
    pub working_dir: Option<PathBuf>,
    pub staged: bool,
}

pub trait ServiceManager {
    fn kind(&self) -> ServiceManagerKind;

    /// Where `register` writes the descriptor for the current privilege.
    fn descriptor_path(&self) -> PathBuf;

    fn register(&self, desc: &ServiceDescriptor) -> Result<Registration>;
    fn enable(&self) -> Result<Change>;
    fn start(&self) -> Result<Change>;
    fn stop(&self) -> Result<Change>;
    fn disable(&self) -> Result<Change>;

    /// Bring a running service up on a rewritten descriptor.
    fn restart(&self) -> Result<Change> {
        self.stop()?;
        self.start()
    }

    /// Delete the registered and staged descriptors.
    fn remove(&self) -> Result<Change>;

    fn query_status(&self) -> ServiceStatus;

    /// Read-only parse of the registered descriptor, or the staged one.
    fn installed(&self) -> Option<InstalledService>;
}

/// Command execution settings shared by every adapter.
#[derive(Clone, Copy)]
pub struct Exec<'a> {
    pub runner: &'a dyn CommandRunner,
    pub timeout: Duration,
    pub elevated: bool,
}

impl<'a> Exec<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration, elevated: bool) -> Self {
        Self {
            runner,
            timeout,
            elevated,
        }
    }

    pub(crate) fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run(program, args, self.timeout)
    }

    /// Run a verb that must succeed.
    pub(crate) fn verb(&self, program: &str, args: &[&str]) -> Result<Change> {
        crate::system::run_checked(self.runner, program, args, self.timeout)?;
        Ok(Change::Applied)
    }

    pub(crate) fn require_elevated(&self, action: &str) -> Result<()> {
        if self.elevated {
            Ok(())
        } else {
            Err(DeployError::permission(format!(
                "{action} requires administrator privileges; re-run with sudo"
            )))
        }
    }
}

/// Pick the adapter for this host once.
pub fn select<'a>(
    profile: &PlatformProfile,
    config: &DeployConfig,
    ctx: &DeployContext,
    exec: Exec<'a>,
    lookup: &dyn ExecutableLookup,
) -> Box<dyn ServiceManager + 'a> {
    let name = config.service.name.as_str();
    let staging = ctx.staging_dir.clone();
    let supervisor_available = profile.is_linux() && lookup.exists("supervisorctl");

    let adapter: Box<dyn ServiceManager + 'a> = match profile.init_system {
        InitSystem::Systemd if config.service.prefer_supervisor && supervisor_available => {
            Box::new(Supervisor::new(name, exec, Supervisor::detect_config_path(name), staging))
        }
        InitSystem::Systemd => Box::new(Systemd::new(
            name,
            exec,
            PathBuf::from(systemd::SYSTEM_UNIT_DIR),
            staging,
        )),
        InitSystem::Launchd => Box::new(Launchd::new(name, exec, Launchd::default_dir(exec.elevated))),
        InitSystem::WindowsService => Box::new(StartupScript::new(
            name,
            ScriptFlavour::Windows,
            exec,
            ctx.install_dir.clone(),
        )),
        InitSystem::None if supervisor_available => {
            Box::new(Supervisor::new(name, exec, Supervisor::detect_config_path(name), staging))
        }
        InitSystem::None => Box::new(StartupScript::new(
            name,
            ScriptFlavour::Posix,
            exec,
            ctx.install_dir.clone(),
        )),
    };
    info!("service manager: {:?}", adapter.kind());
    debug!("descriptor path: {}", adapter.descriptor_path().display());
    adapter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, OsFamily, PackageManager};
    use crate::system::fakes::FakeRunner;

    struct Lookup(&'static [&'static str]);

    impl ExecutableLookup for Lookup {
        fn exists(&self, executable: &str) -> bool {
            self.0.contains(&executable)
        }
    }

    fn profile(os_family: OsFamily, init_system: InitSystem) -> PlatformProfile {
        PlatformProfile {
            os_family,
            init_system,
            arch: Arch::X86_64,
            package_manager: PackageManager::None,
            embedded_board: false,
        }
    }

    fn kind_for(profile: &PlatformProfile, prefer_supervisor: bool, lookup: &Lookup) -> ServiceManagerKind {
        let mut config = DeployConfig::default();
        config.service.prefer_supervisor = prefer_supervisor;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DeployContext::rooted(&config, dir.path(), false);
        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), false);
        select(profile, &config, &ctx, exec, lookup).kind()
    }

    #[test]
    fn selection_follows_init_system() {
        let none = Lookup(&[]);
        assert_eq!(
            kind_for(&profile(OsFamily::Debian, InitSystem::Systemd), false, &none),
            ServiceManagerKind::SystemdUnit
        );
        assert_eq!(
            kind_for(&profile(OsFamily::Macos, InitSystem::Launchd), false, &none),
            ServiceManagerKind::LaunchdPlist
        );
        assert_eq!(
            kind_for(&profile(OsFamily::Windows, InitSystem::WindowsService), false, &none),
            ServiceManagerKind::WindowsStartup
        );
        assert_eq!(
            kind_for(&profile(OsFamily::Debian, InitSystem::None), false, &none),
            ServiceManagerKind::StartupScript
        );
    }

    #[test]
    fn supervisor_used_without_init_or_when_preferred() {
        let sup = Lookup(&["supervisorctl"]);
        assert_eq!(
            kind_for(&profile(OsFamily::Arch, InitSystem::None), false, &sup),
            ServiceManagerKind::SupervisorConf
        );
        assert_eq!(
            kind_for(&profile(OsFamily::Debian, InitSystem::Systemd), true, &sup),
            ServiceManagerKind::SupervisorConf
        );
        assert_eq!(
            kind_for(&profile(OsFamily::Debian, InitSystem::Systemd), false, &sup),
            ServiceManagerKind::SystemdUnit
        );
    }
}
