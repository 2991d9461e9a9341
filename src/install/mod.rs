//! Install orchestration.
//!
//! Steps run in a fixed order and each one becomes a [`StepResult`]. A step
//! whose prerequisite failed is recorded as skipped; independent steps still
//! run. Only a held lock, port exhaustion or a declined overwrite stop the
//! run early.

use std::path::PathBuf;
use std::thread;

use chrono::Utc;
use log::{info, warn};

use crate::config::DeployConfig;
use crate::context::DeployContext;
use crate::error::{DeployError, Result};
use crate::lock::DeployLock;
use crate::manifest::InstallManifest;
use crate::platform::{InitSystem, PlatformProfile};
use crate::port::{PortAllocator, PortRequest, PortSelection};
use crate::prompt::Confirmer;
use crate::proxy::{ProxyOutcome, ReverseProxy};
use crate::report::{InstallReport, InstallState, Outcome, StepResult};
use crate::service::{Change, Registration, ServiceDescriptor, ServiceManager, ServiceStatus};
use crate::system::packages::{DependencyStatus, ExecutableLookup, PackageInstaller, Requirement};
use crate::system::{CommandRunner, PortProbe, privilege};

mod staging;

pub use staging::{prepare_log_dir, stage_tree};

pub const PLATFORM_PROBE: &str = "platform-probe";
pub const LOCK: &str = "lock";
pub const DEPENDENCIES: &str = "dependencies";
pub const PORT: &str = "port";
pub const STAGE_FILES: &str = "stage-files";
pub const REGISTER_SERVICE: &str = "register-service";
pub const ENABLE_SERVICE: &str = "enable-service";
pub const START_SERVICE: &str = "start-service";
pub const REVERSE_PROXY: &str = "reverse-proxy";

/// Operator choices for one install.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Raw `--port` value; validated by the allocator.
    pub port: Option<u32>,
    pub source_dir: PathBuf,
    pub start: bool,
    pub hardened: bool,
}

/// Host capabilities the orchestrator acts through.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub ports: &'a dyn PortProbe,
    pub runner: &'a dyn CommandRunner,
    pub lookup: &'a dyn ExecutableLookup,
    pub confirmer: &'a dyn Confirmer,
}

pub struct Installer<'a> {
    config: &'a DeployConfig,
    ctx: &'a DeployContext,
    caps: Capabilities<'a>,
    seed: Option<u64>,
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a DeployConfig, ctx: &'a DeployContext, caps: Capabilities<'a>) -> Self {
        Self {
            config,
            ctx,
            caps,
            seed: None,
        }
    }

    /// Fix the ephemeral port generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn run(
        &self,
        profile: PlatformProfile,
        manager: &dyn ServiceManager,
        proxy: &dyn ReverseProxy,
        options: &InstallOptions,
    ) -> InstallReport {
        let mut report = InstallReport::new();

        report.push(StepResult::ok(PLATFORM_PROBE, describe_platform(&profile)));
        report.platform = Some(profile);
        report.state = InstallState::PlatformProbed;

        let _lock = match DeployLock::acquire(&self.ctx.lock_path) {
            Ok(lock) => {
                report.push(StepResult::ok(LOCK, lock.path().display().to_string()));
                lock
            }
            Err(e) => {
                report.push(StepResult::failed(LOCK, e.to_string()));
                report.state = InstallState::Aborted(LOCK);
                return report;
            }
        };

        let deps_ok = match self.check_dependencies(&profile) {
            Ok(detail) => {
                report.push(StepResult::ok(DEPENDENCIES, detail));
                report.state = InstallState::DependenciesChecked;
                true
            }
            Err(e) => {
                report.push(StepResult::failed(DEPENDENCIES, e.to_string()));
                false
            }
        };

        let selection = match self.allocate_port(options) {
            Ok(selection) => selection,
            Err(e) => {
                report.push(StepResult::failed(PORT, e.to_string()));
                report.state = InstallState::Aborted(PORT);
                return report;
            }
        };
        let port = selection.resolved_port;
        report.push(StepResult::ok(
            PORT,
            format!("{port} ({:?})", selection.method),
        ));
        report.port = Some(selection);
        report.state = InstallState::PortResolved;

        let staged = match self.stage_files(options) {
            Ok(Some(detail)) => {
                report.push(StepResult::ok(STAGE_FILES, detail));
                report.artifacts.push(self.ctx.install_dir.clone());
                report.state = InstallState::FilesStaged;
                true
            }
            Ok(None) => {
                report.push(StepResult::failed(
                    STAGE_FILES,
                    "existing installation kept; overwrite declined",
                ));
                report.state = InstallState::Aborted(STAGE_FILES);
                return report;
            }
            Err(e @ DeployError::Cancelled(_)) => {
                report.push(StepResult::failed(STAGE_FILES, e.to_string()));
                report.state = InstallState::Aborted(STAGE_FILES);
                return report;
            }
            Err(e) => {
                report.push(StepResult::failed(STAGE_FILES, e.to_string()));
                false
            }
        };

        // A live service keeps its old descriptor until restarted.
        let was_running = staged
            && manager.installed().is_some_and(|svc| !svc.staged)
            && manager.query_status() == ServiceStatus::Active;

        let registration = if staged {
            self.register(manager, port, options, &mut report)
        } else {
            report.push(StepResult::skipped(REGISTER_SERVICE, "requires stage-files"));
            None
        };

        let enabled = self.enable(manager, registration.as_ref(), &mut report);

        let started = if !options.start {
            let detail = if was_running {
                warn!("the running service keeps its previous settings until restarted");
                "--no-start given; running service not restarted"
            } else {
                "--no-start given"
            };
            report.push(StepResult::skipped(START_SERVICE, detail));
            false
        } else if !enabled {
            report.push(StepResult::skipped(START_SERVICE, "requires enable-service"));
            false
        } else if !deps_ok {
            report.push(StepResult::skipped(START_SERVICE, "requires dependencies"));
            false
        } else {
            self.start(manager, was_running, &mut report)
        };

        let proxy_path = self.configure_proxy(proxy, port, &mut report);

        if staged {
            self.record_manifest(
                port,
                manager,
                registration.as_ref().map(|r| r.path().to_path_buf()),
                proxy_path,
                &report,
            );
        }

        report.state = final_state(&report, started);
        info!("install finished in state {:?}", report.state);
        report
    }

    fn check_dependencies(&self, profile: &PlatformProfile) -> Result<String> {
        let interpreter = &self.config.service.interpreter;
        let installer = PackageInstaller::new(
            profile.package_manager,
            self.caps.runner,
            self.caps.lookup,
            self.ctx.package_timeout,
            self.ctx.elevated,
        );
        let req = Requirement::interpreter(interpreter, profile.package_manager);
        Ok(match installer.ensure(&req)? {
            DependencyStatus::Present => format!("{interpreter} found"),
            DependencyStatus::Installed => format!(
                "installed {} with {}",
                req.package,
                profile.package_manager.executable().unwrap_or("package manager")
            ),
        })
    }

    fn allocate_port(&self, options: &InstallOptions) -> Result<PortSelection> {
        let mut allocator = match self.seed {
            Some(seed) => PortAllocator::with_seed(self.caps.ports, self.caps.confirmer, seed),
            None => PortAllocator::new(self.caps.ports, self.caps.confirmer),
        };
        allocator.allocate(&PortRequest {
            preferred: &self.config.ports.preferred,
            operator_choice: options.port,
            ephemeral_attempts: self.config.ports.ephemeral_attempts,
        })
    }

    /// `Ok(None)` when the operator refuses to overwrite an existing install.
    fn stage_files(&self, options: &InstallOptions) -> Result<Option<String>> {
        let svc = &self.config.service;
        let install_dir = &self.ctx.install_dir;

        if let Some(previous) = InstallManifest::read_from(install_dir) {
            let replace = self.caps.confirmer.confirm(
                &format!(
                    "{} is already installed at {} (port {}). Replace its files?",
                    previous.service,
                    install_dir.display(),
                    previous.port
                ),
                "Existing files are overwritten; the service is re-registered",
                false,
            )?;
            if !replace {
                return Ok(None);
            }
        }

        let entrypoint = options.source_dir.join(&svc.entrypoint);
        if !entrypoint.is_file() {
            return Err(DeployError::system(format!(
                "{} has no {}; pass --source <dir>",
                options.source_dir.display(),
                svc.entrypoint
            )));
        }

        let copied = stage_tree(&options.source_dir, install_dir)?;
        prepare_log_dir(
            &self.ctx.log_dir,
            self.service_user().as_deref(),
            self.ctx.elevated,
        )?;
        Ok(Some(format!(
            "{copied} files staged in {}",
            install_dir.display()
        )))
    }

    fn service_user(&self) -> Option<String> {
        self.config.service.user.clone().or_else(|| {
            if cfg!(windows) {
                None
            } else {
                Some(privilege::invoking_user())
            }
        })
    }

    fn register(
        &self,
        manager: &dyn ServiceManager,
        port: u16,
        options: &InstallOptions,
        report: &mut InstallReport,
    ) -> Option<Registration> {
        let interpreter = &self.config.service.interpreter;
        let interpreter_path =
            which::which(interpreter).unwrap_or_else(|_| PathBuf::from(interpreter));
        let desc = ServiceDescriptor::for_application(
            self.config,
            interpreter_path,
            &self.ctx.install_dir,
            &self.ctx.log_dir,
            port,
            self.service_user(),
        )
        .hardened(self.config.service.hardened && options.hardened);

        match manager.register(&desc) {
            Ok(registration) => {
                let path = registration.path().to_path_buf();
                let step = match &registration {
                    Registration::Installed { instructions, .. } => StepResult::ok(
                        REGISTER_SERVICE,
                        format!("{:?} written to {}", manager.kind(), path.display()),
                    )
                    .with_instructions(instructions.clone()),
                    Registration::Staged { instructions, .. } => StepResult::degraded(
                        REGISTER_SERVICE,
                        format!("{:?} staged at {}", manager.kind(), path.display()),
                        instructions.clone(),
                    ),
                };
                report.push(step);
                report.artifacts.push(path);
                report.state = InstallState::ServiceRegistered;
                Some(registration)
            }
            Err(e) => {
                report.push(StepResult::failed(REGISTER_SERVICE, e.to_string()));
                None
            }
        }
    }

    /// True when the service is enabled and may be started.
    fn enable(
        &self,
        manager: &dyn ServiceManager,
        registration: Option<&Registration>,
        report: &mut InstallReport,
    ) -> bool {
        match registration {
            None => {
                report.push(StepResult::skipped(ENABLE_SERVICE, "requires register-service"));
                false
            }
            Some(Registration::Staged { instructions, .. }) => {
                report.push(
                    StepResult::skipped(ENABLE_SERVICE, "descriptor staged; finish manually")
                        .with_instructions(Some(instructions.clone())),
                );
                false
            }
            Some(Registration::Installed { .. }) => match manager.enable() {
                Ok(Change::Applied) => {
                    report.push(StepResult::ok(ENABLE_SERVICE, "enabled at boot"));
                    true
                }
                Ok(Change::Unchanged(reason)) => {
                    report.push(StepResult::skipped(ENABLE_SERVICE, reason));
                    false
                }
                Err(e) => {
                    report.push(StepResult::failed(ENABLE_SERVICE, e.to_string()));
                    false
                }
            },
        }
    }

    fn start(
        &self,
        manager: &dyn ServiceManager,
        was_running: bool,
        report: &mut InstallReport,
    ) -> bool {
        let result = if was_running {
            info!("restarting the running service on the new descriptor");
            manager.restart()
        } else {
            manager.start()
        };
        match result {
            Ok(Change::Applied) => {}
            Ok(Change::Unchanged(reason)) => {
                report.push(StepResult::skipped(START_SERVICE, reason));
                return false;
            }
            Err(e) => {
                report.push(StepResult::failed(START_SERVICE, e.to_string()));
                return false;
            }
        }

        thread::sleep(self.ctx.settle_delay);
        match manager.query_status() {
            ServiceStatus::Active => {
                let detail = if was_running { "restarted" } else { "running" };
                report.push(StepResult::ok(START_SERVICE, detail));
                report.state = InstallState::ServiceRunning;
                true
            }
            ServiceStatus::Inactive => {
                let log = self.ctx.log_dir.join(format!("{}.log", self.ctx.service_name));
                report.push(StepResult::failed(
                    START_SERVICE,
                    format!("not active after start; see {}", log.display()),
                ));
                false
            }
            ServiceStatus::Unknown => {
                warn!("service started but its status could not be read");
                report.push(StepResult::ok(START_SERVICE, "started; status unknown"));
                true
            }
        }
    }

    fn configure_proxy(
        &self,
        proxy: &dyn ReverseProxy,
        port: u16,
        report: &mut InstallReport,
    ) -> Option<PathBuf> {
        match proxy.configure(port) {
            Ok(ProxyOutcome::Activated { path }) => {
                report.push(StepResult::ok(
                    REVERSE_PROXY,
                    format!("nginx forwards to 127.0.0.1:{port}"),
                ));
                report.artifacts.push(path.clone());
                Some(path)
            }
            Ok(ProxyOutcome::Staged { path, instructions }) => {
                report.push(StepResult::degraded(
                    REVERSE_PROXY,
                    format!("server block staged at {}", path.display()),
                    instructions,
                ));
                report.artifacts.push(path.clone());
                Some(path)
            }
            Ok(ProxyOutcome::Skipped(reason)) => {
                report.push(StepResult::skipped(REVERSE_PROXY, reason));
                None
            }
            Err(e) => {
                report.push(StepResult::failed(REVERSE_PROXY, e.to_string()));
                None
            }
        }
    }

    fn record_manifest(
        &self,
        port: u16,
        manager: &dyn ServiceManager,
        descriptor: Option<PathBuf>,
        proxy_config: Option<PathBuf>,
        report: &InstallReport,
    ) {
        let manifest = InstallManifest {
            service: self.config.service.name.clone(),
            port,
            install_dir: self.ctx.install_dir.clone(),
            manager: manager.kind(),
            descriptor,
            proxy_config,
            os_family: report
                .platform
                .map(|p| p.os_family)
                .unwrap_or(crate::platform::OsFamily::Unknown),
            installed_at: Utc::now(),
        };
        if let Err(e) = manifest.write_to(&self.ctx.install_dir) {
            warn!("Failed to write install manifest: {e}");
        }
    }
}

fn describe_platform(profile: &PlatformProfile) -> String {
    let mut detail = format!(
        "{:?} on {:?}, init {:?}, packages {:?}",
        profile.os_family, profile.arch, profile.init_system, profile.package_manager
    );
    if profile.init_system == InitSystem::None {
        detail.push_str("; no init system, startup will be manual");
    }
    detail
}

fn final_state(report: &InstallReport, started: bool) -> InstallState {
    if let Some(step) = report.first_failure() {
        return InstallState::PartialInstall(step);
    }
    let degraded = report
        .steps
        .iter()
        .any(|s| s.instructions.is_some() && s.outcome != Outcome::Failed);
    if degraded {
        InstallState::ManualCompletionRequired
    } else if started {
        InstallState::ServiceRunning
    } else {
        InstallState::ServiceRegistered
    }
}
