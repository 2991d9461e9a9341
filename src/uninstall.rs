//! Discover-and-remove.
//!
//! Once the operator confirms, every step runs even if an earlier one
//! failed. Targets that are already gone are reported as skipped, so running
//! the uninstaller a second time is harmless.

use std::fs;
use std::path::PathBuf;

use log::{info, warn};

use crate::config::DeployConfig;
use crate::context::DeployContext;
use crate::discovery::{DiscoveryResult, EntrypointMatcher, Locator};
use crate::error::{DeployError, Result};
use crate::lock::DeployLock;
use crate::manifest::InstallManifest;
use crate::prompt::Confirmer;
use crate::proxy::ReverseProxy;
use crate::report::{StepResult, UninstallReport, UninstallState};
use crate::service::{Change, ServiceManager};
use crate::system::{PortProbe, ProcessTable};

pub const LOCK: &str = "lock";
pub const STOP_SERVICE: &str = "stop-service";
pub const TERMINATE_PROCESSES: &str = "terminate-processes";
pub const DISABLE_SERVICE: &str = "disable-service";
pub const REMOVE_DESCRIPTOR: &str = "remove-descriptor";
pub const REMOVE_PROXY: &str = "remove-proxy";
pub const REMOVE_FILES: &str = "remove-files";
pub const CLEAN_ENVIRONMENT: &str = "clean-environment";
pub const VERIFY: &str = "verify";

pub struct Uninstaller<'a> {
    config: &'a DeployConfig,
    ctx: &'a DeployContext,
    manager: &'a dyn ServiceManager,
    proxy: &'a dyn ReverseProxy,
    processes: &'a dyn ProcessTable,
    ports: &'a dyn PortProbe,
    confirmer: &'a dyn Confirmer,
}

impl<'a> Uninstaller<'a> {
    pub fn new(
        config: &'a DeployConfig,
        ctx: &'a DeployContext,
        manager: &'a dyn ServiceManager,
        proxy: &'a dyn ReverseProxy,
        processes: &'a dyn ProcessTable,
        ports: &'a dyn PortProbe,
        confirmer: &'a dyn Confirmer,
    ) -> Self {
        Self {
            config,
            ctx,
            manager,
            proxy,
            processes,
            ports,
            confirmer,
        }
    }

    pub fn locate(&self) -> DiscoveryResult {
        Locator::new(
            self.config,
            self.manager,
            self.processes,
            self.ports,
            &self.ctx.candidate_roots,
        )
        .locate()
    }

    pub fn run(&self) -> UninstallReport {
        let discovery = self.locate();
        let mut report = UninstallReport {
            state: UninstallState::Discovered,
            discovery,
            steps: Vec::new(),
            residual: Vec::new(),
        };

        let _lock = match DeployLock::acquire(&self.ctx.lock_path) {
            Ok(lock) => lock,
            Err(e) => {
                report.push(StepResult::failed(LOCK, e.to_string()));
                return report;
            }
        };

        if !self.anything_installed(&report.discovery) {
            info!("nothing to uninstall");
            report.state = UninstallState::NothingInstalled;
            return report;
        }

        report.state = UninstallState::ConfirmationPending;
        match self.confirm(&report.discovery) {
            Ok(true) => report.state = UninstallState::Confirmed,
            Ok(false) => {
                report.state = UninstallState::Declined;
                return report;
            }
            Err(e) => {
                warn!("{e}");
                report.state = UninstallState::Declined;
                return report;
            }
        }

        let step = verb_step(STOP_SERVICE, "stopped", self.manager.stop());
        report.push(step);
        let step = self.terminate_processes(&report.discovery);
        report.push(step);
        report.state = UninstallState::ServicesStopped;

        let step = verb_step(DISABLE_SERVICE, "disabled", self.manager.disable());
        report.push(step);
        let step = verb_step(REMOVE_DESCRIPTOR, "descriptor removed", self.manager.remove());
        report.push(step);
        report.state = UninstallState::Deregistered;

        let step = verb_step(REMOVE_PROXY, "proxy configuration removed", self.proxy.remove());
        report.push(step);
        report.state = UninstallState::ProxyRemoved;

        let step = self.remove_files(&report.discovery, &mut report.residual);
        report.push(step);
        report.state = UninstallState::FilesRemoved;

        let step = self.clean_environment();
        report.push(step);
        report.state = UninstallState::EnvironmentCleaned;

        let step = self.verify(&report.discovery, &mut report.residual);
        report.push(step);
        report.state = UninstallState::Verified;
        report
    }

    fn anything_installed(&self, discovery: &DiscoveryResult) -> bool {
        discovery.found
            || self.manager.installed().is_some()
            || self.proxy.existing_config().is_some()
    }

    fn confirm(&self, discovery: &DiscoveryResult) -> Result<bool> {
        let location = discovery
            .found_install_dir
            .as_ref()
            .map(|d| format!(" in {}", d.display()))
            .unwrap_or_default();
        let question = format!(
            "Remove {} (port {}{location})?",
            self.config.service.name,
            discovery.port_or_default()
        );
        let help = format!("Evidence: {:?} confidence", discovery.confidence);
        self.confirmer.confirm(&question, &help, false)
    }

    fn roots(&self, discovery: &DiscoveryResult) -> Vec<PathBuf> {
        let mut roots = self.ctx.candidate_roots.clone();
        if let Some(dir) = &discovery.found_install_dir
            && !roots.contains(dir)
        {
            roots.push(dir.clone());
        }
        roots
    }

    /// Pids of processes running our entrypoint right now.
    fn service_pids(&self, roots: &[PathBuf]) -> Vec<u32> {
        let matcher = EntrypointMatcher {
            entrypoint: &self.config.service.entrypoint,
            module_path: &self.config.service.module_path,
            roots,
        };
        self.processes
            .processes()
            .into_iter()
            .filter(|p| matcher.matches(p))
            .map(|p| p.pid)
            .collect()
    }

    fn terminate_processes(&self, discovery: &DiscoveryResult) -> StepResult {
        if !discovery.confidence.permits_termination() {
            return StepResult::skipped(
                TERMINATE_PROCESSES,
                format!(
                    "{:?} evidence is too weak to terminate processes",
                    discovery.confidence
                ),
            );
        }

        let pids = self.service_pids(&self.roots(discovery));
        if pids.is_empty() {
            return StepResult::skipped(TERMINATE_PROCESSES, "no service processes running");
        }

        let mut stopped = Vec::new();
        let mut errors = Vec::new();
        for pid in pids {
            match self.processes.terminate(pid) {
                Ok(_) => stopped.push(pid),
                Err(e) => errors.push(format!("{pid}: {e}")),
            }
        }
        if errors.is_empty() {
            StepResult::ok(TERMINATE_PROCESSES, format!("terminated {stopped:?}"))
        } else {
            StepResult::failed(
                TERMINATE_PROCESSES,
                format!("could not terminate {}", errors.join(", ")),
            )
        }
    }

    /// Directories that may hold the installation, most specific first.
    fn install_dirs(&self, discovery: &DiscoveryResult) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = discovery.found_install_dir.iter().cloned().collect();
        if !dirs.contains(&self.ctx.install_dir) {
            dirs.push(self.ctx.install_dir.clone());
        }
        dirs.retain(|d| d.is_dir());
        dirs
    }

    fn remove_files(&self, discovery: &DiscoveryResult, residual: &mut Vec<String>) -> StepResult {
        let dirs = self.install_dirs(discovery);
        if dirs.is_empty() {
            return StepResult::skipped(REMOVE_FILES, "no install directory present");
        }

        let mut removed = Vec::new();
        let mut kept = Vec::new();
        let mut errors = Vec::new();
        for dir in dirs {
            if !InstallManifest::exists_in(&dir) {
                warn!("{} has no install manifest; leaving it in place", dir.display());
                kept.push(dir);
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!("Removed {}", dir.display());
                    removed.push(dir);
                }
                Err(e) => errors.push(DeployError::io_at(&dir, e).to_string()),
            }
        }

        for dir in &kept {
            residual.push(format!("{} kept: not created by this deployer", dir.display()));
        }
        if self.ctx.log_dir.is_dir() {
            residual.push(format!("logs kept at {}", self.ctx.log_dir.display()));
        }

        if !errors.is_empty() {
            return StepResult::failed(REMOVE_FILES, errors.join("; "));
        }
        if removed.is_empty() {
            return StepResult::skipped(
                REMOVE_FILES,
                format!("{} directory(ies) without a manifest left in place", kept.len()),
            );
        }
        let list: Vec<String> = removed.iter().map(|d| d.display().to_string()).collect();
        StepResult::ok(REMOVE_FILES, format!("removed {}", list.join(", ")))
    }

    fn clean_environment(&self) -> StepResult {
        let staging = &self.ctx.staging_dir;
        if !staging.exists() {
            return StepResult::skipped(CLEAN_ENVIRONMENT, "no staged artifacts");
        }
        match fs::remove_dir_all(staging) {
            Ok(()) => StepResult::ok(
                CLEAN_ENVIRONMENT,
                format!("removed staged artifacts in {}", staging.display()),
            ),
            Err(e) => StepResult::failed(CLEAN_ENVIRONMENT, DeployError::io_at(staging, e).to_string()),
        }
    }

    /// Records what is still there; never fails the run.
    fn verify(&self, discovery: &DiscoveryResult, residual: &mut Vec<String>) -> StepResult {
        let before = residual.len();

        for pid in self.service_pids(&self.roots(discovery)) {
            residual.push(format!("process {pid} still runs the service"));
        }
        if let Some(port) = discovery.found_port
            && self.ports.in_use(port)
        {
            residual.push(format!("port {port} is still in use"));
        }
        if let Some(installed) = self.manager.installed() {
            residual.push(format!(
                "descriptor {} is still present",
                installed.descriptor.display()
            ));
        }
        if let Some(path) = self.proxy.existing_config() {
            residual.push(format!("proxy configuration {} is still present", path.display()));
        }

        let found = residual.len() - before;
        if found == 0 {
            StepResult::ok(VERIFY, "no trace of the service remains")
        } else {
            StepResult::ok(VERIFY, format!("{found} residual item(s) found"))
        }
    }
}

fn verb_step(step: &'static str, done: &str, result: Result<Change>) -> StepResult {
    match result {
        Ok(Change::Applied) => StepResult::ok(step, done),
        Ok(Change::Unchanged(reason)) => StepResult::skipped(step, reason),
        Err(e) => StepResult::failed(step, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::platform::OsFamily;
    use crate::prompt::FixedConfirmer;
    use crate::proxy::NoProxy;
    use crate::report::Outcome;
    use crate::service::{Exec, ServiceDescriptor, ServiceManagerKind, Systemd};
    use crate::system::ProcessInfo;
    use crate::system::fakes::{FakePortProbe, FakeProcessTable, FakeRunner, process};

    struct Host {
        root: tempfile::TempDir,
        config: DeployConfig,
        ctx: DeployContext,
        runner: FakeRunner,
    }

    impl Host {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let config = DeployConfig::default();
            let ctx = DeployContext::rooted(&config, root.path(), true);
            Self {
                root,
                config,
                ctx,
                runner: FakeRunner::new(),
            }
        }

        fn systemd(&self) -> Systemd<'_> {
            let exec = Exec::new(&self.runner, Duration::from_secs(1), true);
            Systemd::new(
                "rkos",
                exec,
                self.root.path().join("units"),
                self.ctx.staging_dir.clone(),
            )
        }

        fn install(&self, port: u16, with_manifest: bool) {
            let dir = &self.ctx.install_dir;
            fs::create_dir_all(dir.join("src")).unwrap();
            fs::write(dir.join("main.py"), "").unwrap();
            if with_manifest {
                InstallManifest {
                    service: "rkos".to_string(),
                    port,
                    install_dir: dir.clone(),
                    manager: ServiceManagerKind::SystemdUnit,
                    descriptor: None,
                    proxy_config: None,
                    os_family: OsFamily::Debian,
                    installed_at: Utc::now(),
                }
                .write_to(dir)
                .unwrap();
            }
        }

        fn register(&self, port: u16) {
            let desc = ServiceDescriptor::for_application(
                &self.config,
                "/usr/bin/python3".into(),
                &self.ctx.install_dir,
                &self.ctx.log_dir,
                port,
                None,
            );
            self.systemd().register(&desc).unwrap();
        }

        fn service_process(&self, pid: u32, port: u16) -> ProcessInfo {
            let script = format!("{}/main.py", self.ctx.install_dir.display());
            process(pid, &["python3", &script, "--port", &port.to_string()])
        }

        fn run(
            &self,
            procs: &FakeProcessTable,
            ports: &FakePortProbe,
            confirmer: &FixedConfirmer,
        ) -> UninstallReport {
            let manager = self.systemd();
            let proxy = NoProxy::new("disabled");
            Uninstaller::new(&self.config, &self.ctx, &manager, &proxy, procs, ports, confirmer).run()
        }
    }

    fn outcome(report: &UninstallReport, step: &str) -> Outcome {
        report.step(step).unwrap().outcome
    }

    #[test]
    fn full_removal_of_registered_install() {
        let host = Host::new();
        host.install(8090, true);
        host.register(8090);
        let procs = FakeProcessTable::new(vec![
            host.service_process(40, 8090),
            process(41, &["python3", "/home/someone/main.py", "--port", "8090"]),
        ]);
        let ports = FakePortProbe::with_busy(&[8090]);
        let confirmer = FixedConfirmer::new(true);

        let report = host.run(&procs, &ports, &confirmer);

        assert_eq!(report.state, UninstallState::Verified);
        assert!(report.is_success());
        assert_eq!(report.discovery.found_port, Some(8090));
        assert_eq!(procs.terminated(), vec![40]);
        assert_eq!(outcome(&report, REMOVE_DESCRIPTOR), Outcome::Ok);
        assert_eq!(outcome(&report, REMOVE_FILES), Outcome::Ok);
        assert!(!host.ctx.install_dir.exists());
        assert!(!host.root.path().join("units/rkos.service").exists());
        assert!(host.runner.ran("systemctl stop rkos.service"));
        assert!(host.runner.ran("systemctl disable rkos.service"));
        // The fake probe still reports the port busy.
        assert!(report.residual.iter().any(|r| r.contains("port 8090")));
        assert_eq!(confirmer.asked().len(), 1);
    }

    #[test]
    fn uninstall_twice_has_no_failed_steps() {
        let host = Host::new();
        host.install(8085, true);
        host.register(8085);
        let procs = FakeProcessTable::new(vec![host.service_process(50, 8085)]);
        let ports = FakePortProbe::default();
        let confirmer = FixedConfirmer::new(true);

        let first = host.run(&procs, &ports, &confirmer);
        assert!(first.is_success());

        let second = host.run(&procs, &ports, &confirmer);
        assert!(second.is_success());
        assert_eq!(second.state, UninstallState::NothingInstalled);
        assert!(second.steps.iter().all(|s| s.outcome != Outcome::Failed));
    }

    #[test]
    fn empty_host_is_nothing_installed() {
        let host = Host::new();
        let confirmer = FixedConfirmer::new(true);
        let report = host.run(&FakeProcessTable::default(), &FakePortProbe::default(), &confirmer);
        assert_eq!(report.state, UninstallState::NothingInstalled);
        assert!(!report.discovery.found);
        assert!(confirmer.asked().is_empty());
    }

    #[test]
    fn declined_confirmation_touches_nothing() {
        let host = Host::new();
        host.install(8085, true);
        host.register(8085);
        let report = host.run(
            &FakeProcessTable::default(),
            &FakePortProbe::default(),
            &FixedConfirmer::new(false),
        );
        assert_eq!(report.state, UninstallState::Declined);
        assert!(!report.is_success());
        assert!(report.steps.is_empty());
        assert!(host.ctx.install_dir.join("main.py").exists());
        assert!(!host.runner.ran("systemctl stop"));
        assert!(!host.runner.ran("systemctl disable"));
    }

    #[test]
    fn weak_evidence_never_kills_processes() {
        let host = Host::new();
        let procs = FakeProcessTable::new(vec![process(60, &["python3", "/srv/other/app.py"])]);
        let ports = FakePortProbe::with_busy(&[8080]);
        let report = host.run(&procs, &ports, &FixedConfirmer::new(true));

        assert_eq!(report.discovery.found_port, Some(8080));
        assert_eq!(outcome(&report, TERMINATE_PROCESSES), Outcome::Skipped);
        assert!(procs.terminated().is_empty());
        assert!(report.is_success());
    }

    #[test]
    fn directory_without_manifest_is_left_alone() {
        let host = Host::new();
        host.install(8085, false);
        let report = host.run(
            &FakeProcessTable::default(),
            &FakePortProbe::default(),
            &FixedConfirmer::new(true),
        );

        assert_eq!(report.discovery.found_install_dir.as_deref(), Some(host.ctx.install_dir.as_path()));
        assert_eq!(outcome(&report, REMOVE_FILES), Outcome::Skipped);
        assert!(host.ctx.install_dir.join("main.py").exists());
        assert!(report.residual.iter().any(|r| r.contains("not created by this deployer")));
    }
}
