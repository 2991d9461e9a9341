//! Locating an existing installation.
//!
//! Evidence is consulted in a fixed order and the first source that yields
//! anything wins. The result always says which source that was, so callers
//! can decide how far to trust it. Locating never fails.

use std::collections::BTreeSet;
use std::path::PathBuf;

use log::{debug, info};
use serde::Serialize;

use crate::config::{DEFAULT_PORT, DeployConfig};
use crate::manifest::InstallManifest;
use crate::service::ServiceManager;
use crate::system::{PortProbe, ProcessTable};

mod patterns;

pub use patterns::{EntrypointMatcher, is_install_root, port_from_command_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    ServiceConfig,
    RunningProcess,
    FilesystemProbe,
    DefaultFallback,
}

impl Confidence {
    /// Evidence strong enough to justify killing processes.
    pub fn permits_termination(&self) -> bool {
        matches!(self, Self::ServiceConfig | Self::RunningProcess)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryResult {
    pub found: bool,
    pub found_port: Option<u16>,
    pub found_install_dir: Option<PathBuf>,
    pub confidence: Confidence,
    /// Every distinct port the winning source saw.
    pub candidates: Vec<u16>,
    pub pids: Vec<u32>,
    pub evidence: Vec<String>,
}

impl DiscoveryResult {
    fn nothing() -> Self {
        Self {
            found: false,
            found_port: None,
            found_install_dir: None,
            confidence: Confidence::DefaultFallback,
            candidates: Vec::new(),
            pids: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn port_or_default(&self) -> u16 {
        self.found_port.unwrap_or(DEFAULT_PORT)
    }

    pub fn is_ambiguous(&self) -> bool {
        self.candidates.len() > 1
    }
}

pub struct Locator<'a> {
    config: &'a DeployConfig,
    manager: &'a dyn ServiceManager,
    processes: &'a dyn ProcessTable,
    ports: &'a dyn PortProbe,
    roots: &'a [PathBuf],
}

impl<'a> Locator<'a> {
    pub fn new(
        config: &'a DeployConfig,
        manager: &'a dyn ServiceManager,
        processes: &'a dyn ProcessTable,
        ports: &'a dyn PortProbe,
        roots: &'a [PathBuf],
    ) -> Self {
        Self {
            config,
            manager,
            processes,
            ports,
            roots,
        }
    }

    fn matcher(&self) -> EntrypointMatcher<'_> {
        EntrypointMatcher {
            entrypoint: &self.config.service.entrypoint,
            module_path: &self.config.service.module_path,
            roots: self.roots,
        }
    }

    pub fn locate(&self) -> DiscoveryResult {
        let mut evidence = Vec::new();

        let mut result = self
            .from_descriptor(&mut evidence)
            .or_else(|| self.from_processes(&mut evidence))
            .or_else(|| self.from_default_ports(&mut evidence))
            .or_else(|| self.from_filesystem(&mut evidence))
            .unwrap_or_else(|| {
                evidence.push(format!(
                    "no installation evidence; assuming default port {DEFAULT_PORT}"
                ));
                DiscoveryResult::nothing()
            });

        if result.found_port.is_some() && result.found_install_dir.is_none()
            && let Some(dir) = self.filesystem_roots().into_iter().next()
        {
            evidence.push(format!("install directory {} found on disk", dir.display()));
            result.found_install_dir = Some(dir);
        }

        result.evidence = evidence;
        info!(
            "discovery: found={} port={:?} confidence={:?}",
            result.found, result.found_port, result.confidence
        );
        result
    }

    /// Processes running our entrypoint, with the port each advertises.
    fn running(&self) -> Vec<(u32, Option<u16>, PathBuf)> {
        let matcher = self.matcher();
        self.processes
            .processes()
            .into_iter()
            .filter_map(|p| {
                let dir = matcher.install_dir_of(&p)?;
                Some((p.pid, port_from_command_line(&p.command_line()), dir))
            })
            .collect()
    }

    fn from_descriptor(&self, evidence: &mut Vec<String>) -> Option<DiscoveryResult> {
        let installed = self.manager.installed()?;
        let Some(port) = installed.port else {
            evidence.push(format!(
                "descriptor {} has no port",
                installed.descriptor.display()
            ));
            return None;
        };
        evidence.push(format!(
            "{}descriptor {} declares port {port}",
            if installed.staged { "staged " } else { "" },
            installed.descriptor.display()
        ));

        let running = self.running();
        for (pid, seen, _) in &running {
            if let Some(seen) = seen
                && *seen != port
            {
                evidence.push(format!(
                    "process {pid} runs with port {seen}; descriptor port {port} wins"
                ));
            }
        }

        Some(DiscoveryResult {
            found: true,
            found_port: Some(port),
            found_install_dir: installed.working_dir,
            confidence: Confidence::ServiceConfig,
            candidates: vec![port],
            pids: running.iter().map(|(pid, _, _)| *pid).collect(),
            evidence: Vec::new(),
        })
    }

    fn from_processes(&self, evidence: &mut Vec<String>) -> Option<DiscoveryResult> {
        let running = self.running();
        if running.is_empty() {
            return None;
        }
        let ports: BTreeSet<u16> = running.iter().filter_map(|(_, p, _)| *p).collect();
        let candidates: Vec<u16> = ports.into_iter().collect();
        let Some(&port) = candidates.first() else {
            evidence.push(format!(
                "{} service process(es) running without a port argument",
                running.len()
            ));
            return None;
        };
        if candidates.len() > 1 {
            evidence.push(format!(
                "processes disagree on port {candidates:?}; choosing {port}"
            ));
        }
        let pids: Vec<u32> = running.iter().map(|(pid, _, _)| *pid).collect();
        evidence.push(format!("service processes {pids:?} found"));

        Some(DiscoveryResult {
            found: true,
            found_port: Some(port),
            found_install_dir: running.first().map(|(_, _, dir)| dir.clone()),
            confidence: Confidence::RunningProcess,
            candidates,
            pids,
            evidence: Vec::new(),
        })
    }

    fn from_default_ports(&self, evidence: &mut Vec<String>) -> Option<DiscoveryResult> {
        let interpreter = std::path::Path::new(&self.config.service.interpreter)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.service.interpreter.clone());
        let stem = interpreter.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');

        let busy: Vec<u16> = self
            .config
            .ports
            .historical
            .iter()
            .copied()
            .filter(|p| self.ports.in_use(*p))
            .collect();
        let Some(&port) = busy.first() else {
            return None;
        };

        let interpreters: Vec<_> = self
            .processes
            .processes()
            .into_iter()
            .filter(|p| p.name.starts_with(stem) || p.name == interpreter)
            .collect();
        if interpreters.is_empty() {
            debug!("historical ports {busy:?} in use but no {interpreter} process");
            return None;
        }

        // A listener is only attributed to the interpreter when its argv
        // names that port.
        let linked: Vec<(u16, u32)> = busy
            .iter()
            .flat_map(|&port| {
                interpreters
                    .iter()
                    .filter(move |p| port_from_command_line(&p.command_line()) == Some(port))
                    .map(move |p| (port, p.pid))
            })
            .collect();

        let (port, candidates, pids) = match linked.first() {
            Some(&(first, _)) => {
                let ports: BTreeSet<u16> = linked.iter().map(|(port, _)| *port).collect();
                let pids: Vec<u32> = linked.iter().map(|(_, pid)| *pid).collect();
                evidence.push(format!(
                    "{interpreter} process(es) {pids:?} serve historical port(s) {ports:?}"
                ));
                (first, ports.into_iter().collect(), pids)
            }
            None => {
                evidence.push(format!(
                    "historical port(s) {busy:?} in use while {interpreter} is running; \
                     no {interpreter} command line names them"
                ));
                (port, busy, Vec::new())
            }
        };

        Some(DiscoveryResult {
            found: true,
            found_port: Some(port),
            found_install_dir: None,
            confidence: Confidence::DefaultFallback,
            candidates,
            pids,
            evidence: Vec::new(),
        })
    }

    fn filesystem_roots(&self) -> Vec<PathBuf> {
        let svc = &self.config.service;
        self.roots
            .iter()
            .filter(|dir| is_install_root(dir, &svc.entrypoint, &svc.module_path))
            .cloned()
            .collect()
    }

    fn from_filesystem(&self, evidence: &mut Vec<String>) -> Option<DiscoveryResult> {
        let dir = self.filesystem_roots().into_iter().next()?;
        let manifest = InstallManifest::read_from(&dir);
        let port = manifest.as_ref().map(|m| m.port);
        evidence.push(match port {
            Some(p) => format!("manifest in {} records port {p}", dir.display()),
            None => format!("staged layout found in {}", dir.display()),
        });
        Some(DiscoveryResult {
            found: true,
            found_port: port,
            found_install_dir: Some(dir),
            confidence: Confidence::FilesystemProbe,
            candidates: port.into_iter().collect(),
            pids: Vec::new(),
            evidence: Vec::new(),
        })
    }
}
