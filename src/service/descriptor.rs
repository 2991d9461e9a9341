//! Init-system independent description of the managed service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    Never,
}

/// Everything an adapter needs to render its native descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub description: String,
    pub executable_path: PathBuf,
    /// Includes `--port <resolved>`.
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub user: Option<String>,
    pub log_dir: PathBuf,
    pub hardened: bool,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, executable_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            executable_path: executable_path.into(),
            args: Vec::new(),
            working_directory: PathBuf::new(),
            environment: BTreeMap::new(),
            restart_policy: RestartPolicy::Always,
            user: None,
            log_dir: PathBuf::new(),
            hardened: false,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Later values replace earlier ones for the same key.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn hardened(mut self, hardened: bool) -> Self {
        self.hardened = hardened;
        self
    }

    /// Descriptor for the configured application staged in `install_dir`.
    pub fn for_application(
        config: &DeployConfig,
        interpreter: PathBuf,
        install_dir: &Path,
        log_dir: &Path,
        port: u16,
        user: Option<String>,
    ) -> Self {
        let svc = &config.service;
        let entrypoint = install_dir.join(&svc.entrypoint);
        let module_path = install_dir.join(&svc.module_path);
        Self::new(&svc.name, interpreter)
            .description(&svc.description)
            .arg(entrypoint.display().to_string())
            .arg("--port")
            .arg(port.to_string())
            .working_directory(install_dir)
            .env("PYTHONPATH", module_path.display().to_string())
            .env("PYTHONUNBUFFERED", "1")
            .restart(if svc.restart {
                RestartPolicy::Always
            } else {
                RestartPolicy::Never
            })
            .user(user)
            .log_dir(log_dir)
            .hardened(svc.hardened)
    }

    /// Executable followed by the arguments, quoting anything with spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable_path.display().to_string())
            .chain(self.args.iter().cloned())
            .map(|part| quote_if_needed(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.name))
    }
}

fn quote_if_needed(part: &str) -> String {
    if part.chars().any(char::is_whitespace) {
        format!("\"{part}\"")
    } else {
        part.to_string()
    }
}

static PORT_FLAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--port(?:=|\s+)(\d{1,5})\b").expect("valid port flag regex"));

/// Port from a `--port N` / `--port=N` flag anywhere in `text`.
pub fn port_flag(text: &str) -> Option<u16> {
    PORT_FLAG
        .captures(text)
        .and_then(|c| c[1].parse::<u16>().ok())
        .filter(|p| *p != 0)
}
