//! Deployer configuration (`deploy.toml`).
//!
//! Every field has a default so an absent or partial file is valid.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Port the uninstaller and `status` report when discovery finds nothing.
pub const DEFAULT_PORT: u16 = 8085;

/// Top-level deployer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    pub service: ServiceSection,
    pub ports: PortSection,
    pub paths: PathSection,
    pub proxy: ProxySection,
    pub timeouts: TimeoutSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceSection {
    /// Service name used for units, labels, tasks and directories.
    pub name: String,
    pub description: String,
    /// Interpreter that launches the entrypoint.
    pub interpreter: String,
    /// Entrypoint script, relative to the install directory.
    pub entrypoint: String,
    /// Module search path, relative to the install directory.
    pub module_path: String,
    /// Account the service runs as; defaults to the invoking user.
    pub user: Option<String>,
    pub restart: bool,
    /// Add sandboxing directives where the init system supports them.
    pub hardened: bool,
    /// Use supervisord even when systemd is available.
    pub prefer_supervisor: bool,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "rkos".to_string(),
            description: "RK-OS logic service".to_string(),
            interpreter: "python3".to_string(),
            entrypoint: "main.py".to_string(),
            module_path: "src".to_string(),
            user: None,
            restart: true,
            hardened: true,
            prefer_supervisor: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortSection {
    /// Ports tried in order before falling back to the ephemeral range.
    pub preferred: Vec<u16>,
    /// Ports earlier releases listened on; probed during discovery.
    pub historical: Vec<u16>,
    /// Bounded number of random ephemeral ports tried.
    pub ephemeral_attempts: u32,
}

impl Default for PortSection {
    fn default() -> Self {
        Self {
            preferred: vec![8085, 8090, 8095, 8080],
            historical: vec![8085, 8080, 8090, 5000],
            ephemeral_attempts: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSection {
    /// Directory holding the application to stage; defaults to the working directory.
    pub source_dir: Option<PathBuf>,
    /// Install root; defaults depend on privilege and platform.
    pub install_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Extra install roots probed during discovery.
    pub extra_candidates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxySection {
    pub enabled: bool,
    pub listen_port: u16,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSection {
    /// Timeout for init-system and proxy commands.
    pub command_secs: u64,
    /// Timeout for package installation.
    pub package_secs: u64,
    /// Delay before querying status after a start.
    pub settle_millis: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            command_secs: 30,
            package_secs: 600,
            settle_millis: 2000,
        }
    }
}

impl DeployConfig {
    /// Load configuration from an explicit path, the per-user default
    /// location, or fall back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DeployError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&raw)
            .map_err(|e| DeployError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw).map_err(|e| DeployError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// `<config_dir>/rkos/deploy.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rkos").join("deploy.toml"))
    }

    fn validate(&self) -> Result<()> {
        if self.service.name.is_empty()
            || !self
                .service
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DeployError::Config(format!(
                "service name `{}` must be non-empty and contain only [A-Za-z0-9_-]",
                self.service.name
            )));
        }
        if self.ports.preferred.contains(&0) {
            return Err(DeployError::Config(
                "preferred ports must be in 1-65535".to_string(),
            ));
        }
        Ok(())
    }
}
