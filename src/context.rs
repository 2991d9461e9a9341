//! Resolved paths, privilege and timeouts for one deployer run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};

#[derive(Debug, Clone)]
pub struct DeployContext {
    pub service_name: String,
    pub install_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Deployer-private state: lock file and staged artifacts.
    pub state_dir: PathBuf,
    /// Neutral location for descriptors that need an operator to finish.
    pub staging_dir: PathBuf,
    pub lock_path: PathBuf,
    pub elevated: bool,
    pub command_timeout: Duration,
    pub package_timeout: Duration,
    pub settle_delay: Duration,
    /// Install roots probed during discovery, in order.
    pub candidate_roots: Vec<PathBuf>,
}

impl DeployContext {
    /// Resolve the host locations for `config`.
    pub fn resolve(config: &DeployConfig, elevated: bool) -> Result<Self> {
        let name = config.service.name.as_str();
        let user_data = dirs::data_local_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .ok_or_else(|| DeployError::system("Cannot determine a per-user data directory"))?;

        let install_dir = match &config.paths.install_dir {
            Some(dir) => dir.clone(),
            None if elevated => system_install_dir(name),
            None => user_data.join(name),
        };

        let log_dir = match &config.paths.log_dir {
            Some(dir) => dir.clone(),
            None if elevated && cfg!(unix) => PathBuf::from("/var/log").join(name),
            None => install_dir.join("logs"),
        };

        let state_dir = if elevated && cfg!(unix) {
            PathBuf::from("/var/lib").join(format!("{name}-deploy"))
        } else {
            user_data.join(format!("{name}-deploy"))
        };

        let mut candidate_roots = vec![
            install_dir.clone(),
            system_install_dir(name),
            user_data.join(name),
        ];
        if let Some(home) = dirs::home_dir() {
            candidate_roots.push(home.join(name));
        }
        candidate_roots.extend(config.paths.extra_candidates.iter().cloned());
        dedup_paths(&mut candidate_roots);

        Ok(Self::assemble(
            config,
            elevated,
            install_dir,
            log_dir,
            state_dir,
            candidate_roots,
        ))
    }

    /// Every location under `root`; used by tests and `--install-dir` sandboxes.
    pub fn rooted(config: &DeployConfig, root: &Path, elevated: bool) -> Self {
        let install_dir = root.join("install");
        let log_dir = root.join("logs");
        let state_dir = root.join("state");
        let candidate_roots = vec![install_dir.clone()];
        Self::assemble(config, elevated, install_dir, log_dir, state_dir, candidate_roots)
    }

    fn assemble(
        config: &DeployConfig,
        elevated: bool,
        install_dir: PathBuf,
        log_dir: PathBuf,
        state_dir: PathBuf,
        candidate_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            service_name: config.service.name.clone(),
            staging_dir: state_dir.join("staged"),
            lock_path: state_dir.join("deploy.lock"),
            install_dir,
            log_dir,
            state_dir,
            elevated,
            command_timeout: Duration::from_secs(config.timeouts.command_secs),
            package_timeout: Duration::from_secs(config.timeouts.package_secs),
            settle_delay: Duration::from_millis(config.timeouts.settle_millis),
            candidate_roots,
        }
    }
}

fn system_install_dir(name: &str) -> PathBuf {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            std::env::var("ProgramData")
                .map(|p| PathBuf::from(p).join(name))
                .unwrap_or_else(|_| PathBuf::from("C:\\ProgramData").join(name))
        } else {
            PathBuf::from("/opt").join(name)
        }
    }
}

fn dedup_paths(paths: &mut Vec<PathBuf>) {
    let mut seen = std::collections::HashSet::new();
    paths.retain(|p| seen.insert(p.clone()));
}
