//! nginx server block.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::{ProxyOutcome, ReverseProxy};
use crate::error::{DeployError, Result};
use crate::service::file_ops::{remove_if_exists, write_file_atomic};
use crate::service::{Change, Exec};

/// Where nginx reads site configuration from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NginxLayout {
    /// Debian style: files in `available`, symlinked into `enabled`.
    Sites { available: PathBuf, enabled: PathBuf },
    /// RHEL/Arch style: every `*.conf` in the directory is loaded.
    ConfD { dir: PathBuf },
}

impl NginxLayout {
    pub fn detect(root: &Path) -> Self {
        let available = root.join("sites-available");
        if available.is_dir() {
            Self::Sites {
                available,
                enabled: root.join("sites-enabled"),
            }
        } else {
            Self::ConfD {
                dir: root.join("conf.d"),
            }
        }
    }
}

pub struct Nginx<'a> {
    name: String,
    listen_port: u16,
    layout: NginxLayout,
    exec: Exec<'a>,
    staging_dir: PathBuf,
}

impl<'a> Nginx<'a> {
    pub fn new(
        name: &str,
        listen_port: u16,
        layout: NginxLayout,
        exec: Exec<'a>,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            name: name.to_string(),
            listen_port,
            layout,
            exec,
            staging_dir,
        }
    }

    /// File the block is written to before activation.
    fn written_path(&self) -> PathBuf {
        match &self.layout {
            NginxLayout::Sites { available, .. } => available.join(&self.name),
            // Not matched by `include conf.d/*.conf` until renamed.
            NginxLayout::ConfD { dir } => dir.join(format!("{}.conf.disabled", self.name)),
        }
    }

    fn active_path(&self) -> PathBuf {
        match &self.layout {
            NginxLayout::Sites { enabled, .. } => enabled.join(&self.name),
            NginxLayout::ConfD { dir } => dir.join(format!("{}.conf", self.name)),
        }
    }

    fn staged_path(&self) -> PathBuf {
        self.staging_dir.join(format!("nginx-{}.conf", self.name))
    }

    fn activate(&self) -> Result<()> {
        let written = self.written_path();
        let active = self.active_path();
        match &self.layout {
            NginxLayout::Sites { enabled, .. } => {
                fs::create_dir_all(enabled).map_err(|e| DeployError::io_at(enabled, e))?;
                remove_if_exists(&active)?;
                symlink(&written, &active)
            }
            NginxLayout::ConfD { .. } => {
                fs::rename(&written, &active).map_err(|e| DeployError::io_at(&active, e))
            }
        }
    }

    /// Undo `activate`, keeping the written file for inspection.
    fn deactivate(&self) -> Result<()> {
        let active = self.active_path();
        match &self.layout {
            NginxLayout::Sites { .. } => {
                remove_if_exists(&active)?;
            }
            NginxLayout::ConfD { .. } => {
                let written = self.written_path();
                fs::rename(&active, &written).map_err(|e| DeployError::io_at(&written, e))?;
            }
        }
        Ok(())
    }

    fn manual_steps(&self) -> String {
        let staged = self.staged_path();
        match &self.layout {
            NginxLayout::Sites { .. } => format!(
                "sudo cp {} {}\nsudo ln -sf {} {}\nsudo nginx -t && sudo nginx -s reload",
                staged.display(),
                self.written_path().display(),
                self.written_path().display(),
                self.active_path().display()
            ),
            NginxLayout::ConfD { .. } => format!(
                "sudo cp {} {}\nsudo nginx -t && sudo nginx -s reload",
                staged.display(),
                self.active_path().display()
            ),
        }
    }

    fn owned_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.active_path(), self.written_path()];
        files.dedup();
        files
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| DeployError::io_at(link, e))
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::copy(target, link)
        .map(|_| ())
        .map_err(|e| DeployError::io_at(link, e))
}

/// Render the `server {}` block fronting `127.0.0.1:<port>`.
pub fn render_server_block(listen_port: u16, upstream_port: u16) -> String {
    const HEADERS: [&str; 4] = [
        "proxy_set_header Host $host;",
        "proxy_set_header X-Real-IP $remote_addr;",
        "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;",
        "proxy_set_header X-Forwarded-Proto $scheme;",
    ];

    let mut block = String::with_capacity(1024);
    block.push_str("server {\n");
    let _ = writeln!(block, "    listen {listen_port};");
    block.push_str("    server_name _;\n");
    for location in ["/", "/api/"] {
        block.push('\n');
        let _ = writeln!(block, "    location {location} {{");
        let _ = writeln!(block, "        proxy_pass http://127.0.0.1:{upstream_port};");
        block.push_str("        proxy_http_version 1.1;\n");
        for header in HEADERS {
            let _ = writeln!(block, "        {header}");
        }
        block.push_str("    }\n");
    }
    block.push_str("}\n");
    block
}

impl ReverseProxy for Nginx<'_> {
    fn configure(&self, port: u16) -> Result<ProxyOutcome> {
        let block = render_server_block(self.listen_port, port);

        if !self.exec.elevated {
            let path = self.staged_path();
            write_file_atomic(&path, &block)?;
            warn!("Not running as root; nginx config staged at {}", path.display());
            return Ok(ProxyOutcome::Staged {
                path,
                instructions: self.manual_steps(),
            });
        }

        let written = self.written_path();
        write_file_atomic(&written, &block)?;
        self.activate()?;

        let check = match self.exec.run("nginx", &["-t"]) {
            Ok(check) => check,
            Err(e) => {
                self.deactivate()?;
                return Err(e);
            }
        };
        if !check.success() {
            self.deactivate()?;
            return Err(DeployError::ProxyInvalid {
                path: written,
                reason: check.stderr.trim().to_string(),
            });
        }
        self.exec.verb("nginx", &["-s", "reload"])?;

        let path = self.active_path();
        info!("nginx now proxies :{} to 127.0.0.1:{port}", self.listen_port);
        Ok(ProxyOutcome::Activated { path })
    }

    fn remove(&self) -> Result<Change> {
        let staged_removed = remove_if_exists(&self.staged_path())?;

        let present: Vec<PathBuf> = self
            .owned_files()
            .into_iter()
            .filter(|p| p.symlink_metadata().is_ok())
            .collect();
        if present.is_empty() {
            return Ok(if staged_removed {
                Change::Applied
            } else {
                Change::Unchanged("no nginx configuration present".to_string())
            });
        }

        self.exec.require_elevated("removing the nginx configuration")?;
        for path in &present {
            remove_if_exists(path)?;
        }
        let check = self.exec.run("nginx", &["-t"])?;
        if check.success() {
            self.exec.verb("nginx", &["-s", "reload"])?;
        } else {
            warn!("nginx -t failed after removal; not reloading: {}", check.stderr.trim());
        }
        Ok(Change::Applied)
    }

    fn existing_config(&self) -> Option<PathBuf> {
        self.owned_files()
            .into_iter()
            .chain(std::iter::once(self.staged_path()))
            .find(|p| p.symlink_metadata().is_ok())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::system::fakes::FakeRunner;

    fn sites(root: &Path) -> NginxLayout {
        fs::create_dir_all(root.join("sites-available")).unwrap();
        NginxLayout::detect(root)
    }

    #[test]
    fn server_block_proxies_both_locations() {
        let block = render_server_block(80, 8090);
        assert!(block.starts_with("server {\n    listen 80;\n"));
        assert_eq!(block.matches("proxy_pass http://127.0.0.1:8090;").count(), 2);
        assert!(block.contains("    location /api/ {\n"));
        assert!(block.contains("proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"));
        assert!(block.ends_with("    }\n}\n"));
    }

    #[test]
    fn detects_layouts() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(NginxLayout::detect(dir.path()), NginxLayout::ConfD { .. }));
        assert!(matches!(sites(dir.path()), NginxLayout::Sites { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn sites_layout_symlinks_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), true);
        let nginx = Nginx::new("rkos", 80, sites(dir.path()), exec, dir.path().join("staged"));

        let outcome = nginx.configure(8085).unwrap();
        let active = dir.path().join("sites-enabled").join("rkos");
        assert_eq!(outcome, ProxyOutcome::Activated { path: active.clone() });
        assert!(active.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(runner.calls(), vec!["nginx -t", "nginx -s reload"]);

        assert_eq!(nginx.remove().unwrap(), Change::Applied);
        assert!(active.symlink_metadata().is_err());
        assert!(!dir.path().join("sites-available").join("rkos").exists());
        assert!(matches!(nginx.remove().unwrap(), Change::Unchanged(_)));
    }

    #[test]
    fn failed_syntax_check_deactivates_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.respond("nginx -t", 1, "", "nginx: [emerg] unexpected \"}\"");
        let exec = Exec::new(&runner, Duration::from_secs(1), true);
        let layout = NginxLayout::ConfD {
            dir: dir.path().join("conf.d"),
        };
        let nginx = Nginx::new("rkos", 80, layout, exec, dir.path().join("staged"));

        let err = nginx.configure(8085).unwrap_err();
        assert!(matches!(err, DeployError::ProxyInvalid { .. }));
        assert!(!dir.path().join("conf.d").join("rkos.conf").exists());
        assert!(dir.path().join("conf.d").join("rkos.conf.disabled").exists());
        assert!(!runner.ran("nginx -s reload"));
    }

    #[test]
    fn unprivileged_configure_is_staged() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), false);
        let nginx = Nginx::new("rkos", 80, sites(dir.path()), exec, dir.path().join("staged"));

        let outcome = nginx.configure(8085).unwrap();
        let ProxyOutcome::Staged { path, instructions } = outcome else {
            panic!("expected staged proxy config");
        };
        assert!(path.exists());
        assert!(instructions.contains("nginx -t"));
        assert!(runner.calls().is_empty());
        assert_eq!(nginx.existing_config(), Some(path));
    }
}
