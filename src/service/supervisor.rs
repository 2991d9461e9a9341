//! supervisord program adapter.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::file_ops::{remove_if_exists, write_file_atomic};
use super::{
    Change, Exec, InstalledService, Registration, RestartPolicy, ServiceDescriptor, ServiceManager,
    ServiceManagerKind, ServiceStatus, port_flag,
};
use crate::error::Result;

pub struct Supervisor<'a> {
    name: String,
    exec: Exec<'a>,
    conf_path: PathBuf,
    staging_dir: PathBuf,
}

impl<'a> Supervisor<'a> {
    pub fn new(name: &str, exec: Exec<'a>, conf_path: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            exec,
            conf_path,
            staging_dir,
        }
    }

    /// Debian layout (`conf.d/*.conf`) or RHEL layout (`supervisord.d/*.ini`).
    pub fn detect_config_path(name: &str) -> PathBuf {
        let debian = Path::new("/etc/supervisor/conf.d");
        if debian.is_dir() {
            debian.join(format!("{name}.conf"))
        } else {
            Path::new("/etc/supervisord.d").join(format!("{name}.ini"))
        }
    }

    fn staged_path(&self) -> PathBuf {
        let file = self
            .conf_path
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| format!("{}.conf", self.name).into());
        self.staging_dir.join(file)
    }

    fn ctl(&self, verb: &str) -> Result<Change> {
        if !self.conf_path.exists() {
            return Ok(Change::Unchanged(format!("program `{}` is not registered", self.name)));
        }
        self.exec.require_elevated(&format!("supervisorctl {verb}"))?;
        let out = self.exec.run("supervisorctl", &[verb, &self.name])?;
        let text = format!("{}{}", out.stdout, out.stderr);
        if text.contains("already started") || text.contains("not running") {
            return Ok(Change::Unchanged(text.trim().to_string()));
        }
        if !out.success() || text.contains("ERROR") {
            return Err(crate::error::DeployError::command_failed(
                format!("supervisorctl {verb} {}", self.name),
                text.trim(),
            ));
        }
        Ok(Change::Applied)
    }
}

/// Render the `[program:<name>]` stanza.
pub fn render_program(desc: &ServiceDescriptor) -> String {
    let mut conf = String::with_capacity(512);
    let _ = writeln!(conf, "[program:{}]", desc.name);
    let _ = writeln!(conf, "command={}", desc.command_line());
    let _ = writeln!(conf, "directory={}", desc.working_directory.display());
    if let Some(user) = &desc.user {
        let _ = writeln!(conf, "user={user}");
    }
    conf.push_str("autostart=true\n");
    let _ = writeln!(
        conf,
        "autorestart={}",
        desc.restart_policy == RestartPolicy::Always
    );
    let _ = writeln!(conf, "stdout_logfile={}", desc.log_file().display());
    conf.push_str("redirect_stderr=true\n");
    let env = desc
        .environment
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    if !env.is_empty() {
        let _ = writeln!(conf, "environment={env}");
    }
    conf
}

fn parse_program(content: &str) -> (Option<u16>, Option<PathBuf>) {
    let mut port = None;
    let mut dir = None;
    for line in content.lines() {
        if let Some(cmd) = line.strip_prefix("command=") {
            port = port_flag(cmd);
        } else if let Some(d) = line.strip_prefix("directory=") {
            dir = Some(PathBuf::from(d.trim()));
        }
    }
    (port, dir)
}

impl ServiceManager for Supervisor<'_> {
    fn kind(&self) -> ServiceManagerKind {
        ServiceManagerKind::SupervisorConf
    }

    fn descriptor_path(&self) -> PathBuf {
        if self.exec.elevated {
            self.conf_path.clone()
        } else {
            self.staged_path()
        }
    }

    fn register(&self, desc: &ServiceDescriptor) -> Result<Registration> {
        let content = render_program(desc);
        if !self.exec.elevated {
            let path = self.staged_path();
            write_file_atomic(&path, &content)?;
            warn!("Not running as root; supervisor program staged at {}", path.display());
            return Ok(Registration::Staged {
                instructions: format!(
                    "sudo cp {} {}\nsudo supervisorctl reread\nsudo supervisorctl update",
                    path.display(),
                    self.conf_path.display()
                ),
                path,
            });
        }

        write_file_atomic(&self.conf_path, &content)?;
        info!("Installed supervisor program {}", self.conf_path.display());
        Ok(Registration::Installed {
            path: self.conf_path.clone(),
            instructions: None,
        })
    }

    fn enable(&self) -> Result<Change> {
        self.exec.require_elevated("supervisorctl update")?;
        self.exec.verb("supervisorctl", &["reread"])?;
        self.exec.verb("supervisorctl", &["update"])
    }

    fn start(&self) -> Result<Change> {
        self.ctl("start")
    }

    fn stop(&self) -> Result<Change> {
        self.ctl("stop")
    }

    fn disable(&self) -> Result<Change> {
        self.ctl("remove")
    }

    fn restart(&self) -> Result<Change> {
        self.ctl("restart")
    }

    fn remove(&self) -> Result<Change> {
        let staged_removed = remove_if_exists(&self.staged_path())?;
        if !self.conf_path.exists() {
            return Ok(if staged_removed {
                Change::Applied
            } else {
                Change::Unchanged(format!("program `{}` is not registered", self.name))
            });
        }
        self.exec.require_elevated("removing the supervisor program")?;
        remove_if_exists(&self.conf_path)?;
        self.exec.verb("supervisorctl", &["reread"])?;
        Ok(Change::Applied)
    }

    fn query_status(&self) -> ServiceStatus {
        match self.exec.run("supervisorctl", &["status", &self.name]) {
            Ok(out) if out.stdout.contains("RUNNING") || out.stdout.contains("STARTING") => {
                ServiceStatus::Active
            }
            Ok(out)
                if ["STOPPED", "EXITED", "FATAL", "BACKOFF"]
                    .iter()
                    .any(|s| out.stdout.contains(s)) =>
            {
                ServiceStatus::Inactive
            }
            Ok(_) => ServiceStatus::Unknown,
            Err(e) => {
                warn!("supervisorctl status failed: {e}");
                ServiceStatus::Unknown
            }
        }
    }

    fn installed(&self) -> Option<InstalledService> {
        [(self.conf_path.clone(), false), (self.staged_path(), true)]
            .into_iter()
            .find_map(|(path, staged)| {
                let content = fs::read_to_string(&path).ok()?;
                let (port, working_dir) = parse_program(&content);
                Some(InstalledService {
                    descriptor: path,
                    port,
                    working_dir,
                    staged,
                })
            })
    }
}
