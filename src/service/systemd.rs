//! systemd unit adapter.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use log::{info, warn};

use super::file_ops::{remove_if_exists, set_mode, write_file_atomic};
use super::{
    Change, Exec, InstalledService, Registration, RestartPolicy, ServiceDescriptor, ServiceManager,
    ServiceManagerKind, ServiceStatus, port_flag,
};
use crate::error::Result;

pub(crate) const SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";

pub struct Systemd<'a> {
    name: String,
    exec: Exec<'a>,
    unit_dir: PathBuf,
    staging_dir: PathBuf,
}

impl<'a> Systemd<'a> {
    pub fn new(name: &str, exec: Exec<'a>, unit_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            exec,
            unit_dir,
            staging_dir,
        }
    }

    fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(self.unit_name())
    }

    fn staged_path(&self) -> PathBuf {
        self.staging_dir.join(self.unit_name())
    }

    fn manual_steps(&self) -> String {
        let unit = self.unit_name();
        format!(
            "sudo cp {} {}\nsudo systemctl daemon-reload\nsudo systemctl enable --now {unit}",
            self.staged_path().display(),
            self.unit_path().display()
        )
    }

    fn systemctl(&self, verb: &str) -> Result<Change> {
        if !self.unit_path().exists() {
            return Ok(Change::Unchanged(format!("{} is not registered", self.unit_name())));
        }
        self.exec.require_elevated(&format!("systemctl {verb}"))?;
        self.exec.verb("systemctl", &[verb, &self.unit_name()])
    }
}

/// Render the unit file.
pub fn render_unit(desc: &ServiceDescriptor) -> String {
    let mut unit = String::with_capacity(1024);

    unit.push_str("[Unit]\n");
    let _ = writeln!(unit, "Description={}", desc.description);
    unit.push_str("After=network.target\n\n");

    unit.push_str("[Service]\n");
    unit.push_str("Type=simple\n");
    if let Some(user) = &desc.user {
        let _ = writeln!(unit, "User={user}");
    }
    let _ = writeln!(unit, "WorkingDirectory={}", desc.working_directory.display());
    let _ = writeln!(unit, "ExecStart={}", desc.command_line());
    match desc.restart_policy {
        RestartPolicy::Always => unit.push_str("Restart=always\nRestartSec=5\n"),
        RestartPolicy::Never => unit.push_str("Restart=no\n"),
    }
    for (key, value) in &desc.environment {
        let _ = writeln!(unit, "Environment=\"{key}={value}\"");
    }
    if desc.hardened {
        unit.push_str("NoNewPrivileges=true\n");
        unit.push_str("PrivateTmp=true\n");
        unit.push_str("ProtectSystem=strict\n");
        unit.push_str("ProtectHome=read-only\n");
        // The code directory stays read-only under ProtectSystem=strict.
        let _ = writeln!(unit, "ReadWritePaths={}", desc.log_dir.display());
    }
    unit.push('\n');

    unit.push_str("[Install]\n");
    unit.push_str("WantedBy=multi-user.target\n");
    unit
}

fn parse_unit(content: &str) -> (Option<u16>, Option<PathBuf>) {
    let mut port = None;
    let mut working_dir = None;
    for line in content.lines() {
        if let Some(exec) = line.strip_prefix("ExecStart=") {
            port = port_flag(exec);
        } else if let Some(dir) = line.strip_prefix("WorkingDirectory=") {
            working_dir = Some(PathBuf::from(dir.trim()));
        }
    }
    (port, working_dir)
}

impl ServiceManager for Systemd<'_> {
    fn kind(&self) -> ServiceManagerKind {
        ServiceManagerKind::SystemdUnit
    }

    fn descriptor_path(&self) -> PathBuf {
        if self.exec.elevated {
            self.unit_path()
        } else {
            self.staged_path()
        }
    }

    fn register(&self, desc: &ServiceDescriptor) -> Result<Registration> {
        let content = render_unit(desc);

        if !self.exec.elevated {
            let path = self.staged_path();
            write_file_atomic(&path, &content)?;
            warn!("Not running as root; unit staged at {}", path.display());
            return Ok(Registration::Staged {
                path,
                instructions: self.manual_steps(),
            });
        }

        let path = self.unit_path();
        write_file_atomic(&path, &content)?;
        set_mode(&path, 0o644)?;
        self.exec.verb("systemctl", &["daemon-reload"])?;
        info!("Installed systemd unit {}", path.display());
        Ok(Registration::Installed {
            path,
            instructions: None,
        })
    }

    fn enable(&self) -> Result<Change> {
        self.systemctl("enable")
    }

    fn start(&self) -> Result<Change> {
        self.systemctl("start")
    }

    fn stop(&self) -> Result<Change> {
        self.systemctl("stop")
    }

    fn disable(&self) -> Result<Change> {
        self.systemctl("disable")
    }

    fn restart(&self) -> Result<Change> {
        self.systemctl("restart")
    }

    fn remove(&self) -> Result<Change> {
        let staged_removed = remove_if_exists(&self.staged_path())?;

        let unit = self.unit_path();
        if !unit.exists() {
            return Ok(if staged_removed {
                Change::Applied
            } else {
                Change::Unchanged(format!("{} is not registered", self.unit_name()))
            });
        }

        self.exec.require_elevated("removing the systemd unit")?;
        remove_if_exists(&unit)?;
        self.exec.verb("systemctl", &["daemon-reload"])?;
        info!("Removed systemd unit {}", unit.display());
        Ok(Change::Applied)
    }

    fn query_status(&self) -> ServiceStatus {
        match self.exec.run("systemctl", &["is-active", &self.unit_name()]) {
            Ok(out) => match out.stdout.trim() {
                "active" | "activating" | "reloading" => ServiceStatus::Active,
                "inactive" | "failed" | "deactivating" => ServiceStatus::Inactive,
                _ => ServiceStatus::Unknown,
            },
            Err(e) => {
                warn!("systemctl is-active failed: {e}");
                ServiceStatus::Unknown
            }
        }
    }

    fn installed(&self) -> Option<InstalledService> {
        [(self.unit_path(), false), (self.staged_path(), true)]
            .into_iter()
            .find_map(|(path, staged)| {
                let content = fs::read_to_string(&path).ok()?;
                let (port, working_dir) = parse_unit(&content);
                Some(InstalledService {
                    descriptor: path,
                    port,
                    working_dir,
                    staged,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::config::DeployConfig;
    use crate::error::DeployError;
    use crate::system::fakes::FakeRunner;

    fn descriptor(hardened: bool) -> ServiceDescriptor {
        let mut config = DeployConfig::default();
        config.service.hardened = hardened;
        ServiceDescriptor::for_application(
            &config,
            PathBuf::from("/usr/bin/python3"),
            Path::new("/opt/rkos"),
            Path::new("/var/log/rkos"),
            8085,
            Some("pi".to_string()),
        )
    }

    #[test]
    fn renders_hardened_unit() {
        let expected = "\
[Unit]
Description=RK-OS logic service
After=network.target

[Service]
Type=simple
User=pi
WorkingDirectory=/opt/rkos
ExecStart=/usr/bin/python3 /opt/rkos/main.py --port 8085
Restart=always
RestartSec=5
Environment=\"PYTHONPATH=/opt/rkos/src\"
Environment=\"PYTHONUNBUFFERED=1\"
NoNewPrivileges=true
PrivateTmp=true
ProtectSystem=strict
ProtectHome=read-only
ReadWritePaths=/var/log/rkos

[Install]
WantedBy=multi-user.target
";
        assert_eq!(render_unit(&descriptor(true)), expected);
    }

    #[test]
    fn hardened_unit_only_writes_to_log_dir() {
        let unit = render_unit(&descriptor(true));
        let writable: Vec<&str> = unit
            .lines()
            .filter_map(|l| l.strip_prefix("ReadWritePaths="))
            .flat_map(str::split_whitespace)
            .collect();
        assert_eq!(writable, ["/var/log/rkos"]);
    }

    #[test]
    fn plain_unit_has_no_sandboxing() {
        let unit = render_unit(&descriptor(false).restart(RestartPolicy::Never));
        assert!(unit.contains("Restart=no\n"));
        assert!(!unit.contains("RestartSec"));
        assert!(!unit.contains("ProtectSystem"));
    }

    #[test]
    fn unprivileged_register_stages_unit_with_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), false);
        let adapter = Systemd::new("rkos", exec, dir.path().join("etc"), dir.path().join("staged"));

        let reg = adapter.register(&descriptor(true)).unwrap();
        let Registration::Staged { path, instructions } = reg else {
            panic!("expected staged registration");
        };
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("staged")));
        assert!(instructions.contains("systemctl enable --now rkos.service"));
        assert!(runner.calls().is_empty());

        let found = adapter.installed().unwrap();
        assert!(found.staged);
        assert_eq!(found.port, Some(8085));
        assert_eq!(found.working_dir, Some(PathBuf::from("/opt/rkos")));
    }

    #[test]
    fn elevated_lifecycle_drives_systemctl() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), true);
        let adapter = Systemd::new("rkos", exec, dir.path().join("etc"), dir.path().join("staged"));

        adapter.register(&descriptor(true)).unwrap();
        assert_eq!(adapter.enable().unwrap(), Change::Applied);
        assert_eq!(adapter.start().unwrap(), Change::Applied);
        runner.respond("systemctl is-active", 0, "active\n", "");
        assert_eq!(adapter.query_status(), ServiceStatus::Active);
        assert_eq!(adapter.remove().unwrap(), Change::Applied);
        assert!(!dir.path().join("etc").join("rkos.service").exists());

        assert_eq!(
            runner.calls(),
            vec![
                "systemctl daemon-reload",
                "systemctl enable rkos.service",
                "systemctl start rkos.service",
                "systemctl is-active rkos.service",
                "systemctl daemon-reload",
            ]
        );
    }

    #[test]
    fn verbs_on_missing_unit_are_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), true);
        let adapter = Systemd::new("rkos", exec, dir.path().join("etc"), dir.path().join("staged"));
        assert!(matches!(adapter.stop().unwrap(), Change::Unchanged(_)));
        assert!(matches!(adapter.remove().unwrap(), Change::Unchanged(_)));
        assert!(adapter.installed().is_none());
    }

    #[test]
    fn unprivileged_stop_of_system_unit_is_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("etc");
        fs::create_dir_all(&unit_dir).unwrap();
        fs::write(unit_dir.join("rkos.service"), render_unit(&descriptor(true))).unwrap();

        let runner = FakeRunner::new();
        let exec = Exec::new(&runner, Duration::from_secs(1), false);
        let adapter = Systemd::new("rkos", exec, unit_dir, dir.path().join("staged"));
        let err = adapter.stop().unwrap_err();
        assert!(matches!(err, DeployError::PermissionDenied(_)));
    }

    #[test]
    fn timed_out_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.time_out("systemctl start");
        let exec = Exec::new(&runner, Duration::from_secs(1), true);
        let adapter = Systemd::new("rkos", exec, dir.path().join("etc"), dir.path().join("staged"));
        adapter.register(&descriptor(true)).unwrap();
        assert!(matches!(
            adapter.start().unwrap_err(),
            DeployError::CommandTimedOut { .. }
        ));
    }
}
