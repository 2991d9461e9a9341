//! Startup-script adapter.
//!
//! Windows gets a batch file plus an at-logon scheduled task. Hosts with no
//! init system at all get a POSIX shell script and instructions.

use std::fs;
use std::path::PathBuf;

use log::{info, warn};

use super::file_ops::{remove_if_exists, set_mode, write_file_atomic};
use super::{
    Change, Exec, InstalledService, Registration, ServiceDescriptor, ServiceManager,
    ServiceManagerKind, ServiceStatus, port_flag,
};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavour {
    Windows,
    Posix,
}

pub struct StartupScript<'a> {
    name: String,
    flavour: ScriptFlavour,
    exec: Exec<'a>,
    script_dir: PathBuf,
}

impl<'a> StartupScript<'a> {
    pub fn new(name: &str, flavour: ScriptFlavour, exec: Exec<'a>, script_dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            flavour,
            exec,
            script_dir,
        }
    }

    fn script_path(&self) -> PathBuf {
        let ext = match self.flavour {
            ScriptFlavour::Windows => "bat",
            ScriptFlavour::Posix => "sh",
        };
        self.script_dir.join(format!("start_{}.{ext}", self.name))
    }

    fn run_instructions(&self) -> String {
        let script = self.script_path();
        match self.flavour {
            ScriptFlavour::Windows => format!(
                "Run \"{}\" to start {} by hand; the `{}` scheduled task starts it at logon.",
                script.display(),
                self.name,
                self.name
            ),
            ScriptFlavour::Posix => format!(
                "No init system was detected. Start {} with:\n  nohup sh {} &\nTo start it at boot add this line to `crontab -e`:\n  @reboot sh {}",
                self.name,
                script.display(),
                script.display()
            ),
        }
    }

    fn manual(&self) -> Change {
        Change::Unchanged(self.run_instructions())
    }

    fn task_exists(&self) -> bool {
        self.exec
            .run("schtasks", &["/Query", "/TN", &self.name])
            .map(|out| out.success())
            .unwrap_or(false)
    }
}

/// Windows batch file; lines end with CRLF.
pub fn render_batch(desc: &ServiceDescriptor) -> String {
    let mut lines = vec![
        "@echo off".to_string(),
        format!("cd /d \"{}\"", desc.working_directory.display()),
    ];
    for (key, value) in &desc.environment {
        lines.push(format!("set \"{key}={value}\""));
    }
    lines.push(format!(
        "{} >> \"{}\" 2>&1",
        desc.command_line(),
        desc.log_file().display()
    ));
    lines.join("\r\n") + "\r\n"
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// POSIX shell script.
pub fn render_shell(desc: &ServiceDescriptor) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!(
        "cd {} || exit 1\n",
        sh_quote(&desc.working_directory.display().to_string())
    ));
    for (key, value) in &desc.environment {
        script.push_str(&format!("export {key}={}\n", sh_quote(value)));
    }
    let command: Vec<String> = std::iter::once(desc.executable_path.display().to_string())
        .chain(desc.args.iter().cloned())
        .map(|part| {
            if part.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c)) {
                part
            } else {
                sh_quote(&part)
            }
        })
        .collect();
    script.push_str(&format!(
        "mkdir -p {}\n",
        sh_quote(&desc.log_dir.display().to_string())
    ));
    script.push_str(&format!(
        "exec {} >> {} 2>&1\n",
        command.join(" "),
        sh_quote(&desc.log_file().display().to_string())
    ));
    script
}

impl ServiceManager for StartupScript<'_> {
    fn kind(&self) -> ServiceManagerKind {
        match self.flavour {
            ScriptFlavour::Windows => ServiceManagerKind::WindowsStartup,
            ScriptFlavour::Posix => ServiceManagerKind::StartupScript,
        }
    }

    fn descriptor_path(&self) -> PathBuf {
        self.script_path()
    }

    fn register(&self, desc: &ServiceDescriptor) -> Result<Registration> {
        let path = self.script_path();
        match self.flavour {
            ScriptFlavour::Windows => {
                write_file_atomic(&path, &render_batch(desc))?;
                info!("Wrote startup script {}", path.display());
                Ok(Registration::Installed {
                    path,
                    instructions: Some(self.run_instructions()),
                })
            }
            ScriptFlavour::Posix => {
                write_file_atomic(&path, &render_shell(desc))?;
                set_mode(&path, 0o755)?;
                warn!("No init system; wrote {}", path.display());
                Ok(Registration::Staged {
                    path,
                    instructions: self.run_instructions(),
                })
            }
        }
    }

    fn enable(&self) -> Result<Change> {
        if self.flavour == ScriptFlavour::Posix {
            return Ok(self.manual());
        }
        let target = format!("\"{}\"", self.script_path().display());
        self.exec.verb(
            "schtasks",
            &["/Create", "/TN", &self.name, "/TR", &target, "/SC", "ONLOGON", "/F"],
        )
    }

    fn start(&self) -> Result<Change> {
        if self.flavour == ScriptFlavour::Posix {
            return Ok(self.manual());
        }
        self.exec.verb("schtasks", &["/Run", "/TN", &self.name])
    }

    fn stop(&self) -> Result<Change> {
        if self.flavour == ScriptFlavour::Posix {
            return Ok(Change::Unchanged(
                "no init system; the service process is terminated directly".to_string(),
            ));
        }
        if !self.task_exists() {
            return Ok(Change::Unchanged(format!("no `{}` scheduled task", self.name)));
        }
        self.exec.verb("schtasks", &["/End", "/TN", &self.name])
    }

    fn disable(&self) -> Result<Change> {
        if self.flavour == ScriptFlavour::Posix {
            return Ok(Change::Unchanged("no init system registration".to_string()));
        }
        if !self.task_exists() {
            return Ok(Change::Unchanged(format!("no `{}` scheduled task", self.name)));
        }
        self.exec
            .verb("schtasks", &["/Change", "/TN", &self.name, "/DISABLE"])
    }

    fn remove(&self) -> Result<Change> {
        let mut changed = false;
        if self.flavour == ScriptFlavour::Windows && self.task_exists() {
            self.exec
                .verb("schtasks", &["/Delete", "/TN", &self.name, "/F"])?;
            changed = true;
        }
        changed |= remove_if_exists(&self.script_path())?;
        Ok(if changed {
            Change::Applied
        } else {
            Change::Unchanged(format!("{} is not present", self.script_path().display()))
        })
    }

    fn query_status(&self) -> ServiceStatus {
        if self.flavour == ScriptFlavour::Posix {
            return ServiceStatus::Unknown;
        }
        match self
            .exec
            .run("schtasks", &["/Query", "/TN", &self.name, "/FO", "LIST"])
        {
            Ok(out) if out.success() && out.stdout.contains("Running") => ServiceStatus::Active,
            Ok(out) if out.success() => ServiceStatus::Inactive,
            Ok(_) => ServiceStatus::Inactive,
            Err(_) => ServiceStatus::Unknown,
        }
    }

    fn installed(&self) -> Option<InstalledService> {
        let path = self.script_path();
        let content = fs::read_to_string(&path).ok()?;
        let working_dir = content.lines().find_map(|line| {
            let dir = line
                .strip_prefix("cd /d ")
                .or_else(|| line.strip_prefix("cd "))?;
            let dir = dir.trim_end_matches(" || exit 1");
            Some(PathBuf::from(dir.trim_matches(|c| c == '"' || c == '\'')))
        });
        Some(InstalledService {
            port: port_flag(&content),
            working_dir,
            staged: self.flavour == ScriptFlavour::Posix,
            descriptor: path,
        })
    }
}
