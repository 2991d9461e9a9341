//! launchd property-list adapter.

use std::path::PathBuf;

use log::{info, warn};
use plist::{Dictionary, Value};

use super::file_ops::{remove_if_exists, write_file_atomic};
use super::{
    Change, Exec, InstalledService, Registration, ServiceDescriptor, ServiceManager, ServiceManagerKind,
    ServiceStatus, port_flag,
};
use crate::error::{DeployError, Result};

pub struct Launchd<'a> {
    label: String,
    exec: Exec<'a>,
    plist_dir: PathBuf,
}

impl<'a> Launchd<'a> {
    pub fn new(name: &str, exec: Exec<'a>, plist_dir: PathBuf) -> Self {
        Self {
            label: label_for(name),
            exec,
            plist_dir,
        }
    }

    /// System daemons when elevated, the user's agents otherwise.
    pub fn default_dir(elevated: bool) -> PathBuf {
        if elevated {
            PathBuf::from("/Library/LaunchDaemons")
        } else {
            dirs::home_dir()
                .unwrap_or_default()
                .join("Library")
                .join("LaunchAgents")
        }
    }

    fn plist_path(&self) -> PathBuf {
        self.plist_dir.join(format!("{}.plist", self.label))
    }

    fn path_arg(&self) -> Result<String> {
        let path = self.plist_path();
        if path.exists() {
            Ok(path.display().to_string())
        } else {
            Err(DeployError::system(format!("{} does not exist", path.display())))
        }
    }
}

pub fn label_for(name: &str) -> String {
    format!("com.{name}.service")
}

/// Render the launchd property list as XML.
pub fn render_plist(label: &str, desc: &ServiceDescriptor) -> Result<String> {
    let mut dict = Dictionary::new();
    dict.insert("Label".to_string(), Value::String(label.to_string()));

    let program_args = std::iter::once(desc.executable_path.display().to_string())
        .chain(desc.args.iter().cloned())
        .map(Value::String)
        .collect();
    dict.insert("ProgramArguments".to_string(), Value::Array(program_args));
    dict.insert(
        "WorkingDirectory".to_string(),
        Value::String(desc.working_directory.display().to_string()),
    );

    let env: Dictionary = desc
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    dict.insert("EnvironmentVariables".to_string(), Value::Dictionary(env));

    if let Some(user) = &desc.user
        && user != "root"
    {
        // UserName is only honoured for daemons; agents always run as the owner.
        dict.insert("UserName".to_string(), Value::String(user.clone()));
    }

    dict.insert("RunAtLoad".to_string(), Value::Boolean(true));
    // launchd must not respawn a process the operator stopped; restarts are
    // left to the application.
    dict.insert("KeepAlive".to_string(), Value::Boolean(false));
    dict.insert(
        "StandardOutPath".to_string(),
        Value::String(desc.log_file().display().to_string()),
    );
    dict.insert(
        "StandardErrorPath".to_string(),
        Value::String(
            desc.log_dir
                .join(format!("{}.err.log", desc.name))
                .display()
                .to_string(),
        ),
    );

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(dict))
        .map_err(|e| DeployError::system(format!("Failed to generate plist: {e}")))?;
    String::from_utf8(buf)
        .map_err(|e| DeployError::system(format!("Plist contains invalid UTF-8: {e}")))
}

impl ServiceManager for Launchd<'_> {
    fn kind(&self) -> ServiceManagerKind {
        ServiceManagerKind::LaunchdPlist
    }

    fn descriptor_path(&self) -> PathBuf {
        self.plist_path()
    }

    fn register(&self, desc: &ServiceDescriptor) -> Result<Registration> {
        let path = self.plist_path();
        write_file_atomic(&path, &render_plist(&self.label, desc)?)?;
        info!("Wrote launchd plist {}", path.display());
        Ok(Registration::Installed {
            path,
            instructions: None,
        })
    }

    fn enable(&self) -> Result<Change> {
        let path = self.path_arg()?;
        self.exec.verb("launchctl", &["load", "-w", &path])
    }

    fn start(&self) -> Result<Change> {
        self.exec.verb("launchctl", &["start", &self.label])
    }

    fn stop(&self) -> Result<Change> {
        if !self.plist_path().exists() {
            return Ok(Change::Unchanged(format!("{} is not registered", self.label)));
        }
        self.exec.verb("launchctl", &["stop", &self.label])
    }

    fn disable(&self) -> Result<Change> {
        if !self.plist_path().exists() {
            return Ok(Change::Unchanged(format!("{} is not registered", self.label)));
        }
        let path = self.path_arg()?;
        self.exec.verb("launchctl", &["unload", "-w", &path])
    }

    // `start` on a loaded job keeps the old plist; reload it instead.
    fn restart(&self) -> Result<Change> {
        let path = self.path_arg()?;
        self.exec.verb("launchctl", &["unload", &path])?;
        self.exec.verb("launchctl", &["load", "-w", &path])
    }

    fn remove(&self) -> Result<Change> {
        if remove_if_exists(&self.plist_path())? {
            Ok(Change::Applied)
        } else {
            Ok(Change::Unchanged(format!("{} is not registered", self.label)))
        }
    }

    fn query_status(&self) -> ServiceStatus {
        match self.exec.run("launchctl", &["list", &self.label]) {
            Ok(out) if out.success() => {
                let running = out
                    .stdout
                    .lines()
                    .any(|l| l.trim_start().starts_with("\"PID\""));
                if running {
                    ServiceStatus::Active
                } else {
                    ServiceStatus::Inactive
                }
            }
            Ok(_) => ServiceStatus::Inactive,
            Err(e) => {
                warn!("launchctl list failed: {e}");
                ServiceStatus::Unknown
            }
        }
    }

    fn installed(&self) -> Option<InstalledService> {
        let path = self.plist_path();
        let value = Value::from_file(&path).ok()?;
        let dict = value.as_dictionary()?;

        let port = dict
            .get("ProgramArguments")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(Value::as_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .and_then(|line| port_flag(&line));
        let working_dir = dict
            .get("WorkingDirectory")
            .and_then(Value::as_string)
            .map(PathBuf::from);

        Some(InstalledService {
            descriptor: path,
            port,
            working_dir,
            staged: false,
        })
    }
}
