//! Process table backed by `sysinfo`.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};

use super::{ProcessInfo, ProcessTable};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct SysinfoProcessTable;

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self
    }
}

/// argv and cwd are not part of the default process refresh.
fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing()
        .with_cmd(UpdateKind::Always)
        .with_cwd(UpdateKind::Always)
}

impl ProcessTable for SysinfoProcessTable {
    fn processes(&self) -> Vec<ProcessInfo> {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());

        let mut list: Vec<ProcessInfo> = system
            .processes()
            .values()
            .map(|p| ProcessInfo {
                pid: p.pid().as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                cmdline: p
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().into_owned())
                    .collect(),
                cwd: p.cwd().map(|c| c.to_path_buf()),
            })
            .collect();
        list.sort_by_key(|p| p.pid);
        list
    }

    fn terminate(&self, pid: u32) -> Result<bool> {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh_kind());

        let Some(process) = system.process(pid) else {
            return Ok(false);
        };
        // Platforms without SIGTERM fall back to a hard kill.
        match process.kill_with(Signal::Term) {
            Some(sent) => Ok(sent),
            None => Ok(process.kill()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_current_process() {
        let me = std::process::id();
        let table = SysinfoProcessTable::new();
        assert!(table.processes().iter().any(|p| p.pid == me));
    }

    #[cfg(unix)]
    #[test]
    fn reads_argv_and_cwd_of_child() {
        use std::process::Command;
        use std::thread;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let mut child = Command::new("sleep")
            .arg("30")
            .current_dir(dir.path())
            .spawn()
            .unwrap();
        let table = SysinfoProcessTable::new();

        // The child may not have exec'd yet on the first scan.
        let mut found = None;
        for _ in 0..50 {
            found = table
                .processes()
                .into_iter()
                .find(|p| p.pid == child.id() && p.cmdline.iter().any(|a| a == "30"));
            if found.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(40));
        }
        let _ = child.kill();
        let _ = child.wait();

        let info = found.expect("child argv never appeared");
        assert!(info.cmdline[0].ends_with("sleep"));
        assert_eq!(
            info.cwd.map(|c| c.canonicalize().unwrap()),
            Some(dir.path().canonicalize().unwrap())
        );
    }

    #[cfg(unix)]
    #[test]
    fn terminates_running_child() {
        use std::process::Command;

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let table = SysinfoProcessTable::new();
        assert!(table.terminate(child.id()).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn terminating_missing_pid_reports_gone() {
        let table = SysinfoProcessTable::new();
        assert!(!table.terminate(u32::MAX - 7).unwrap());
    }
}
