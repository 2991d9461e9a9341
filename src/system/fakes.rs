//! Scripted capability fakes for tests.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::time::Duration;

use super::{CommandOutput, CommandRunner, PortProbe, ProcessInfo, ProcessTable, render_command};
use crate::error::{DeployError, Result};

#[derive(Debug, Default)]
pub(crate) struct FakePortProbe {
    busy: RefCell<BTreeSet<u16>>,
}

impl FakePortProbe {
    pub fn with_busy(ports: &[u16]) -> Self {
        Self {
            busy: RefCell::new(ports.iter().copied().collect()),
        }
    }
}

impl PortProbe for FakePortProbe {
    fn in_use(&self, port: u16) -> bool {
        self.busy.borrow().contains(&port)
    }
}

/// Process table whose entries disappear once terminated.
#[derive(Debug, Default)]
pub(crate) struct FakeProcessTable {
    procs: RefCell<Vec<ProcessInfo>>,
    terminated: RefCell<Vec<u32>>,
}

impl FakeProcessTable {
    pub fn new(procs: Vec<ProcessInfo>) -> Self {
        Self {
            procs: RefCell::new(procs),
            terminated: RefCell::default(),
        }
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.borrow().clone()
    }
}

impl ProcessTable for FakeProcessTable {
    fn processes(&self) -> Vec<ProcessInfo> {
        self.procs.borrow().clone()
    }

    fn terminate(&self, pid: u32) -> Result<bool> {
        let mut procs = self.procs.borrow_mut();
        let before = procs.len();
        procs.retain(|p| p.pid != pid);
        if procs.len() == before {
            return Ok(false);
        }
        self.terminated.borrow_mut().push(pid);
        Ok(true)
    }
}

pub(crate) fn process(pid: u32, cmdline: &[&str]) -> ProcessInfo {
    ProcessInfo {
        pid,
        name: cmdline.first().copied().unwrap_or_default().to_string(),
        cmdline: cmdline.iter().map(|s| s.to_string()).collect(),
        cwd: None,
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    TimedOut,
}

/// Records every command; unscripted commands succeed with empty output.
#[derive(Debug, Default)]
pub(crate) struct FakeRunner {
    calls: RefCell<Vec<String>>,
    // Later entries win.
    script: RefCell<Vec<(String, Scripted)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the response for commands whose rendered line starts with `prefix`.
    pub fn respond(&self, prefix: &str, code: i32, stdout: &str, stderr: &str) {
        self.script.borrow_mut().push((
            prefix.to_string(),
            Scripted::Output(CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        ));
    }

    pub fn time_out(&self, prefix: &str) {
        self.script
            .borrow_mut()
            .push((prefix.to_string(), Scripted::TimedOut));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.calls.borrow().iter().any(|c| c.starts_with(prefix))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let rendered = render_command(program, args);
        self.calls.borrow_mut().push(rendered.clone());

        let scripted = self
            .script
            .borrow()
            .iter()
            .rev()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .map(|(_, s)| s.clone());

        match scripted {
            Some(Scripted::Output(out)) => Ok(out),
            Some(Scripted::TimedOut) => Err(DeployError::CommandTimedOut {
                command: rendered,
                timeout,
            }),
            None => Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            }),
        }
    }
}
