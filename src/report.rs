//! Step results and run summaries.

use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::discovery::DiscoveryResult;
use crate::platform::PlatformProfile;
use crate::port::PortSelection;
use crate::service::{ServiceManagerKind, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub step: &'static str,
    pub outcome: Outcome,
    pub detail: String,
    /// Manual completion text; present means degraded success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl StepResult {
    pub fn ok(step: &'static str, detail: impl Into<String>) -> Self {
        Self {
            step,
            outcome: Outcome::Ok,
            detail: detail.into(),
            instructions: None,
        }
    }

    pub fn degraded(step: &'static str, detail: impl Into<String>, instructions: String) -> Self {
        Self {
            step,
            outcome: Outcome::Ok,
            detail: detail.into(),
            instructions: Some(instructions),
        }
    }

    pub fn skipped(step: &'static str, detail: impl Into<String>) -> Self {
        Self {
            step,
            outcome: Outcome::Skipped,
            detail: detail.into(),
            instructions: None,
        }
    }

    pub fn failed(step: &'static str, detail: impl Into<String>) -> Self {
        Self {
            step,
            outcome: Outcome::Failed,
            detail: detail.into(),
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.outcome != Outcome::Failed && self.instructions.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "kebab-case")]
pub enum InstallState {
    NotStarted,
    PlatformProbed,
    DependenciesChecked,
    PortResolved,
    FilesStaged,
    ServiceRegistered,
    ServiceRunning,
    ManualCompletionRequired,
    PartialInstall(&'static str),
    Aborted(&'static str),
}

impl InstallState {
    /// Terminal states that exit 0.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::ServiceRegistered | Self::ServiceRunning | Self::ManualCompletionRequired
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub state: InstallState,
    pub platform: Option<PlatformProfile>,
    pub port: Option<PortSelection>,
    pub steps: Vec<StepResult>,
    pub artifacts: Vec<PathBuf>,
}

impl InstallReport {
    pub fn new() -> Self {
        Self {
            state: InstallState::NotStarted,
            platform: None,
            port: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn push(&mut self, step: StepResult) {
        log::debug!("{} -> {:?}: {}", step.step, step.outcome, step.detail);
        self.steps.push(step);
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn first_failure(&self) -> Option<&'static str> {
        self.steps
            .iter()
            .find(|s| s.outcome == Outcome::Failed)
            .map(|s| s.step)
    }
}

impl Default for InstallReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UninstallState {
    Discovered,
    ConfirmationPending,
    Confirmed,
    ServicesStopped,
    Deregistered,
    ProxyRemoved,
    FilesRemoved,
    EnvironmentCleaned,
    Verified,
    Declined,
    NothingInstalled,
}

#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub state: UninstallState,
    pub discovery: DiscoveryResult,
    pub steps: Vec<StepResult>,
    /// What verification still found on the host.
    pub residual: Vec<String>,
}

impl UninstallReport {
    pub fn push(&mut self, step: StepResult) {
        log::debug!("{} -> {:?}: {}", step.step, step.outcome, step.detail);
        self.steps.push(step);
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn is_success(&self) -> bool {
        self.state != UninstallState::Declined
            && self.steps.iter().all(|s| s.outcome != Outcome::Failed)
    }
}

/// Answer to `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub platform: PlatformProfile,
    pub manager: ServiceManagerKind,
    pub service: ServiceStatus,
    pub discovery: DiscoveryResult,
}

fn print_steps(out: &mut StandardStream, steps: &[StepResult]) -> io::Result<()> {
    for step in steps {
        let (mark, color) = match step.outcome {
            Outcome::Ok if step.instructions.is_some() => ("!", Color::Yellow),
            Outcome::Ok => ("✓", Color::Green),
            Outcome::Skipped => ("-", Color::Cyan),
            Outcome::Failed => ("✗", Color::Red),
        };
        out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
        write!(out, "  {mark} {:<20}", step.step)?;
        out.reset()?;
        writeln!(out, " {}", step.detail)?;
    }

    let manual: Vec<&StepResult> = steps.iter().filter(|s| s.instructions.is_some()).collect();
    if !manual.is_empty() {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)).set_bold(true))?;
        writeln!(out, "\nManual steps required:")?;
        out.reset()?;
        for step in manual {
            writeln!(out, "  [{}]", step.step)?;
            for line in step.instructions.iter().flat_map(|i| i.lines()) {
                writeln!(out, "    {line}")?;
            }
        }
    }
    Ok(())
}

fn print_counts(out: &mut StandardStream, steps: &[StepResult]) -> io::Result<()> {
    let failed = steps.iter().filter(|s| s.outcome == Outcome::Failed).count();
    let degraded = steps.iter().filter(|s| s.is_degraded()).count();
    let ok = steps
        .iter()
        .filter(|s| s.outcome == Outcome::Ok && !s.is_degraded())
        .count();
    writeln!(out, "\n{ok} succeeded, {degraded} degraded, {failed} failed")
}

/// Coloured install summary on stdout.
pub fn print_install(report: &InstallReport) -> io::Result<()> {
    let mut out = StandardStream::stdout(ColorChoice::Auto);

    out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)).set_bold(true))?;
    writeln!(out, "Installation summary")?;
    out.reset()?;
    if let Some(p) = &report.platform {
        writeln!(
            out,
            "Platform: {:?} / {:?} / {:?}",
            p.os_family, p.init_system, p.arch
        )?;
    }
    if let Some(sel) = &report.port {
        writeln!(out, "Port: {} ({:?})", sel.resolved_port, sel.method)?;
        for warning in &sel.warnings {
            writeln!(out, "  note: {warning}")?;
        }
    }
    writeln!(out)?;
    print_steps(&mut out, &report.steps)?;

    if !report.artifacts.is_empty() {
        writeln!(out, "\nGenerated files:")?;
        for path in &report.artifacts {
            writeln!(out, "  {}", path.display())?;
        }
    }
    print_counts(&mut out, &report.steps)?;

    let color = if report.state.is_success() {
        Color::Green
    } else {
        Color::Red
    };
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    writeln!(out, "Final state: {:?}", report.state)?;
    out.reset()
}

/// Coloured uninstall summary on stdout.
pub fn print_uninstall(report: &UninstallReport) -> io::Result<()> {
    let mut out = StandardStream::stdout(ColorChoice::Auto);

    out.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)).set_bold(true))?;
    writeln!(out, "Uninstall summary")?;
    out.reset()?;
    print_discovery(&mut out, &report.discovery)?;
    writeln!(out)?;
    print_steps(&mut out, &report.steps)?;

    if !report.residual.is_empty() {
        out.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)))?;
        writeln!(out, "\nStill present:")?;
        out.reset()?;
        for note in &report.residual {
            writeln!(out, "  {note}")?;
        }
    }
    print_counts(&mut out, &report.steps)?;

    let color = if report.is_success() {
        Color::Green
    } else {
        Color::Red
    };
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    writeln!(out, "Final state: {:?}", report.state)?;
    out.reset()
}

/// Coloured status on stdout.
pub fn print_status(report: &StatusReport) -> io::Result<()> {
    let mut out = StandardStream::stdout(ColorChoice::Auto);

    let (label, color) = match (report.discovery.found, report.service) {
        (_, ServiceStatus::Active) => ("running", Color::Green),
        (true, _) => ("installed", Color::Yellow),
        (false, _) => ("not installed", Color::Red),
    };
    out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    writeln!(out, "Service: {label}")?;
    out.reset()?;
    writeln!(
        out,
        "Platform: {:?} / {:?} via {:?}",
        report.platform.os_family, report.platform.init_system, report.manager
    )?;
    print_discovery(&mut out, &report.discovery)
}

fn print_discovery(out: &mut StandardStream, found: &DiscoveryResult) -> io::Result<()> {
    match found.found_port {
        Some(port) => writeln!(out, "Port: {port} ({:?})", found.confidence)?,
        None => writeln!(
            out,
            "Port: unknown (default {})",
            found.port_or_default()
        )?,
    }
    if let Some(dir) = &found.found_install_dir {
        writeln!(out, "Install directory: {}", dir.display())?;
    }
    if found.candidates.len() > 1 {
        writeln!(out, "Ambiguous: ports {:?} were all seen", found.candidates)?;
    }
    for note in &found.evidence {
        writeln!(out, "  evidence: {note}")?;
    }
    Ok(())
}

/// Reports as JSON on stdout for `--json`.
pub fn print_json<T: Serialize>(report: &T) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, report)?;
    writeln!(stdout)
}
