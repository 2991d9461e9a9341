mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use rkos_deploy::config::DeployConfig;
use rkos_deploy::context::DeployContext;
use rkos_deploy::install::{Capabilities, InstallOptions, Installer};
use rkos_deploy::platform::PlatformProfile;
use rkos_deploy::prompt::{Confirmer, FixedConfirmer, InquireConfirmer};
use rkos_deploy::report::{self, StatusReport};
use rkos_deploy::service::{self, Exec};
use rkos_deploy::system::packages::PathLookup;
use rkos_deploy::system::{SysinfoProcessTable, SystemCommandRunner, TcpPortProbe, privilege};
use rkos_deploy::uninstall::Uninstaller;
use rkos_deploy::{discovery::Locator, proxy};

fn main() -> ExitCode {
    // Warnings only by default; the summary is the primary output
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    match real_main() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Host implementations of every capability, created once per run.
struct Host {
    runner: SystemCommandRunner,
    ports: TcpPortProbe,
    processes: SysinfoProcessTable,
    lookup: PathLookup,
}

impl Host {
    fn new() -> Result<Self> {
        Ok(Self {
            runner: SystemCommandRunner::new().context("Failed to set up command execution")?,
            ports: TcpPortProbe::new(),
            processes: SysinfoProcessTable::new(),
            lookup: PathLookup,
        })
    }
}

/// `Ok(true)` means exit 0.
fn real_main() -> Result<bool> {
    let args = cli::Args::parse();

    let mut config = DeployConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let cli::Cmd::Install(install) = &args.sub {
        if let Some(dir) = &install.install_dir {
            config.paths.install_dir = Some(dir.clone());
        }
        if install.no_proxy {
            config.proxy.enabled = false;
        }
    }

    let elevated = privilege::is_elevated();
    let ctx = DeployContext::resolve(&config, elevated).context("Failed to resolve install locations")?;
    info!(
        "install dir {} (elevated: {elevated})",
        ctx.install_dir.display()
    );

    let host = Host::new()?;
    let profile = PlatformProfile::probe();
    let exec = Exec::new(&host.runner, ctx.command_timeout, elevated);
    let manager = service::select(&profile, &config, &ctx, exec, &host.lookup);

    match args.sub {
        cli::Cmd::Install(install) => {
            let confirmer = confirmer(install.yes);
            let proxy = proxy::select(&config, &ctx, exec, &host.lookup, config.proxy.enabled);
            let source_dir = match install.source.or_else(|| config.paths.source_dir.clone()) {
                Some(dir) => dir,
                None => std::env::current_dir().context("Failed to read the current directory")?,
            };
            let options = InstallOptions {
                port: install.port,
                source_dir,
                start: !install.no_start,
                hardened: !install.no_harden,
            };
            let caps = Capabilities {
                ports: &host.ports,
                runner: &host.runner,
                lookup: &host.lookup,
                confirmer: confirmer.as_ref(),
            };

            let report = Installer::new(&config, &ctx, caps).run(
                profile,
                manager.as_ref(),
                proxy.as_ref(),
                &options,
            );
            if args.json {
                report::print_json(&report)?;
            } else {
                report::print_install(&report)?;
            }
            Ok(report.state.is_success())
        }
        cli::Cmd::Uninstall { yes } => {
            let confirmer = confirmer(yes);
            let proxy = proxy::select(&config, &ctx, exec, &host.lookup, true);
            let report = Uninstaller::new(
                &config,
                &ctx,
                manager.as_ref(),
                proxy.as_ref(),
                &host.processes,
                &host.ports,
                confirmer.as_ref(),
            )
            .run();
            if args.json {
                report::print_json(&report)?;
            } else {
                report::print_uninstall(&report)?;
            }
            Ok(report.is_success())
        }
        cli::Cmd::Status => {
            let discovery = Locator::new(
                &config,
                manager.as_ref(),
                &host.processes,
                &host.ports,
                &ctx.candidate_roots,
            )
            .locate();
            let status = StatusReport {
                platform: profile,
                manager: manager.kind(),
                service: manager.query_status(),
                discovery,
            };
            if args.json {
                report::print_json(&status)?;
            } else {
                report::print_status(&status)?;
            }
            Ok(status.discovery.found)
        }
    }
}

fn confirmer(yes: bool) -> Box<dyn Confirmer> {
    if yes {
        Box::new(FixedConfirmer::new(true))
    } else {
        Box::new(InquireConfirmer)
    }
}
