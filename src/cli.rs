use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "RK-OS deployer: install, locate and remove the RK-OS service")]
pub struct Args {
    /// Path to a deploy.toml overriding the defaults
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Print the report as JSON instead of the coloured summary
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub sub: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Stage, register and start the service (Exit 0 = installed, 1 = failed)
    Install(InstallArgs),
    /// Locate and remove an existing installation (Exit 0 = removed, 1 = failed or declined)
    Uninstall {
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Report where the service is installed and whether it runs (Exit 0 = found, 1 = not found)
    Status,
}

#[derive(ClapArgs, Debug)]
pub struct InstallArgs {
    /// Port to serve on; conflicts are confirmed interactively
    #[arg(long, short = 'p')]
    pub port: Option<u32>,

    /// Answer yes to every confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Application directory containing main.py (defaults to the current directory)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Install into this directory instead of the platform default
    #[arg(long)]
    pub install_dir: Option<PathBuf>,

    /// Skip reverse-proxy configuration
    #[arg(long)]
    pub no_proxy: bool,

    /// Omit sandboxing directives from the service descriptor
    #[arg(long)]
    pub no_harden: bool,

    /// Register the service without starting it
    #[arg(long)]
    pub no_start: bool,
}
