//! RK-OS deployment library
//!
//! Installs the RK-OS logic service under whatever init system the host
//! runs, and later finds and removes it again. The `rkos-deploy` binary is a
//! thin CLI over [`install::Installer`], [`uninstall::Uninstaller`] and
//! [`discovery::Locator`].

pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod install;
pub mod lock;
pub mod manifest;
pub mod platform;
pub mod port;
pub mod prompt;
pub mod proxy;
pub mod report;
pub mod service;
pub mod system;
pub mod uninstall;

pub use error::{DeployError, Result};
