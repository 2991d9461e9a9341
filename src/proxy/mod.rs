//! Reverse-proxy configuration.

use std::path::{Path, PathBuf};

use log::info;

use crate::config::DeployConfig;
use crate::context::DeployContext;
use crate::error::Result;
use crate::service::{Change, Exec};
use crate::system::packages::ExecutableLookup;

mod nginx;

pub use nginx::{Nginx, NginxLayout, render_server_block};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// Configuration is live and the proxy reloaded.
    Activated { path: PathBuf },
    /// Written to the staging directory; the operator activates it.
    Staged { path: PathBuf, instructions: String },
    Skipped(String),
}

pub trait ReverseProxy {
    /// Front `127.0.0.1:<port>`.
    fn configure(&self, port: u16) -> Result<ProxyOutcome>;

    /// Delete every configuration file this deployer wrote.
    fn remove(&self) -> Result<Change>;

    /// Configuration file left behind by an earlier install, if any.
    fn existing_config(&self) -> Option<PathBuf>;
}

/// Used when nginx is absent or the proxy is disabled.
#[derive(Debug, Clone)]
pub struct NoProxy {
    reason: String,
}

impl NoProxy {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl ReverseProxy for NoProxy {
    fn configure(&self, _port: u16) -> Result<ProxyOutcome> {
        Ok(ProxyOutcome::Skipped(self.reason.clone()))
    }

    fn remove(&self) -> Result<Change> {
        Ok(Change::Unchanged(self.reason.clone()))
    }

    fn existing_config(&self) -> Option<PathBuf> {
        None
    }
}

/// nginx when it is installed and `enabled`, otherwise a no-op.
pub fn select<'a>(
    config: &DeployConfig,
    ctx: &DeployContext,
    exec: Exec<'a>,
    lookup: &dyn ExecutableLookup,
    enabled: bool,
) -> Box<dyn ReverseProxy + 'a> {
    if !enabled {
        return Box::new(NoProxy::new("reverse proxy disabled"));
    }
    let nginx_root = Path::new("/etc/nginx");
    if !lookup.exists("nginx") || !nginx_root.is_dir() {
        info!("nginx not found; skipping reverse proxy");
        return Box::new(NoProxy::new("nginx is not installed"));
    }
    let layout = NginxLayout::detect(nginx_root);
    Box::new(Nginx::new(
        &config.service.name,
        config.proxy.listen_port,
        layout,
        exec,
        ctx.staging_dir.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proxy_skips_everything() {
        let proxy = NoProxy::new("nginx is not installed");
        assert_eq!(
            proxy.configure(8085).unwrap(),
            ProxyOutcome::Skipped("nginx is not installed".to_string())
        );
        assert!(matches!(proxy.remove().unwrap(), Change::Unchanged(_)));
        assert!(proxy.existing_config().is_none());
    }
}
