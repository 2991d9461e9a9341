//! Install manifest.
//!
//! A directory is only ever deleted by the uninstaller when it carries this
//! file.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};
use crate::platform::OsFamily;
use crate::service::ServiceManagerKind;

pub const MANIFEST_FILE: &str = ".rkos-install.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub service: String,
    pub port: u16,
    pub install_dir: PathBuf,
    pub manager: ServiceManagerKind,
    pub descriptor: Option<PathBuf>,
    pub proxy_config: Option<PathBuf>,
    pub os_family: OsFamily,
    pub installed_at: DateTime<Utc>,
}

impl InstallManifest {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn exists_in(dir: &Path) -> bool {
        Self::path_in(dir).is_file()
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(dir);
        let body = toml::to_string_pretty(self)
            .map_err(|e| DeployError::system(format!("Failed to serialize manifest: {e}")))?;
        crate::service::file_ops::write_file_atomic(&path, &body)?;
        Ok(path)
    }

    /// Read the manifest in `dir`; unreadable manifests are logged and ignored.
    pub fn read_from(dir: &Path) -> Option<Self> {
        let path = Self::path_in(dir);
        let raw = fs::read_to_string(&path).ok()?;
        match toml::from_str(&raw) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring unreadable manifest {}: {e}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = InstallManifest {
            service: "rkos".to_string(),
            port: 8090,
            install_dir: dir.path().to_path_buf(),
            manager: ServiceManagerKind::SystemdUnit,
            descriptor: Some(PathBuf::from("/etc/systemd/system/rkos.service")),
            proxy_config: None,
            os_family: OsFamily::RaspberryPi,
            installed_at: Utc::now(),
        };
        manifest.write_to(dir.path()).unwrap();
        assert!(InstallManifest::exists_in(dir.path()));
        assert_eq!(InstallManifest::read_from(dir.path()), Some(manifest));
    }

    #[test]
    fn garbage_manifest_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), "port = \"eighty\"").unwrap();
        assert!(InstallManifest::read_from(dir.path()).is_none());
        assert!(InstallManifest::exists_in(dir.path()));
    }
}
