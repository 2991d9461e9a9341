//! Raw host facts read from the filesystem and PATH.

use std::fs;
use std::path::Path;

use super::PackageManager;

/// Subset of `/etc/os-release` used for classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
}

impl OsRelease {
    /// Parse `KEY=value` lines, tolerating quotes and comments.
    pub fn parse(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key.trim() {
                "ID" => release.id = value.to_ascii_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value
                        .split_whitespace()
                        .map(|s| s.to_ascii_lowercase())
                        .collect()
                }
                _ => {}
            }
        }
        release
    }
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    /// `std::env::consts::OS`
    pub os: String,
    /// `std::env::consts::ARCH`
    pub arch: String,
    pub os_release: Option<OsRelease>,
    /// Device-tree model string, present on most ARM boards.
    pub board_model: Option<String>,
    pub wsl: bool,
    pub systemd_running: bool,
    /// Package managers found on PATH.
    pub package_managers: Vec<PackageManager>,
}

impl HostFacts {
    pub fn gather() -> Self {
        let os_release = ["/etc/os-release", "/usr/lib/os-release"]
            .iter()
            .find_map(|p| fs::read_to_string(p).ok())
            .map(|content| OsRelease::parse(&content));

        let board_model = [
            "/proc/device-tree/model",
            "/sys/firmware/devicetree/base/model",
        ]
        .iter()
        .find_map(|p| fs::read_to_string(p).ok())
        .map(|m| m.trim_end_matches('\0').trim().to_string())
        .filter(|m| !m.is_empty());

        let wsl = fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|r| {
                let r = r.to_ascii_lowercase();
                r.contains("microsoft") || r.contains("wsl")
            })
            .unwrap_or(false);

        let package_managers = PackageManager::ALL
            .into_iter()
            .filter(|pm| pm.executable().is_some_and(|exe| which::which(exe).is_ok()))
            .collect();

        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_release,
            board_model,
            wsl,
            systemd_running: Path::new("/run/systemd/system").exists(),
            package_managers,
        }
    }
}
