//! Platform detection.
//!
//! Facts are gathered from the host once and classified by a pure function,
//! so the classification rules are testable without the host they describe.
//! Classification never fails: anything unrecognised maps to `Unknown` /
//! `None` and the rest of the pipeline degrades to manual instructions.

use serde::{Deserialize, Serialize};

mod facts;

pub use facts::{HostFacts, OsRelease};

/// Operating-system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsFamily {
    Debian,
    Fedora,
    Arch,
    RaspberryPi,
    Macos,
    Windows,
    Wsl,
    Unknown,
}

/// Init system responsible for supervising services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitSystem {
    Systemd,
    Launchd,
    WindowsService,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Arch {
    X86_64,
    Arm64,
    Armv7,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Pacman,
    Brew,
    Choco,
    Winget,
    None,
}

impl PackageManager {
    /// Executable that must be on PATH for this manager.
    pub const fn executable(&self) -> Option<&'static str> {
        match self {
            Self::Apt => Some("apt-get"),
            Self::Dnf => Some("dnf"),
            Self::Yum => Some("yum"),
            Self::Pacman => Some("pacman"),
            Self::Brew => Some("brew"),
            Self::Choco => Some("choco"),
            Self::Winget => Some("winget"),
            Self::None => None,
        }
    }

    pub const ALL: [PackageManager; 7] = [
        Self::Apt,
        Self::Dnf,
        Self::Yum,
        Self::Pacman,
        Self::Brew,
        Self::Choco,
        Self::Winget,
    ];
}

/// Immutable description of the host, probed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformProfile {
    pub os_family: OsFamily,
    pub init_system: InitSystem,
    pub arch: Arch,
    pub package_manager: PackageManager,
    pub embedded_board: bool,
}

impl PlatformProfile {
    /// Probe the running host.
    pub fn probe() -> Self {
        let facts = HostFacts::gather();
        let profile = classify(&facts);
        log::info!(
            "platform: os={:?} init={:?} arch={:?} pkg={:?} board={}",
            profile.os_family,
            profile.init_system,
            profile.arch,
            profile.package_manager,
            profile.embedded_board
        );
        profile
    }

    pub fn is_linux(&self) -> bool {
        matches!(
            self.os_family,
            OsFamily::Debian
                | OsFamily::Fedora
                | OsFamily::Arch
                | OsFamily::RaspberryPi
                | OsFamily::Wsl
        ) || (self.os_family == OsFamily::Unknown && cfg!(target_os = "linux"))
    }
}

/// Map an architecture string (`std::env::consts::ARCH` or `uname -m`).
pub fn parse_arch(raw: &str) -> Arch {
    match raw.trim() {
        "x86_64" | "amd64" => Arch::X86_64,
        "aarch64" | "arm64" => Arch::Arm64,
        "arm" | "armv7" | "armv7l" | "armhf" | "armv6l" => Arch::Armv7,
        _ => Arch::Other,
    }
}

fn family_from_release_id(id: &str) -> Option<OsFamily> {
    match id {
        "debian" | "ubuntu" | "linuxmint" | "pop" | "elementary" => Some(OsFamily::Debian),
        "fedora" | "rhel" | "centos" | "rocky" | "almalinux" | "ol" => Some(OsFamily::Fedora),
        "arch" | "manjaro" | "endeavouros" => Some(OsFamily::Arch),
        "raspbian" => Some(OsFamily::RaspberryPi),
        _ => None,
    }
}

fn linux_family(facts: &HostFacts, arch: Arch) -> OsFamily {
    let release = facts.os_release.as_ref();
    let id = release.map(|r| r.id.as_str()).unwrap_or("");

    // Hardware markers win over the generic release ID.
    let board_marker = facts
        .board_model
        .as_deref()
        .is_some_and(|m| m.contains("Raspberry Pi"));
    let arm_debian = matches!(arch, Arch::Armv7 | Arch::Arm64) && matches!(id, "debian" | "raspbian");
    if board_marker || arm_debian {
        return OsFamily::RaspberryPi;
    }

    if facts.wsl {
        return OsFamily::Wsl;
    }

    if let Some(family) = family_from_release_id(id) {
        return family;
    }
    release
        .into_iter()
        .flat_map(|r| r.id_like.iter())
        .find_map(|like| family_from_release_id(like))
        .unwrap_or(OsFamily::Unknown)
}

fn release_family(facts: &HostFacts) -> Option<OsFamily> {
    let release = facts.os_release.as_ref()?;
    family_from_release_id(&release.id).or_else(|| {
        release
            .id_like
            .iter()
            .find_map(|like| family_from_release_id(like))
    })
}

fn package_manager_for(family: OsFamily, facts: &HostFacts) -> PackageManager {
    let has = |pm: PackageManager| facts.package_managers.contains(&pm);
    let preferred: &[PackageManager] = match family {
        OsFamily::Debian | OsFamily::RaspberryPi => &[PackageManager::Apt],
        OsFamily::Fedora => &[PackageManager::Dnf, PackageManager::Yum],
        OsFamily::Arch => &[PackageManager::Pacman],
        OsFamily::Macos => &[PackageManager::Brew],
        OsFamily::Windows => &[PackageManager::Choco, PackageManager::Winget],
        OsFamily::Wsl => {
            return match release_family(facts) {
                Some(inner) if inner != OsFamily::Wsl => package_manager_for(inner, facts),
                _ => PackageManager::ALL
                    .into_iter()
                    .find(|pm| has(*pm))
                    .unwrap_or(PackageManager::None),
            };
        }
        OsFamily::Unknown => {
            return PackageManager::ALL
                .into_iter()
                .find(|pm| has(*pm))
                .unwrap_or(PackageManager::None);
        }
    };
    preferred
        .iter()
        .copied()
        .find(|pm| has(*pm))
        .unwrap_or(PackageManager::None)
}

/// Classify gathered host facts into a profile.
pub fn classify(facts: &HostFacts) -> PlatformProfile {
    let arch = parse_arch(&facts.arch);

    let os_family = match facts.os.as_str() {
        "linux" => linux_family(facts, arch),
        "macos" => OsFamily::Macos,
        "windows" => OsFamily::Windows,
        _ => OsFamily::Unknown,
    };

    let init_system = match os_family {
        OsFamily::Macos => InitSystem::Launchd,
        OsFamily::Windows => InitSystem::WindowsService,
        OsFamily::Unknown => InitSystem::None,
        _ if facts.systemd_running => InitSystem::Systemd,
        _ => InitSystem::None,
    };

    PlatformProfile {
        os_family,
        init_system,
        arch,
        package_manager: package_manager_for(os_family, facts),
        embedded_board: os_family == OsFamily::RaspberryPi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux(id: &str, arch: &str) -> HostFacts {
        HostFacts {
            os: "linux".to_string(),
            arch: arch.to_string(),
            os_release: Some(OsRelease {
                id: id.to_string(),
                id_like: Vec::new(),
            }),
            board_model: None,
            wsl: false,
            systemd_running: true,
            package_managers: vec![PackageManager::Apt],
        }
    }

    #[test]
    fn armv7_debian_is_raspberry_pi() {
        let profile = classify(&linux("debian", "arm"));
        assert_eq!(profile.os_family, OsFamily::RaspberryPi);
        assert_eq!(profile.arch, Arch::Armv7);
        assert!(profile.embedded_board);
        assert_eq!(profile.init_system, InitSystem::Systemd);
        assert_eq!(profile.package_manager, PackageManager::Apt);
    }

    #[test]
    fn board_marker_beats_ubuntu_release() {
        let mut facts = linux("ubuntu", "aarch64");
        facts.board_model = Some("Raspberry Pi 4 Model B Rev 1.4".to_string());
        assert_eq!(classify(&facts).os_family, OsFamily::RaspberryPi);
    }

    #[test]
    fn ubuntu_on_arm_server_stays_debian() {
        assert_eq!(classify(&linux("ubuntu", "aarch64")).os_family, OsFamily::Debian);
    }

    #[test]
    fn x86_debian_is_debian() {
        let profile = classify(&linux("debian", "x86_64"));
        assert_eq!(profile.os_family, OsFamily::Debian);
        assert!(!profile.embedded_board);
    }

    #[test]
    fn fedora_prefers_dnf_then_yum() {
        let mut facts = linux("rocky", "x86_64");
        facts.package_managers = vec![PackageManager::Yum];
        let profile = classify(&facts);
        assert_eq!(profile.os_family, OsFamily::Fedora);
        assert_eq!(profile.package_manager, PackageManager::Yum);

        facts.package_managers = vec![PackageManager::Yum, PackageManager::Dnf];
        assert_eq!(classify(&facts).package_manager, PackageManager::Dnf);
    }

    #[test]
    fn id_like_resolves_derivatives() {
        let mut facts = linux("zorin", "x86_64");
        facts.os_release = Some(OsRelease {
            id: "zorin".to_string(),
            id_like: vec!["ubuntu".to_string(), "debian".to_string()],
        });
        assert_eq!(classify(&facts).os_family, OsFamily::Debian);
    }

    #[test]
    fn unknown_release_has_no_init_system() {
        let profile = classify(&linux("slackware", "x86_64"));
        assert_eq!(profile.os_family, OsFamily::Unknown);
        assert_eq!(profile.init_system, InitSystem::None);
    }

    #[test]
    fn linux_without_systemd_has_no_init_system() {
        let mut facts = linux("debian", "x86_64");
        facts.systemd_running = false;
        assert_eq!(classify(&facts).init_system, InitSystem::None);
    }

    #[test]
    fn wsl_marker_classifies_wsl_with_inner_package_manager() {
        let mut facts = linux("ubuntu", "x86_64");
        facts.wsl = true;
        let profile = classify(&facts);
        assert_eq!(profile.os_family, OsFamily::Wsl);
        assert_eq!(profile.package_manager, PackageManager::Apt);
    }

    #[test]
    fn macos_and_windows() {
        let mac = HostFacts {
            os: "macos".to_string(),
            arch: "aarch64".to_string(),
            package_managers: vec![PackageManager::Brew],
            ..HostFacts::default()
        };
        let profile = classify(&mac);
        assert_eq!(profile.os_family, OsFamily::Macos);
        assert_eq!(profile.init_system, InitSystem::Launchd);
        assert_eq!(profile.package_manager, PackageManager::Brew);

        let win = HostFacts {
            os: "windows".to_string(),
            arch: "x86_64".to_string(),
            package_managers: vec![PackageManager::Winget],
            ..HostFacts::default()
        };
        let profile = classify(&win);
        assert_eq!(profile.init_system, InitSystem::WindowsService);
        assert_eq!(profile.package_manager, PackageManager::Winget);
    }

    #[test]
    fn exotic_os_is_unknown() {
        let facts = HostFacts {
            os: "freebsd".to_string(),
            arch: "riscv64".to_string(),
            ..HostFacts::default()
        };
        let profile = classify(&facts);
        assert_eq!(profile.os_family, OsFamily::Unknown);
        assert_eq!(profile.arch, Arch::Other);
        assert_eq!(profile.package_manager, PackageManager::None);
    }
}
