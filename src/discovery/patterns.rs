//! Command-line heuristics.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::manifest::InstallManifest;
use crate::system::ProcessInfo;

/// Port patterns, most specific first.
static PORT_PATTERNS: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"--port(?:=|\s+)(\d{1,5})\b").expect("valid --port regex"),
        Regex::new(r"(?:^|\s)-p\s+(\d{1,5})\b").expect("valid -p regex"),
        Regex::new(r"(?:0\.0\.0\.0|127\.0\.0\.1|localhost|\[::\]|::):(\d{1,5})\b")
            .expect("valid host:port regex"),
    ]
});

/// First port matched by the ranked patterns.
pub fn port_from_command_line(cmdline: &str) -> Option<u16> {
    PORT_PATTERNS.iter().find_map(|re| {
        re.captures(cmdline)
            .and_then(|c| c[1].parse::<u16>().ok())
            .filter(|p| *p != 0)
    })
}

/// True when `dir` looks like a staged install: a manifest, or the
/// entrypoint next to its module directory.
pub fn is_install_root(dir: &Path, entrypoint: &str, module_path: &str) -> bool {
    InstallManifest::exists_in(dir)
        || (dir.join(entrypoint).is_file() && dir.join(module_path).is_dir())
}

/// Decides whether a process runs this service.
pub struct EntrypointMatcher<'a> {
    pub entrypoint: &'a str,
    pub module_path: &'a str,
    pub roots: &'a [PathBuf],
}

impl EntrypointMatcher<'_> {
    /// Directory of the entrypoint the process was started with, when that
    /// directory is one of ours.
    pub fn install_dir_of(&self, process: &ProcessInfo) -> Option<PathBuf> {
        if process.pid == std::process::id() {
            return None;
        }
        process.cmdline.iter().skip(1).find_map(|arg| {
            let arg_path = Path::new(arg);
            if arg_path.file_name()? != Path::new(self.entrypoint).file_name()? {
                return None;
            }
            let script = if arg_path.is_absolute() {
                arg_path.to_path_buf()
            } else {
                process.cwd.as_ref()?.join(arg_path)
            };
            let dir = script.parent()?.to_path_buf();
            let known = self.roots.iter().any(|r| r == &dir)
                || is_install_root(&dir, self.entrypoint, self.module_path);
            known.then_some(dir)
        })
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        self.install_dir_of(process).is_some()
    }
}
