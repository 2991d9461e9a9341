//! Copying the application into its install directory.

use std::fs;
use std::path::Path;

use log::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::error::{DeployError, Result};

const SKIPPED_DIRS: [&str; 7] = [
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    "target",
    "node_modules",
    ".pytest_cache",
];

fn is_skipped(entry: &DirEntry, dest: &Path) -> bool {
    if entry.path() == dest {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        return SKIPPED_DIRS.contains(&name.as_ref());
    }
    name.ends_with(".log") || name.ends_with(".pyc") || name == crate::manifest::MANIFEST_FILE
}

/// Copy `source` into `dest`, returning the number of files copied.
///
/// Staging a directory onto itself copies nothing.
pub fn stage_tree(source: &Path, dest: &Path) -> Result<usize> {
    let source = source
        .canonicalize()
        .map_err(|e| DeployError::io_at(source, e))?;
    fs::create_dir_all(dest).map_err(|e| DeployError::io_at(dest, e))?;
    let dest = dest.canonicalize().map_err(|e| DeployError::io_at(dest, e))?;

    if source == dest {
        info!("{} is already the install directory", dest.display());
        return Ok(0);
    }

    let mut copied = 0;
    for entry in WalkDir::new(&source)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_skipped(e, &dest))
    {
        let entry = entry.map_err(|e| DeployError::system(format!("Failed to walk source: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(&source)
            .map_err(|e| DeployError::system(e.to_string()))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| DeployError::io_at(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| DeployError::io_at(&target, e))?;
            copied += 1;
        }
    }
    debug!("copied {copied} files from {} to {}", source.display(), dest.display());
    Ok(copied)
}

/// Create the log directory and hand it to the service account.
pub fn prepare_log_dir(log_dir: &Path, user: Option<&str>, elevated: bool) -> Result<()> {
    fs::create_dir_all(log_dir).map_err(|e| DeployError::io_at(log_dir, e))?;

    #[cfg(unix)]
    if elevated
        && let Some(name) = user
        && name != "root"
    {
        use nix::unistd::{User, chown};

        let account = User::from_name(name)
            .map_err(|e| DeployError::system(format!("Failed to look up user {name}: {e}")))?
            .ok_or_else(|| DeployError::system(format!("User {name} does not exist")))?;
        chown(log_dir, Some(account.uid), Some(account.gid))
            .map_err(|e| DeployError::system(format!("Failed to chown {}: {e}", log_dir.display())))?;
    }
    #[cfg(not(unix))]
    let _ = (user, elevated);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn copies_tree_without_caches_and_logs() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("main.py"), "print('hi')");
        write(&src.path().join("src/core/engine.py"), "");
        write(&src.path().join("src/__pycache__/engine.cpython-311.pyc"), "");
        write(&src.path().join(".git/HEAD"), "ref");
        write(&src.path().join("debug.log"), "noise");

        let dst = tempfile::tempdir().unwrap();
        let dest = dst.path().join("rkos");
        let copied = stage_tree(src.path(), &dest).unwrap();

        assert_eq!(copied, 2);
        assert!(dest.join("main.py").is_file());
        assert!(dest.join("src/core/engine.py").is_file());
        assert!(!dest.join("src/__pycache__").exists());
        assert!(!dest.join(".git").exists());
        assert!(!dest.join("debug.log").exists());
    }

    #[test]
    fn destination_inside_source_is_not_recursed() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("main.py"), "");
        let dest = src.path().join("install");
        assert_eq!(stage_tree(src.path(), &dest).unwrap(), 1);
        assert!(!dest.join("install").exists());
    }

    #[test]
    fn staging_onto_itself_copies_nothing() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("main.py"), "");
        assert_eq!(stage_tree(src.path(), src.path()).unwrap(), 0);
    }
}
