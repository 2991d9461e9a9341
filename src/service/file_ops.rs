//! Descriptor file writes.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{DeployError, Result};

/// Write through a sibling temp file and rename, so a crash never leaves a
/// half-written descriptor behind.
pub(crate) fn write_file_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| map_io(parent, e))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = fs::File::create(&temp_path).map_err(|e| map_io(&temp_path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| map_io(&temp_path, e))?;
        file.sync_all().map_err(|e| map_io(&temp_path, e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| map_io(path, e))
}

/// Set unix permission bits; a no-op elsewhere.
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| map_io(path, e))
        } else {
            let _ = (path, mode);
            Ok(())
        }
    }
}

/// Remove a file; `Ok(false)` when it was not there.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(map_io(path, e)),
    }
}

fn map_io(path: &Path, err: std::io::Error) -> DeployError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        DeployError::permission(format!("cannot write {}", path.display()))
    } else {
        DeployError::io_at(path, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("rkos.service");
        write_file_atomic(&path, "[Unit]\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Unit]\n");
        assert!(!dir.path().join("a").join("rkos.service.tmp").exists());
    }

    #[test]
    fn removing_missing_file_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_if_exists(&dir.path().join("nope")).unwrap());
    }
}
