//! Exclusive deployer lock.
//!
//! Held for the duration of an install or uninstall so two runs never
//! interleave writes to the same service files.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{DeployError, Result};

/// Released when dropped.
pub struct DeployLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<fs::File>,
}

impl DeployLock {
    /// Take the lock without waiting; a concurrent holder is `LockHeld`.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DeployError::io_at(parent, e))?;
        }

        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                use nix::fcntl::{Flock, FlockArg};

                let file = fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(path)
                    .map_err(|e| DeployError::io_at(path, e))?;
                let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
                    .map_err(|_| DeployError::LockHeld(path.to_path_buf()))?;
                debug!("acquired lock {}", path.display());
                Ok(Self {
                    path: path.to_path_buf(),
                    _flock: flock,
                })
            } else {
                match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                    Ok(_) => {
                        debug!("acquired lock {}", path.display());
                        Ok(Self { path: path.to_path_buf() })
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        Err(DeployError::LockHeld(path.to_path_buf()))
                    }
                    Err(e) => Err(DeployError::io_at(path, e)),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for DeployLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployLock").field("path", &self.path).finish()
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        // The flock is released with the descriptor; the marker file is
        // what other platforms test for.
        #[cfg(not(unix))]
        let _ = fs::remove_file(&self.path);
        debug!("released lock {}", self.path.display());
    }
}
