//! Privilege detection.

/// Whether the current process can write system service locations.
pub fn is_elevated() -> bool {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            nix::unistd::geteuid().is_root()
        } else {
            // The Windows variant never needs elevation, so report the
            // conservative answer.
            false
        }
    }
}

/// Account the service should run as when the configuration names none.
///
/// Under `sudo` the invoking operator is preferred over root.
pub fn invoking_user() -> String {
    if let Ok(user) = std::env::var("SUDO_USER")
        && !user.is_empty()
    {
        return user;
    }

    #[cfg(unix)]
    {
        if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
            return user.name;
        }
    }

    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
