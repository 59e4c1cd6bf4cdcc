//! Resolves the daemon home directory and the filesystem layout beneath it,
//! per spec.md §6 ("Filesystem layout").

use std::path::PathBuf;

use crate::errors::{NodeDaemonError, Result};

pub const HOME_ENV: &str = "NODEDAEMON_HOME";
pub const SOCKET_ENV: &str = "NODEDAEMON_SOCKET";
pub const LOG_LEVEL_ENV: &str = "NODEDAEMON_LOG_LEVEL";
pub const WEBUI_PASSWORD_ENV: &str = "NODEDAEMON_WEBUI_PASSWORD";

/// `~/.nodedaemon` unless overridden by `NODEDAEMON_HOME`.
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(override_path));
    }

    home::home_dir()
        .map(|p| p.join(".nodedaemon"))
        .ok_or_else(|| NodeDaemonError::invalid_config("could not determine home directory"))
}

pub fn ensure_home() -> Result<PathBuf> {
    let home = home_dir()?;
    std::fs::create_dir_all(&home)?;
    std::fs::create_dir_all(home.join("logs"))?;
    Ok(home)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join("config.toml"))
}

pub fn state_path() -> Result<PathBuf> {
    Ok(home_dir()?.join("state.json"))
}

pub fn socket_path() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    Ok(home_dir()?.join("daemon.sock"))
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("logs"))
}

pub fn daemon_log_path() -> Result<PathBuf> {
    Ok(log_dir()?.join("daemon.log"))
}

pub fn process_log_path(process_name: &str) -> Result<PathBuf> {
    Ok(log_dir()?.join(format!("{process_name}.log")))
}

pub fn process_log_archive_path(process_name: &str, index: u32) -> Result<PathBuf> {
    Ok(log_dir()?.join(format!("{process_name}.{index}.log.gz")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn home_dir_honors_override_env_var() {
        std::env::set_var(HOME_ENV, "/tmp/nd-test-home");
        assert_eq!(home_dir().unwrap(), PathBuf::from("/tmp/nd-test-home"));
        std::env::remove_var(HOME_ENV);
    }

    #[test]
    #[serial]
    fn socket_path_honors_override_env_var() {
        std::env::set_var(SOCKET_ENV, "/tmp/nd-test.sock");
        assert_eq!(socket_path().unwrap(), PathBuf::from("/tmp/nd-test.sock"));
        std::env::remove_var(SOCKET_ENV);
    }

    #[test]
    fn process_log_archive_naming_matches_the_spec() {
        std::env::set_var(HOME_ENV, "/tmp/nd-test-home-2");
        let p = process_log_archive_path("api", 3).unwrap();
        assert_eq!(p.file_name().unwrap().to_str().unwrap(), "api.3.log.gz");
        std::env::remove_var(HOME_ENV);
    }
}
