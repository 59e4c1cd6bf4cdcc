//! Daemon-wide configuration: load/create/save `config.toml`, plus the
//! size-literal and env-file grammars used to parse `ProcessConfig` fields.
//!
//! Scoped to what a local, single-host supervisor needs: no remote-fleet
//! config, no agent/server role split, no secure-token handshake.

pub mod envfile;
pub mod paths;
pub mod size;
pub mod structs;

use std::fs;

use structs::prelude::*;

use crate::errors::Result;

/// Loads `config.toml` from the daemon home directory, creating it with
/// defaults on first run.
pub fn read() -> Result<DaemonConfig> {
    let path = paths::config_path()?;

    if !path.exists() {
        paths::ensure_home()?;
        let config = DaemonConfig::default();
        save(&config)?;
        log::info!("created default config at {}", path.display());
        return Ok(config);
    }

    let contents = fs::read_to_string(&path)?;
    Ok(toml::from_str(&contents)?)
}

pub fn save(config: &DaemonConfig) -> Result<()> {
    let path = paths::config_path()?;
    paths::ensure_home()?;
    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn read_creates_a_default_config_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let config = read().unwrap();
        assert_eq!(config.health_check_interval_ms, 5000);
        assert!(dir.path().join("config.toml").exists());

        std::env::remove_var(paths::HOME_ENV);
    }

    #[test]
    #[serial]
    fn save_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let mut config = DaemonConfig::default();
        config.health_check_interval_ms = 9999;
        save(&config).unwrap();

        let reloaded = read().unwrap();
        assert_eq!(reloaded.health_check_interval_ms, 9999);

        std::env::remove_var(paths::HOME_ENV);
    }
}
