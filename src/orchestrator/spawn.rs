//! Builds the `tokio::process::Command` for one instance, given the
//! ManagedProcess's spawn strategy.
//!
//! Pipes stdio back to the Log Manager and builds each child's environment
//! explicitly from `env_file` merged behind `env`, rather than leaking the
//! daemon's own environment unfiltered into children.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use crate::clock::Id;
use crate::config::envfile;
use crate::errors::{NodeDaemonError, Result};
use crate::model::{ProcessConfig, SpawnStrategy};

fn default_runtime() -> String {
    "node".to_string()
}

fn merged_env(config: &ProcessConfig) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();

    if let Some(env_file) = &config.env_file {
        let contents = std::fs::read_to_string(env_file)
            .map_err(|e| NodeDaemonError::invalid_config(format!("cannot read env file {env_file}: {e}")))?;
        merged.extend(envfile::parse(&contents));
    }

    // Explicit `env` wins over `envFile`, per spec.md §3.
    merged.extend(config.env.clone());
    Ok(merged)
}

/// Builds the command for instance `instance_id` of `process_id`.
/// `cluster_index` is `Some(i)` for cluster-style instances, used only to
/// pick the `DAEMON_INSTANCE_ID` value distinctly per worker.
pub fn build_command(
    config: &ProcessConfig,
    process_id: Id,
    instance_id: Id,
) -> Result<tokio::process::Command> {
    if !Path::new(&config.script).exists() {
        return Err(NodeDaemonError::script_missing(&config.script));
    }

    let (program, mut args) = match config.spawn_strategy() {
        SpawnStrategy::Fork => (default_runtime(), vec![config.script.clone()]),
        SpawnStrategy::Spawn => match &config.interpreter {
            Some(interp) => (interp.clone(), vec![config.script.clone()]),
            None => (config.script.clone(), Vec::new()),
        },
        SpawnStrategy::Cluster => {
            let program = config.interpreter.clone().unwrap_or_else(default_runtime);
            (program, vec![config.script.clone()])
        }
    };
    args.extend(config.args.clone());

    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(&args);

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    // Allowlist-based environment: never forward the daemon's own
    // environment unfiltered (it may carry the Web UI password or other
    // secrets), only PATH plus what the process config explicitly grants.
    cmd.env_clear();
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    cmd.envs(merged_env(config)?);

    cmd.env("DAEMON", "1");
    cmd.env("DAEMON_PROCESS_ID", process_id.to_string());
    cmd.env("DAEMON_PROCESS_NAME", &config.name);
    cmd.env("DAEMON_INSTANCE_ID", instance_id.to_string());

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_script_is_rejected_before_spawn() {
        let config = ProcessConfig::new("/nonexistent/script.js", "api");
        let err = build_command(&config, Id::new(), Id::new()).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ScriptMissing);
    }

    #[test]
    fn explicit_env_wins_over_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("app.js");
        std::fs::write(&script, "").unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "FOO=from_file\n").unwrap();

        let mut config = ProcessConfig::new(script.to_str().unwrap(), "api");
        config.env_file = Some(env_file.to_str().unwrap().to_string());
        config.env.insert("FOO".to_string(), "from_explicit".to_string());

        let merged = merged_env(&config).unwrap();
        assert_eq!(merged.get("FOO").unwrap(), "from_explicit");
    }
}
