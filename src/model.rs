//! The shared data model: `ManagedProcess`, `ProcessInstance`,
//! `ProcessConfig`, `DaemonState`, `LogEntry`, `FileChangeEvent`.
//!
//! These types are owned live by [`crate::orchestrator::OrchestratorHandle`];
//! everything else only ever sees value copies (`ManagedProcessSnapshot`)
//! obtained through its query API.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Id;

pub const DEFAULT_MAX_RESTARTS: u32 = 16;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_RESTART_DELAY_MS: u64 = 15_000;
pub const DEFAULT_MIN_UPTIME_MS: u64 = 1000;
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 1600;
pub const DEFAULT_FORCE_KILL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MEMORY_THRESHOLD_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_CPU_THRESHOLD_PERCENT: f32 = 80.0;

/// How many instances a ManagedProcess should run. `Max` resolves to the
/// host's logical CPU count at start time via `num_cpus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceCount {
    Fixed(u32),
    Max,
}

impl InstanceCount {
    pub fn resolve(self) -> u32 {
        match self {
            InstanceCount::Fixed(n) => n.max(1),
            InstanceCount::Max => num_cpus::get() as u32,
        }
    }
}

impl Default for InstanceCount {
    fn default() -> Self {
        InstanceCount::Fixed(1)
    }
}

/// What the orchestrator should watch for this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WatchConfig {
    #[default]
    Disabled,
    ScriptDirectory,
    Paths(Vec<String>),
}

/// Immutable snapshot of the options a `start` request carried, taken at
/// first start. Per spec.md §3, it is never re-read from disk once the
/// ManagedProcess exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub script: String,
    pub name: String,
    #[serde(default)]
    pub instances: InstanceCount,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub interpreter: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub env_file: Option<String>,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default = "default_true")]
    pub autorestart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay_ms: u64,
    #[serde(default = "default_min_uptime")]
    pub min_uptime_ms: u64,
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,

    pub max_memory: Option<u64>,
    #[serde(default)]
    pub auto_restart_on_high_memory: bool,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: u64,
    #[serde(default)]
    pub auto_restart_on_high_cpu: bool,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,
}

fn default_true() -> bool {
    true
}
fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}
fn default_restart_delay() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}
fn default_max_restart_delay() -> u64 {
    DEFAULT_MAX_RESTART_DELAY_MS
}
fn default_min_uptime() -> u64 {
    DEFAULT_MIN_UPTIME_MS
}
fn default_kill_timeout() -> u64 {
    DEFAULT_KILL_TIMEOUT_MS
}
fn default_memory_threshold() -> u64 {
    DEFAULT_MEMORY_THRESHOLD_BYTES
}
fn default_cpu_threshold() -> f32 {
    DEFAULT_CPU_THRESHOLD_PERCENT
}

impl ProcessConfig {
    pub fn new(script: impl Into<String>, name: impl Into<String>) -> Self {
        ProcessConfig {
            script: script.into(),
            name: name.into(),
            instances: InstanceCount::default(),
            args: Vec::new(),
            cwd: None,
            interpreter: None,
            env: BTreeMap::new(),
            env_file: None,
            watch: WatchConfig::default(),
            autorestart: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            max_restart_delay_ms: DEFAULT_MAX_RESTART_DELAY_MS,
            min_uptime_ms: DEFAULT_MIN_UPTIME_MS,
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            max_memory: None,
            auto_restart_on_high_memory: false,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD_BYTES,
            auto_restart_on_high_cpu: false,
            cpu_threshold: DEFAULT_CPU_THRESHOLD_PERCENT,
        }
    }

    /// The strategy the orchestrator picks at first start, per spec.md §4.1.
    pub fn spawn_strategy(&self) -> SpawnStrategy {
        if self.instances.resolve() > 1 {
            SpawnStrategy::Cluster
        } else if self.interpreter.is_some() {
            SpawnStrategy::Spawn
        } else {
            SpawnStrategy::Fork
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStrategy {
    Fork,
    Spawn,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
    Reloading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Errored,
}

impl InstanceStatus {
    pub fn has_pid(self) -> bool {
        matches!(self, InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping)
    }
}

/// One live worker of a ManagedProcess.
#[derive(Debug, Clone)]
pub struct ProcessInstance {
    pub id: Id,
    pub pid: Option<u32>,
    pub status: InstanceStatus,
    pub restarts: u32,
    pub started_at: Option<Instant>,
    pub started_at_wall: Option<DateTime<Utc>>,
    pub last_restart_at: Option<Instant>,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

impl ProcessInstance {
    pub fn new() -> Self {
        ProcessInstance {
            id: Id::new(),
            pid: None,
            status: InstanceStatus::Starting,
            restarts: 0,
            started_at: None,
            started_at_wall: None,
            last_restart_at: None,
            memory_bytes: 0,
            cpu_percent: 0.0,
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        match self.started_at {
            Some(t) => crate::clock::elapsed_since(t),
            None => std::time::Duration::ZERO,
        }
    }
}

impl Default for ProcessInstance {
    fn default() -> Self {
        Self::new()
    }
}

/// A user-declared application under supervision.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub id: Id,
    pub name: String,
    pub script: String,
    pub config: ProcessConfig,
    pub status: ProcessStatus,
    pub instances: Vec<ProcessInstance>,
    pub aggregate_restarts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedProcess {
    pub fn new(config: ProcessConfig) -> Self {
        let now = crate::clock::now_utc();
        ManagedProcess {
            id: Id::new(),
            name: config.name.clone(),
            script: config.script.clone(),
            status: ProcessStatus::Starting,
            instances: Vec::new(),
            aggregate_restarts: 0,
            created_at: now,
            updated_at: now,
            config,
        }
    }

    pub fn running_instance_count(&self) -> usize {
        self.instances.iter().filter(|i| i.status == InstanceStatus::Running).count()
    }

    pub fn recompute_status(&mut self) {
        if self.instances.iter().any(|i| i.status == InstanceStatus::Running) {
            self.status = ProcessStatus::Running;
            return;
        }
        let all_given_up = !self.instances.is_empty()
            && self
                .instances
                .iter()
                .all(|i| matches!(i.status, InstanceStatus::Errored | InstanceStatus::Crashed));
        if all_given_up && self.instances.iter().any(|i| i.status == InstanceStatus::Errored) {
            self.status = ProcessStatus::Errored;
        }
    }
}

/// Persisted snapshot of a `ManagedProcess`. pids and live per-instance
/// status are elided/marked stale on load, per spec.md §3 and §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedProcessSnapshot {
    pub id: Id,
    pub name: String,
    pub script: String,
    pub config: ProcessConfig,
    pub status: ProcessStatus,
    pub instance_count: usize,
    pub aggregate_restarts: u32,
    /// Sum of every instance's last-sampled RSS.
    pub memory_bytes: u64,
    /// Uptime of the longest-running instance, in milliseconds; zero when
    /// no instance is currently running.
    pub uptime_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ManagedProcess> for ManagedProcessSnapshot {
    fn from(p: &ManagedProcess) -> Self {
        ManagedProcessSnapshot {
            id: p.id,
            name: p.name.clone(),
            script: p.script.clone(),
            config: p.config.clone(),
            status: p.status,
            instance_count: p.instances.len(),
            aggregate_restarts: p.aggregate_restarts,
            memory_bytes: p.instances.iter().map(|i| i.memory_bytes).sum(),
            uptime_ms: p.instances.iter().map(|i| i.uptime().as_millis() as u64).max().unwrap_or(0),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

pub const STATE_VERSION: u32 = 1;

/// Top-level persisted state file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub processes: BTreeMap<Id, ManagedProcessSnapshot>,
    pub webui: Option<WebUiConfig>,
}

impl DaemonState {
    pub fn new(pid: u32) -> Self {
        DaemonState {
            version: STATE_VERSION,
            started_at: crate::clock::now_utc(),
            pid,
            processes: BTreeMap::new(),
            webui: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebUiConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub process_id: Option<Id>,
    pub process_name: Option<String>,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub kind: FileChangeKind,
    pub absolute_path: String,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_count_max_resolves_to_cpu_count() {
        assert_eq!(InstanceCount::Max.resolve(), num_cpus::get() as u32);
    }

    #[test]
    fn instance_count_fixed_floors_at_one() {
        assert_eq!(InstanceCount::Fixed(0).resolve(), 1);
    }

    #[test]
    fn spawn_strategy_picks_cluster_for_multi_instance() {
        let mut cfg = ProcessConfig::new("/t/app.js", "api");
        cfg.instances = InstanceCount::Fixed(4);
        assert_eq!(cfg.spawn_strategy(), SpawnStrategy::Cluster);
    }

    #[test]
    fn spawn_strategy_picks_spawn_when_interpreter_given() {
        let mut cfg = ProcessConfig::new("/t/app.py", "api");
        cfg.interpreter = Some("python3".into());
        assert_eq!(cfg.spawn_strategy(), SpawnStrategy::Spawn);
    }

    #[test]
    fn spawn_strategy_defaults_to_fork() {
        let cfg = ProcessConfig::new("/t/app.js", "api");
        assert_eq!(cfg.spawn_strategy(), SpawnStrategy::Fork);
    }

    #[test]
    fn managed_process_running_iff_one_instance_running() {
        let mut p = ManagedProcess::new(ProcessConfig::new("/t/app.js", "api"));
        let mut inst = ProcessInstance::new();
        inst.status = InstanceStatus::Running;
        p.instances.push(inst);
        p.recompute_status();
        assert_eq!(p.status, ProcessStatus::Running);
    }
}
