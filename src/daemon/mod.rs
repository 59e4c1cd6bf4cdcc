//! Daemon Core: wires the Orchestrator, Health Monitor, File Watcher, Log
//! Manager, State Manager, IPC Server, and (optionally) the Web UI into one
//! running process, and owns the startup/shutdown sequences.
//!
//! Fully async and event-driven: a single bridge task selects over the
//! orchestrator/health/watcher event channels and reacts, rather than
//! polling any of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::clock::Id;
use crate::config::{self, structs::DaemonConfig};
use crate::errors::{NodeDaemonError, Result};
use crate::health::{HealthMonitorHandle, TrackedInstance, TrackedProcess};
use crate::ipc::protocol::{StartData, WebuiData};
use crate::logs::LogManagerHandle;
use crate::model::{InstanceCount, ManagedProcessSnapshot, ProcessConfig, WatchConfig};
use crate::orchestrator::{OrchestratorEvent, OrchestratorHandle, Target};
use crate::state::StateManagerHandle;
use crate::watcher::FileWatcherHandle;
use crate::webui::WebUiHandle;

/// Shared handles every component dispatch needs; built once in [`run`] and
/// handed to the IPC server and the background bridge tasks as an `Arc`.
pub struct DaemonCtx {
    pub orchestrator: OrchestratorHandle,
    pub log: LogManagerHandle,
    pub state: StateManagerHandle,
    health: HealthMonitorHandle,
    watcher: FileWatcherHandle,
    config: DaemonConfig,
    webui: Mutex<Option<WebUiHandle>>,
    watches: Mutex<HashMap<PathBuf, Id>>,
    shutdown_notify: Notify,
    shutting_down: AtomicBool,
}

impl DaemonCtx {
    pub fn config_from_start_request(&self, data: StartData) -> Result<ProcessConfig> {
        let mut config = ProcessConfig::new(data.script, data.name.unwrap_or_default());
        if config.name.is_empty() {
            return Err(NodeDaemonError::invalid_config("name is required"));
        }
        if let Some(instances) = data.instances {
            config.instances = parse_instances(&instances)?;
        }
        config.args = data.args;
        config.cwd = data.cwd;
        config.interpreter = data.interpreter;
        config.env = data.env;
        config.env_file = data.env_file;
        if let Some(true) = data.watch {
            config.watch = match data.watch_paths {
                Some(paths) if !paths.is_empty() => WatchConfig::Paths(paths),
                _ => WatchConfig::ScriptDirectory,
            };
        }
        if let Some(max_memory) = data.max_memory {
            config.max_memory = Some(crate::config::size::parse_size(&max_memory)?);
        }
        if let Some(v) = data.max_restarts {
            config.max_restarts = v;
        }
        if let Some(v) = data.restart_delay_ms {
            config.restart_delay_ms = v;
        }
        if let Some(v) = data.min_uptime_ms {
            config.min_uptime_ms = v;
        }
        if let Some(v) = data.auto_restart_memory {
            config.auto_restart_on_high_memory = v;
        }
        if let Some(v) = data.auto_restart_cpu {
            config.auto_restart_on_high_cpu = v;
        }
        if let Some(threshold) = data.memory_threshold {
            config.memory_threshold = crate::config::size::parse_size(&threshold)?;
        }
        if let Some(v) = data.cpu_threshold {
            config.cpu_threshold = v;
        }
        Ok(config)
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub async fn handle_webui_request(&self, action: WebuiData) -> Result<Option<serde_json::Value>> {
        match action {
            WebuiData::Start { port, host, username: _ } => {
                {
                    let slot = self.webui.lock().unwrap();
                    if slot.is_some() {
                        return Err(NodeDaemonError::already_exists("web UI is already running"));
                    }
                }
                let address = host.unwrap_or_else(|| self.config.web.address.clone());
                let port = port.unwrap_or(self.config.web.port);
                let handle = crate::webui::start(self.orchestrator.clone(), &address, port).await?;
                *self.webui.lock().unwrap() = Some(handle);
                Ok(Some(serde_json::json!({ "address": address, "port": port })))
            }
            WebuiData::Stop => {
                match self.webui.lock().unwrap().take() {
                    Some(handle) => {
                        handle.stop();
                        Ok(None)
                    }
                    None => Err(NodeDaemonError::not_found("web UI is not running")),
                }
            }
            WebuiData::Status => {
                let running = self.webui.lock().unwrap().is_some();
                Ok(Some(serde_json::json!({ "running": running })))
            }
        }
    }
}

fn parse_instances(raw: &str) -> Result<InstanceCount> {
    if raw.eq_ignore_ascii_case("max") {
        return Ok(InstanceCount::Max);
    }
    raw.parse::<u32>()
        .map(InstanceCount::Fixed)
        .map_err(|_| NodeDaemonError::invalid_config(format!("invalid instances value: {raw:?}")))
}

/// Runs the daemon to completion: startup, serve, shutdown. Returns the
/// process exit code per spec.md §6.
pub async fn run() -> i32 {
    match try_run().await {
        Ok(()) => 0,
        Err(err) => {
            log::error!("daemon exited with error: {err}");
            err.kind.exit_code()
        }
    }
}

async fn try_run() -> Result<()> {
    crate::config::paths::ensure_home()?;
    let daemon_config = config::read()?;

    let log = crate::logs::LogManager::spawn(daemon_config.log.max_size_bytes, daemon_config.log.max_files, daemon_config.log.ring_capacity);
    log.log(crate::model::LogLevel::Info, None, None, "daemon starting up");

    let (orchestrator, mut orch_events) = crate::orchestrator::spawn(log.clone());
    let (health, mut health_events) = crate::health::spawn(std::time::Duration::from_millis(daemon_config.health_check_interval_ms));
    let (watcher, mut watch_events) = crate::watcher::spawn(crate::watcher::DEFAULT_DEBOUNCE, Vec::new());

    let orchestrator_for_state = orchestrator.clone();
    let state = crate::state::spawn(move || build_daemon_state(&orchestrator_for_state, std::process::id()));

    let ctx = std::sync::Arc::new(DaemonCtx {
        orchestrator: orchestrator.clone(),
        log: log.clone(),
        state: state.clone(),
        health: health.clone(),
        watcher: watcher.clone(),
        config: daemon_config.clone(),
        webui: Mutex::new(None),
        watches: Mutex::new(HashMap::new()),
        shutdown_notify: Notify::new(),
        shutting_down: AtomicBool::new(false),
    });

    replay_persisted_state(&ctx).await;

    if daemon_config.web.enabled {
        match crate::webui::start(orchestrator.clone(), &daemon_config.web.address, daemon_config.web.port).await {
            Ok(handle) => *ctx.webui.lock().unwrap() = Some(handle),
            Err(err) => log::error!("web UI failed to start at boot: {err}"),
        }
    }

    let listener = crate::ipc::bind().await?;
    let ipc_ctx = ctx.clone();
    let ipc_task = tokio::spawn(crate::ipc::serve(listener, ipc_ctx));

    let bridge_ctx = ctx.clone();
    let bridge_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = orch_events.recv() => handle_orchestrator_event(&bridge_ctx, event).await,
                Some(event) = health_events.recv() => handle_health_event(&bridge_ctx, event).await,
                Some(event) = watch_events.recv() => handle_watch_event(&bridge_ctx, event).await,
                else => break,
            }
        }
    });

    wait_for_signal_or_shutdown(&ctx).await;

    ctx.orchestrator.shutdown_all().await;
    health.shutdown();
    watcher.shutdown();
    if let Some(handle) = ctx.webui.lock().unwrap().take() {
        handle.stop();
    }
    let _ = state.save_now().await;
    state.shutdown();
    log.flush().await;

    ipc_task.abort();
    bridge_task.abort();
    let _ = std::fs::remove_file(crate::config::paths::socket_path()?);

    Ok(())
}

fn build_daemon_state(orchestrator: &OrchestratorHandle, pid: u32) -> crate::model::DaemonState {
    let mut state = crate::model::DaemonState::new(pid);
    for snapshot in orchestrator.list() {
        state.processes.insert(snapshot.id, snapshot);
    }
    state
}

async fn replay_persisted_state(ctx: &DaemonCtx) {
    let daemon_pid = std::process::id();
    let state = match crate::state::load_or_init(daemon_pid) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to load persisted state: {err}");
            return;
        }
    };

    for (_, snapshot) in state.processes {
        let name = snapshot.name.clone();
        match ctx.orchestrator.replay_start(snapshot).await {
            Ok(id) => register_watch(ctx, id).await,
            Err(err) => log::error!("failed to replay process {name:?}: {err}"),
        }
    }
}

async fn register_watch(ctx: &DaemonCtx, id: Id) {
    let Ok(snapshot) = ctx.orchestrator.get(&Target::Id(id)) else { return };
    let paths = watch_paths_for(&snapshot);
    if !paths.is_empty() {
        let mut watches = ctx.watches.lock().unwrap();
        for path in paths {
            ctx.watcher.watch(path.clone());
            watches.insert(path, id);
        }
    }

    sync_health_tracking(ctx, &snapshot).await;
}

fn watch_paths_for(snapshot: &ManagedProcessSnapshot) -> Vec<PathBuf> {
    match &snapshot.config.watch {
        WatchConfig::Disabled => Vec::new(),
        WatchConfig::ScriptDirectory => Path::new(&snapshot.config.script)
            .parent()
            .map(|p| vec![p.to_path_buf()])
            .unwrap_or_default(),
        WatchConfig::Paths(paths) => paths.iter().map(PathBuf::from).collect(),
    }
}

async fn sync_health_tracking(ctx: &DaemonCtx, snapshot: &ManagedProcessSnapshot) {
    let instances = ctx.orchestrator.live_instances(snapshot.id).await;
    let tracked = TrackedProcess {
        process_id: snapshot.id,
        name: snapshot.name.clone(),
        instances: instances.into_iter().map(|(instance_id, pid)| TrackedInstance { instance_id, pid }).collect(),
        auto_restart_on_high_memory: snapshot.config.auto_restart_on_high_memory,
        memory_threshold: snapshot.config.memory_threshold,
        auto_restart_on_high_cpu: snapshot.config.auto_restart_on_high_cpu,
        cpu_threshold: snapshot.config.cpu_threshold,
    };
    ctx.health.update(tracked);
}

async fn handle_orchestrator_event(ctx: &DaemonCtx, event: OrchestratorEvent) {
    match event {
        OrchestratorEvent::ProcessStarted(snapshot) => {
            ctx.state.mark_dirty();
            register_watch(ctx, snapshot.id).await;
        }
        OrchestratorEvent::ProcessUpdated(snapshot) => {
            ctx.state.mark_dirty();
            sync_health_tracking(ctx, &snapshot).await;
        }
        OrchestratorEvent::ProcessStopped(_) => {
            ctx.state.mark_dirty();
        }
        OrchestratorEvent::ProcessDeleted(id) => {
            ctx.state.mark_dirty();
            ctx.health.remove(id);
            ctx.watches.lock().unwrap().retain(|_, v| *v != id);
        }
        OrchestratorEvent::MaxRestartsReached { process_id } => {
            log::warn!("process {process_id} reached its restart ceiling and is no longer restarting");
        }
        OrchestratorEvent::InstanceExited { .. } | OrchestratorEvent::RestartScheduled { .. } => {}
    }
}

async fn handle_health_event(ctx: &DaemonCtx, event: crate::health::HealthEvent) {
    match event {
        crate::health::HealthEvent::RecycleRequested { process_id, reason } => {
            log::warn!("recycling process {process_id}: {reason}");
            if let Err(err) = ctx.orchestrator.restart(&Target::Id(process_id), false).await {
                log::error!("failed to recycle process {process_id}: {err}");
            }
        }
        crate::health::HealthEvent::Issues { process_id, issues, .. } => {
            log::warn!("process {process_id} health issues: {}", issues.join(", "));
        }
        crate::health::HealthEvent::Metrics { process_id, instance_id, rss_bytes, cpu_percent } => {
            ctx.orchestrator.record_metrics(process_id, instance_id, rss_bytes, cpu_percent).await;
        }
    }
}

async fn handle_watch_event(ctx: &DaemonCtx, event: crate::model::FileChangeEvent) {
    let changed = PathBuf::from(&event.absolute_path);
    let target = {
        let watches = ctx.watches.lock().unwrap();
        watches.iter().find(|(watched, _)| changed.starts_with(watched.as_path())).map(|(_, id)| *id)
    };
    let Some(id) = target else { return };
    log::info!("file change under watch triggered restart of {id}: {}", event.absolute_path);
    if let Err(err) = ctx.orchestrator.restart(&Target::Id(id), false).await {
        log::error!("watch-triggered restart of {id} failed: {err}");
    }
}

async fn wait_for_signal_or_shutdown(ctx: &DaemonCtx) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to install SIGTERM handler: {err}");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to install SIGINT handler: {err}");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to install SIGHUP handler: {err}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => { log::info!("received SIGTERM, shutting down"); break; }
            _ = sigint.recv() => { log::info!("received SIGINT, shutting down"); break; }
            _ = sighup.recv() => {
                log::info!("received SIGHUP, reloading all running processes");
                reload_all(ctx).await;
            }
            _ = ctx.shutdown_notify.notified() => { log::info!("shutdown requested over IPC"); break; }
        }
    }
}

async fn reload_all(ctx: &DaemonCtx) {
    for snapshot in ctx.orchestrator.list() {
        if snapshot.status == crate::model::ProcessStatus::Running {
            if let Err(err) = ctx.orchestrator.restart(&Target::Id(snapshot.id), true).await {
                log::error!("SIGHUP reload of {} failed: {err}", snapshot.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_instances_accepts_max_case_insensitively() {
        assert_eq!(parse_instances("MAX").unwrap(), InstanceCount::Max);
        assert_eq!(parse_instances("4").unwrap(), InstanceCount::Fixed(4));
        assert!(parse_instances("bogus").is_err());
    }
}
