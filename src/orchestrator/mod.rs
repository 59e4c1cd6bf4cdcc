//! Process Orchestrator: owns the fleet, the only component allowed to
//! mutate `ManagedProcess`/`ProcessInstance`.
//!
//! Supports three spawn strategies and an async, event-driven lifecycle.
//! Per-ManagedProcess state lives behind its own `tokio::sync::Mutex` so
//! lifecycle operations on different ManagedProcesses proceed concurrently
//! while operations on the *same* id serialize through that process's lock
//! ("a Stop cannot overlap a Restart for the same id") without forcing the
//! whole fleet through one queue.

pub mod policy;
pub mod spawn;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::clock::Id;
use crate::errors::{NodeDaemonError, Result};
use crate::logs::LogManagerHandle;
use crate::model::{
    InstanceStatus, LogLevel, ManagedProcess, ManagedProcessSnapshot, ProcessConfig, ProcessInstance, ProcessStatus,
    SpawnStrategy,
};

const START_WINDOW: Duration = Duration::from_secs(30);
const RELOAD_STABILIZE_DELAY: Duration = Duration::from_secs(2);
const RELOAD_RETIRE_DELAY: Duration = Duration::from_secs(1);

/// Either a process id or a unique name; every public operation accepts
/// either, matching the CLI's `<name|id>` argument shape.
#[derive(Debug, Clone)]
pub enum Target {
    Id(Id),
    Name(String),
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    ProcessStarted(ManagedProcessSnapshot),
    ProcessStopped(Id),
    ProcessDeleted(Id),
    ProcessUpdated(ManagedProcessSnapshot),
    InstanceExited { process_id: Id, instance_id: Id, exit_code: Option<i32> },
    RestartScheduled { process_id: Id, instance_id: Id, delay: Duration },
    MaxRestartsReached { process_id: Id },
}

struct Live {
    process: ManagedProcess,
    /// Bumped on every externally triggered Stop/Restart/Delete so a
    /// scheduled-restart timer that wakes up after the bump knows to no-op
    /// instead of firing into a process that has moved on.
    generation: u64,
    /// One per instance id, used by `stop` to wait for the exit-watcher
    /// task instead of polling.
    exit_notify: HashMap<Id, Arc<Notify>>,
}

struct OrchestratorInner {
    fleet: RwLock<HashMap<Id, Arc<Mutex<Live>>>>,
    name_index: std::sync::RwLock<HashMap<String, Id>>,
    snapshots: std::sync::Mutex<HashMap<Id, ManagedProcessSnapshot>>,
    events: tokio::sync::mpsc::UnboundedSender<OrchestratorEvent>,
    log: LogManagerHandle,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    inner: Arc<OrchestratorInner>,
}

pub fn spawn(log: LogManagerHandle) -> (OrchestratorHandle, tokio::sync::mpsc::UnboundedReceiver<OrchestratorEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let inner = Arc::new(OrchestratorInner {
        fleet: RwLock::new(HashMap::new()),
        name_index: std::sync::RwLock::new(HashMap::new()),
        snapshots: std::sync::Mutex::new(HashMap::new()),
        events: tx,
        log,
        shutting_down: AtomicBool::new(false),
    });
    (OrchestratorHandle { inner }, rx)
}

impl OrchestratorHandle {
    pub fn list(&self) -> Vec<ManagedProcessSnapshot> {
        self.inner.snapshots.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, target: &Target) -> Result<ManagedProcessSnapshot> {
        let id = self.resolve(target)?;
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| NodeDaemonError::not_found(format!("process {id} not found")))
    }

    fn resolve(&self, target: &Target) -> Result<Id> {
        match target {
            Target::Id(id) => Ok(*id),
            Target::Name(name) => self
                .inner
                .name_index
                .read()
                .unwrap()
                .get(name)
                .copied()
                .ok_or_else(|| NodeDaemonError::not_found(format!("no process named {name:?}"))),
        }
    }

    /// Validates and normalizes `config`, registers a new ManagedProcess,
    /// and awaits every instance reaching `running` within the start
    /// window. On any failure the whole ManagedProcess is torn down.
    pub async fn start(&self, config: ProcessConfig) -> Result<Id> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(NodeDaemonError::shutdown());
        }
        validate_config(&config)?;

        {
            let index = self.inner.name_index.read().unwrap();
            if index.contains_key(&config.name) {
                return Err(NodeDaemonError::already_exists(format!("process named {:?} already exists", config.name)));
            }
        }

        let process = ManagedProcess::new(config.clone());
        let process_id = process.id;
        let count = config.instances.resolve();

        let live = Arc::new(Mutex::new(Live { process, generation: 0, exit_notify: HashMap::new() }));

        {
            let mut fleet = self.inner.fleet.write().await;
            let mut index = self.inner.name_index.write().unwrap();
            fleet.insert(process_id, live.clone());
            index.insert(config.name.clone(), process_id);
        }

        let result = tokio::time::timeout(START_WINDOW, self.spawn_initial_instances(live.clone(), count)).await;

        match result {
            Ok(Ok(())) => {
                let mut guard = live.lock().await;
                guard.process.status = ProcessStatus::Running;
                let snapshot = ManagedProcessSnapshot::from(&guard.process);
                self.inner.snapshots.lock().unwrap().insert(process_id, snapshot.clone());
                drop(guard);
                let _ = self.inner.events.send(OrchestratorEvent::ProcessStarted(snapshot));
                Ok(process_id)
            }
            Ok(Err(err)) => {
                self.teardown_failed_start(process_id, &config.name).await;
                Err(err)
            }
            Err(_) => {
                self.teardown_failed_start(process_id, &config.name).await;
                Err(NodeDaemonError::timeout(format!("process {:?} did not start within {START_WINDOW:?}", config.name)))
            }
        }
    }

    async fn teardown_failed_start(&self, process_id: Id, name: &str) {
        if let Some(live) = self.inner.fleet.write().await.remove(&process_id) {
            self.inner.name_index.write().unwrap().remove(name);
            let guard = live.lock().await;
            for instance in &guard.process.instances {
                if let Some(pid) = instance.pid {
                    let _ = signal::kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
                }
            }
        }
        self.inner.snapshots.lock().unwrap().remove(&process_id);
    }

    async fn spawn_initial_instances(&self, live: Arc<Mutex<Live>>, count: u32) -> Result<()> {
        for _ in 0..count {
            let mut instance = ProcessInstance::new();
            let (process_id, config) = {
                let guard = live.lock().await;
                (guard.process.id, guard.process.config.clone())
            };
            self.spawn_one(live.clone(), process_id, &config, &mut instance).await?;
            let mut guard = live.lock().await;
            guard.process.instances.push(instance);
        }
        Ok(())
    }

    /// Spawns exactly one child for `instance`, wires its stdio to the log
    /// manager, and spawns the background task that reports its eventual
    /// exit back into the orchestrator.
    fn spawn_one<'a>(
        &'a self,
        live: Arc<Mutex<Live>>,
        process_id: Id,
        config: &'a ProcessConfig,
        instance: &'a mut ProcessInstance,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let mut command = spawn::build_command(config, process_id, instance.id)?;
        let mut child = command.spawn().map_err(|e| NodeDaemonError::spawn_failed(e.to_string()))?;

        instance.pid = child.id();
        instance.status = InstanceStatus::Running;
        instance.started_at = Some(crate::clock::now_monotonic());
        instance.started_at_wall = Some(crate::clock::now_utc());
        instance.last_restart_at = Some(crate::clock::now_monotonic());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let process_name = config.name.clone();
        self.spawn_stdio_forwarder(stdout, process_id, process_name.clone(), LogLevel::Info);
        self.spawn_stdio_forwarder(stderr, process_id, process_name, LogLevel::Warn);

        let notify = Arc::new(Notify::new());
        {
            let mut guard = live.lock().await;
            guard.exit_notify.insert(instance.id, notify.clone());
        }

        let inner = self.inner.clone();
        let live_clone = live.clone();
        let instance_id = instance.id;
        tokio::spawn(async move {
            let status = child.wait().await;
            notify.notify_waiters();
            let exit_code = status.ok().and_then(|s| s.code());
            handle_instance_exit(inner, live_clone, process_id, instance_id, exit_code).await;
        });

        Ok(())
        })
    }

    fn spawn_stdio_forwarder<R>(&self, pipe: Option<R>, process_id: Id, process_name: String, level: LogLevel)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let Some(pipe) = pipe else { return };
        let log = self.inner.log.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let mut lines = tokio::io::BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log.log(level, Some(process_id), Some(process_name.clone()), line);
            }
        });
    }

    /// Graceful-then-forceful stop of every instance in `target`.
    pub async fn stop(&self, target: &Target, force: bool) -> Result<()> {
        let id = self.resolve(target)?;
        let live = self.get_live(id).await?;

        let kill_timeout = {
            let mut guard = live.lock().await;
            guard.process.status = ProcessStatus::Stopping;
            guard.generation += 1;
            Duration::from_millis(if force { 1000 } else { guard.process.config.kill_timeout_ms })
        };

        let instances: Vec<(Id, Option<u32>)> = {
            let guard = live.lock().await;
            guard.process.instances.iter().map(|i| (i.id, i.pid)).collect()
        };

        for (instance_id, pid) in instances {
            self.terminate_instance(&live, instance_id, pid, kill_timeout).await;
        }

        let mut guard = live.lock().await;
        guard.process.status = ProcessStatus::Stopped;
        self.publish_updated(&guard.process);
        let snapshot = ManagedProcessSnapshot::from(&guard.process);
        drop(guard);
        let _ = self.inner.events.send(OrchestratorEvent::ProcessStopped(id));
        let _ = self.inner.events.send(OrchestratorEvent::ProcessUpdated(snapshot));
        Ok(())
    }

    async fn terminate_instance(&self, live: &Arc<Mutex<Live>>, instance_id: Id, pid: Option<u32>, kill_timeout: Duration) {
        let Some(pid) = pid else { return };

        {
            let mut guard = live.lock().await;
            if let Some(inst) = guard.process.instances.iter_mut().find(|i| i.id == instance_id) {
                inst.status = InstanceStatus::Stopping;
            }
        }

        let _ = signal::kill(NixPid::from_raw(pid as i32), Signal::SIGTERM);

        let notify = {
            let guard = live.lock().await;
            guard.exit_notify.get(&instance_id).cloned()
        };

        if let Some(notify) = notify {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(kill_timeout) => {
                    let _ = signal::kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
                }
            }
        }
    }

    /// Plain restart (stop then start in place) or, for a cluster
    /// ManagedProcess with `graceful=true`, the zero-downtime reload
    /// protocol of spec.md §4.1.
    pub async fn restart(&self, target: &Target, graceful: bool) -> Result<()> {
        let id = self.resolve(target)?;
        let live = self.get_live(id).await?;

        let (strategy, instance_count) = {
            let guard = live.lock().await;
            (guard.process.config.spawn_strategy(), guard.process.config.instances.resolve())
        };

        if graceful && strategy == SpawnStrategy::Cluster && instance_count > 1 {
            self.reload(id, live).await
        } else {
            self.stop(&Target::Id(id), false).await?;
            self.restart_in_place(live).await
        }
    }

    async fn restart_in_place(&self, live: Arc<Mutex<Live>>) -> Result<()> {
        let config = {
            let mut guard = live.lock().await;
            guard.process.status = ProcessStatus::Starting;
            guard.process.instances.clear();
            guard.process.config.clone()
        };
        self.spawn_initial_instances(live.clone(), config.instances.resolve()).await?;
        let mut guard = live.lock().await;
        guard.process.status = ProcessStatus::Running;
        self.publish_updated(&guard.process);
        Ok(())
    }

    /// Spawns `N` fresh instances, waits for each to be running and settle,
    /// then retires the old instances one at a time. At no point does the
    /// running count drop below `N`.
    async fn reload(&self, process_id: Id, live: Arc<Mutex<Live>>) -> Result<()> {
        let (config, old_instance_ids, kill_timeout) = {
            let mut guard = live.lock().await;
            guard.process.status = ProcessStatus::Reloading;
            (
                guard.process.config.clone(),
                guard.process.instances.iter().map(|i| i.id).collect::<Vec<_>>(),
                Duration::from_millis(guard.process.config.kill_timeout_ms),
            )
        };

        let n = config.instances.resolve();

        for _ in 0..n {
            let mut instance = ProcessInstance::new();
            if let Err(err) = self.spawn_one(live.clone(), process_id, &config, &mut instance).await {
                log::error!("reload of {process_id} aborted, old instances kept: {err}");
                let mut guard = live.lock().await;
                guard.process.status = ProcessStatus::Running;
                return Err(err);
            }
            {
                let mut guard = live.lock().await;
                guard.process.instances.push(instance);
            }
            tokio::time::sleep(RELOAD_STABILIZE_DELAY).await;
        }

        for old_id in old_instance_ids {
            let pid = {
                let guard = live.lock().await;
                guard.process.instances.iter().find(|i| i.id == old_id).and_then(|i| i.pid)
            };
            self.terminate_instance(&live, old_id, pid, kill_timeout).await;
            {
                let mut guard = live.lock().await;
                guard.process.instances.retain(|i| i.id != old_id);
            }
            tokio::time::sleep(RELOAD_RETIRE_DELAY).await;
        }

        let mut guard = live.lock().await;
        guard.process.status = ProcessStatus::Running;
        self.publish_updated(&guard.process);
        Ok(())
    }

    pub async fn delete(&self, target: &Target) -> Result<()> {
        let id = self.resolve(target)?;
        let live = self.get_live(id).await?;

        let name = {
            let guard = live.lock().await;
            if !matches!(guard.process.status, ProcessStatus::Stopped | ProcessStatus::Errored) {
                return Err(NodeDaemonError::invalid_config("process must be stopped before it can be deleted"));
            }
            guard.process.name.clone()
        };

        self.inner.fleet.write().await.remove(&id);
        self.inner.name_index.write().unwrap().remove(&name);
        self.inner.snapshots.lock().unwrap().remove(&id);
        let _ = self.inner.events.send(OrchestratorEvent::ProcessDeleted(id));
        Ok(())
    }

    async fn get_live(&self, id: Id) -> Result<Arc<Mutex<Live>>> {
        self.inner
            .fleet
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| NodeDaemonError::not_found(format!("process {id} not found")))
    }

    fn publish_updated(&self, process: &ManagedProcess) {
        let snapshot = ManagedProcessSnapshot::from(process);
        self.inner.snapshots.lock().unwrap().insert(process.id, snapshot.clone());
        let _ = self.inner.events.send(OrchestratorEvent::ProcessUpdated(snapshot));
    }

    /// Replays a persisted snapshot through normal `start`, clearing
    /// transient fields first, per spec.md §4.5 recovery.
    pub async fn replay_start(&self, snapshot: ManagedProcessSnapshot) -> Result<Id> {
        self.start(snapshot.config).await
    }

    /// Stops every live ManagedProcess with its configured `killTimeout`,
    /// used by the Daemon Core's shutdown sequence.
    pub async fn shutdown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<Id> = self.inner.fleet.read().await.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.stop(&Target::Id(id), true).await {
                log::error!("error stopping {id} during shutdown: {err}");
            }
        }
    }

    /// Current `(instance id, pid)` pairs for every instance that has a
    /// live pid, so callers can route a sampled metric back to the instance
    /// it belongs to instead of a freshly minted, unrelated id.
    pub async fn live_instances(&self, id: Id) -> Vec<(Id, u32)> {
        match self.get_live(id).await {
            Ok(live) => live.lock().await.process.instances.iter().filter_map(|i| i.pid.map(|pid| (i.id, pid))).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Applies a sampled metric from the Health Monitor to the matching
    /// instance and refreshes its cached snapshot. Does not publish an
    /// `OrchestratorEvent`: a metrics tick is not a lifecycle change, and
    /// emitting one on every sample would mark the fleet state dirty far
    /// more often than spec.md §4.5's debounce is meant to absorb.
    pub async fn record_metrics(&self, process_id: Id, instance_id: Id, rss_bytes: u64, cpu_percent: f32) {
        let Ok(live) = self.get_live(process_id).await else { return };
        let mut guard = live.lock().await;
        if let Some(inst) = guard.process.instances.iter_mut().find(|i| i.id == instance_id) {
            inst.memory_bytes = rss_bytes;
            inst.cpu_percent = cpu_percent;
        }
        let snapshot = ManagedProcessSnapshot::from(&guard.process);
        drop(guard);
        self.inner.snapshots.lock().unwrap().insert(process_id, snapshot);
    }
}

async fn handle_instance_exit(inner: Arc<OrchestratorInner>, live: Arc<Mutex<Live>>, process_id: Id, instance_id: Id, exit_code: Option<i32>) {
    let shutting_down = inner.shutting_down.load(Ordering::SeqCst);

    let (should_schedule, delay_ms, generation, config) = {
        let mut guard = live.lock().await;
        let status_is_stopping = guard.process.status == ProcessStatus::Stopping;

        let Some(inst) = guard.process.instances.iter_mut().find(|i| i.id == instance_id) else {
            return;
        };

        inst.status = if exit_code == Some(0) { InstanceStatus::Stopped } else { InstanceStatus::Crashed };
        let uptime_ms = inst.uptime().as_millis() as u64;
        inst.pid = None;
        let inst_restarts = inst.restarts;

        let _ = inner.events.send(OrchestratorEvent::InstanceExited { process_id, instance_id, exit_code });

        let autorestart = guard.process.config.autorestart;
        if shutting_down || status_is_stopping || !autorestart {
            guard.process.recompute_status();
            (false, 0, guard.generation, guard.process.config.clone())
        } else {
            let min_uptime_ms = guard.process.config.min_uptime_ms;
            let max_restarts = guard.process.config.max_restarts;
            let restart_delay_ms = guard.process.config.restart_delay_ms;
            let max_restart_delay_ms = guard.process.config.max_restart_delay_ms;
            let decision = policy::decide_after_exit(
                uptime_ms,
                min_uptime_ms,
                inst_restarts,
                max_restarts,
                restart_delay_ms,
                max_restart_delay_ms,
            );
            let inst = guard.process.instances.iter_mut().find(|i| i.id == instance_id).unwrap();
            inst.restarts = decision.restarts_after_reset;

            match decision.scheduled_delay_ms {
                Some(delay) => (true, delay, guard.generation, guard.process.config.clone()),
                None => {
                    inst.status = InstanceStatus::Errored;
                    guard.process.aggregate_restarts = guard.process.instances.iter().map(|i| i.restarts).sum();
                    guard.process.recompute_status();
                    let _ = inner.events.send(OrchestratorEvent::MaxRestartsReached { process_id });
                    (false, 0, guard.generation, guard.process.config.clone())
                }
            }
        }
    };

    if should_schedule {
        let _ = inner.events.send(OrchestratorEvent::RestartScheduled { process_id, instance_id, delay: Duration::from_millis(delay_ms) });
        let inner2 = inner.clone();
        let live2 = live.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let still_current = { live2.lock().await.generation == generation };
            if !still_current || inner2.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            fire_scheduled_restart(inner2, live2, process_id, instance_id, config).await;
        });
    }
}

async fn fire_scheduled_restart(inner: Arc<OrchestratorInner>, live: Arc<Mutex<Live>>, process_id: Id, instance_id: Id, config: ProcessConfig) {
    {
        let mut guard = live.lock().await;
        let Some(inst) = guard.process.instances.iter_mut().find(|i| i.id == instance_id) else {
            return;
        };
        inst.restarts += 1;
        inst.status = InstanceStatus::Starting;
        inst.last_restart_at = Some(crate::clock::now_monotonic());
        guard.process.aggregate_restarts += 1;
        guard.process.status = ProcessStatus::Starting;
    }

    let mut instance = ProcessInstance::new();
    instance.id = instance_id;
    {
        let guard = live.lock().await;
        instance.restarts = guard.process.instances.iter().find(|i| i.id == instance_id).map(|i| i.restarts).unwrap_or(0);
    }

    let handle = OrchestratorHandle { inner: inner.clone() };
    match handle.spawn_one(live.clone(), process_id, &config, &mut instance).await {
        Ok(()) => {
            let mut guard = live.lock().await;
            if let Some(slot) = guard.process.instances.iter_mut().find(|i| i.id == instance_id) {
                *slot = instance;
            }
            guard.process.recompute_status();
            let snapshot = ManagedProcessSnapshot::from(&guard.process);
            drop(guard);
            let _ = inner.events.send(OrchestratorEvent::ProcessUpdated(snapshot));
        }
        Err(err) => {
            log::error!("scheduled restart of {process_id}/{instance_id} failed: {err}");
        }
    }
}

fn validate_config(config: &ProcessConfig) -> Result<()> {
    if config.script.trim().is_empty() {
        return Err(NodeDaemonError::invalid_config("script must not be empty"));
    }
    if config.name.trim().is_empty() {
        return Err(NodeDaemonError::invalid_config("name must not be empty"));
    }
    if !std::path::Path::new(&config.script).exists() {
        return Err(NodeDaemonError::script_missing(&config.script));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_missing_script() {
        let (log_tx, _rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let _ = log_tx;
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(crate::config::paths::HOME_ENV, dir.path());
        let log = crate::logs::LogManager::spawn(1024 * 1024, 5, 100);
        let (orch, _events) = spawn(log);

        let config = ProcessConfig::new("/nonexistent/app.js", "api");
        let err = orch.start(config).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::ScriptMissing);
        std::env::remove_var(crate::config::paths::HOME_ENV);
    }

    #[tokio::test]
    async fn get_on_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(crate::config::paths::HOME_ENV, dir.path());
        let log = crate::logs::LogManager::spawn(1024 * 1024, 5, 100);
        let (orch, _events) = spawn(log);

        let err = orch.get(&Target::Id(Id::new())).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::NotFound);
        std::env::remove_var(crate::config::paths::HOME_ENV);
    }
}
