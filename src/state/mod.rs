//! State Manager: crash-safe persistence of the fleet snapshot to a single
//! JSON file, plus the recovery path that replays it through the
//! orchestrator at daemon start.
//!
//! Unparseable or version-mismatched state is quarantined rather than
//! crashing the daemon on a fresh start; writes are debounced and coalesced
//! behind a single-writer guard so a burst of fleet mutations produces one
//! save, not one per mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::config::paths;
use crate::errors::Result;
use crate::model::DaemonState;

const AUTO_SAVE_INTERVAL: Duration = Duration::from_secs(30);
const DEBOUNCE_DELAY: Duration = Duration::from_secs(1);

/// Loads `state.json` if present. Unparseable state is moved aside to
/// `state.json.corrupt.<ts>` and a fresh, empty-process state is returned —
/// the daemon must always be able to start.
pub fn load_or_init(daemon_pid: u32) -> Result<DaemonState> {
    let path = paths::state_path()?;

    if !path.exists() {
        return Ok(DaemonState::new(daemon_pid));
    }

    let contents = std::fs::read_to_string(&path)?;
    match serde_json::from_str::<DaemonState>(&contents) {
        Ok(mut state) if state.version == crate::model::STATE_VERSION => {
            state.pid = daemon_pid;
            Ok(state)
        }
        Ok(state) => {
            log::error!("state file is version {}, this daemon writes version {}; quarantining", state.version, crate::model::STATE_VERSION);
            quarantine(&path);
            Ok(DaemonState::new(daemon_pid))
        }
        Err(err) => {
            log::error!("state file corrupt, quarantining: {err}");
            quarantine(&path);
            Ok(DaemonState::new(daemon_pid))
        }
    }
}

fn quarantine(path: &std::path::Path) {
    let dest = path.with_extension(format!("json.corrupt.{}", crate::clock::now_utc().timestamp()));
    let _ = std::fs::rename(path, dest);
}

/// Writes `state` to `state.json.tmp.<pid>` then atomically renames over
/// `state.json`. Non-reentrant: callers serialize through
/// [`StateManager::save_now`] rather than calling this directly from more
/// than one place at a time.
fn write_atomic(state: &DaemonState) -> Result<()> {
    let path = paths::state_path()?;
    paths::ensure_home()?;
    let tmp_path = path.with_extension(format!("json.tmp.{}", state.pid));

    let contents = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

enum Command {
    MarkDirty,
    SaveNow(tokio::sync::oneshot::Sender<Result<()>>),
    Shutdown,
}

#[derive(Clone)]
pub struct StateManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl StateManagerHandle {
    /// Call after any fleet mutation; arms the 1s debounced save.
    pub fn mark_dirty(&self) {
        let _ = self.tx.send(Command::MarkDirty);
    }

    pub async fn save_now(&self) -> Result<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.tx.send(Command::SaveNow(reply)).map_err(|_| crate::errors::NodeDaemonError::shutdown())?;
        rx.await.map_err(|_| crate::errors::NodeDaemonError::shutdown())?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Runs the save loop. `snapshot` is called each time a save fires to pull
/// the latest fleet state from the orchestrator.
pub fn spawn<F>(snapshot: F) -> StateManagerHandle
where
    F: Fn() -> DaemonState + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let writing = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        let mut debounce_deadline: Option<Instant> = None;
        let mut auto_save_deadline = Instant::now() + AUTO_SAVE_INTERVAL;

        loop {
            let sleep_until = match debounce_deadline {
                Some(d) => d.min(auto_save_deadline),
                None => auto_save_deadline,
            };

            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::MarkDirty) => {
                            debounce_deadline = Some(Instant::now() + DEBOUNCE_DELAY);
                        }
                        Some(Command::SaveNow(reply)) => {
                            let result = do_save(&writing, &snapshot);
                            debounce_deadline = None;
                            let _ = reply.send(result);
                        }
                        Some(Command::Shutdown) | None => {
                            let _ = do_save(&writing, &snapshot);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(sleep_until) => {
                    let now = Instant::now();
                    if debounce_deadline.map(|d| now >= d).unwrap_or(false) {
                        let _ = do_save(&writing, &snapshot);
                        debounce_deadline = None;
                    }
                    if now >= auto_save_deadline {
                        let _ = do_save(&writing, &snapshot);
                        auto_save_deadline = now + AUTO_SAVE_INTERVAL;
                    }
                }
            }
        }
    });

    StateManagerHandle { tx }
}

fn do_save<F>(writing: &Arc<AtomicBool>, snapshot: &F) -> Result<()>
where
    F: Fn() -> DaemonState,
{
    if writing.swap(true, Ordering::SeqCst) {
        // a save is already in flight; the caller that set the flag wins,
        // this invocation is coalesced away (latest-wins, no queue).
        return Ok(());
    }
    let state = snapshot();
    let result = write_atomic(&state);
    writing.store(false, Ordering::SeqCst);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn load_or_init_returns_fresh_state_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let state = load_or_init(1234).unwrap();
        assert!(state.processes.is_empty());
        assert_eq!(state.pid, 1234);

        std::env::remove_var(paths::HOME_ENV);
    }

    #[test]
    #[serial]
    fn write_atomic_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let state = DaemonState::new(999);
        write_atomic(&state).unwrap();
        let loaded = load_or_init(999).unwrap();
        assert_eq!(loaded.version, state.version);

        std::env::remove_var(paths::HOME_ENV);
    }

    #[test]
    #[serial]
    fn corrupt_state_is_quarantined_and_fresh_state_returned() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        std::fs::write(dir.path().join("state.json"), "{ not json").unwrap();
        let state = load_or_init(1).unwrap();
        assert!(state.processes.is_empty());

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(quarantined.len(), 1);

        std::env::remove_var(paths::HOME_ENV);
    }

    #[test]
    #[serial]
    fn mismatched_version_is_quarantined_and_fresh_state_returned() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let mut state = DaemonState::new(1);
        state.version = crate::model::STATE_VERSION + 1;
        write_atomic(&state).unwrap();

        let loaded = load_or_init(1).unwrap();
        assert!(loaded.processes.is_empty());
        assert_eq!(loaded.version, crate::model::STATE_VERSION);

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(quarantined.len(), 1);

        std::env::remove_var(paths::HOME_ENV);
    }

    #[tokio::test]
    #[serial]
    async fn save_now_persists_the_current_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let handle = spawn(|| DaemonState::new(42));
        handle.save_now().await.unwrap();

        let loaded = load_or_init(42).unwrap();
        assert_eq!(loaded.pid, 42);

        std::env::remove_var(paths::HOME_ENV);
    }
}
