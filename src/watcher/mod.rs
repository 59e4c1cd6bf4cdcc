//! File Watcher: recursive directory watch with debounced, content-hash
//! verified change events and ignore-pattern filtering.
//!
//! Uses the `notify` crate for raw OS events, then confirms each event
//! against a SHA-256 of the file's bytes before forwarding it, so editors
//! that truncate-then-rewrite (or touch without changing content) don't
//! trigger a restart for nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecursiveMode, Watcher as NotifyWatcherTrait};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::model::{FileChangeEvent, FileChangeKind};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

pub const DEFAULT_IGNORES: &[&str] = &["node_modules", ".git", ".hg", ".svn", "target", "*.log"];

fn is_ignored(path: &Path, patterns: &[String]) -> bool {
    let path_str = path.to_string_lossy();
    patterns.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix('*') {
            path_str.ends_with(suffix)
        } else {
            path_str.split(std::path::MAIN_SEPARATOR).any(|segment| segment == pattern)
        }
    })
}

fn hash_file(path: &Path) -> Option<[u8; 32]> {
    let bytes = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hasher.finalize().into())
}

enum WatchCommand {
    Watch(PathBuf),
    Unwatch(Option<PathBuf>),
    Shutdown,
}

#[derive(Clone)]
pub struct FileWatcherHandle {
    tx: std::sync::mpsc::Sender<WatchCommand>,
}

impl FileWatcherHandle {
    pub fn watch(&self, path: impl Into<PathBuf>) {
        let _ = self.tx.send(WatchCommand::Watch(path.into()));
    }

    pub fn unwatch(&self, path: Option<PathBuf>) {
        let _ = self.tx.send(WatchCommand::Unwatch(path));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(WatchCommand::Shutdown);
    }
}

/// Spawns the watcher. The OS-facing `notify` watcher and its command queue
/// live on a dedicated thread (notify's callback API is synchronous); the
/// debounce/hash-comparison logic runs as a tokio task fed by that thread's
/// raw events, matching the async-everywhere-else shape of the daemon.
pub fn spawn(debounce: Duration, extra_ignores: Vec<String>) -> (FileWatcherHandle, mpsc::UnboundedReceiver<FileChangeEvent>) {
    let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<WatchCommand>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<FileChangeEvent>();
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Event>();

    std::thread::spawn(move || run_os_watcher_thread(cmd_rx, raw_tx));

    let mut ignore_patterns: Vec<String> = DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect();
    ignore_patterns.extend(extra_ignores);

    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();
        let mut hashes: HashMap<PathBuf, [u8; 32]> = HashMap::new();

        loop {
            let next_deadline = pending.values().min().copied();
            let sleep_fut = async {
                match next_deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                raw = raw_rx.recv() => {
                    match raw {
                        Some(event) => handle_raw_event(event, &ignore_patterns, debounce, &mut pending),
                        None => break,
                    }
                }
                _ = sleep_fut => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<PathBuf> = pending.iter().filter(|(_, &t)| t <= now).map(|(p, _)| p.clone()).collect();
                    for path in ready {
                        pending.remove(&path);
                        emit_if_changed(&path, &mut hashes, &event_tx);
                    }
                }
            }
        }
    });

    (FileWatcherHandle { tx: cmd_tx }, event_rx)
}

fn run_os_watcher_thread(cmd_rx: std::sync::mpsc::Receiver<WatchCommand>, raw_tx: mpsc::UnboundedSender<notify::Event>) {
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = raw_tx.send(event);
        }
    }) {
        Ok(w) => w,
        Err(err) => {
            log::error!("file watcher: failed to start: {err}");
            return;
        }
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WatchCommand::Watch(path) => {
                if let Err(err) = NotifyWatcherTrait::watch(&mut watcher, &path, RecursiveMode::Recursive) {
                    log::error!("file watcher: failed to watch {}: {err}", path.display());
                }
            }
            WatchCommand::Unwatch(Some(path)) => {
                let _ = NotifyWatcherTrait::unwatch(&mut watcher, &path);
            }
            WatchCommand::Unwatch(None) => {
                // no enumeration API on the trait; individual Unwatch calls
                // cover the common case, a full reset happens on shutdown.
            }
            WatchCommand::Shutdown => break,
        }
    }
}

fn handle_raw_event(event: notify::Event, ignores: &[String], debounce: Duration, pending: &mut HashMap<PathBuf, tokio::time::Instant>) {
    use notify::EventKind;

    for path in event.paths {
        if is_ignored(&path, ignores) {
            continue;
        }
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
            continue;
        }
        pending.insert(path, tokio::time::Instant::now() + debounce);
    }
}

fn emit_if_changed(path: &Path, hashes: &mut HashMap<PathBuf, [u8; 32]>, events: &mpsc::UnboundedSender<FileChangeEvent>) {
    let exists = path.exists();
    let kind = if !exists {
        hashes.remove(path);
        FileChangeKind::Unlink
    } else {
        let new_hash = hash_file(path);
        let previously_seen = hashes.contains_key(path);
        if let (Some(h), Some(old)) = (new_hash, hashes.get(path)) {
            if h == *old {
                return;
            }
        }
        if let Some(h) = new_hash {
            hashes.insert(path.to_path_buf(), h);
        }
        if previously_seen {
            FileChangeKind::Change
        } else {
            FileChangeKind::Add
        }
    };

    let _ = events.send(FileChangeEvent {
        kind,
        absolute_path: path.to_string_lossy().to_string(),
        detected_at: crate::clock::now_utc(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_patterns_match_directory_segments() {
        let patterns = vec!["node_modules".to_string()];
        assert!(is_ignored(Path::new("/a/node_modules/b.js"), &patterns));
        assert!(!is_ignored(Path::new("/a/src/b.js"), &patterns));
    }

    #[test]
    fn ignore_patterns_match_glob_suffix() {
        let patterns = vec!["*.log".to_string()];
        assert!(is_ignored(Path::new("/a/daemon.log"), &patterns));
        assert!(!is_ignored(Path::new("/a/daemon.js"), &patterns));
    }

    #[test]
    fn hash_file_changes_when_contents_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        let h1 = hash_file(&file).unwrap();
        std::fs::write(&file, "two").unwrap();
        let h2 = hash_file(&file).unwrap();
        assert_ne!(h1, h2);
    }
}
