//! Log Manager: one active JSON-lines log file per channel (the daemon
//! itself, plus one per `ManagedProcess`), size-triggered rotation with
//! gzip archival, and a fixed-size in-memory ring buffer for `getRecent`
//! queries.
//!
//! Runs as its own task, driven by an unbounded mpsc channel, so rotation
//! I/O (including gzip compression of the retiring file) never blocks a
//! caller appending a log line.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use tokio::sync::{mpsc, oneshot};

use crate::clock::Id;
use crate::config::paths;
use crate::errors::Result;
use crate::model::{LogEntry, LogLevel};

#[derive(Debug)]
enum Command {
    Append(LogEntry),
    GetRecent { lines: usize, process_id: Option<Id>, reply: oneshot::Sender<Vec<LogEntry>> },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LogManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl LogManagerHandle {
    pub fn append(&self, entry: LogEntry) {
        let _ = self.tx.send(Command::Append(entry));
    }

    pub fn log(&self, level: LogLevel, process_id: Option<Id>, process_name: Option<String>, message: impl Into<String>) {
        self.append(LogEntry {
            timestamp: crate::clock::now_utc(),
            level,
            process_id,
            process_name,
            message: message.into(),
            data: None,
        });
    }

    pub async fn get_recent(&self, lines: usize, process_id: Option<Id>) -> Vec<LogEntry> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::GetRecent { lines, process_id, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct ActiveLog {
    path: std::path::PathBuf,
    file: std::fs::File,
    size: u64,
}

pub struct LogManager {
    max_size_bytes: u64,
    max_files: u32,
    ring_capacity: usize,
    ring: VecDeque<LogEntry>,
    channels: std::collections::HashMap<String, ActiveLog>,
}

impl LogManager {
    pub fn spawn(max_size_bytes: u64, max_files: u32, ring_capacity: usize) -> LogManagerHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let mut manager = LogManager {
            max_size_bytes,
            max_files,
            ring_capacity,
            ring: VecDeque::with_capacity(ring_capacity),
            channels: std::collections::HashMap::new(),
        };

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Append(entry) => manager.handle_append(entry),
                    Command::GetRecent { lines, process_id, reply } => {
                        let _ = reply.send(manager.recent(lines, process_id));
                    }
                    Command::Flush(reply) => {
                        manager.flush_all();
                        let _ = reply.send(());
                    }
                }
            }
        });

        LogManagerHandle { tx }
    }

    fn channel_name(entry: &LogEntry) -> String {
        entry.process_name.clone().unwrap_or_else(|| "daemon".to_string())
    }

    fn handle_append(&mut self, entry: LogEntry) {
        let channel = Self::channel_name(&entry);
        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(_) => return,
        };

        if let Err(err) = self.write_line(&channel, &line) {
            log::error!("log manager: failed writing to channel {channel}: {err}");
        }

        self.ring.push_back(entry);
        while self.ring.len() > self.ring_capacity {
            self.ring.pop_front();
        }
    }

    fn write_line(&mut self, channel: &str, line: &str) -> Result<()> {
        if !self.channels.contains_key(channel) {
            let path = if channel == "daemon" {
                paths::daemon_log_path()?
            } else {
                paths::process_log_path(channel)?
            };
            paths::ensure_home()?;
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.channels.insert(channel.to_string(), ActiveLog { path, file, size });
        }

        let active = self.channels.get_mut(channel).unwrap();
        writeln!(active.file, "{line}")?;
        active.size += line.len() as u64 + 1;

        if active.size >= self.max_size_bytes {
            self.rotate(channel)?;
        }

        Ok(())
    }

    /// Shifts archives `1..k` to `2..k+1`, dropping the archive already at
    /// slot `max_files` since shifting it further would exceed the limit,
    /// then compresses the active file into slot 1 and truncates it.
    fn rotate(&mut self, channel: &str) -> Result<()> {
        for i in (1..=self.max_files).rev() {
            let from = paths::process_log_archive_path(channel, i)?;
            if !from.exists() {
                continue;
            }
            if i == self.max_files {
                std::fs::remove_file(&from)?;
            } else {
                let to = paths::process_log_archive_path(channel, i + 1)?;
                std::fs::rename(&from, &to)?;
            }
        }

        let active = self.channels.get(channel).unwrap();
        let slot1 = paths::process_log_archive_path(channel, 1)?;

        if let Err(err) = compress_file(&active.path, &slot1) {
            log::error!("log manager: rotation compression failed for {channel}: {err}");
            return Err(err);
        }

        let file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&active.path)?;
        let active = self.channels.get_mut(channel).unwrap();
        active.file = file;
        active.size = 0;

        Ok(())
    }

    fn recent(&self, lines: usize, process_id: Option<Id>) -> Vec<LogEntry> {
        self.ring
            .iter()
            .rev()
            .filter(|e| process_id.is_none() || e.process_id == process_id)
            .take(lines)
            .cloned()
            .collect()
    }

    fn flush_all(&mut self) {
        for active in self.channels.values_mut() {
            let _ = active.file.flush();
        }
    }
}

fn compress_file(src: &std::path::Path, dst: &std::path::Path) -> Result<()> {
    let input = std::fs::File::open(src)?;
    let mut reader = std::io::BufReader::new(input);
    let output = std::fs::File::create(dst)?;
    let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());

    loop {
        let buf = reader.fill_buf()?;
        let len = buf.len();
        if len == 0 {
            break;
        }
        encoder.write_all(buf)?;
        reader.consume(len);
    }

    encoder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn appended_entries_are_queryable_from_the_ring() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let handle = LogManager::spawn(10 * 1024 * 1024, 5, 100);
        handle.log(LogLevel::Info, None, None, "daemon starting");
        handle.flush().await;

        let recent = handle.get_recent(10, None).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "daemon starting");

        std::env::remove_var(paths::HOME_ENV);
    }

    #[tokio::test]
    #[serial]
    async fn rotation_creates_a_gzip_archive_at_slot_one() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::HOME_ENV, dir.path());

        let handle = LogManager::spawn(200, 5, 100);
        for i in 0..50 {
            handle.log(LogLevel::Info, Some(Id::new()), Some("api".to_string()), format!("line {i}"));
        }
        handle.flush().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(dir.path().join("logs/api.1.log.gz").exists());

        std::env::remove_var(paths::HOME_ENV);
    }
}
