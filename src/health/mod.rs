//! Health Monitor: periodic per-instance metric sampling, threshold and
//! heuristic issue detection, and recycle-trigger emission.
//!
//! Sampling lives under [`sampler`]; this module tracks history per pid and
//! turns samples into events, so the Daemon Core only has to react to
//! recycle/issue events rather than poll PIDs itself.

pub mod sampler;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::clock::Id;
use sampler::{CpuTicks, Sample};

const MAX_HISTORY: usize = 100;
const LEAK_WINDOW: usize = 10;
const LEAK_GROWTH_THRESHOLD: f64 = 0.20;
const SPIKE_WINDOW: usize = 5;
const SPIKE_MULTIPLIER: f32 = 1.5;

#[derive(Debug, Clone)]
pub struct TrackedInstance {
    pub instance_id: Id,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub process_id: Id,
    pub name: String,
    pub instances: Vec<TrackedInstance>,
    pub auto_restart_on_high_memory: bool,
    pub memory_threshold: u64,
    pub auto_restart_on_high_cpu: bool,
    pub cpu_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    HighMemory,
    HighCpu,
    PossibleLeak,
    CpuSpike,
}

impl Issue {
    fn label(self) -> &'static str {
        match self {
            Issue::HighMemory => "high memory",
            Issue::HighCpu => "high CPU",
            Issue::PossibleLeak => "possible leak",
            Issue::CpuSpike => "CPU spike",
        }
    }
}

#[derive(Debug, Clone)]
pub enum HealthEvent {
    Metrics { process_id: Id, instance_id: Id, rss_bytes: u64, cpu_percent: f32 },
    Issues { process_id: Id, instance_id: Id, issues: Vec<&'static str> },
    RecycleRequested { process_id: Id, reason: &'static str },
}

enum Command {
    Add(TrackedProcess),
    Update(TrackedProcess),
    Remove(Id),
    Shutdown,
}

#[derive(Clone)]
pub struct HealthMonitorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl HealthMonitorHandle {
    pub fn add(&self, process: TrackedProcess) {
        let _ = self.tx.send(Command::Add(process));
    }

    pub fn update(&self, process: TrackedProcess) {
        let _ = self.tx.send(Command::Update(process));
    }

    pub fn remove(&self, process_id: Id) {
        let _ = self.tx.send(Command::Remove(process_id));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

#[derive(Default)]
struct History {
    ticks: Option<CpuTicks>,
    samples: VecDeque<Sample>,
}

pub fn spawn(check_interval: Duration) -> (HealthMonitorHandle, mpsc::UnboundedReceiver<HealthEvent>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<HealthEvent>();

    tokio::spawn(async move {
        let mut tracked: HashMap<Id, TrackedProcess> = HashMap::new();
        let mut history: HashMap<u32, History> = HashMap::new();
        let mut recycling: HashSet<Id> = HashSet::new();
        let mut ticker = tokio::time::interval(check_interval.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Add(p)) => { tracked.insert(p.process_id, p); }
                        Some(Command::Update(p)) => {
                            recycling.remove(&p.process_id);
                            tracked.insert(p.process_id, p);
                        }
                        Some(Command::Remove(id)) => { tracked.remove(&id); }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                _ = ticker.tick() => {
                    run_cycle(&tracked, &mut history, &mut recycling, &event_tx);
                }
            }
        }
    });

    (HealthMonitorHandle { tx: cmd_tx }, event_rx)
}

fn run_cycle(
    tracked: &HashMap<Id, TrackedProcess>,
    history: &mut HashMap<u32, History>,
    recycling: &mut HashSet<Id>,
    events: &mpsc::UnboundedSender<HealthEvent>,
) {
    let live_pids: HashSet<u32> = tracked.values().flat_map(|p| p.instances.iter().map(|i| i.pid)).collect();
    history.retain(|pid, _| live_pids.contains(pid));

    for process in tracked.values() {
        for instance in &process.instances {
            let sample = sample_instance(instance.pid, history);

            let _ = events.send(HealthEvent::Metrics {
                process_id: process.process_id,
                instance_id: instance.instance_id,
                rss_bytes: sample.rss_bytes,
                cpu_percent: sample.cpu_percent,
            });

            let samples = &history.get(&instance.pid).unwrap().samples;
            let issues = detect_issues(samples, process);

            if !issues.is_empty() {
                let _ = events.send(HealthEvent::Issues {
                    process_id: process.process_id,
                    instance_id: instance.instance_id,
                    issues: issues.iter().map(|i| i.label()).collect(),
                });
            }

            if recycling.contains(&process.process_id) {
                continue;
            }

            if issues.contains(&Issue::HighMemory) && process.auto_restart_on_high_memory {
                recycling.insert(process.process_id);
                let _ = events.send(HealthEvent::RecycleRequested { process_id: process.process_id, reason: "high memory" });
            } else if (issues.contains(&Issue::HighCpu) || issues.contains(&Issue::CpuSpike)) && process.auto_restart_on_high_cpu {
                recycling.insert(process.process_id);
                let _ = events.send(HealthEvent::RecycleRequested { process_id: process.process_id, reason: "high cpu" });
            }
        }
    }
}

fn sample_instance(pid: u32, history: &mut HashMap<u32, History>) -> Sample {
    let entry = history.entry(pid).or_default();

    let (ticks, rss) = sampler::read_ticks_and_rss(pid).unwrap_or((None, 0));
    let cpu_percent = match ticks {
        Some(t) => sampler::cpu_percent_from_ticks(entry.ticks, t),
        None => 0.0,
    };
    if let Some(t) = ticks {
        entry.ticks = Some(t);
    }

    let sample = Sample { rss_bytes: rss, cpu_percent };
    entry.samples.push_back(sample);
    while entry.samples.len() > MAX_HISTORY {
        entry.samples.pop_front();
    }

    sample
}

fn detect_issues(samples: &VecDeque<Sample>, process: &TrackedProcess) -> Vec<Issue> {
    let mut issues = Vec::new();
    let Some(latest) = samples.back() else {
        return issues;
    };

    if latest.rss_bytes as f64 > process.memory_threshold as f64 {
        issues.push(Issue::HighMemory);
    }
    if latest.cpu_percent >= process.cpu_threshold {
        issues.push(Issue::HighCpu);
    }

    if samples.len() >= LEAK_WINDOW {
        let window: Vec<&Sample> = samples.iter().rev().take(LEAK_WINDOW).collect();
        // window[0] is most recent, window[LEAK_WINDOW-1] is oldest of the window
        let first = window[LEAK_WINDOW - 1].rss_bytes;
        let last = window[0].rss_bytes;
        if first > 0 {
            let growth = (last as f64 - first as f64) / first as f64;
            let grew_count = window.windows(2).filter(|pair| pair[0].rss_bytes >= pair[1].rss_bytes).count();
            if grew_count >= 8 && growth > LEAK_GROWTH_THRESHOLD {
                issues.push(Issue::PossibleLeak);
            }
        }
    }

    if samples.len() >= SPIKE_WINDOW {
        let mean: f32 = samples.iter().rev().take(SPIKE_WINDOW).map(|s| s.cpu_percent).sum::<f32>() / SPIKE_WINDOW as f32;
        if mean > process.cpu_threshold * SPIKE_MULTIPLIER {
            issues.push(Issue::CpuSpike);
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(memory_threshold: u64, cpu_threshold: f32) -> TrackedProcess {
        TrackedProcess {
            process_id: Id::new(),
            name: "api".to_string(),
            instances: Vec::new(),
            auto_restart_on_high_memory: true,
            memory_threshold,
            auto_restart_on_high_cpu: true,
            cpu_threshold,
        }
    }

    #[test]
    fn high_memory_issue_fires_above_threshold() {
        let p = process(100, 80.0);
        let mut samples = VecDeque::new();
        samples.push_back(Sample { rss_bytes: 200, cpu_percent: 0.0 });
        let issues = detect_issues(&samples, &p);
        assert!(issues.contains(&Issue::HighMemory));
    }

    #[test]
    fn high_cpu_issue_fires_exactly_at_threshold() {
        let p = process(u64::MAX, 80.0);
        let mut samples = VecDeque::new();
        samples.push_back(Sample { rss_bytes: 0, cpu_percent: 80.0 });
        let issues = detect_issues(&samples, &p);
        assert!(issues.contains(&Issue::HighCpu));
    }

    #[test]
    fn leak_heuristic_requires_sustained_growth() {
        let p = process(u64::MAX, 100.0);
        let mut samples = VecDeque::new();
        let mut rss = 1000u64;
        for _ in 0..10 {
            samples.push_back(Sample { rss_bytes: rss, cpu_percent: 0.0 });
            rss += rss / 5;
        }
        let issues = detect_issues(&samples, &p);
        assert!(issues.contains(&Issue::PossibleLeak));
    }

    #[test]
    fn leak_heuristic_does_not_fire_on_flat_memory() {
        let p = process(u64::MAX, 100.0);
        let mut samples = VecDeque::new();
        for _ in 0..10 {
            samples.push_back(Sample { rss_bytes: 1000, cpu_percent: 0.0 });
        }
        let issues = detect_issues(&samples, &p);
        assert!(!issues.contains(&Issue::PossibleLeak));
    }

    #[test]
    fn cpu_spike_requires_sustained_mean_above_1_5x() {
        let p = process(u64::MAX, 40.0);
        let mut samples = VecDeque::new();
        for _ in 0..5 {
            samples.push_back(Sample { rss_bytes: 0, cpu_percent: 90.0 });
        }
        let issues = detect_issues(&samples, &p);
        assert!(issues.contains(&Issue::CpuSpike));
    }
}
