//! Host-local process supervisor: library surface shared by the `nd` binary
//! and its tests.
//!
//! One module per component: `orchestrator` owns the fleet, `health` and
//! `watcher` observe it, `logs` and `state` persist its output and
//! snapshots, `ipc` and `cli` expose it, `daemon` wires everything together.

pub mod clock;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod health;
pub mod ipc;
pub mod logs;
pub mod model;
pub mod orchestrator;
pub mod state;
pub mod watcher;
pub mod webui;
