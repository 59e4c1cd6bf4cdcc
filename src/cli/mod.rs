//! `nd` command-line surface: parses `clap` subcommands, relays them to the
//! running daemon over IPC, and renders the response with `tabled` and
//! `colored`.

pub mod client;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::settings::Style;
use tabled::Tabled;

use crate::errors::ErrorKind;
use crate::ipc::protocol::{LogsData, RequestBody, RestartData, StartData, TargetData, WebuiData};
use crate::model::{LogEntry, ManagedProcessSnapshot, ProcessStatus};

#[derive(Parser)]
#[command(name = "nd", version, about = "A host-local process supervisor for long-running applications")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon in the foreground (or detached).
    Daemon {
        #[arg(long)]
        detach: bool,
        #[arg(long = "log-level")]
        log_level: Option<String>,
    },
    /// Start a new managed process.
    Start {
        script: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        instances: Option<String>,
        #[arg(long)]
        watch: bool,
        #[arg(long = "watch-paths", value_delimiter = ',')]
        watch_paths: Option<Vec<String>>,
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[arg(long = "env-file")]
        env_file: Option<String>,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long, value_delimiter = ',')]
        args: Vec<String>,
        #[arg(long)]
        interpreter: Option<String>,
        #[arg(long = "max-memory")]
        max_memory: Option<String>,
        #[arg(long = "max-restarts")]
        max_restarts: Option<u32>,
        #[arg(long = "restart-delay")]
        restart_delay: Option<u64>,
        #[arg(long = "min-uptime")]
        min_uptime: Option<u64>,
        #[arg(long = "auto-restart-memory")]
        auto_restart_memory: bool,
        #[arg(long = "auto-restart-cpu")]
        auto_restart_cpu: bool,
        #[arg(long = "memory-threshold")]
        memory_threshold: Option<String>,
        #[arg(long = "cpu-threshold")]
        cpu_threshold: Option<f32>,
    },
    /// Stop a managed process.
    Stop {
        target: String,
        #[arg(long)]
        force: bool,
    },
    /// Restart a managed process.
    Restart {
        target: String,
        #[arg(long)]
        graceful: bool,
    },
    /// List every managed process.
    List {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        watch: bool,
    },
    /// Show the status of one process, or every process if none is named.
    Status {
        target: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show recent log lines for a process.
    Logs {
        target: String,
        #[arg(long, default_value_t = 20)]
        lines: usize,
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        json: bool,
    },
    /// Ask the daemon to shut down.
    Shutdown,
    /// Manage the web UI.
    Webui {
        #[command(subcommand)]
        action: WebuiAction,
    },
}

#[derive(Subcommand)]
pub enum WebuiAction {
    Start {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        username: Option<String>,
    },
    Stop,
    Status,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn target_data(target: String, force: bool) -> TargetData {
    match target.parse::<crate::clock::Id>() {
        Ok(_) => TargetData { process_id: Some(target), name: None, force },
        Err(_) => TargetData { process_id: None, name: Some(target), force },
    }
}

fn restart_data(target: String, graceful: bool) -> RestartData {
    match target.parse::<crate::clock::Id>() {
        Ok(_) => RestartData { process_id: Some(target), name: None, graceful },
        Err(_) => RestartData { process_id: None, name: Some(target), graceful },
    }
}

fn logs_data(target: String, lines: usize) -> LogsData {
    match target.parse::<crate::clock::Id>() {
        Ok(_) => LogsData { process_id: Some(target), name: None, lines },
        Err(_) => LogsData { process_id: None, name: Some(target), lines },
    }
}

/// Runs the parsed command and returns the process exit code per spec.md §6.
pub async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Daemon { detach, log_level } => run_daemon(detach, log_level).await,
        Commands::Start {
            script,
            name,
            instances,
            watch,
            watch_paths,
            env,
            env_file,
            cwd,
            args,
            interpreter,
            max_memory,
            max_restarts,
            restart_delay,
            min_uptime,
            auto_restart_memory,
            auto_restart_cpu,
            memory_threshold,
            cpu_threshold,
        } => {
            let data = StartData {
                script,
                name,
                instances,
                args,
                cwd,
                interpreter,
                env: env.into_iter().collect(),
                env_file,
                watch: Some(watch),
                watch_paths,
                max_memory,
                max_restarts,
                restart_delay_ms: restart_delay,
                min_uptime_ms: min_uptime,
                auto_restart_memory: Some(auto_restart_memory),
                auto_restart_cpu: Some(auto_restart_cpu),
                memory_threshold,
                cpu_threshold,
            };
            send(RequestBody::Start(data)).await
        }
        Commands::Stop { target, force } => send(RequestBody::Stop(target_data(target, force))).await,
        Commands::Restart { target, graceful } => send(RequestBody::Restart(restart_data(target, graceful))).await,
        Commands::List { json, watch } => run_list(json, watch).await,
        Commands::Status { target, json } => run_status(target, json).await,
        Commands::Logs { target, lines, follow, json } => run_logs(target, lines, follow, json).await,
        Commands::Shutdown => send(RequestBody::Shutdown).await,
        Commands::Webui { action } => run_webui(action).await,
    }
}

async fn run_daemon(detach: bool, log_level: Option<String>) -> i32 {
    if let Some(level) = log_level {
        std::env::set_var(crate::config::paths::LOG_LEVEL_ENV, level);
    }
    if detach {
        eprintln!("{} --detach is not supported from this build; run under a process manager instead", "warn:".yellow());
    }
    crate::daemon::run().await
}

async fn send(body: RequestBody) -> i32 {
    match client::call(body).await {
        Ok(response) if response.success => {
            if let Some(data) = response.data {
                println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
            }
            0
        }
        Ok(response) => {
            let message = response.data.as_ref().and_then(|d| d.get("error")).and_then(|e| e.as_str()).unwrap_or("request failed");
            eprintln!("{} {message}", "error:".red().bold());
            ErrorKind::ProtocolError.exit_code()
        }
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            err.kind.exit_code()
        }
    }
}

#[derive(Tabled)]
struct ProcessRow {
    id: String,
    name: String,
    status: String,
    instances: usize,
    restarts: u32,
    memory: String,
    uptime: String,
}

impl From<&ManagedProcessSnapshot> for ProcessRow {
    fn from(p: &ManagedProcessSnapshot) -> Self {
        let status = match p.status {
            ProcessStatus::Running => "running".green().to_string(),
            ProcessStatus::Starting | ProcessStatus::Reloading => "starting".yellow().to_string(),
            ProcessStatus::Stopping | ProcessStatus::Stopped => "stopped".normal().to_string(),
            ProcessStatus::Errored => "errored".red().bold().to_string(),
        };
        ProcessRow {
            id: p.id.to_string(),
            name: p.name.clone(),
            status,
            instances: p.instance_count,
            restarts: p.aggregate_restarts,
            memory: crate::config::size::format_size(p.memory_bytes),
            uptime: crate::clock::format_uptime(std::time::Duration::from_millis(p.uptime_ms)),
        }
    }
}

async fn run_list(json: bool, watch: bool) -> i32 {
    loop {
        match client::call(RequestBody::List).await {
            Ok(response) if response.success => {
                let processes: Vec<ManagedProcessSnapshot> = response.data.map(serde_json::from_value).transpose().unwrap_or_default().unwrap_or_default();
                if json {
                    println!("{}", serde_json::to_string_pretty(&processes).unwrap_or_default());
                } else if processes.is_empty() {
                    println!("no managed processes");
                } else {
                    let rows: Vec<ProcessRow> = processes.iter().map(ProcessRow::from).collect();
                    println!("{}", tabled::Table::new(rows).with(Style::rounded()));
                }
            }
            Ok(response) => {
                eprintln!("{} {:?}", "error:".red().bold(), response.data);
                return ErrorKind::ProtocolError.exit_code();
            }
            Err(err) => {
                eprintln!("{} {err}", "error:".red().bold());
                return err.kind.exit_code();
            }
        }

        if !watch {
            return 0;
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
}

async fn run_status(target: Option<String>, json: bool) -> i32 {
    match target {
        None => run_list(json, false).await,
        Some(target) => {
            let data = target_data(target, false);
            match client::call(RequestBody::Status(data)).await {
                Ok(response) if response.success => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&response.data).unwrap_or_default());
                    } else if let Some(value) = response.data {
                        if let Ok(snapshot) = serde_json::from_value::<ManagedProcessSnapshot>(value) {
                            print_status(&snapshot);
                        }
                    }
                    0
                }
                Ok(response) => {
                    eprintln!("{} {:?}", "error:".red().bold(), response.data);
                    ErrorKind::NotFound.exit_code()
                }
                Err(err) => {
                    eprintln!("{} {err}", "error:".red().bold());
                    err.kind.exit_code()
                }
            }
        }
    }
}

fn print_status(p: &ManagedProcessSnapshot) {
    println!("{}  {}", p.name.bold(), p.id);
    println!("  script:     {}", p.script);
    println!("  status:     {:?}", p.status);
    println!("  instances:  {}", p.instance_count);
    println!("  restarts:   {}", p.aggregate_restarts);
    println!("  memory:     {}", crate::config::size::format_size(p.memory_bytes));
    println!("  uptime:     {}", crate::clock::format_uptime(std::time::Duration::from_millis(p.uptime_ms)));
    println!("  created:    {}", p.created_at);
}

async fn run_logs(target: String, lines: usize, follow: bool, json: bool) -> i32 {
    let mut last_len = 0usize;
    loop {
        let data = logs_data(target.clone(), lines);
        match client::call(RequestBody::Logs(data)).await {
            Ok(response) if response.success => {
                let entries: Vec<LogEntry> = response.data.map(serde_json::from_value).transpose().unwrap_or_default().unwrap_or_default();
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
                } else {
                    for entry in entries.iter().skip(last_len) {
                        println!("[{}] {:?} {}", entry.timestamp, entry.level, entry.message);
                    }
                    last_len = entries.len();
                }
            }
            Ok(response) => {
                eprintln!("{} {:?}", "error:".red().bold(), response.data);
                return ErrorKind::NotFound.exit_code();
            }
            Err(err) => {
                eprintln!("{} {err}", "error:".red().bold());
                return err.kind.exit_code();
            }
        }

        if !follow {
            return 0;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

async fn run_webui(action: WebuiAction) -> i32 {
    let data = match action {
        WebuiAction::Start { port, host, username } => WebuiData::Start { port, host, username },
        WebuiAction::Stop => WebuiData::Stop,
        WebuiAction::Status => WebuiData::Status,
    };
    send(RequestBody::Webui(data)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_data_detects_uuid_vs_name() {
        let id = crate::clock::Id::new();
        let by_id = target_data(id.to_string(), false);
        assert_eq!(by_id.process_id, Some(id.to_string()));

        let by_name = target_data("api".to_string(), false);
        assert_eq!(by_name.name, Some("api".to_string()));
    }

    #[test]
    fn parse_env_pair_splits_on_first_equals() {
        assert_eq!(parse_env_pair("FOO=bar=baz").unwrap(), ("FOO".to_string(), "bar=baz".to_string()));
        assert!(parse_env_pair("FOO").is_err());
    }
}
