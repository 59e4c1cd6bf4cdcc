//! Web UI: a minimal `rocket` server exposing process status as JSON.
//!
//! Treated as an opaque supervised surface: the IPC `webui` verb can
//! start/stop/query it, but no dashboard logic lives in this crate beyond a
//! health route and a read-only status route.

use rocket::serde::json::Json;
use rocket::{Build, Rocket, State};

use crate::orchestrator::OrchestratorHandle;

struct WebUiState {
    orchestrator: OrchestratorHandle,
}

#[rocket::get("/health")]
fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[rocket::get("/processes")]
fn processes(state: &State<WebUiState>) -> Json<Vec<crate::model::ManagedProcessSnapshot>> {
    Json(state.orchestrator.list())
}

fn build(orchestrator: OrchestratorHandle, address: &str, port: u16) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", address))
        .merge(("port", port))
        .merge(("log_level", rocket::config::LogLevel::Off));

    rocket::custom(figment)
        .manage(WebUiState { orchestrator })
        .mount("/", rocket::routes![health, processes])
}

pub struct WebUiHandle {
    shutdown: rocket::Shutdown,
}

impl WebUiHandle {
    pub fn stop(&self) {
        self.shutdown.clone().notify();
    }
}

/// Ignites and launches the web UI in the background, returning a handle
/// that can request a graceful shutdown.
pub async fn start(orchestrator: OrchestratorHandle, address: &str, port: u16) -> crate::errors::Result<WebUiHandle> {
    let rocket = build(orchestrator, address, port);
    let ignited = rocket
        .ignite()
        .await
        .map_err(|e| crate::errors::NodeDaemonError::invalid_config(format!("web UI failed to start: {e}")))?;
    let shutdown = ignited.shutdown();

    tokio::spawn(async move {
        if let Err(err) = ignited.launch().await {
            log::error!("web UI exited with error: {err}");
        }
    });

    Ok(WebUiHandle { shutdown })
}
