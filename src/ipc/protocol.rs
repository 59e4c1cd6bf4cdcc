//! Wire message shapes: newline-delimited JSON, tagged by `type`.
//!
//! A single `#[serde(tag = "type")]` enum per direction keeps the decoder
//! exhaustive: adding a verb means adding a variant, not a new branch in a
//! hand-rolled dispatcher.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub body: RequestBody,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RequestBody {
    Ping,
    Start(StartData),
    Stop(TargetData),
    Restart(RestartData),
    List,
    Status(TargetData),
    Logs(LogsData),
    Shutdown,
    Webui(WebuiData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartData {
    pub script: String,
    pub name: Option<String>,
    pub instances: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub interpreter: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    pub env_file: Option<String>,
    pub watch: Option<bool>,
    pub watch_paths: Option<Vec<String>>,
    pub max_memory: Option<String>,
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: Option<u64>,
    pub min_uptime_ms: Option<u64>,
    pub auto_restart_memory: Option<bool>,
    pub auto_restart_cpu: Option<bool>,
    pub memory_threshold: Option<String>,
    pub cpu_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TargetData {
    pub process_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RestartData {
    pub process_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub graceful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogsData {
    pub process_id: Option<String>,
    pub name: Option<String>,
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum WebuiData {
    Start { port: Option<u16>, host: Option<String>, username: Option<String> },
    Stop,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub timestamp: i64,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: Option<Value>) -> Self {
        Response { id: id.into(), success: true, data, timestamp: Utc::now().timestamp_millis() }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Response {
            id: id.into(),
            success: false,
            data: Some(serde_json::json!({ "error": message.into() })),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_request_round_trips() {
        let json = r#"{"id":"a","type":"ping","timestamp":0}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(req.body, RequestBody::Ping));
    }

    #[test]
    fn list_request_round_trips() {
        let json = r#"{"id":"b","type":"list","timestamp":0}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(matches!(req.body, RequestBody::List));
    }

    #[test]
    fn response_err_carries_error_message() {
        let resp = Response::err("x", "boom");
        let data = resp.data.unwrap();
        assert_eq!(data["error"], "boom");
    }
}
