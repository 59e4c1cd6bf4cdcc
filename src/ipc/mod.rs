//! IPC Server: a Unix domain socket accepting newline-delimited JSON
//! requests from the `nd` CLI, dispatched against the daemon's components.
//!
//! One JSON value per line, tagged by `type`; the socket is permissioned
//! `0600` so the trust boundary is "same user," not a network listener.

pub mod protocol;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::clock::Id;
use crate::config::paths;
use crate::daemon::DaemonCtx;
use crate::errors::Result;
use crate::orchestrator::Target;
use protocol::{Request, RequestBody, Response};

/// Binds the socket at the configured path, removing a stale one first, and
/// sets its permissions to `0600` before accepting connections.
pub async fn bind() -> Result<UnixListener> {
    let path = paths::socket_path()?;
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Accept loop; runs until `ctx.shutting_down()` and the listener is
/// dropped by the caller.
pub async fn serve(listener: UnixListener, ctx: Arc<DaemonCtx>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, ctx).await {
                        log::debug!("ipc connection ended: {err}");
                    }
                });
            }
            Err(err) => {
                log::error!("ipc accept failed: {err}");
                break;
            }
        }
    }
}

/// Per-connection loop. Requests are newline-delimited, so a client may
/// pipeline several in one write or split one across several reads;
/// `BufReader::lines` handles both by buffering until a full line appears.
async fn handle_connection(stream: UnixStream, ctx: Arc<DaemonCtx>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&ctx, request).await,
            Err(err) => Response::err(recover_id(&line), format!("malformed request: {err}")),
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }

    Ok(())
}

/// A request can fail the strict `Request` decode (unknown/missing `type`)
/// while still carrying a well-formed `id` the client is waiting on; pull
/// that out of the raw JSON before falling back to `"unknown"`.
fn recover_id(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn target_of(process_id: &Option<String>, name: &Option<String>) -> Result<Target> {
    if let Some(id) = process_id {
        let parsed: Id = id.parse().map_err(|_| crate::errors::NodeDaemonError::invalid_config("malformed process id"))?;
        return Ok(Target::Id(parsed));
    }
    if let Some(name) = name {
        return Ok(Target::Name(name.clone()));
    }
    Err(crate::errors::NodeDaemonError::invalid_config("request must carry either processId or name"))
}

async fn dispatch(ctx: &Arc<DaemonCtx>, request: Request) -> Response {
    let id = request.id.clone();
    match run(ctx, request.body).await {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::err(id, err.to_string()),
    }
}

async fn run(ctx: &Arc<DaemonCtx>, body: RequestBody) -> Result<Option<serde_json::Value>> {
    match body {
        RequestBody::Ping => Ok(Some(serde_json::json!({ "pong": true }))),

        RequestBody::Start(data) => {
            let config = ctx.config_from_start_request(data)?;
            let id = ctx.orchestrator.start(config).await?;
            ctx.state.mark_dirty();
            Ok(Some(serde_json::json!({ "id": id.to_string() })))
        }

        RequestBody::Stop(data) => {
            let target = target_of(&data.process_id, &data.name)?;
            ctx.orchestrator.stop(&target, data.force).await?;
            ctx.state.mark_dirty();
            Ok(None)
        }

        RequestBody::Restart(data) => {
            let target = target_of(&data.process_id, &data.name)?;
            ctx.orchestrator.restart(&target, data.graceful).await?;
            ctx.state.mark_dirty();
            Ok(None)
        }

        RequestBody::List => {
            let list = ctx.orchestrator.list();
            Ok(Some(serde_json::to_value(list)?))
        }

        RequestBody::Status(data) => {
            let target = target_of(&data.process_id, &data.name)?;
            let snapshot = ctx.orchestrator.get(&target)?;
            Ok(Some(serde_json::to_value(snapshot)?))
        }

        RequestBody::Logs(data) => {
            let process_id = match (&data.process_id, &data.name) {
                (Some(_), _) | (_, Some(_)) => Some(ctx.orchestrator.get(&target_of(&data.process_id, &data.name)?)?.id),
                (None, None) => None,
            };
            let entries = ctx.log.get_recent(data.lines, process_id).await;
            Ok(Some(serde_json::to_value(entries)?))
        }

        RequestBody::Shutdown => {
            ctx.request_shutdown();
            Ok(None)
        }

        RequestBody::Webui(action) => ctx.handle_webui_request(action).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_of_requires_one_identifier() {
        let err = target_of(&None, &None).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::InvalidConfig);
    }

    #[test]
    fn target_of_prefers_process_id_over_name() {
        let id = Id::new();
        let target = target_of(&Some(id.to_string()), &Some("api".to_string())).unwrap();
        assert!(matches!(target, Target::Id(parsed) if parsed == id));
    }

    #[test]
    fn recover_id_extracts_id_from_a_request_with_an_unknown_type() {
        let line = r#"{"id":"abc-123","type":"frobnicate","timestamp":0}"#;
        assert_eq!(recover_id(line), "abc-123");
    }

    #[test]
    fn recover_id_falls_back_to_unknown_when_id_is_missing() {
        assert_eq!(recover_id("not json at all"), "unknown");
        assert_eq!(recover_id(r#"{"type":"ping"}"#), "unknown");
    }
}
