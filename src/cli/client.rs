//! Thin synchronous-feeling client over the IPC socket: connect, write one
//! newline-delimited JSON request, read one newline-delimited JSON
//! response.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::errors::{NodeDaemonError, Result};
use crate::ipc::protocol::{Request, RequestBody, Response};

pub async fn call(body: RequestBody) -> Result<Response> {
    let path = crate::config::paths::socket_path()?;
    let stream = UnixStream::connect(&path)
        .await
        .map_err(|e| NodeDaemonError::new(crate::errors::ErrorKind::IoFailure, format!("daemon not reachable at {}: {e}", path.display())))?;

    let request = Request { id: crate::clock::Id::new().to_string(), body, timestamp: chrono::Utc::now().timestamp_millis() };
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');

    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    let n = reader.read_line(&mut response_line).await?;
    if n == 0 {
        return Err(NodeDaemonError::protocol("daemon closed the connection without responding"));
    }

    Ok(serde_json::from_str(&response_line)?)
}
