//! Crate-wide error type.
//!
//! Every fallible operation in the supervision engine returns a
//! [`NodeDaemonError`]. The variant carries an error *kind* rather than being
//! split into many small structs, matching how the wire protocol reports
//! failures to clients (`{error: <message>, kind: <kind>}`).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The fixed vocabulary of failure kinds a client or log line can key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidConfig,
    ScriptMissing,
    NotFound,
    AlreadyExists,
    SpawnFailed,
    Timeout,
    Shutdown,
    StateCorrupt,
    IoFailure,
    ProtocolError,
    PermissionDenied,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::ScriptMissing => "ScriptMissing",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::SpawnFailed => "SpawnFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Shutdown => "Shutdown",
            ErrorKind::StateCorrupt => "StateCorrupt",
            ErrorKind::IoFailure => "IOFailure",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::PermissionDenied => "PermissionDenied",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Maps a wire-level error kind to the CLI exit code table.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidConfig => 8,
            ErrorKind::ScriptMissing => 4,
            ErrorKind::NotFound => 4,
            ErrorKind::AlreadyExists => 1,
            ErrorKind::SpawnFailed => 1,
            ErrorKind::Timeout => 7,
            ErrorKind::Shutdown => 3,
            ErrorKind::StateCorrupt => 1,
            ErrorKind::IoFailure => 1,
            ErrorKind::ProtocolError => 2,
            ErrorKind::PermissionDenied => 5,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct NodeDaemonError {
    pub kind: ErrorKind,
    pub message: String,
    pub id: Option<String>,
}

impl NodeDaemonError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        NodeDaemonError { kind, message: message.into(), id: None }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn script_missing(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::ScriptMissing, format!("script not found: {path}"))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SpawnFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "daemon is shutting down")
    }

    pub fn state_corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StateCorrupt, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }
}

impl From<std::io::Error> for NodeDaemonError {
    fn from(err: std::io::Error) -> Self {
        NodeDaemonError::new(ErrorKind::IoFailure, err.to_string())
    }
}

impl From<serde_json::Error> for NodeDaemonError {
    fn from(err: serde_json::Error) -> Self {
        NodeDaemonError::new(ErrorKind::ProtocolError, err.to_string())
    }
}

impl From<toml::de::Error> for NodeDaemonError {
    fn from(err: toml::de::Error) -> Self {
        NodeDaemonError::new(ErrorKind::InvalidConfig, err.to_string())
    }
}

impl From<toml::ser::Error> for NodeDaemonError {
    fn from(err: toml::ser::Error) -> Self {
        NodeDaemonError::new(ErrorKind::InvalidConfig, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeDaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_published_table() {
        assert_eq!(ErrorKind::InvalidConfig.exit_code(), 8);
        assert_eq!(ErrorKind::NotFound.exit_code(), 4);
        assert_eq!(ErrorKind::PermissionDenied.exit_code(), 5);
        assert_eq!(ErrorKind::Timeout.exit_code(), 7);
        assert_eq!(ErrorKind::Shutdown.exit_code(), 3);
    }

    #[test]
    fn display_round_trips_the_kind_name() {
        let err = NodeDaemonError::not_found("process xyz");
        assert_eq!(err.to_string(), "NotFound: process xyz");
    }
}
