//! Error types for telnet transport, session bring-up and command execution.
//!
//! Transport-level failures are always fatal to the session that hit them.
//! Command timeouts are not errors at all: they are reported through
//! [`crate::session::Outcome`] together with the partial output.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the raw byte stream.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The TCP connection could not be established in time.
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    /// An I/O error on the socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed, either by the peer or by a forced disconnect.
    #[error("transport closed")]
    Closed,
}

/// Step of the connect sequence that was running when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectPhase {
    Open,
    Wake,
    Login,
    ExitConfig,
    DisablePaging,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectPhase::Open => "open",
            ConnectPhase::Wake => "wake",
            ConnectPhase::Login => "login",
            ConnectPhase::ExitConfig => "exit-config",
            ConnectPhase::DisablePaging => "disable-paging",
        };
        f.write_str(name)
    }
}

/// Errors raised while bringing a session up.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The host could not be reached at all.
    #[error("host {addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: TransportError,
    },

    /// The device rejected the supplied credentials, or asked for one we do not have.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The device never presented a recognisable prompt.
    ///
    /// Carries whatever output was received during the failed phase.
    #[error("no prompt during {phase} (received {output:?})")]
    PromptNotFound { phase: ConnectPhase, output: String },

    /// The transport failed after it was opened.
    #[error("transport failure during {phase}: {source}")]
    Transport {
        phase: ConnectPhase,
        #[source]
        source: TransportError,
    },

    /// The session was disconnected while the connect sequence was running.
    #[error("connect aborted: session closed")]
    Aborted,

    /// A configured pattern failed to compile.
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

impl ConnectError {
    /// Phase in which the connect sequence stopped, when known.
    pub fn phase(&self) -> Option<ConnectPhase> {
        match self {
            ConnectError::Unreachable { .. } => Some(ConnectPhase::Open),
            ConnectError::AuthRejected(_) => Some(ConnectPhase::Login),
            ConnectError::PromptNotFound { phase, .. } => Some(*phase),
            ConnectError::Transport { phase, .. } => Some(*phase),
            ConnectError::Aborted | ConnectError::InvalidConfig(_) => None,
        }
    }
}

/// Errors raised by command execution and session lookup.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Another command is in flight and the queue wait elapsed.
    #[error("session {0} is busy")]
    SessionBusy(String),

    /// The session was disconnected, or never finished connecting.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// The transport failed mid-command; the session has been closed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// Machine-readable error category surfaced to tool callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    AuthRejected,
    PromptNotFound,
    SessionNotFound,
    SessionBusy,
    SessionClosed,
    TransportFailure,
    TimedOut,
    InvalidRequest,
}

/// Errors surfaced through the tool façade.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Connect(err) => match err {
                ConnectError::Unreachable { .. } => ErrorKind::Unreachable,
                ConnectError::AuthRejected(_) => ErrorKind::AuthRejected,
                ConnectError::PromptNotFound { .. } => ErrorKind::PromptNotFound,
                ConnectError::Transport { .. } => ErrorKind::TransportFailure,
                ConnectError::Aborted => ErrorKind::SessionClosed,
                ConnectError::InvalidConfig(_) => ErrorKind::InvalidRequest,
            },
            ToolError::Exec(err) => match err {
                ExecError::SessionNotFound(_) => ErrorKind::SessionNotFound,
                ExecError::SessionBusy(_) => ErrorKind::SessionBusy,
                ExecError::SessionClosed(_) => ErrorKind::SessionClosed,
                ExecError::Transport(_) => ErrorKind::TransportFailure,
            },
            ToolError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}
