//! Telnet session management and command execution.
//!
//! This module provides the per-device session engine: bringing a connection
//! up, tracking the device mode from its prompts and running the adaptive
//! wait loop that decides when a command's output is complete. Sessions are
//! owned by a [`SessionRegistry`] and keyed by an opaque id.
//!
//! # Main Components
//!
//! - [`SessionRegistry`] - Process-wide table of live sessions
//! - [`Session`] - One connection with its mode, buffer and history
//! - [`Transport`] - Bounded, cancellable reads over TCP
//! - [`CommandOutput`] - Command execution results

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::SessionConfig;
use crate::device::{DeviceMode, InputKind, PromptMatcher, TailState};
use crate::error::{ConnectError, ConnectPhase, ExecError, TransportError};

pub use recording::{SessionEvent, SessionRecordEntry, SessionRecordLevel, SessionRecorder};
pub use transport::{ReadOutcome, TelnetFilter, Transport};

/// Login and enable secrets for a device.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub enable_password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "enable_password",
                &self.enable_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// How a command's wait loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The prompt came back.
    Complete,
    /// The wait budget ran out; the output is partial.
    TimedOut,
    /// The pager continuation bound was reached; the output is partial.
    PagerLimit,
    /// The device asked a question nobody could answer automatically.
    AwaitingInput,
}

impl Outcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete)
    }

    /// True for outcomes that returned partial output.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Outcome::TimedOut | Outcome::PagerLimit)
    }
}

/// The result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Output with the echoed command and trailing prompt removed.
    pub output: String,
    /// Mode after the command; unchanged unless a prompt was seen.
    pub mode: DeviceMode,
    pub outcome: Outcome,
    /// Question the device is waiting on, for `AwaitingInput`.
    pub pending_input: Option<InputKind>,
    /// Number of pager continuations sent for this command.
    pub pager_continuations: u32,
}

/// Listing entry for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    /// Last observed prompt, or `unknown`.
    pub device_mode: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// A command or the connect sequence is in flight.
    pub busy: bool,
}

/// One stateful connection to a device.
///
/// All transport I/O happens under `state`, so connect and execute are
/// strictly serialised per session. Mode, activity time and the closed flag
/// live outside the lock so that listing and forced disconnects never wait
/// on an in-flight command.
pub struct Session {
    id: String,
    host: String,
    port: u16,
    credentials: Credentials,
    config: SessionConfig,
    matcher: PromptMatcher,
    created_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    mode: RwLock<DeviceMode>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    state: Mutex<SessionState>,
    recorder: SessionRecorder,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .field("mode", &self.mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// State that only the lock holder may touch.
#[derive(Default)]
struct SessionState {
    transport: Option<Transport>,
    /// Raw output of the command in flight; cleared once attributed.
    buffer: String,
    /// The last command ended before its prompt, so output still arriving
    /// belongs to it until the next command's echo shows up.
    out_of_step: bool,
}

/// Process-wide table of live sessions.
///
/// Entries are never evicted on their own; a session leaves the table only
/// through `disconnect`, a failed connect, or `shutdown`.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Cache<String, Arc<Session>>,
    config: SessionConfig,
}

mod client;
mod manager;
mod recording;
mod transport;
mod wait;
