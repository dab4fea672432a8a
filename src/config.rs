//! Session configuration and policy defaults.
//!
//! All timing values are milliseconds so a config document maps one-to-one
//! onto the tool parameters callers already use. The policy lists (long
//! running commands, pager markers) have no canonical source and are meant to
//! be tuned per deployment.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::device::PromptMatcher;
use crate::error::ConnectError;
use crate::session::SessionRecordLevel;

/// Line terminator appended to every command.
pub const DEFAULT_LINE_TERMINATOR: &str = "\r\n";

/// Command sent after login to turn off device-side paging.
pub const DEFAULT_PAGER_DISABLE_COMMAND: &str = "terminal length 0";

/// Command used to leave configuration mode during connect.
pub const EXIT_CONFIG_COMMAND: &str = "end";

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_WAKE_ATTEMPTS: u32 = 3;
pub const DEFAULT_WAKE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_WAIT_MS: u64 = 2_000;
pub const DEFAULT_MAX_COMMAND_TIME_MS: u64 = 300_000;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 30_000;

/// History entries kept per session before the oldest are dropped.
pub const DEFAULT_RECORD_MAX_ENTRIES: usize = 1_000;

/// Minimum wait applied to commands whose runtime the device controls.
pub const DEFAULT_LONG_RUNNING_FLOOR_MS: u64 = 12_000;
pub const DEFAULT_MAX_PAGER_CONTINUATIONS: u32 = 256;

/// Command prefixes that get the long-running wait floor.
///
/// A default `ping` sends five echo requests with a two second timeout each, so the
/// floor has to cover roughly twelve seconds of silence.
pub const DEFAULT_LONG_RUNNING_COMMANDS: &[&str] = &[
    "ping",
    "traceroute",
    "tracert",
    "show tech",
    "copy",
    "write",
    "reload",
    "debug",
];

/// Pagination markers, e.g. `--More--`, ` -- More -- `, `<--- More --->`.
pub const DEFAULT_PAGER_PATTERNS: &[&str] = &[r"(?i)-{2,}\s*\(?more[^-\r\n]*\)?\s*-{2,}>?"];

/// Policy for the adaptive wait loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitPolicy {
    /// Case-insensitive command prefixes classified as long-running.
    pub long_running_commands: Vec<String>,
    /// Floor applied to the caller's wait hint for long-running commands.
    pub long_running_floor_ms: u64,
    /// Upper bound on automatic pager continuations per command.
    pub max_pager_continuations: u32,
    /// Regexes recognising a pagination marker at the end of the output.
    pub pager_patterns: Vec<String>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            long_running_commands: DEFAULT_LONG_RUNNING_COMMANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            long_running_floor_ms: DEFAULT_LONG_RUNNING_FLOOR_MS,
            max_pager_continuations: DEFAULT_MAX_PAGER_CONTINUATIONS,
            pager_patterns: DEFAULT_PAGER_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl WaitPolicy {
    /// Returns true when the command starts with one of the long-running prefixes.
    pub fn is_long_running(&self, command: &str) -> bool {
        let command = command.trim().to_ascii_lowercase();
        if command.is_empty() {
            return false;
        }
        self.long_running_commands
            .iter()
            .map(|prefix| prefix.trim().to_ascii_lowercase())
            .any(|prefix| !prefix.is_empty() && command.starts_with(&prefix))
    }

    /// The wait budget for a command: the hint, raised to the floor when the
    /// command is long-running. A hint above the floor is kept as is.
    pub fn effective_wait(&self, command: &str, hint: Duration) -> Duration {
        if self.is_long_running(command) {
            hint.max(Duration::from_millis(self.long_running_floor_ms))
        } else {
            hint
        }
    }
}

/// Full configuration of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub line_terminator: String,
    pub pager_disable_command: String,
    /// Send `end` when the first prompt seen is a configuration prompt.
    pub exit_config_on_connect: bool,
    pub connect_timeout_ms: u64,
    pub wake_attempts: u32,
    pub wake_interval_ms: u64,
    pub default_wait_ms: u64,
    /// Hard ceiling for one command, pager extensions included.
    pub max_command_time_ms: u64,
    /// How long `execute` waits for a busy session; zero rejects immediately.
    pub queue_timeout_ms: u64,
    pub wait: WaitPolicy,
    pub record_level: SessionRecordLevel,
    /// Cap on history entries per session; zero keeps everything.
    pub record_max_entries: usize,
    /// Refuse telnet option negotiation and strip IAC sequences.
    pub telnet_negotiation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_terminator: DEFAULT_LINE_TERMINATOR.to_string(),
            pager_disable_command: DEFAULT_PAGER_DISABLE_COMMAND.to_string(),
            exit_config_on_connect: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            wake_attempts: DEFAULT_WAKE_ATTEMPTS,
            wake_interval_ms: DEFAULT_WAKE_INTERVAL_MS,
            default_wait_ms: DEFAULT_WAIT_MS,
            max_command_time_ms: DEFAULT_MAX_COMMAND_TIME_MS,
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            wait: WaitPolicy::default(),
            record_level: SessionRecordLevel::KeyEventsOnly,
            record_max_entries: DEFAULT_RECORD_MAX_ENTRIES,
            telnet_negotiation: true,
        }
    }
}

impl SessionConfig {
    /// Parses a JSON config document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConnectError> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| ConnectError::InvalidConfig(format!("config decode error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the config and compiles its pattern lists.
    pub fn validate(&self) -> Result<PromptMatcher, ConnectError> {
        if self.line_terminator.is_empty() {
            return Err(ConnectError::InvalidConfig(
                "line terminator must not be empty".to_string(),
            ));
        }
        if self.wake_attempts == 0 {
            return Err(ConnectError::InvalidConfig(
                "wake attempts must be at least 1".to_string(),
            ));
        }
        PromptMatcher::new(self.wait.pager_patterns.as_slice())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }

    pub fn max_command_time(&self) -> Duration {
        Duration::from_millis(self.max_command_time_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}
