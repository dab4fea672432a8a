//! Tool façade.
//!
//! Maps the four external operations (`telnet_connect`, `telnet_execute`,
//! `telnet_list_sessions`, `telnet_disconnect`) onto the [`SessionRegistry`]
//! and shapes their results into camelCase JSON objects. Failures are never
//! raised to the caller; they come back as `success: false` with an
//! `errorKind`.

use std::time::Duration;

use log::{error, info, warn};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::error::{ErrorKind, ToolError};
use crate::session::{Credentials, Outcome, SessionInfo, SessionRegistry};

pub const TOOL_CONNECT: &str = "telnet_connect";
pub const TOOL_EXECUTE: &str = "telnet_execute";
pub const TOOL_LIST_SESSIONS: &str = "telnet_list_sessions";
pub const TOOL_DISCONNECT: &str = "telnet_disconnect";

/// Parameters of `telnet_connect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Device address.
    pub host: String,
    /// Telnet port, usually 23.
    pub port: u16,
    /// Sent when the device asks `Username:`.
    #[serde(default)]
    pub username: Option<String>,
    /// Sent when the device asks `Password:` during login.
    #[serde(default)]
    pub password: Option<String>,
    /// Sent when a command (typically `enable`) asks for a password.
    #[serde(default)]
    pub enable_password: Option<String>,
    /// Connection timeout in milliseconds (default 5000).
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

/// Parameters of `telnet_execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Id returned by `telnet_connect`.
    pub session_id: String,
    /// Command line to send, without line terminator.
    pub command: String,
    /// Wait hint in milliseconds (default 2000). The call returns as soon as
    /// the prompt comes back; ping, traceroute and similar commands are
    /// always given at least the long-running floor.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Parameters of `telnet_list_sessions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListSessionsRequest {}

/// Parameters of `telnet_disconnect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    /// Id returned by `telnet_connect`.
    pub session_id: String,
}

/// Result object shared by connect, execute and disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Raw prompt text, e.g. `SW3#` or `SW3(config-if)#`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Set when the device is waiting for an answer to a question.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_input: Option<bool>,
}

impl ToolResult {
    fn failure(err: &ToolError) -> Self {
        Self {
            success: false,
            message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Default::default()
        }
    }
}

/// Name, description and input schema of one tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

/// Descriptors for the four tools.
pub fn tool_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: TOOL_CONNECT,
            description: "Open a telnet session to a Cisco-style device. Returns the session id \
                          and the current prompt (e.g. SW3> user mode, SW3# privileged mode, \
                          SW3(config)# global config, SW3(config-if)# interface config).",
            input_schema: schema_value::<ConnectRequest>(),
        },
        ToolDescriptor {
            name: TOOL_EXECUTE,
            description: "Run a command on a session. Returns as soon as the device prompt \
                          comes back; long-running commands such as ping and traceroute get an \
                          extended wait automatically. On timeout the partial output is returned.",
            input_schema: schema_value::<ExecuteRequest>(),
        },
        ToolDescriptor {
            name: TOOL_LIST_SESSIONS,
            description: "List active sessions with host and last known prompt.",
            input_schema: schema_value::<ListSessionsRequest>(),
        },
        ToolDescriptor {
            name: TOOL_DISCONNECT,
            description: "Close a session. Interrupts a command still running on it.",
            input_schema: schema_value::<DisconnectRequest>(),
        },
    ]
}

/// Entry point for tool calls.
#[derive(Clone, Default)]
pub struct ToolFacade {
    registry: SessionRegistry,
}

impl ToolFacade {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn connect(&self, req: ConnectRequest) -> ToolResult {
        if req.host.trim().is_empty() || req.port == 0 {
            return ToolResult::failure(&ToolError::InvalidRequest(
                "host and a non-zero port are required".to_string(),
            ));
        }
        let timeout_ms = req.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        info!(
            "Connecting to {}:{} with timeout {}ms",
            req.host, req.port, timeout_ms
        );
        let credentials = Credentials {
            username: req.username,
            password: req.password,
            enable_password: req.enable_password,
        };
        match self
            .registry
            .connect(
                req.host.clone(),
                req.port,
                credentials,
                Some(Duration::from_millis(timeout_ms)),
            )
            .await
        {
            Ok((session, mode)) => ToolResult {
                success: true,
                session_id: Some(session.id().to_string()),
                device_mode: Some(mode.as_prompt_str().to_string()),
                message: Some(format!("connected to {}:{}", req.host, req.port)),
                ..Default::default()
            },
            Err(err) => {
                error!("Connect to {}:{} failed: {}", req.host, req.port, err);
                ToolResult::failure(&err.into())
            }
        }
    }

    pub async fn execute(&self, req: ExecuteRequest) -> ToolResult {
        info!(
            "Executing on session {}: {:?}",
            req.session_id, req.command
        );
        let wait = req.wait_ms.map(Duration::from_millis);
        let output = match self
            .registry
            .execute(&req.session_id, &req.command, wait)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                error!("Execute on session {} failed: {}", req.session_id, err);
                return ToolResult::failure(&err.into());
            }
        };

        let mut result = ToolResult {
            success: true,
            output: Some(output.output),
            device_mode: Some(output.mode.as_prompt_str().to_string()),
            ..Default::default()
        };
        match output.outcome {
            Outcome::Complete => {}
            Outcome::AwaitingInput => {
                result.awaiting_input = Some(true);
                result.message = Some("device is waiting for input".to_string());
            }
            Outcome::TimedOut | Outcome::PagerLimit => {
                warn!(
                    "Command on session {} ended {:?}, returning partial output",
                    req.session_id, output.outcome
                );
                result.success = false;
                result.error_kind = Some(ErrorKind::TimedOut);
                result.message = Some(match output.outcome {
                    Outcome::PagerLimit => format!(
                        "pager continuation limit reached after {} pages; output is partial",
                        output.pager_continuations
                    ),
                    _ => "command did not complete before the wait expired; output is partial"
                        .to_string(),
                });
            }
        }
        result
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    pub async fn disconnect(&self, req: DisconnectRequest) -> ToolResult {
        info!("Disconnecting session {}", req.session_id);
        match self.registry.disconnect(&req.session_id).await {
            Ok(()) => ToolResult {
                success: true,
                session_id: Some(req.session_id.clone()),
                message: Some(format!("session {} disconnected", req.session_id)),
                ..Default::default()
            },
            Err(err) => ToolResult::failure(&err.into()),
        }
    }

    /// Dispatches a raw JSON tool call by name.
    pub async fn call(&self, name: &str, args: Value) -> Value {
        let args = if args.is_null() {
            Value::Object(Default::default())
        } else {
            args
        };
        let result = match name {
            TOOL_CONNECT => match serde_json::from_value(args) {
                Ok(req) => self.connect(req).await,
                Err(e) => invalid(e),
            },
            TOOL_EXECUTE => match serde_json::from_value(args) {
                Ok(req) => self.execute(req).await,
                Err(e) => invalid(e),
            },
            TOOL_DISCONNECT => match serde_json::from_value(args) {
                Ok(req) => self.disconnect(req).await,
                Err(e) => invalid(e),
            },
            TOOL_LIST_SESSIONS => {
                return serde_json::to_value(self.list_sessions()).unwrap_or(Value::Null);
            }
            other => ToolResult::failure(&ToolError::InvalidRequest(format!(
                "unknown tool {other}"
            ))),
        };
        serde_json::to_value(result).unwrap_or(Value::Null)
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

fn invalid(err: serde_json::Error) -> ToolResult {
    ToolResult::failure(&ToolError::InvalidRequest(err.to_string()))
}
