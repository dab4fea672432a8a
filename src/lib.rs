//! # rtelnet - Telnet Session Engine for Cisco-style Network Devices
//!
//! `rtelnet` keeps stateful telnet sessions to routers and switches and runs
//! CLI commands on them. It decides when a command has finished by watching
//! for the device prompt instead of sleeping for a fixed time, tracks the
//! device mode from that prompt, and answers pagination markers on its own.
//!
//! ## Features
//!
//! - **Prompt-driven completion**: a command returns the moment the prompt
//!   comes back, bounded by a per-command wait budget
//! - **Mode tracking**: user, privileged, global config and sub-config modes
//!   are derived from the last prompt line
//! - **Long-running commands**: `ping`, `traceroute` and friends get an
//!   extended wait floor automatically
//! - **Pagination**: `--More--` markers are answered and stripped from output
//! - **Concurrent sessions**: commands on one session are serialised, sessions
//!   never block each other, and disconnect interrupts an in-flight command
//! - **Tool façade**: JSON in, JSON out, for agent tool-calling frameworks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use rtelnet::session::{Credentials, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = SessionRegistry::default();
//!
//!     let (session, mode) = registry
//!         .connect(
//!             "192.168.1.1".to_string(),
//!             23,
//!             Credentials::default(),
//!             Some(Duration::from_secs(5)),
//!         )
//!         .await?;
//!     println!("connected at {mode}");
//!
//!     let result = registry
//!         .execute(session.id(), "show ip interface brief", None)
//!         .await?;
//!     println!("{}", result.output);
//!
//!     registry.disconnect(session.id()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`session::SessionRegistry`] - Table of live sessions keyed by id
//! - [`session::Session`] - One device connection and its wait loop
//! - [`device::PromptMatcher`] - Prompt, question and pager recognition
//! - [`tools::ToolFacade`] - The four JSON tools over the registry
//! - [`config`] - Session defaults and wait policy

pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod tools;

pub use config::{SessionConfig, WaitPolicy};
pub use device::DeviceMode;
pub use error::{ConnectError, ErrorKind, ExecError, ToolError, TransportError};
pub use session::{CommandOutput, Credentials, Outcome, Session, SessionInfo, SessionRegistry};
pub use tools::ToolFacade;
