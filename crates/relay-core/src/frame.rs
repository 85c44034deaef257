//! Wire protocol frames exchanged with the browser client.

use serde::{Deserialize, Serialize};

/// Why a query ended, carried on every `process-exit` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    /// The agent process exited on its own.
    ChildExit,
    /// The agent process could not be started.
    SpawnError,
    /// The query context existed but could not be read.
    ContextReadError,
    /// The query context carried no prompt.
    NoPrompt,
    /// No query context arrived within the poll budget.
    ContextTimeout,
}

/// Build identity reported once per connection for client-side troubleshooting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub sdk_version: String,
    pub cli_version: String,
    pub build_date: String,
    pub runtime_version: String,
}

impl SystemInfo {
    /// Identity of this relay build, paired with the agent CLI version.
    #[must_use]
    pub fn current(cli_version: impl Into<String>) -> Self {
        Self {
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
            cli_version: cli_version.into(),
            build_date: option_env!("RELAY_BUILD_DATE")
                .unwrap_or("unknown")
                .to_owned(),
            runtime_version: option_env!("RELAY_RUSTC_VERSION")
                .unwrap_or("unknown")
                .to_owned(),
        }
    }
}

/// Frame sent from the relay to the client.
///
/// Raw agent output lines are forwarded verbatim and are not represented here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Connected,
    SystemInfo(SystemInfo),
    /// Agent diagnostic output, only sent when debug forwarding is enabled.
    Stderr { text: String },
    Error { error: String },
    ReplayComplete { replayed_chunks: usize },
    Paused,
    PauseFailed { error: String },
    Resumed,
    ResumeFailed { error: String },
    /// Keepalive.
    Ping,
    ProcessExit { exit_code: i32, reason: ExitReason },
}

impl ServerFrame {
    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frame sent from the client to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Suspend the running agent.
    Pause,
    /// Continue a suspended agent.
    Resume,
    /// Reply to a keepalive ping.
    Pong,
}

impl ClientFrame {
    /// Parse a client text message.
    ///
    /// # Errors
    /// Returns error if the text is not a known frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Message queued for delivery to one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame.
    Text(String),
    /// Close the connection from the relay side.
    Close,
}
