//! Relay configuration.

use std::{path::PathBuf, time::Duration};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where the orchestrator deposits the query context.
    pub context_file: PathBuf,
    /// Directory holding replay buffers.
    pub buffer_dir: PathBuf,
    /// Environment overlay key carrying the message correlation id.
    pub correlation_key: String,
    /// How often the context file is checked for.
    pub context_poll_interval: Duration,
    /// How long a fresh connection waits for the context file.
    pub context_timeout: Duration,
    /// How long a running agent survives without a client.
    pub grace_period: Duration,
    /// How long the relay stays up with no clients and no agent.
    pub idle_timeout: Duration,
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// Age after which retained replay buffers are deleted.
    pub buffer_ttl: Duration,
    /// Agent CLI version reported in `system-info`.
    pub cli_version: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            context_file: PathBuf::from("/tmp/relay/query-context.json"),
            buffer_dir: PathBuf::from("/tmp/relay/buffers"),
            correlation_key: "MSG_ID".to_owned(),
            context_poll_interval: Duration::from_millis(50),
            context_timeout: Duration::from_secs(6),
            grace_period: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(15 * 60),
            keepalive_interval: Duration::from_secs(25),
            buffer_ttl: Duration::from_secs(24 * 60 * 60),
            cli_version: "unknown".to_owned(),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn with_context_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.context_file = path.into();
        self
    }

    #[must_use]
    pub fn with_buffer_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.buffer_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = key.into();
        self
    }

    /// Set the context poll interval and overall budget.
    #[must_use]
    pub const fn with_context_poll(mut self, interval: Duration, timeout: Duration) -> Self {
        self.context_poll_interval = interval;
        self.context_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    #[must_use]
    pub const fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_buffer_ttl(mut self, ttl: Duration) -> Self {
        self.buffer_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_cli_version(mut self, version: impl Into<String>) -> Self {
        self.cli_version = version.into();
        self
    }
}
