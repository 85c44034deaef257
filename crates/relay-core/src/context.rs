//! One-shot query context handed over by the orchestrator.

use std::{
    collections::HashMap,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, time::Instant};

/// Query context written by the orchestrator before it opens a client
/// connection to this container.
///
/// The environment overlay may carry credentials, so the file holding it is
/// deleted as soon as it has been read and `Debug` never prints overlay values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    /// Prompt for the agent.
    #[serde(default)]
    pub prompt: Option<String>,

    /// IDE session this query belongs to.
    #[serde(default)]
    pub session_id: Option<String>,

    /// Working directory for the agent process.
    #[serde(default, rename = "cwd")]
    pub working_dir: Option<PathBuf>,

    /// Environment overlay merged over the relay's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Optional agent mode.
    #[serde(default)]
    pub mode: Option<String>,
}

impl QueryContext {
    /// Create a context carrying only a prompt.
    #[must_use]
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Set an environment overlay entry.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The prompt, if present and not blank.
    #[must_use]
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|p| !p.trim().is_empty())
    }

    /// Message correlation id stored under `key` in the environment overlay.
    ///
    /// The id names a file on disk, so anything that is not a plain token is
    /// rejected and treated as absent.
    #[must_use]
    pub fn correlation_id(&self, key: &str) -> Option<&str> {
        let id = self.env.get(key)?.as_str();
        if is_plain_token(id) {
            Some(id)
        } else {
            tracing::warn!(key, "Ignoring malformed message correlation id");
            None
        }
    }
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut env_keys: Vec<&str> = self.env.keys().map(String::as_str).collect();
        env_keys.sort_unstable();
        f.debug_struct("QueryContext")
            .field("prompt_len", &self.prompt.as_ref().map(String::len))
            .field("session_id", &self.session_id)
            .field("working_dir", &self.working_dir)
            .field("env_keys", &env_keys)
            .field("mode", &self.mode)
            .finish()
    }
}

fn is_plain_token(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Context handoff error.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to read query context: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write query context: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to parse query context: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("query context did not arrive within {0:?}")]
    Timeout(Duration),
}

/// Filesystem location the orchestrator deposits query contexts into.
#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    /// Create a store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the handoff file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a context is currently waiting to be consumed.
    pub async fn is_pending(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Read and delete the pending context.
    ///
    /// The file is removed before parsing so a malformed payload is not left
    /// behind either.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub async fn take(&self) -> Result<Option<QueryContext>, ContextError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                self.remove().await;
                return Err(ContextError::Read(e));
            }
        };
        self.remove().await;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Delete a pending context without reading it.
    ///
    /// Returns true if a file was removed.
    pub async fn discard(&self) -> bool {
        match fs::remove_file(&self.path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to discard query context: {e}");
                false
            }
        }
    }

    /// Wait until a context is pending, checking every `interval`.
    ///
    /// # Errors
    /// Returns `ContextError::Timeout` if nothing shows up within `budget`.
    pub async fn wait_for(&self, interval: Duration, budget: Duration) -> Result<(), ContextError> {
        let deadline = Instant::now() + budget;
        loop {
            if self.is_pending().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ContextError::Timeout(budget));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Write a context the way the orchestrator does: to a temporary file
    /// that is then renamed into place, so readers never see a partial file.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub async fn put(&self, ctx: &QueryContext) -> Result<(), ContextError> {
        let json = serde_json::to_vec(ctx)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(ContextError::Write)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).await.map_err(ContextError::Write)?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(ContextError::Write)
    }

    async fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to delete query context: {e}");
            }
        }
    }
}
