//! The seam between the relay and the agent process.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::QueryContext;

/// Everything needed to start one agent run.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Prompt for the agent.
    pub prompt: String,
    /// IDE session id.
    pub session_id: Option<String>,
    /// Working directory; the relay's own when absent.
    pub working_dir: Option<PathBuf>,
    /// Environment overlay merged over the ambient environment.
    pub env: HashMap<String, String>,
    /// Optional agent mode.
    pub mode: Option<String>,
}

impl LaunchRequest {
    /// Build a request from a consumed query context and its validated prompt.
    #[must_use]
    pub fn from_context(prompt: String, ctx: QueryContext) -> Self {
        Self {
            prompt,
            session_id: ctx.session_id,
            working_dir: ctx.working_dir,
            env: ctx.env,
            mode: ctx.mode,
        }
    }
}

/// Output produced by a running agent, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// One complete stdout line.
    Stdout(String),
    /// A debug-marked diagnostic line.
    Debug(String),
    /// A diagnostic line that should reach the client as an error.
    Error(String),
    /// The process exited. Always the last event of a run.
    Exited { code: i32 },
}

/// Control request delivered to the process supervisor.
#[derive(Debug)]
pub enum AgentControl {
    /// Stop the process (SIGSTOP).
    Suspend(oneshot::Sender<std::io::Result<()>>),
    /// Continue a stopped process (SIGCONT).
    Resume(oneshot::Sender<std::io::Result<()>>),
    /// Terminate the process (SIGTERM, escalating to SIGKILL).
    Terminate(oneshot::Sender<std::io::Result<()>>),
}

/// Control error.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("agent process has already exited")]
    Exited,
    #[error("failed to signal agent process: {0}")]
    Signal(#[from] std::io::Error),
}

/// Handle to a running agent.
///
/// Dropping the handle does not stop the process.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pid: Option<u32>,
    control: mpsc::Sender<AgentControl>,
}

impl AgentHandle {
    /// Wrap a supervisor's control channel.
    #[must_use]
    pub const fn new(pid: Option<u32>, control: mpsc::Sender<AgentControl>) -> Self {
        Self { pid, control }
    }

    /// OS process id, if known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Suspend the process.
    ///
    /// # Errors
    /// Returns error if the process is gone or the signal fails.
    pub async fn suspend(&self) -> Result<(), ControlError> {
        self.request(AgentControl::Suspend).await
    }

    /// Continue a suspended process.
    ///
    /// # Errors
    /// Returns error if the process is gone or the signal fails.
    pub async fn resume(&self) -> Result<(), ControlError> {
        self.request(AgentControl::Resume).await
    }

    /// Terminate the process.
    ///
    /// # Errors
    /// Returns error if the process is gone or the signal fails.
    pub async fn terminate(&self) -> Result<(), ControlError> {
        self.request(AgentControl::Terminate).await
    }

    async fn request(
        &self,
        make: fn(oneshot::Sender<std::io::Result<()>>) -> AgentControl,
    ) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(make(tx))
            .await
            .map_err(|_| ControlError::Exited)?;
        rx.await.map_err(|_| ControlError::Exited)??;
        Ok(())
    }
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command build error: {0}")]
    CommandBuild(String),
}

/// Starts agent processes.
///
/// Implementations stream every `AgentEvent` of the run into `events`, ending
/// with exactly one `AgentEvent::Exited`.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Spawn an agent for one query.
    async fn launch(
        &self,
        request: LaunchRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<AgentHandle, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_round_trip() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = AgentHandle::new(Some(7), tx);

        let supervisor = tokio::spawn(async move {
            match rx.recv().await {
                Some(AgentControl::Suspend(reply)) => reply.send(Ok(())).unwrap(),
                other => panic!("unexpected control: {other:?}"),
            }
        });

        handle.suspend().await.unwrap();
        supervisor.await.unwrap();
        assert_eq!(handle.pid(), Some(7));
    }

    #[tokio::test]
    async fn test_control_after_supervisor_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = AgentHandle::new(None, tx);
        assert!(matches!(handle.resume().await, Err(ControlError::Exited)));
    }

    #[tokio::test]
    async fn test_signal_failure_is_reported() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = AgentHandle::new(None, tx);
        tokio::spawn(async move {
            if let Some(AgentControl::Suspend(reply)) = rx.recv().await {
                let _ = reply.send(Err(std::io::Error::other("ESRCH")));
            }
        });

        let err = handle.suspend().await.unwrap_err();
        assert!(matches!(err, ControlError::Signal(_)));
        assert!(err.to_string().contains("ESRCH"));
    }

    #[test]
    fn test_launch_request_from_context() {
        let ctx = QueryContext {
            session_id: Some("s-1".into()),
            mode: Some("plan".into()),
            ..QueryContext::with_prompt("ignored").env("A", "1")
        };
        let request = LaunchRequest::from_context("do it".into(), ctx);
        assert_eq!(request.prompt, "do it");
        assert_eq!(request.session_id.as_deref(), Some("s-1"));
        assert_eq!(request.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(request.mode.as_deref(), Some("plan"));
    }
}
