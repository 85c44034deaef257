//! Agent process launcher and supervisor.

use std::{
    process::{ExitStatus, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild, Signal, UnixChildExt};
use relay_core::{
    AgentControl, AgentEvent, AgentHandle, AgentLauncher, ExecutorError, LaunchRequest,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};

use crate::{CommandBuilder, LineSplitter, StderrClass, StderrFilter};

const READ_CHUNK: usize = 8 * 1024;

/// How long output readers may lag behind process exit before they are dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for spawning the agent.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent command line, without the prompt.
    pub command: CommandBuilder,
    /// Flag placed before the prompt argument, if any.
    pub prompt_flag: Option<String>,
    /// Stderr classification rules.
    pub stderr: StderrFilter,
    /// Time between SIGTERM and SIGKILL when terminating.
    pub terminate_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: CommandBuilder::new("claude").params([
                "--output-format",
                "stream-json",
                "--verbose",
            ]),
            prompt_flag: Some("-p".to_owned()),
            stderr: StderrFilter::default(),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

/// Spawns the agent binary in its own process group.
///
/// Signals go to the whole group, so tools the agent started are stopped,
/// continued and terminated along with it.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: ExecutorConfig,
}

impl ProcessLauncher {
    /// Create a launcher.
    #[must_use]
    pub const fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Launcher configuration.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<AgentHandle, ExecutorError> {
        let parts = self
            .config
            .command
            .build_for_prompt(self.config.prompt_flag.as_deref(), &request.prompt)
            .map_err(|e| ExecutorError::CommandBuild(e.to_string()))?;
        let (program, args) = parts
            .into_resolved()
            .await
            .map_err(|e| ExecutorError::ExecutableNotFound(e.to_string()))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(session_id) = &request.session_id {
            cmd.env("SESSION_ID", session_id);
        }
        if let Some(mode) = &request.mode {
            cmd.env("AGENT_MODE", mode);
        }
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        tracing::info!(
            program = %program.display(),
            working_dir = ?request.working_dir,
            session_id = ?request.session_id,
            env_overlay = request.env.len(),
            "Spawning agent process"
        );
        let mut child = cmd
            .group_spawn()
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        let (Some(stdout), Some(stderr)) =
            (child.inner().stdout.take(), child.inner().stderr.take())
        else {
            if let Err(e) = child.kill().await {
                tracing::warn!(pid, "Failed to kill agent after pipe setup failure: {e}");
            }
            return Err(ExecutorError::SpawnFailed(
                "failed to capture agent output pipes".to_owned(),
            ));
        };

        let readers = [
            tokio::spawn(pump_stdout(stdout, events.clone())),
            tokio::spawn(pump_stderr(stderr, self.config.stderr.clone(), events.clone())),
        ];
        let (control_tx, control_rx) = mpsc::channel(8);
        tokio::spawn(supervise(
            child,
            control_rx,
            readers,
            events,
            self.config.terminate_timeout,
        ));

        Ok(AgentHandle::new(pid, control_tx))
    }
}

async fn read_lines<R, F>(mut reader: R, stream: &'static str, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut splitter = LineSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => splitter.push(&chunk[..n]).into_iter().for_each(&mut on_line),
            Err(e) => {
                tracing::warn!(stream, "Failed to read agent output: {e}");
                break;
            }
        }
    }
    if let Some(tail) = splitter.finish() {
        on_line(tail);
    }
}

async fn pump_stdout<R>(reader: R, events: mpsc::UnboundedSender<AgentEvent>)
where
    R: AsyncRead + Unpin,
{
    read_lines(reader, "stdout", |line| {
        tracing::trace!(%line, "agent stdout");
        let _ = events.send(AgentEvent::Stdout(line));
    })
    .await;
}

async fn pump_stderr<R>(reader: R, filter: StderrFilter, events: mpsc::UnboundedSender<AgentEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut stream = filter.stream();
    read_lines(reader, "stderr", |line| match stream.classify(&line) {
        StderrClass::Debug(text) => {
            tracing::debug!(%text, "agent debug output");
            if filter.forward_debug {
                let _ = events.send(AgentEvent::Debug(text));
            }
        }
        StderrClass::Error(text) => {
            tracing::warn!(%text, "agent stderr");
            let _ = events.send(AgentEvent::Error(text));
        }
        StderrClass::Suppressed => tracing::trace!(%line, "suppressed agent stderr"),
    })
    .await;
}

async fn supervise(
    mut child: AsyncGroupChild,
    mut control: mpsc::Receiver<AgentControl>,
    readers: [JoinHandle<()>; 2],
    events: mpsc::UnboundedSender<AgentEvent>,
    terminate_timeout: Duration,
) {
    let pid = child.id();
    let mut kill_at: Option<Instant> = None;
    let mut control_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = control.recv(), if control_open => match request {
                Some(request) => {
                    if handle_control(&child, request) {
                        kill_at.get_or_insert_with(|| Instant::now() + terminate_timeout);
                    }
                }
                None => control_open = false,
            },
            () = deadline(kill_at) => {
                tracing::warn!(pid, "Agent still running after SIGTERM, killing process group");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(pid, "Failed to kill agent: {e}");
                }
                kill_at = None;
            }
        }
    };
    // Late control requests now fail with `ControlError::Exited`.
    drop(control);

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::error!(pid, "Failed to wait for agent process: {e}");
            -1
        }
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
            tracing::warn!(pid, "Agent output pipe still open after exit, dropping reader");
            abort.abort();
        }
    }

    tracing::info!(pid, code, "Agent process exited");
    let _ = events.send(AgentEvent::Exited { code });
}

/// Apply one control request. Returns true when termination was requested.
fn handle_control(child: &AsyncGroupChild, request: AgentControl) -> bool {
    match request {
        AgentControl::Suspend(reply) => {
            let _ = reply.send(child.signal(Signal::SIGSTOP));
            false
        }
        AgentControl::Resume(reply) => {
            let _ = reply.send(child.signal(Signal::SIGCONT));
            false
        }
        AgentControl::Terminate(reply) => {
            let result = child.signal(Signal::SIGTERM);
            // A stopped process only acts on SIGTERM once continued.
            let _ = child.signal(Signal::SIGCONT);
            let _ = reply.send(result);
            true
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use relay_core::ControlError;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn sh_launcher(configure: impl FnOnce(&mut ExecutorConfig)) -> ProcessLauncher {
        let mut config = ExecutorConfig {
            command: CommandBuilder::new("sh").params(["-c"]),
            prompt_flag: None,
            ..ExecutorConfig::default()
        };
        configure(&mut config);
        ProcessLauncher::new(config)
    }

    fn script(script: &str) -> LaunchRequest {
        LaunchRequest {
            prompt: script.to_owned(),
            ..LaunchRequest::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<AgentEvent>) -> AgentEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for agent event")
            .expect("event channel closed")
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(&mut rx).await;
            let done = matches!(event, AgentEvent::Exited { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_streams_lines_and_flushes_tail() {
        let (tx, rx) = mpsc::unbounded_channel();
        sh_launcher(|_| {})
            .launch(script("printf 'one\\ntwo\\nthree'; exit 3"), tx)
            .await
            .unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                AgentEvent::Stdout("one".into()),
                AgentEvent::Stdout("two".into()),
                AgentEvent::Stdout("three".into()),
                AgentEvent::Exited { code: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_environment_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let request = LaunchRequest {
            prompt: r#"echo "$MSG_ID|$SESSION_ID|$AGENT_MODE"; pwd"#.to_owned(),
            session_id: Some("s-9".into()),
            working_dir: Some(dir.path().to_path_buf()),
            env: HashMap::from([("MSG_ID".to_owned(), "m-1".to_owned())]),
            mode: Some("plan".into()),
        };
        sh_launcher(|_| {}).launch(request, tx).await.unwrap();

        let events = collect(rx).await;
        assert_eq!(events[0], AgentEvent::Stdout("m-1|s-9|plan".into()));
        let AgentEvent::Stdout(cwd) = &events[1] else {
            panic!("expected pwd output, got {events:?}");
        };
        assert_eq!(
            std::fs::canonicalize(cwd).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(events[2], AgentEvent::Exited { code: 0 });
    }

    #[tokio::test]
    async fn test_stderr_is_classified() {
        let (tx, rx) = mpsc::unbounded_channel();
        sh_launcher(|c| c.stderr.forward_debug = true)
            .launch(
                script(
                    "echo '[DEBUG] warming up' >&2; \
                     echo '(node:1) ExperimentalWarning: fetch' >&2; \
                     echo '/opt/agent/cli.js:7' >&2; \
                     echo '  throw err;' >&2; \
                     echo '  ^' >&2; \
                     echo 'Error: boom' >&2; \
                     echo '    at main (cli.js:1:1)' >&2",
                ),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                AgentEvent::Debug("[DEBUG] warming up".into()),
                AgentEvent::Error("Error: boom".into()),
                AgentEvent::Exited { code: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_debug_not_forwarded_by_default() {
        let (tx, rx) = mpsc::unbounded_channel();
        sh_launcher(|_| {})
            .launch(script("echo '[DEBUG] quiet' >&2"), tx)
            .await
            .unwrap();
        assert_eq!(collect(rx).await, vec![AgentEvent::Exited { code: 0 }]);
    }

    #[tokio::test]
    async fn test_suspend_resume_terminate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = sh_launcher(|_| {})
            .launch(script("echo ready; while :; do sleep 0.05; done"), tx)
            .await
            .unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(next_event(&mut rx).await, AgentEvent::Stdout("ready".into()));

        assert_ok!(handle.suspend().await);
        assert_ok!(handle.resume().await);
        // Terminating a stopped agent must still end it.
        assert_ok!(handle.suspend().await);
        assert_ok!(handle.terminate().await);

        assert_eq!(next_event(&mut rx).await, AgentEvent::Exited { code: 143 });
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = sh_launcher(|c| c.terminate_timeout = Duration::from_millis(200))
            .launch(
                script("trap '' TERM; echo ready; while :; do sleep 0.05; done"),
                tx,
            )
            .await
            .unwrap();
        assert_eq!(next_event(&mut rx).await, AgentEvent::Stdout("ready".into()));

        assert_ok!(handle.terminate().await);
        assert_eq!(next_event(&mut rx).await, AgentEvent::Exited { code: 137 });
    }

    #[tokio::test]
    async fn test_control_after_exit_reports_exited() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = sh_launcher(|_| {}).launch(script("exit 0"), tx).await.unwrap();
        assert_eq!(next_event(&mut rx).await, AgentEvent::Exited { code: 0 });

        let err = assert_err!(handle.suspend().await);
        assert!(matches!(err, ControlError::Exited));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launcher = ProcessLauncher::new(ExecutorConfig {
            command: CommandBuilder::new("definitely-not-a-real-agent-xyz"),
            ..ExecutorConfig::default()
        });
        let err = assert_err!(launcher.launch(script("hi"), tx).await);
        assert!(matches!(err, ExecutorError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_working_dir_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = LaunchRequest {
            working_dir: Some(dir.path().join("gone")),
            ..script("echo hi")
        };
        let err = assert_err!(sh_launcher(|_| {}).launch(request, tx).await);
        assert!(matches!(err, ExecutorError::SpawnFailed(_)));
    }
}
