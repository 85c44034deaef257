//! The relay actor.
//!
//! One task owns all relay state: the agent run, the client link, the replay
//! buffer and the timers. Connections, timers, the context poll and the agent
//! supervisor only send it events, so everything below runs one event at a
//! time and output reaches the client in the order the agent produced it.

use std::{collections::HashMap, fmt, sync::Arc};

use relay_core::{
    AgentEvent, AgentHandle, AgentLauncher, ClientFrame, ContextError, ContextStore, ExitReason,
    LaunchRequest, Outbound, ReplayBuffer, ServerFrame, SystemInfo, replay,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    RelayConfig,
    timers::{Timer, spawn_keepalive},
};

const CONTEXT_TIMEOUT_MESSAGE: &str = "sandbox still warming up, retry";

/// Relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is no longer running")]
    Stopped,
}

/// Identifies one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the agent is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Running,
    Paused,
}

/// Snapshot of relay state, published after every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    #[serde(rename = "status")]
    pub state: AgentState,
    pub attached_clients: usize,
    pub client_linked: bool,
}

/// A client attached to the relay.
///
/// Everything the relay sends this client arrives on `outbound`.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ClientId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

#[derive(Debug)]
enum RelayEvent {
    Connect {
        id: ClientId,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Message {
        id: ClientId,
        text: String,
    },
    Disconnect {
        id: ClientId,
    },
    ContextReady {
        poll: u64,
        result: Result<(), ContextError>,
    },
    GraceExpired {
        generation: u64,
    },
    IdleFired {
        generation: u64,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Handle for talking to a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<RelayEvent>,
    status: watch::Receiver<RelayStatus>,
    shutdown: watch::Receiver<bool>,
}

impl RelayHandle {
    /// Attach a new client.
    ///
    /// # Errors
    /// Returns error if the relay has stopped.
    pub fn connect(&self) -> Result<ClientConnection, RelayError> {
        let id = ClientId::new();
        let (outbound, rx) = mpsc::unbounded_channel();
        self.send(RelayEvent::Connect { id, outbound })?;
        Ok(ClientConnection { id, outbound: rx })
    }

    /// Deliver a text frame received from a client.
    ///
    /// # Errors
    /// Returns error if the relay has stopped.
    pub fn message(&self, id: ClientId, text: impl Into<String>) -> Result<(), RelayError> {
        self.send(RelayEvent::Message {
            id,
            text: text.into(),
        })
    }

    /// Report that a client's connection is gone.
    ///
    /// # Errors
    /// Returns error if the relay has stopped.
    pub fn disconnect(&self, id: ClientId) -> Result<(), RelayError> {
        self.send(RelayEvent::Disconnect { id })
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Resolves once the idle watchdog asks for the process to exit, or the
    /// relay stops.
    pub async fn shutdown_requested(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|requested| *requested).await;
    }

    /// Stop the relay, terminating a live agent first.
    ///
    /// # Errors
    /// Returns error if the relay had already stopped.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let (ack, done) = oneshot::channel();
        self.send(RelayEvent::Stop { ack })?;
        done.await.map_err(|_| RelayError::Stopped)
    }

    fn send(&self, event: RelayEvent) -> Result<(), RelayError> {
        self.events.send(event).map_err(|_| RelayError::Stopped)
    }
}

struct Client {
    outbound: mpsc::UnboundedSender<Outbound>,
    keepalive: JoinHandle<()>,
    connected_at: Instant,
    last_pong: Option<Instant>,
}

struct ActiveRun {
    id: u64,
    handle: AgentHandle,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    buffer: Option<ReplayBuffer>,
    disconnected: bool,
    paused: bool,
}

struct PendingPoll {
    id: u64,
    client: ClientId,
    task: JoinHandle<()>,
}

/// The relay actor.
pub struct Relay {
    config: RelayConfig,
    launcher: Arc<dyn AgentLauncher>,
    store: ContextStore,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    clients: HashMap<ClientId, Client>,
    link: Option<ClientId>,
    run: Option<ActiveRun>,
    poll: Option<PendingPoll>,
    next_id: u64,
    grace: Timer,
    idle: Timer,
    status: watch::Sender<RelayStatus>,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    /// Create a relay and its handle. Drive it with [`Relay::run`].
    #[must_use]
    pub fn new(config: RelayConfig, launcher: Arc<dyn AgentLauncher>) -> (Self, RelayHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(RelayStatus::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = RelayHandle {
            events: events_tx.clone(),
            status: status_rx,
            shutdown: shutdown_rx,
        };
        let relay = Self {
            store: ContextStore::new(config.context_file.clone()),
            config,
            launcher,
            events_tx,
            events,
            clients: HashMap::new(),
            link: None,
            run: None,
            poll: None,
            next_id: 0,
            grace: Timer::default(),
            idle: Timer::default(),
            status,
            shutdown,
        };
        (relay, handle)
    }

    /// Create a relay and run it on a new task.
    #[must_use]
    pub fn spawn(config: RelayConfig, launcher: Arc<dyn AgentLauncher>) -> RelayHandle {
        let (relay, handle) = Self::new(config, launcher);
        tokio::spawn(relay.run());
        handle
    }

    /// Process events until stopped.
    pub async fn run(mut self) {
        tracing::info!(
            context_file = %self.config.context_file.display(),
            buffer_dir = %self.config.buffer_dir.display(),
            "Relay started"
        );
        self.evict_stale_buffers().await;
        self.arm_idle();

        let ack = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(RelayEvent::Stop { ack }) => {
                        self.stop().await;
                        break Some(ack);
                    }
                    Some(event) => self.handle(event).await,
                    None => break None,
                },
                event = next_agent_event(&mut self.run) => self.on_agent_event(event).await,
            }
            self.publish_status();
        };
        // Acknowledge only once the event queue is gone, so later calls on
        // any handle fail with `RelayError::Stopped`.
        drop(self);
        tracing::info!("Relay stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connect { id, outbound } => self.on_connect(id, outbound).await,
            RelayEvent::Message { id, text } => self.on_message(id, &text).await,
            RelayEvent::Disconnect { id } => self.on_disconnect(id),
            RelayEvent::ContextReady { poll, result } => self.on_context_ready(poll, result).await,
            RelayEvent::GraceExpired { generation } => self.on_grace_expired(generation).await,
            RelayEvent::IdleFired { generation } => self.on_idle_fired(generation),
            RelayEvent::Stop { .. } => {}
        }
    }

    async fn on_connect(&mut self, id: ClientId, outbound: mpsc::UnboundedSender<Outbound>) {
        self.idle.cancel();
        let keepalive = spawn_keepalive(self.config.keepalive_interval, outbound.clone());
        self.clients.insert(
            id,
            Client {
                outbound,
                keepalive,
                connected_at: Instant::now(),
                last_pong: None,
            },
        );
        tracing::info!(client = %id, attached = self.clients.len(), "Client connected");

        self.send_frame(id, &ServerFrame::Connected);
        self.send_frame(
            id,
            &ServerFrame::SystemInfo(SystemInfo::current(self.config.cli_version.clone())),
        );

        if self.run.is_some() {
            self.reattach(id).await;
        } else {
            self.begin_query(id).await;
        }
    }

    /// Hand a running agent over to a reconnecting client.
    async fn reattach(&mut self, id: ClientId) {
        if self.grace.is_armed() {
            self.grace.cancel();
            tracing::info!(client = %id, "Client reconnected within grace period");
        }
        if self.store.discard().await {
            tracing::info!("Discarded query context left over from before reconnect");
        }

        let lines = match self.run.as_ref().and_then(|run| run.buffer.as_ref()) {
            Some(buffer) => buffer.read_lines().await.unwrap_or_else(|e| {
                tracing::warn!("Failed to read replay buffer: {e}");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let replayed_chunks = lines.len();
        for line in lines {
            self.send_raw(id, line);
        }
        self.send_frame(id, &ServerFrame::ReplayComplete { replayed_chunks });

        if let Some(previous) = self.link.replace(id).filter(|previous| *previous != id) {
            tracing::debug!(client = %id, %previous, "Client link moved to newer connection");
        }
        tracing::info!(client = %id, replayed_chunks, "Client reattached to running agent");
    }

    /// Link the client and wait for the orchestrator's query context.
    async fn begin_query(&mut self, id: ClientId) {
        self.link = Some(id);
        if let Some(stale) = self.poll.take() {
            stale.task.abort();
            tracing::info!(
                client = %stale.client,
                "Newer connection superseded pending context poll"
            );
            self.reject_waiting(stale.client);
        }
        self.evict_stale_buffers().await;

        let poll = self.next_id();
        let store = self.store.clone();
        let events = self.events_tx.clone();
        let interval = self.config.context_poll_interval;
        let budget = self.config.context_timeout;
        let task = tokio::spawn(async move {
            let result = store.wait_for(interval, budget).await;
            let _ = events.send(RelayEvent::ContextReady { poll, result });
        });
        self.poll = Some(PendingPoll {
            id: poll,
            client: id,
            task,
        });
        tracing::debug!(client = %id, ?budget, "Waiting for query context");
    }

    async fn on_context_ready(&mut self, poll: u64, result: Result<(), ContextError>) {
        let Some(pending) = self.poll.take_if(|pending| pending.id == poll) else {
            tracing::debug!(poll, "Ignoring result of superseded context poll");
            return;
        };
        let client = pending.client;
        match result {
            Ok(()) => self.start_query(client).await,
            Err(e) => {
                tracing::warn!(client = %client, "{e}");
                self.reject_waiting(client);
            }
        }
    }

    /// End a connection whose query never started; the client should retry.
    fn reject_waiting(&self, client: ClientId) {
        self.send_frame(
            client,
            &ServerFrame::Error {
                error: CONTEXT_TIMEOUT_MESSAGE.to_owned(),
            },
        );
        self.send_exit(client, 1, ExitReason::ContextTimeout);
        self.send(client, Outbound::Close);
    }

    async fn start_query(&mut self, client: ClientId) {
        let ctx = match self.store.take().await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                tracing::warn!("Query context vanished before it could be read");
                self.fail_query(
                    client,
                    "query context disappeared before it could be read",
                    ExitReason::ContextReadError,
                );
                return;
            }
            Err(e) => {
                tracing::error!("{e}");
                self.fail_query(client, &e.to_string(), ExitReason::ContextReadError);
                return;
            }
        };
        tracing::debug!(?ctx, "Consumed query context");

        let Some(prompt) = ctx.prompt().map(str::to_owned) else {
            tracing::warn!("Query context carries no prompt");
            self.fail_query(client, "query context has no prompt", ExitReason::NoPrompt);
            return;
        };

        let correlation_id = ctx
            .correlation_id(&self.config.correlation_key)
            .map(str::to_owned);
        let buffer = match &correlation_id {
            Some(id) => match ReplayBuffer::create(&self.config.buffer_dir, id).await {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    tracing::warn!(correlation_id = %id, "Replay disabled for this query: {e}");
                    None
                }
            },
            None => {
                tracing::debug!("No message correlation id, replay disabled");
                None
            }
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let request = LaunchRequest::from_context(prompt, ctx);
        match self.launcher.launch(request, events_tx).await {
            Ok(handle) => {
                let id = self.next_id();
                tracing::info!(
                    run = id,
                    pid = ?handle.pid(),
                    correlation_id = ?correlation_id,
                    "Agent started"
                );
                self.run = Some(ActiveRun {
                    id,
                    handle,
                    events,
                    buffer,
                    disconnected: false,
                    paused: false,
                });
            }
            Err(e) => {
                tracing::error!("Failed to start agent: {e}");
                if let Some(buffer) = buffer {
                    remove_buffer(buffer).await;
                }
                self.fail_query(client, &e.to_string(), ExitReason::SpawnError);
            }
        }
    }

    fn fail_query(&self, client: ClientId, error: &str, reason: ExitReason) {
        self.send_frame(
            client,
            &ServerFrame::Error {
                error: error.to_owned(),
            },
        );
        self.send_exit(client, 1, reason);
    }

    async fn on_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Stdout(line) => {
                if let Some(buffer) = self.run.as_mut().and_then(|run| run.buffer.as_mut()) {
                    if let Err(e) = buffer.append(&line).await {
                        tracing::warn!("Failed to append to replay buffer: {e}");
                    }
                }
                if let Some(link) = self.link {
                    self.send_raw(link, line);
                }
            }
            AgentEvent::Debug(text) => self.send_linked(&ServerFrame::Stderr { text }),
            AgentEvent::Error(error) => self.send_linked(&ServerFrame::Error { error }),
            AgentEvent::Exited { code } => self.finish_run(code).await,
        }
    }

    async fn finish_run(&mut self, code: i32) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.grace.cancel();
        tracing::info!(run = run.id, code, "Agent exited");

        if let Some(buffer) = run.buffer {
            if run.disconnected {
                tracing::debug!(
                    path = %buffer.path().display(),
                    "Keeping replay buffer of run that saw a disconnect"
                );
            } else {
                remove_buffer(buffer).await;
            }
        }
        if let Some(link) = self.link {
            self.send_exit(link, code, ExitReason::ChildExit);
        }
    }

    async fn on_message(&mut self, id: ClientId, text: &str) {
        if !self.clients.contains_key(&id) {
            return;
        }
        match ClientFrame::parse(text) {
            Ok(ClientFrame::Pause) => self.pause(id).await,
            Ok(ClientFrame::Resume) => self.resume(id).await,
            Ok(ClientFrame::Pong) => {
                if let Some(client) = self.clients.get_mut(&id) {
                    let now = Instant::now();
                    let since_last = client.last_pong.map(|last| now - last);
                    client.last_pong = Some(now);
                    tracing::trace!(
                        client = %id,
                        ?since_last,
                        connected_for = ?(now - client.connected_at),
                        "pong"
                    );
                }
            }
            Err(e) => tracing::warn!(client = %id, "Ignoring malformed client frame: {e}"),
        }
    }

    async fn pause(&mut self, id: ClientId) {
        let Some(run) = self.run.as_mut() else {
            tracing::debug!("Ignoring pause, no agent running");
            return;
        };
        if run.paused {
            tracing::debug!("Ignoring pause, agent already paused");
            return;
        }
        let result = run.handle.suspend().await;
        run.paused = result.is_ok();
        let run_id = run.id;

        match result {
            Ok(()) => {
                tracing::info!(run = run_id, "Agent paused");
                self.send_frame(id, &ServerFrame::Paused);
            }
            Err(e) => {
                tracing::warn!(run = run_id, "Failed to pause agent: {e}");
                self.send_frame(id, &ServerFrame::PauseFailed { error: e.to_string() });
            }
        }
    }

    async fn resume(&mut self, id: ClientId) {
        let Some(run) = self.run.as_mut().filter(|run| run.paused) else {
            tracing::debug!("Ignoring resume, no paused agent");
            return;
        };
        let result = run.handle.resume().await;
        run.paused = result.is_err();
        let run_id = run.id;

        match result {
            Ok(()) => {
                tracing::info!(run = run_id, "Agent resumed");
                self.send_frame(id, &ServerFrame::Resumed);
            }
            Err(e) => {
                tracing::warn!(run = run_id, "Failed to resume agent: {e}");
                self.send_frame(id, &ServerFrame::ResumeFailed { error: e.to_string() });
            }
        }
    }

    fn on_disconnect(&mut self, id: ClientId) {
        let Some(client) = self.clients.remove(&id) else {
            return;
        };
        client.keepalive.abort();
        tracing::info!(client = %id, attached = self.clients.len(), "Client disconnected");

        if let Some(pending) = self.poll.take_if(|pending| pending.client == id) {
            pending.task.abort();
            tracing::info!(client = %id, "Client left before its query started");
        }

        if self.link == Some(id) {
            self.link = None;
            if let Some(run) = self.run.as_mut() {
                run.disconnected = true;
                let events = self.events_tx.clone();
                self.grace.arm(self.config.grace_period, move |generation| {
                    let _ = events.send(RelayEvent::GraceExpired { generation });
                });
                tracing::info!(
                    run = run.id,
                    grace = ?self.config.grace_period,
                    "Client link lost, agent keeps running"
                );
            }
        }

        self.arm_idle();
    }

    async fn on_grace_expired(&mut self, generation: u64) {
        if !self.grace.fired(generation) {
            return;
        }
        let Some(run) = self.run.take() else {
            return;
        };
        tracing::warn!(run = run.id, "No client reconnected within grace period, terminating agent");
        if let Err(e) = run.handle.terminate().await {
            tracing::warn!(run = run.id, "Failed to terminate agent: {e}");
        }
    }

    fn on_idle_fired(&mut self, generation: u64) {
        if !self.idle.fired(generation) {
            return;
        }
        if self.clients.is_empty() && self.run.is_none() {
            tracing::info!(idle = ?self.config.idle_timeout, "Relay idle, requesting shutdown");
            self.shutdown.send_replace(true);
        } else {
            tracing::debug!(
                attached = self.clients.len(),
                running = self.run.is_some(),
                "Relay busy at idle check, rescheduling"
            );
            self.arm_idle();
        }
    }

    async fn stop(&mut self) {
        if let Some(pending) = self.poll.take() {
            pending.task.abort();
        }
        if let Some(run) = self.run.take() {
            tracing::info!(run = run.id, "Terminating agent on relay stop");
            if let Err(e) = run.handle.terminate().await {
                tracing::warn!(run = run.id, "Failed to terminate agent: {e}");
            }
        }
        self.grace.cancel();
        self.idle.cancel();
        for (_, client) in self.clients.drain() {
            client.keepalive.abort();
            let _ = client.outbound.send(Outbound::Close);
        }
        self.link = None;
        self.publish_status();
        self.shutdown.send_replace(true);
    }

    fn arm_idle(&mut self) {
        let events = self.events_tx.clone();
        self.idle.arm(self.config.idle_timeout, move |generation| {
            let _ = events.send(RelayEvent::IdleFired { generation });
        });
    }

    async fn evict_stale_buffers(&self) {
        match replay::evict_stale(&self.config.buffer_dir, self.config.buffer_ttl).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Evicted stale replay buffers"),
            Err(e) => tracing::warn!("Failed to evict stale replay buffers: {e}"),
        }
    }

    fn publish_status(&self) {
        let status = RelayStatus {
            state: match &self.run {
                None => AgentState::Idle,
                Some(run) if run.paused => AgentState::Paused,
                Some(_) => AgentState::Running,
            },
            attached_clients: self.clients.len(),
            client_linked: self.link.is_some(),
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn send_linked(&self, frame: &ServerFrame) {
        if let Some(link) = self.link {
            self.send_frame(link, frame);
        }
    }

    fn send_exit(&self, client: ClientId, exit_code: i32, reason: ExitReason) {
        self.send_frame(client, &ServerFrame::ProcessExit { exit_code, reason });
    }

    fn send_frame(&self, client: ClientId, frame: &ServerFrame) {
        match frame.to_text() {
            Ok(text) => self.send_raw(client, text),
            Err(e) => tracing::error!("Failed to serialize frame: {e}"),
        }
    }

    fn send_raw(&self, client: ClientId, text: String) {
        self.send(client, Outbound::Text(text));
    }

    fn send(&self, client: ClientId, message: Outbound) {
        if let Some(client) = self.clients.get(&client) {
            // A closed channel means the disconnect event is already queued.
            let _ = client.outbound.send(message);
        }
    }
}

/// Next event of the current run; pending while no agent runs.
async fn next_agent_event(run: &mut Option<ActiveRun>) -> AgentEvent {
    match run {
        Some(run) => run
            .events
            .recv()
            .await
            .unwrap_or(AgentEvent::Exited { code: -1 }),
        None => std::future::pending().await,
    }
}

async fn remove_buffer(buffer: ReplayBuffer) {
    if let Err(e) = buffer.remove().await {
        tracing::warn!("Failed to remove replay buffer: {e}");
    }
}
