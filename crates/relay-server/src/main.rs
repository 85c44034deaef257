//! In-container session relay.
//!
//! Serves `/ws` for the IDE client and `/health` for probes, runs the agent
//! for each query the orchestrator hands over, and exits once idle.

use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use relay_executor::{CommandBuilder, ExecutorConfig, ProcessLauncher, StderrFilter};
use relay_session::{Relay, RelayConfig};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sandbox-relay")]
#[command(version, about = "In-container session relay for the agent subprocess")]
struct Args {
    /// HTTP bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "RELAY_LISTEN")]
    listen: SocketAddr,

    /// Query context handoff file written by the orchestrator
    #[arg(long, default_value = "/tmp/relay/query-context.json", env = "RELAY_CONTEXT_FILE")]
    context_file: PathBuf,

    /// Directory for replay buffers
    #[arg(long, default_value = "/tmp/relay/buffers", env = "RELAY_BUFFER_DIR")]
    buffer_dir: PathBuf,

    /// Environment overlay key holding the message correlation id
    #[arg(long, default_value = "MSG_ID", env = "RELAY_CORRELATION_KEY")]
    correlation_key: String,

    /// Agent executable, optionally with leading arguments
    #[arg(long, default_value = "claude", env = "RELAY_AGENT_COMMAND")]
    agent_command: String,

    /// Arguments placed between the agent command and the prompt
    #[arg(
        long,
        default_value = "--output-format stream-json --verbose",
        env = "RELAY_AGENT_ARGS",
        allow_hyphen_values = true
    )]
    agent_args: String,

    /// Flag preceding the prompt; empty passes the prompt positionally
    #[arg(long, default_value = "-p", env = "RELAY_PROMPT_FLAG", allow_hyphen_values = true)]
    prompt_flag: String,

    /// Seconds a running agent survives without a client
    #[arg(long, default_value_t = 120, env = "RELAY_GRACE_SECS")]
    grace_secs: u64,

    /// Seconds without clients or agent before the relay exits
    #[arg(long, default_value_t = 900, env = "RELAY_IDLE_SECS")]
    idle_secs: u64,

    /// Seconds between keepalive pings
    #[arg(long, default_value_t = 25, env = "RELAY_KEEPALIVE_SECS")]
    keepalive_secs: u64,

    /// Milliseconds between checks for the query context
    #[arg(long, default_value_t = 50, env = "RELAY_CONTEXT_POLL_MS")]
    context_poll_ms: u64,

    /// Milliseconds a fresh connection waits for the query context
    #[arg(long, default_value_t = 6000, env = "RELAY_CONTEXT_TIMEOUT_MS")]
    context_timeout_ms: u64,

    /// Seconds after which retained replay buffers are deleted
    #[arg(long, default_value_t = 86_400, env = "RELAY_BUFFER_TTL_SECS")]
    buffer_ttl_secs: u64,

    /// Seconds between SIGTERM and SIGKILL when terminating the agent
    #[arg(long, default_value_t = 5, env = "RELAY_TERMINATE_TIMEOUT_SECS")]
    terminate_timeout_secs: u64,

    /// Forward agent debug output to the client as `stderr` frames
    #[arg(long, env = "RELAY_FORWARD_DEBUG")]
    forward_debug: bool,

    /// Agent CLI version reported to clients
    #[arg(long, default_value = "unknown", env = "AGENT_CLI_VERSION")]
    cli_version: String,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "RELAY_LOG_LEVEL")]
    log_level: String,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .with_context_file(&self.context_file)
            .with_buffer_dir(&self.buffer_dir)
            .with_correlation_key(&self.correlation_key)
            .with_context_poll(
                Duration::from_millis(self.context_poll_ms),
                Duration::from_millis(self.context_timeout_ms),
            )
            .with_grace_period(Duration::from_secs(self.grace_secs))
            .with_idle_timeout(Duration::from_secs(self.idle_secs))
            .with_keepalive_interval(Duration::from_secs(self.keepalive_secs))
            .with_buffer_ttl(Duration::from_secs(self.buffer_ttl_secs))
            .with_cli_version(&self.cli_version)
    }

    fn executor_config(&self) -> anyhow::Result<ExecutorConfig> {
        let params = shlex::split(&self.agent_args)
            .with_context(|| format!("cannot parse agent arguments: {}", self.agent_args))?;
        Ok(ExecutorConfig {
            command: CommandBuilder::new(&self.agent_command).params(params),
            prompt_flag: Some(self.prompt_flag.clone()).filter(|flag| !flag.is_empty()),
            stderr: StderrFilter {
                forward_debug: self.forward_debug,
                ..StderrFilter::default()
            },
            terminate_timeout: Duration::from_secs(self.terminate_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let launcher = ProcessLauncher::new(args.executor_config()?);
    let relay = Relay::spawn(args.relay_config(), Arc::new(launcher));

    let app = relay_transport::create_router(relay.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, version = env!("CARGO_PKG_VERSION"), "Relay listening");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result.context("HTTP server failed")?;
        }
        () = relay.shutdown_requested() => {
            info!("Relay idle, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    if let Err(e) = relay.stop().await {
        tracing::debug!("Relay already stopped: {e}");
    }
    info!("Relay exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_configs_from_flags() {
        let args = Args::try_parse_from([
            "sandbox-relay",
            "--context-file",
            "/run/ctx.json",
            "--grace-secs",
            "30",
            "--agent-command",
            "node /opt/agent/cli.js",
            "--agent-args",
            "--verbose --model 'big one'",
            "--prompt-flag",
            "",
            "--forward-debug",
        ])
        .unwrap();

        let relay = args.relay_config();
        assert_eq!(relay.context_file, PathBuf::from("/run/ctx.json"));
        assert_eq!(relay.grace_period, Duration::from_secs(30));

        let executor = args.executor_config().unwrap();
        assert_eq!(executor.command.base, "node /opt/agent/cli.js");
        assert_eq!(executor.command.params, vec!["--verbose", "--model", "big one"]);
        assert_eq!(executor.prompt_flag, None);
        assert!(executor.stderr.forward_debug);
    }

    #[test]
    fn test_rejects_unbalanced_agent_args() {
        let args =
            Args::try_parse_from(["sandbox-relay", "--agent-args", "--model 'oops"]).unwrap();
        assert!(args.executor_config().is_err());
    }
}
