//! Relay core for the in-container session relay.
//!
//! Provides:
//! - `Relay` / `RelayHandle` - The actor owning the agent run, the client link and timers
//! - `RelayConfig` - Paths, timeouts and intervals

pub mod config;
pub mod relay;
mod timers;

pub use config::RelayConfig;
pub use relay::{AgentState, ClientConnection, ClientId, Relay, RelayError, RelayHandle, RelayStatus};
