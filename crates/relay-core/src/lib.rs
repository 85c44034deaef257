//! Core building blocks for the in-container session relay.
//!
//! This crate provides:
//! - `QueryContext` / `ContextStore` - One-shot handoff from the orchestrator
//! - `ReplayBuffer` - Append-only line log for reconnection support
//! - `ServerFrame` / `ClientFrame` - Wire protocol frames
//! - `AgentLauncher` - The seam between the relay and the agent process

pub mod context;
pub mod frame;
pub mod replay;
pub mod traits;

pub use context::{ContextError, ContextStore, QueryContext};
pub use frame::{ClientFrame, ExitReason, Outbound, ServerFrame, SystemInfo};
pub use replay::{ReplayBuffer, ReplayError};
pub use traits::{
    AgentControl, AgentEvent, AgentHandle, AgentLauncher, ControlError, ExecutorError,
    LaunchRequest,
};
