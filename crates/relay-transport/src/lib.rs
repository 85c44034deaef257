//! Transport layer between browser clients and the relay.
//!
//! Provides:
//! - WebSocket transport (feature: websocket)
//! - `/health` status endpoint (feature: websocket)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::{WsState, create_router};
