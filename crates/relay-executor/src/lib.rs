//! Agent subprocess wrapper.
//!
//! Provides:
//! - `ProcessLauncher` - Spawns the agent in its own process group
//! - Command building utilities
//! - Line splitting and stderr classification

#[cfg(not(unix))]
compile_error!("relay-executor controls agents with POSIX signals and only supports unix targets");

pub mod command;
pub mod lines;
pub mod process;
pub mod stderr;

pub use command::{CommandBuilder, CommandParts};
pub use lines::LineSplitter;
pub use process::{ExecutorConfig, ProcessLauncher};
pub use stderr::{StderrClass, StderrFilter, StderrStream};
