//! Debug adapter bridge between a DAP speaking editor and an introspection engine running
//! inside the debugged process.

pub mod api;
pub mod config;
pub mod daemon;
pub mod dap;
pub mod engine;
pub mod error;
pub mod log;
pub mod session;
pub mod socket;

pub use api::{enable_attach, install};
pub use config::{Config, SessionMode};
pub use daemon::{Daemon, DaemonState, Role, SessionListener};
pub use error::{Error, Result};
pub use session::{EndReason, Session, SessionState};
