//! Entry points for embedding the bridge into a debugging process.

use crate::config::{Config, SessionMode};
use crate::daemon::Daemon;
use crate::engine::{into_handle, Engine};
use crate::error::Result;
use crate::socket::Address;
use log::warn;
use std::thread::{self, JoinHandle};

/// Create a daemon for the engine. The daemon is not started.
pub fn install(engine: impl Engine + 'static, config: Config) -> Daemon {
    Daemon::new(into_handle(engine), config)
}

/// Start a multi-session server daemon on the configured address and keep accepting editor
/// connections on a background thread until the daemon is closed. The listening address is
/// available through [`Daemon::server_addr`].
pub fn enable_attach(
    engine: impl Engine + 'static,
    config: Config,
) -> Result<(Daemon, JoinHandle<()>)> {
    let config = Config {
        session_mode: SessionMode::Multi,
        ..config
    };
    let addr = Address::as_server(&config.host, config.port);
    let daemon = install(engine, config);
    let listener = daemon.start_server(&addr)?;
    let acceptor = thread::Builder::new()
        .name("pybridge.listen".to_string())
        .spawn(move || {
            if let Err(e) = listener.serve() {
                warn!(target: "daemon", "stop listening: {e:#}");
            }
        })?;
    Ok((daemon, acceptor))
}
