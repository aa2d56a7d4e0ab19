use crate::error::Result;
use crate::muted_error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// How many sessions a daemon serves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionMode {
    /// Daemon closes when the first session ends.
    #[default]
    Single,
    /// Sessions are served serially until the daemon is closed.
    Multi,
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub session_mode: SessionMode,
    /// Failed session establishment is logged and the daemon keeps waiting for connections.
    pub hide_session_failures: bool,
    /// Close the daemon at process exit and on SIGHUP/SIGTERM.
    pub add_exit_handlers: bool,
    /// Terminate a launched debuggee when the editor disconnects.
    pub kill_on_close: bool,
    pub wait_on_normal_exit: bool,
    pub wait_on_abnormal_exit: bool,
    /// Give up waiting for an editor connection after this time, wait forever if unset.
    pub accept_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    /// How long a session waits for `disconnect` after the debuggee exited.
    pub disconnect_timeout_ms: u64,
    pub redirect_output: bool,
    /// Interpreter used by the no-debug engine, resolved from `PATH` if unset.
    pub python: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5678,
            session_mode: SessionMode::Single,
            hide_session_failures: false,
            add_exit_handlers: true,
            kill_on_close: true,
            wait_on_normal_exit: false,
            wait_on_abnormal_exit: false,
            accept_timeout_ms: None,
            connect_timeout_ms: 10_000,
            disconnect_timeout_ms: 2_000,
            redirect_output: true,
            python: None,
        }
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/pybridge/config.toml";

    /// Parse configuration from TOML. Missing keys take default values.
    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::de::from_str(data)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = read_to_string(path)?;
        Self::from_toml(&data)
    }

    /// Load configuration from `path`, or from the file in the user home directory if no path
    /// given. A missing home configuration is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Self::default());
                };
                match muted_error!(read_to_string(home.join(Self::DEFAULT_PATH))) {
                    Some(data) => Self::from_toml(&data),
                    None => Ok(Self::default()),
                }
            }
        }
    }

    pub fn is_multi_session(&self) -> bool {
        self.session_mode == SessionMode::Multi
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}
