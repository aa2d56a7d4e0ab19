use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- framing errors --------------------------------------------
    #[error("Content-Length is missing or invalid")]
    InvalidContentLength,
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("end of stream")]
    EndOfStream,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("incoming message has invalid \"type\": {0}")]
    InvalidMessage(String),
    #[error("received response to unknown request {0}")]
    UnknownRequest(i64),
    #[error("response to request {0} already received")]
    ResponseAlreadyBound(i64),
    #[error("channel closed")]
    ChannelClosed,
    #[error("channel already started")]
    ChannelAlreadyStarted,
    #[error("receive loop terminated: {0}")]
    ReceiveLoop(String),

    // --------------------------------- session lifecycle errors ----------------------------------
    #[error("session already bound")]
    SessionAlreadyBound,
    #[error("session is {0}, expected {1}")]
    SessionState(&'static str, &'static str),
    #[error("daemon is running as a {0}")]
    RoleConflict(&'static str),

    // --------------------------------- daemon errors ---------------------------------------------
    #[error("daemon already started")]
    AlreadyStarted,
    #[error("daemon not started yet")]
    NotStarted,
    #[error("daemon closed")]
    DaemonClosed,
    #[error("daemon already closed")]
    AlreadyClosed,
    #[error("timed out after {0:?} while {1}")]
    Timeout(Duration, &'static str),

    // --------------------------------- configuration errors --------------------------------------
    #[error("invalid address {0:?}: {1}")]
    InvalidAddress(String, &'static str),
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),

    // --------------------------------- third party errors ----------------------------------------
    #[error("engine: {0:#}")]
    Engine(anyhow::Error),
}

impl Error {
    /// Return a hint to the receive loop - keep processing messages or tear the channel down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ResponseAlreadyBound(_) => false,
            Error::SessionAlreadyBound => false,
            Error::SessionState(_, _) => false,
            Error::RoleConflict(_) => false,
            Error::AlreadyStarted => false,
            Error::NotStarted => false,
            Error::AlreadyClosed => false,
            Error::Timeout(_, _) => false,
            Error::InvalidAddress(_, _) => false,
            Error::Config(_) => false,
            Error::Engine(_) => false,

            // framing and protocol desync
            Error::InvalidContentLength => true,
            Error::MalformedHeader(_) => true,
            Error::Json(_) => true,
            Error::IO(_) => true,
            Error::EndOfStream => true,
            Error::InvalidMessage(_) => true,
            Error::UnknownRequest(_) => true,
            Error::ChannelClosed => true,
            Error::ChannelAlreadyStarted => true,
            Error::ReceiveLoop(_) => true,
            Error::DaemonClosed => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pybridge", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pybridge", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
