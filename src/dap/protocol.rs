use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, IntoStaticStr};

/// DAP message envelope.
///
/// `seq` is assigned by the sending side when the message is written, so outgoing messages are
/// built with `seq = 0` and numbered by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Message {
    Request {
        seq: i64,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },
    Response {
        seq: i64,
        request_seq: i64,
        success: bool,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Event {
        seq: i64,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl Message {
    pub fn seq(&self) -> i64 {
        match self {
            Message::Request { seq, .. }
            | Message::Response { seq, .. }
            | Message::Event { seq, .. } => *seq,
        }
    }

    pub(crate) fn set_seq(&mut self, new_seq: i64) {
        match self {
            Message::Request { seq, .. }
            | Message::Response { seq, .. }
            | Message::Event { seq, .. } => *seq = new_seq,
        }
    }

    /// Build a response envelope. A failed response never carries a body, a successful one never
    /// carries an error message.
    pub fn response(
        request_seq: i64,
        success: bool,
        command: impl Into<String>,
        error_message: Option<String>,
        body: Option<Value>,
    ) -> Self {
        let (message, body) = if success {
            (None, body)
        } else {
            (error_message, None)
        };
        Message::Response {
            seq: 0,
            request_seq,
            success,
            command: command.into(),
            message,
            body,
        }
    }
}

/// Failure payload of a [`Response`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResponseError {
    /// The peer answered with `success: false`.
    #[error("request failed: {}", .0.as_deref().unwrap_or("<no message>"))]
    Failed(Option<String>),
    /// No response will ever arrive, the channel closed first.
    #[error("request failed: channel closed before a response was received")]
    ChannelClosed,
}

impl ResponseError {
    pub fn message(&self) -> Option<&str> {
        match self {
            ResponseError::Failed(msg) => msg.as_deref(),
            ResponseError::ChannelClosed => None,
        }
    }
}

/// Received response to an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub command: String,
    pub result: Result<Option<Value>, ResponseError>,
}

impl Response {
    pub fn success(command: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            command: command.into(),
            result: Ok(body),
        }
    }

    pub fn failure(command: impl Into<String>, message: Option<String>) -> Self {
        Self {
            command: command.into(),
            result: Err(ResponseError::Failed(message)),
        }
    }

    pub(crate) fn channel_closed(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            result: Err(ResponseError::ChannelClosed),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn body(&self) -> Option<&Value> {
        self.result.as_ref().ok().and_then(Option::as_ref)
    }

    pub fn error(&self) -> Option<&ResponseError> {
        self.result.as_ref().err()
    }

    pub fn matches(&self, expect: &Expect) -> bool {
        match (expect, &self.result) {
            (Expect::AnySuccess, Ok(_)) => true,
            (Expect::AnyFailure, Err(_)) => true,
            (Expect::Body(expected), Ok(body)) => body.as_ref() == Some(expected),
            (Expect::Failure(expected), Err(err)) => err.message() == Some(expected.as_str()),
            _ => false,
        }
    }
}

/// Response matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Expect {
    AnySuccess,
    AnyFailure,
    /// Success with exactly this body.
    Body(Value),
    /// Failure with exactly this message.
    Failure(String),
}

/// Incoming request as seen by a request handler.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub seq: i64,
    pub command: String,
    pub arguments: Value,
}

/// DAP event names emitted by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Display, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum EventKind {
    Initialized,
    Stopped,
    Continued,
    Exited,
    Terminated,
    Thread,
    Output,
    Process,
    Breakpoint,
}
