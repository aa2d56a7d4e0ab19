//! Seam between debug sessions and the introspection engine that drives the debuggee.

pub mod nodebug;

use anyhow::bail;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Line breakpoint as sent by the editor in `setBreakpoints`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

/// Breakpoint as applied by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointStatus {
    pub verified: bool,
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BreakpointStatus {
    pub fn unverified(line: i64, message: impl Into<String>) -> Self {
        Self {
            verified: false,
            line,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Display, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum StepKind {
    /// `next`
    Over,
    /// `stepIn`
    In,
    /// `stepOut`
    Out,
}

/// Category of debuggee output.
#[derive(Debug, Clone, Copy, PartialEq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum OutputCategory {
    Stdout,
    Stderr,
    Console,
}

/// Asynchronous notification from the engine, re-emitted to the editor as a DAP event.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ThreadStarted {
        thread_id: i64,
    },
    ThreadExited {
        thread_id: i64,
    },
    Stopped {
        thread_id: i64,
        reason: String,
        description: Option<String>,
    },
    Continued {
        thread_id: Option<i64>,
    },
    Output {
        category: OutputCategory,
        output: String,
    },
    /// Debuggee process started.
    Process {
        name: String,
        pid: Option<u32>,
    },
    /// Debuggee process exited.
    Exited {
        code: i32,
    },
}

/// Receiver of engine events, the current session.
pub trait EventSink: Send + Sync {
    fn on_engine_event(&self, event: EngineEvent);
}

/// Routes engine events to the currently bound session.
///
/// Events emitted while no session is bound are dropped, except that the debuggee exit code is
/// always recorded.
#[derive(Default)]
pub struct EventRouter {
    target: Mutex<Option<Arc<dyn EventSink>>>,
    exit_code: Mutex<Option<i32>>,
}

pub type EventSender = Arc<EventRouter>;

impl EventRouter {
    pub fn new() -> EventSender {
        Arc::new(Self::default())
    }

    pub fn emit(&self, event: EngineEvent) {
        if let EngineEvent::Exited { code } = event {
            *self.exit_code.lock().unwrap() = Some(code);
        }
        let target = self.target.lock().unwrap().clone();
        match target {
            Some(target) => target.on_engine_event(event),
            None => debug!(target: "engine", "no session bound, drop event {event:?}"),
        }
    }

    /// Exit code reported by the debuggee, if it exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    pub(crate) fn set_target(&self, sink: Arc<dyn EventSink>) {
        *self.target.lock().unwrap() = Some(sink);
    }

    pub(crate) fn clear_target(&self) {
        self.target.lock().unwrap().take();
    }
}

/// Introspection engine interface.
///
/// Methods are invoked from DAP request handlers on the session receive thread, the engine is
/// owned by one session at a time. Argument and body values are DAP-shaped JSON, the adapter
/// takes care of path translation.
pub trait Engine: Send {
    /// Engine name, reported in the `process` event.
    fn name(&self) -> &str;

    /// Called once when the daemon starts. Events must be delivered through `events`.
    fn start(&mut self, events: EventSender) -> anyhow::Result<()>;

    /// Editor finished configuration, the debuggee may run.
    fn configuration_done(&mut self) -> anyhow::Result<()>;

    /// Replace all breakpoints of a source file.
    fn set_breakpoints(
        &mut self,
        path: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> anyhow::Result<Vec<BreakpointStatus>> {
        _ = path;
        Ok(breakpoints
            .iter()
            .map(|bp| BreakpointStatus::unverified(bp.line, "breakpoints are not supported"))
            .collect())
    }

    fn set_exception_breakpoints(&mut self, filters: &[String]) -> anyhow::Result<()> {
        _ = filters;
        Ok(())
    }

    fn threads(&mut self) -> anyhow::Result<Value> {
        bail!("threads are not supported by {}", self.name())
    }

    fn stack_trace(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("stack trace is not supported by {}", self.name())
    }

    fn scopes(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("scopes are not supported by {}", self.name())
    }

    fn variables(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("variables are not supported by {}", self.name())
    }

    fn evaluate(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("evaluate is not supported by {}", self.name())
    }

    /// Assign a value to a variable of a container, return the DAP `setVariable` body.
    fn set_variable(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("set variable is not supported by {}", self.name())
    }

    /// Assign a value to an assignable expression evaluated in a frame.
    fn set_expression(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("set expression is not supported by {}", self.name())
    }

    /// Details of the exception the thread is stopped on.
    fn exception_info(&mut self, thread_id: i64) -> anyhow::Result<Value> {
        _ = thread_id;
        bail!("exception info is not supported by {}", self.name())
    }

    /// Modules loaded by the debuggee, DAP `modules` body.
    fn modules(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        _ = arguments;
        bail!("modules are not supported by {}", self.name())
    }

    fn resume(&mut self, thread_id: Option<i64>) -> anyhow::Result<()> {
        _ = thread_id;
        bail!("continue is not supported by {}", self.name())
    }

    fn step(&mut self, thread_id: i64, kind: StepKind) -> anyhow::Result<()> {
        _ = thread_id;
        bail!("step {kind} is not supported by {}", self.name())
    }

    fn pause(&mut self, thread_id: Option<i64>) -> anyhow::Result<()> {
        _ = thread_id;
        bail!("pause is not supported by {}", self.name())
    }

    /// Stop tracing and let the debuggee run freely.
    fn detach(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Kill the debuggee.
    fn terminate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared engine handle, locked by whichever session currently owns the engine.
pub type EngineHandle = Arc<Mutex<Box<dyn Engine>>>;

pub fn into_handle(engine: impl Engine + 'static) -> EngineHandle {
    Arc::new(Mutex::new(Box::new(engine)))
}
