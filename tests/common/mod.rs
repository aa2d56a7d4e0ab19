#![allow(dead_code)]

use pybridge::config::Config;
use pybridge::dap::channel::{ChannelObserver, Handlers, JsonMessageChannel};
use pybridge::dap::protocol::Response;
use pybridge::dap::transport::DapTransport;
use pybridge::engine::{
    BreakpointStatus, Engine, EngineEvent, EventSender, SourceBreakpoint, StepKind,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Path reported by the fake engine in stack frames.
pub const ENGINE_FILE: &str = "/srv/app/main.py";

/// Config without process-wide handlers and with short timeouts.
pub fn test_config() -> Config {
    Config {
        add_exit_handlers: false,
        disconnect_timeout_ms: 200,
        connect_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// Calls observed by [`FakeEngine`].
#[derive(Debug, Default)]
pub struct Calls {
    pub started: usize,
    pub configuration_done: usize,
    pub breakpoints: Vec<(String, Vec<i64>)>,
    pub exception_filters: Vec<Vec<String>>,
    pub steps: Vec<(i64, StepKind)>,
    pub resumed: Vec<Option<i64>>,
    pub assignments: Vec<(String, String)>,
    pub detached: usize,
    pub terminated: usize,
}

/// Engine that records every call. Clones share state, so a test keeps one clone while the
/// daemon owns the other.
#[derive(Clone, Default)]
pub struct FakeEngine {
    calls: Arc<Mutex<Calls>>,
    events: Arc<Mutex<Option<EventSender>>>,
    fail_breakpoints: Arc<Mutex<bool>>,
}

impl FakeEngine {
    pub fn calls(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }

    pub fn fail_breakpoints(&self, fail: bool) {
        *self.fail_breakpoints.lock().unwrap() = fail;
    }

    /// Emit an event as if the debuggee produced it.
    pub fn emit(&self, event: EngineEvent) {
        let sender = self.events.lock().unwrap().clone();
        sender.expect("engine is not started").emit(event);
    }
}

impl Engine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn start(&mut self, events: EventSender) -> anyhow::Result<()> {
        self.calls().started += 1;
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn configuration_done(&mut self) -> anyhow::Result<()> {
        self.calls().configuration_done += 1;
        self.emit(EngineEvent::Process {
            name: "main.py".to_string(),
            pid: Some(4242),
        });
        Ok(())
    }

    fn set_breakpoints(
        &mut self,
        path: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> anyhow::Result<Vec<BreakpointStatus>> {
        if *self.fail_breakpoints.lock().unwrap() {
            anyhow::bail!("no such file: {path}");
        }
        self.calls()
            .breakpoints
            .push((path.to_string(), breakpoints.iter().map(|bp| bp.line).collect()));
        Ok(breakpoints
            .iter()
            .map(|bp| BreakpointStatus {
                verified: true,
                line: bp.line,
                message: None,
            })
            .collect())
    }

    fn set_exception_breakpoints(&mut self, filters: &[String]) -> anyhow::Result<()> {
        self.calls().exception_filters.push(filters.to_vec());
        Ok(())
    }

    fn threads(&mut self) -> anyhow::Result<Value> {
        Ok(json!({"threads": [{"id": 1, "name": "MainThread"}]}))
    }

    fn stack_trace(&mut self, _: &Value) -> anyhow::Result<Value> {
        Ok(json!({
            "stackFrames": [
                {"id": 1, "name": "main", "line": 3, "column": 1, "source": {"path": ENGINE_FILE}},
                {"id": 2, "name": "<module>", "line": 10, "column": 1},
            ],
            "totalFrames": 2,
        }))
    }

    fn set_variable(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        let name = arguments["name"].as_str().unwrap_or_default().to_string();
        let value = arguments["value"].as_str().unwrap_or_default().to_string();
        self.calls().assignments.push((name, value.clone()));
        Ok(json!({"value": value, "type": "int"}))
    }

    fn set_expression(&mut self, arguments: &Value) -> anyhow::Result<Value> {
        let expression = arguments["expression"].as_str().unwrap_or_default().to_string();
        let value = arguments["value"].as_str().unwrap_or_default().to_string();
        self.calls().assignments.push((expression, value.clone()));
        Ok(json!({"value": value}))
    }

    fn exception_info(&mut self, thread_id: i64) -> anyhow::Result<Value> {
        if thread_id != 1 {
            anyhow::bail!("thread {thread_id} is not stopped on an exception");
        }
        Ok(json!({
            "exceptionId": "ValueError",
            "description": "bad value",
            "breakMode": "unhandled",
            "details": {"typeName": "ValueError", "message": "bad value", "source": ENGINE_FILE},
        }))
    }

    fn modules(&mut self, _: &Value) -> anyhow::Result<Value> {
        Ok(json!({
            "modules": [
                {"id": 1, "name": "__main__", "path": ENGINE_FILE},
                {"id": 2, "name": "sys"},
            ],
            "totalModules": 2,
        }))
    }

    fn resume(&mut self, thread_id: Option<i64>) -> anyhow::Result<()> {
        self.calls().resumed.push(thread_id);
        Ok(())
    }

    fn step(&mut self, thread_id: i64, kind: StepKind) -> anyhow::Result<()> {
        self.calls().steps.push((thread_id, kind));
        Ok(())
    }

    fn detach(&mut self) -> anyhow::Result<()> {
        self.calls().detached += 1;
        Ok(())
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.calls().terminated += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Received(Mutex<Vec<Value>>);

impl ChannelObserver for Received {
    fn on_receive(&self, _: &str, message: &Value) {
        self.0.lock().unwrap().push(message.clone());
    }
}

struct Events {
    rx: mpsc::Receiver<(String, Value)>,
    backlog: VecDeque<(String, Value)>,
}

/// Editor side of a session.
pub struct TestClient {
    pub channel: JsonMessageChannel,
    events: Mutex<Events>,
    received: Arc<Received>,
}

impl TestClient {
    pub fn new(transport: Arc<dyn DapTransport>) -> Self {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handlers = Handlers::new().on_any_event(move |_, event, body| {
            let body = body.cloned().unwrap_or(Value::Null);
            _ = tx.lock().unwrap().send((event.to_string(), body));
        });
        let received = Arc::new(Received::default());
        let observer: Arc<dyn ChannelObserver> = received.clone();
        let channel = JsonMessageChannel::with_observer("editor", transport, handlers, Some(observer));
        channel.start().unwrap();
        Self {
            channel,
            events: Mutex::new(Events {
                rx,
                backlog: VecDeque::new(),
            }),
            received,
        }
    }

    pub fn request(&self, command: &str, arguments: Value) -> Response {
        let arguments = (!arguments.is_null()).then_some(arguments);
        self.channel
            .send_request(command, arguments)
            .unwrap()
            .wait_for_response_timeout(TIMEOUT)
            .unwrap_or_else(|| panic!("no response to {command}"))
    }

    /// Wait for the event, events with other names are kept for later calls.
    pub fn event(&self, name: &str) -> Option<Value> {
        let mut events = self.events.lock().unwrap();
        if let Some(pos) = events.backlog.iter().position(|(event, _)| event == name) {
            return events.backlog.remove(pos).map(|(_, body)| body);
        }
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match events.rx.recv_timeout(left) {
                Ok((event, body)) if event == name => return Some(body),
                Ok(other) => events.backlog.push_back(other),
                Err(_) => return None,
            }
        }
    }

    /// All events named `name` received during `wait`, including already buffered ones.
    pub fn count_events(&self, name: &str, wait: Duration) -> usize {
        std::thread::sleep(wait);
        let mut events = self.events.lock().unwrap();
        while let Ok(event) = events.rx.try_recv() {
            events.backlog.push_back(event);
        }
        events.backlog.iter().filter(|(event, _)| event == name).count()
    }

    /// Raw messages received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.0.lock().unwrap().clone()
    }

    /// Run the `initialize` + `launch` + `configurationDone` sequence.
    pub fn handshake(&self, launch_args: Value) {
        assert!(self.request("initialize", json!({"adapterID": "pybridge"})).is_success());
        assert!(self.event("initialized").is_some());
        assert!(self.request("launch", launch_args).is_success());
        assert!(self.request("configurationDone", Value::Null).is_success());
    }
}
