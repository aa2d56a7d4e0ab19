//! JSON message channel: request/response/event correlation on top of a [`DapTransport`].

use crate::dap::protocol::{IncomingRequest, Message, Response};
use crate::dap::transport::DapTransport;
use crate::error::{Error, Result};
use crate::muted_error;
use log::{debug, error, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

type ResponseCallback = Box<dyn FnOnce(&Response) + Send>;
type RequestFn = Box<dyn Fn(&RequestContext) -> anyhow::Result<Option<Value>> + Send + Sync>;
type EventFn = Box<dyn Fn(&JsonMessageChannel, &str, Option<&Value>) + Send + Sync>;
type PostResponseAction = Box<dyn FnOnce(&JsonMessageChannel) + Send>;

/// Handle for an outgoing request, used to await or be notified of its response.
#[derive(Clone)]
pub struct PendingRequest {
    inner: Arc<PendingInner>,
}

struct PendingInner {
    seq: i64,
    command: String,
    state: Mutex<PendingState>,
    cond: Condvar,
}

#[derive(Default)]
struct PendingState {
    response: Option<Response>,
    callback: Option<ResponseCallback>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("seq", &self.inner.seq)
            .field("command", &self.inner.command)
            .finish()
    }
}

impl PendingRequest {
    fn new(seq: i64, command: &str) -> Self {
        Self {
            inner: Arc::new(PendingInner {
                seq,
                command: command.to_string(),
                state: Mutex::new(PendingState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn seq(&self) -> i64 {
        self.inner.seq
    }

    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// Return the response if it is already received.
    pub fn response(&self) -> Option<Response> {
        self.inner.state.lock().unwrap().response.clone()
    }

    /// Bind the response. Happens exactly once per request.
    pub(crate) fn bind(&self, response: Response) -> Result<()> {
        let callback = {
            let mut state = self.inner.state.lock().unwrap();
            if state.response.is_some() {
                return Err(Error::ResponseAlreadyBound(self.inner.seq));
            }
            state.response = Some(response.clone());
            state.callback.take()
        };
        if let Some(callback) = callback {
            callback(&response);
        }
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Block until the response is received.
    pub fn wait_for_response(&self) -> Response {
        let state = self.inner.state.lock().unwrap();
        let state = self
            .inner
            .cond
            .wait_while(state, |s| s.response.is_none())
            .unwrap();
        state.response.clone().expect("checked by wait_while")
    }

    /// Block until the response is received or timeout expires. A timed out request stays
    /// pending and may still complete later.
    pub fn wait_for_response_timeout(&self, timeout: Duration) -> Option<Response> {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |s| s.response.is_none())
            .unwrap();
        state.response.clone()
    }

    /// Register a callback invoked with the response. If the response is already received the
    /// callback is invoked immediately on the calling thread, otherwise on the receive thread.
    pub fn on_response(&self, callback: impl FnOnce(&Response) + Send + 'static) {
        let response = {
            let mut state = self.inner.state.lock().unwrap();
            match &state.response {
                Some(response) => response.clone(),
                None => {
                    state.callback = Some(Box::new(callback));
                    return;
                }
            }
        };
        callback(&response);
    }
}

/// Request and event handlers, resolved by name when a message arrives.
///
/// Requests without a specific handler go to the fallback request handler (if any), otherwise
/// they are answered with a failure. Events without a handler go to the fallback event handler,
/// otherwise they are dropped.
#[derive(Default)]
pub struct Handlers {
    requests: HashMap<String, RequestFn>,
    events: HashMap<String, EventFn>,
    any_request: Option<RequestFn>,
    any_event: Option<EventFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request(
        mut self,
        command: &str,
        handler: impl Fn(&RequestContext) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.requests.insert(command.to_string(), Box::new(handler));
        self
    }

    pub fn on_any_request(
        mut self,
        handler: impl Fn(&RequestContext) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.any_request = Some(Box::new(handler));
        self
    }

    pub fn on_event(
        mut self,
        event: &str,
        handler: impl Fn(&JsonMessageChannel, &str, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.events.insert(event.to_string(), Box::new(handler));
        self
    }

    pub fn on_any_event(
        mut self,
        handler: impl Fn(&JsonMessageChannel, &str, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.any_event = Some(Box::new(handler));
        self
    }

    fn request_handler(&self, command: &str) -> Option<&RequestFn> {
        self.requests.get(command).or(self.any_request.as_ref())
    }

    fn event_handler(&self, event: &str) -> Option<&EventFn> {
        self.events.get(event).or(self.any_event.as_ref())
    }
}

/// Context of an incoming request, passed to request handlers.
pub struct RequestContext<'a> {
    channel: &'a JsonMessageChannel,
    request: &'a IncomingRequest,
    after_response: Mutex<Vec<PostResponseAction>>,
}

impl RequestContext<'_> {
    pub fn channel(&self) -> &JsonMessageChannel {
        self.channel
    }

    pub fn seq(&self) -> i64 {
        self.request.seq
    }

    pub fn command(&self) -> &str {
        &self.request.command
    }

    pub fn arguments(&self) -> &Value {
        &self.request.arguments
    }

    /// Schedule an action that runs on the receive thread right after the response is written
    /// (whether the handler succeeds or fails).
    pub fn after_response(&self, action: impl FnOnce(&JsonMessageChannel) + Send + 'static) {
        self.after_response.lock().unwrap().push(Box::new(action));
    }
}

/// Observer of channel traffic.
pub trait ChannelObserver: Send + Sync {
    fn on_send(&self, _channel: &str, _message: &Value) {}
    fn on_receive(&self, _channel: &str, _message: &Value) {}
}

/// JSON message channel over a transport.
///
/// Cloning produces another handle to the same channel.
#[derive(Clone)]
pub struct JsonMessageChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    transport: Arc<dyn DapTransport>,
    handlers: Handlers,
    observer: Option<Arc<dyn ChannelObserver>>,
    /// Last used outgoing sequence number, also serializes writes.
    write_lock: Mutex<i64>,
    requests: Mutex<HashMap<i64, PendingRequest>>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
    finished: Mutex<Option<std::result::Result<(), String>>>,
    finished_cond: Condvar,
    on_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl fmt::Debug for JsonMessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonMessageChannel")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl JsonMessageChannel {
    pub fn new(name: &str, transport: Arc<dyn DapTransport>, handlers: Handlers) -> Self {
        Self::with_observer(name, transport, handlers, None)
    }

    pub fn with_observer(
        name: &str,
        transport: Arc<dyn DapTransport>,
        handlers: Handlers,
        observer: Option<Arc<dyn ChannelObserver>>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                transport,
                handlers,
                observer,
                write_lock: Mutex::new(0),
                requests: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                worker: Mutex::new(None),
                worker_id: Mutex::new(None),
                finished: Mutex::new(None),
                finished_cond: Condvar::new(),
                on_close: Mutex::new(vec![]),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Register a callback invoked once the receive loop terminates (or the channel is closed
    /// before it starts). Invoked immediately if that already happened.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let finished = self.inner.finished.lock().unwrap();
            if finished.is_none() {
                self.inner.on_close.lock().unwrap().push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Start the background receive loop.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().unwrap();
        if worker.is_some() || self.is_closed() {
            return Err(Error::ChannelAlreadyStarted);
        }
        let channel = self.clone();
        let handle = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || channel.process_incoming_messages())?;
        *self.inner.worker_id.lock().unwrap() = Some(handle.thread().id());
        *worker = Some(handle);
        Ok(())
    }

    /// Return true if the caller runs on this channel's receive thread.
    pub fn is_receive_thread(&self) -> bool {
        *self.inner.worker_id.lock().unwrap() == Some(thread::current().id())
    }

    /// Close the transport. Outstanding requests are completed with a synthetic failure.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "dap", "{}: closing channel", self.inner.name);
        self.inner.transport.close();
        self.fail_pending_requests();
        if self.inner.worker.lock().unwrap().is_none() {
            self.finish(Ok(()));
        }
    }

    /// Block until the receive loop terminates. Returns the error that terminated it, if any.
    /// Called from the receive thread itself this returns immediately.
    pub fn wait(&self) -> Result<()> {
        if self.is_receive_thread() {
            return Ok(());
        }
        let worker = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            _ = handle.join();
        }
        let finished = self.inner.finished.lock().unwrap();
        let finished = self
            .inner
            .finished_cond
            .wait_while(finished, |f| f.is_none())
            .unwrap();
        match &*finished {
            Some(Err(msg)) => Err(Error::ReceiveLoop(msg.clone())),
            _ => Ok(()),
        }
    }

    /// Block until the receive loop terminates or timeout expires. Return false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let finished = self.inner.finished.lock().unwrap();
        let (finished, _) = self
            .inner
            .finished_cond
            .wait_timeout_while(finished, timeout, |f| f.is_none())
            .unwrap();
        finished.is_some()
    }

    /// Assign the next sequence number and write the message. `before_write` runs under the write
    /// lock with the assigned number.
    fn send_message(&self, mut message: Message, before_write: impl FnOnce(i64)) -> Result<i64> {
        let mut last_seq = self.inner.write_lock.lock().unwrap();
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let seq = *last_seq + 1;
        message.set_seq(seq);
        let value = serde_json::to_value(&message)?;
        before_write(seq);
        self.inner.transport.write_value(&value)?;
        *last_seq = seq;
        if let Some(observer) = &self.inner.observer {
            observer.on_send(&self.inner.name, &value);
        }
        Ok(seq)
    }

    /// Send a request. Returns immediately with a handle for the eventual response.
    pub fn send_request(&self, command: &str, arguments: Option<Value>) -> Result<PendingRequest> {
        let message = Message::Request {
            seq: 0,
            command: command.to_string(),
            arguments,
        };
        let mut pending = None;
        let res = self.send_message(message, |seq| {
            let request = PendingRequest::new(seq, command);
            // registered before writing, a fast peer may answer before `write_value` returns
            self.inner
                .requests
                .lock()
                .unwrap()
                .insert(seq, request.clone());
            pending = Some(request);
        });
        match res {
            Ok(_) => pending.ok_or(Error::ChannelClosed),
            Err(e) => {
                if let Some(request) = pending {
                    self.inner.requests.lock().unwrap().remove(&request.seq());
                }
                Err(e)
            }
        }
    }

    pub fn send_event(&self, event: &str, body: Option<Value>) -> Result<()> {
        let message = Message::Event {
            seq: 0,
            event: event.to_string(),
            body,
        };
        self.send_message(message, |_| {}).map(|_| ())
    }

    pub fn send_response(
        &self,
        request_seq: i64,
        success: bool,
        command: &str,
        error_message: Option<String>,
        body: Option<Value>,
    ) -> Result<()> {
        let message = Message::response(request_seq, success, command, error_message, body);
        self.send_message(message, |_| {}).map(|_| ())
    }

    fn process_incoming_messages(self) {
        let name = self.inner.name.clone();
        let result = loop {
            let value = match self.inner.transport.read_value() {
                Ok(value) => value,
                Err(Error::EndOfStream) => break Ok(()),
                Err(_) if self.is_closed() => break Ok(()),
                Err(e) => break Err(e),
            };
            if let Some(observer) = &self.inner.observer {
                observer.on_receive(&name, &value);
            }
            if let Err(e) = self.on_message(value.clone()) {
                if e.is_fatal() {
                    error!(target: "dap", "{name}: error while processing message {value}: {e:#}");
                    break Err(e);
                }
                warn!(target: "dap", "{name}: {e:#}");
            }
        };

        if let Err(e) = &result {
            warn!(target: "dap", "{name}: receive loop terminated: {e:#}");
        } else {
            debug!(target: "dap", "{name}: receive loop finished");
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.transport.close();
        self.fail_pending_requests();
        self.finish(result.map_err(|e| e.to_string()));
    }

    fn finish(&self, result: std::result::Result<(), String>) {
        {
            let mut finished = self.inner.finished.lock().unwrap();
            if finished.is_some() {
                return;
            }
            *finished = Some(result);
        }
        self.inner.finished_cond.notify_all();
        let callbacks = std::mem::take(&mut *self.inner.on_close.lock().unwrap());
        for callback in callbacks {
            callback();
        }
    }

    fn fail_pending_requests(&self) {
        let pending: Vec<_> = self
            .inner
            .requests
            .lock()
            .unwrap()
            .drain()
            .map(|(_, request)| request)
            .collect();
        for request in pending {
            muted_error!(request.bind(Response::channel_closed(request.command())));
        }
    }

    fn on_message(&self, value: Value) -> Result<()> {
        let message: Message =
            serde_json::from_value(value.clone()).map_err(|_| Error::InvalidMessage(value.to_string()))?;
        match message {
            Message::Request {
                seq,
                command,
                arguments,
            } => {
                let request = IncomingRequest {
                    seq,
                    command,
                    arguments: arguments.unwrap_or(Value::Null),
                };
                self.on_request(&request)
            }
            Message::Event { event, body, .. } => {
                self.on_event(&event, body.as_ref());
                Ok(())
            }
            Message::Response {
                request_seq,
                success,
                command,
                message,
                body,
                ..
            } => {
                let response = if success {
                    Response::success(command, body)
                } else {
                    Response::failure(command, message)
                };
                self.on_response(request_seq, response)
            }
        }
    }

    fn on_request(&self, request: &IncomingRequest) -> Result<()> {
        let ctx = RequestContext {
            channel: self,
            request,
            after_response: Mutex::new(vec![]),
        };
        let result = match self.inner.handlers.request_handler(&request.command) {
            Some(handler) => handler(&ctx),
            None => Err(anyhow::anyhow!("unsupported command: {}", request.command)),
        };

        let sent = match result {
            Ok(body) => self.send_response(request.seq, true, &request.command, None, body),
            Err(e) => {
                debug!(target: "dap", "{}: request {} failed: {e:#}", self.inner.name, request.command);
                self.send_response(
                    request.seq,
                    false,
                    &request.command,
                    Some(format!("{e:#}")),
                    None,
                )
            }
        };

        let actions = std::mem::take(&mut *ctx.after_response.lock().unwrap());
        for action in actions {
            action(self);
        }
        match sent {
            Err(Error::ChannelClosed) if self.is_closed() => Ok(()),
            res => res,
        }
    }

    fn on_event(&self, event: &str, body: Option<&Value>) {
        match self.inner.handlers.event_handler(event) {
            Some(handler) => handler(self, event, body),
            None => debug!(target: "dap", "{}: unhandled event {event}", self.inner.name),
        }
    }

    fn on_response(&self, request_seq: i64, response: Response) -> Result<()> {
        let request = self
            .inner
            .requests
            .lock()
            .unwrap()
            .remove(&request_seq)
            .ok_or(Error::UnknownRequest(request_seq))?;
        request.bind(response)
    }
}

/// Non-owning channel handle.
#[derive(Clone)]
pub struct WeakChannel(Weak<ChannelInner>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<JsonMessageChannel> {
        self.0.upgrade().map(|inner| JsonMessageChannel { inner })
    }
}
