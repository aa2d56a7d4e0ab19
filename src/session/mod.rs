//! Debug session: one editor connection bound to the engine, from handshake to disconnect.

pub mod adapter;
pub mod breakpoints;

use crate::config::Config;
use crate::dap::channel::{ChannelObserver, JsonMessageChannel};
use crate::dap::transport::DapTransport;
use crate::engine::{EngineEvent, EngineHandle, EventSender, EventSink};
use crate::error::{Error, Result};
use crate::session::adapter::AdapterState;
use crate::session::breakpoints::BreakpointStore;
use crate::{muted_error, weak_error};
use log::{debug, info};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use strum_macros::{Display, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SessionState {
    /// Bound into a daemon, channel is not started.
    Bound,
    /// Channel started, handshake and debugging in progress.
    Active,
    Ending,
    Closed,
}

/// Why a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Editor sent `disconnect`.
    Disconnect { terminate: bool },
    /// Debuggee exited and the editor did not disconnect in time.
    DebuggeeExited,
    /// Connection to the editor is lost.
    ChannelClosed,
    DaemonClosing,
}

/// Everything a session needs from its daemon.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub engine: EngineHandle,
    pub router: EventSender,
    pub breakpoints: Arc<Mutex<BreakpointStore>>,
    pub observer: Option<Arc<dyn ChannelObserver>>,
}

/// What the daemon learns when a session is released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOutcome {
    pub reason: EndReason,
    pub wait_on_normal_exit: bool,
    pub wait_on_abnormal_exit: bool,
}

type ReleaseHook = Box<dyn FnOnce(&Session, SessionOutcome) + Send>;

/// Debug session handle. Cloning produces another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    name: String,
    ctx: SessionContext,
    channel: JsonMessageChannel,
    state: Mutex<SessionState>,
    closed: Condvar,
    adapter: Mutex<AdapterState>,
    release: Mutex<Option<ReleaseHook>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Wrap a connected transport into a session. The channel is not started until
    /// [`Session::start`].
    pub fn new(name: &str, transport: Arc<dyn DapTransport>, ctx: SessionContext) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let channel = JsonMessageChannel::with_observer(
                name,
                transport,
                adapter::handlers(weak.clone()),
                ctx.observer.clone(),
            );
            SessionInner {
                name: name.to_string(),
                adapter: Mutex::new(AdapterState::new(&ctx.config)),
                ctx,
                channel,
                state: Mutex::new(SessionState::Bound),
                closed: Condvar::new(),
                release: Mutex::new(None),
            }
        });
        Self { inner }
    }

    fn from_weak(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn channel(&self) -> &JsonMessageChannel {
        &self.inner.channel
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.ctx.config
    }

    pub(crate) fn engine(&self) -> &EngineHandle {
        &self.inner.ctx.engine
    }

    pub(crate) fn breakpoints(&self) -> &Mutex<BreakpointStore> {
        &self.inner.ctx.breakpoints
    }

    pub(crate) fn adapter(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        self.inner.adapter.lock().unwrap()
    }

    /// Set the hook called once when the session ends, right before it is marked closed.
    pub fn on_release(&self, hook: impl FnOnce(&Session, SessionOutcome) + Send + 'static) {
        *self.inner.release.lock().unwrap() = Some(Box::new(hook));
    }

    /// Apply breakpoints persisted by previous sessions to the engine.
    pub fn rebuild_breakpoints(&self) -> anyhow::Result<()> {
        let store = self.breakpoints().lock().unwrap().clone();
        if store.is_empty() {
            return Ok(());
        }
        info!(target: "session", "{}: rebuild breakpoints", self.name());
        let mut engine = self.engine().lock().unwrap();
        store.replay(engine.as_mut())
    }

    /// Start the channel, the editor handshake begins.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != SessionState::Bound {
                return Err(Error::SessionState((*state).into(), SessionState::Bound.into()));
            }
            *state = SessionState::Active;
        }

        let weak = self.downgrade();
        self.inner
            .ctx
            .router
            .set_target(Arc::new(SessionSink(weak.clone())));
        self.channel().on_close(move || {
            if let Some(session) = Session::from_weak(&weak) {
                session.end(EndReason::ChannelClosed);
            }
        });
        if let Err(e) = self.channel().start() {
            self.end(EndReason::ChannelClosed);
            return Err(e);
        }
        debug!(target: "session", "{}: started", self.name());
        Ok(())
    }

    /// Block until the editor connection is gone.
    pub fn wait(&self) -> Result<()> {
        self.channel().wait()
    }

    /// Block until the session is closed or timeout expires. Return false on timeout.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .closed
            .wait_timeout_while(state, timeout, |s| *s != SessionState::Closed)
            .unwrap();
        *state == SessionState::Closed
    }

    /// End the session. Safe to call many times and from any thread, only the first call
    /// has an effect.
    pub fn end(&self, reason: EndReason) {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                SessionState::Ending | SessionState::Closed => return,
                SessionState::Bound | SessionState::Active => *state = SessionState::Ending,
            }
        }
        info!(target: "session", "{}: ending ({reason:?})", self.name());

        let (terminate, outcome) = {
            let adapter = self.adapter();
            let terminate = adapter.should_terminate(reason, self.config());
            let (normal, abnormal) = adapter.wait_on_exit(self.config());
            let outcome = SessionOutcome {
                reason,
                wait_on_normal_exit: normal,
                wait_on_abnormal_exit: abnormal,
            };
            (terminate, outcome)
        };

        {
            let mut engine = self.engine().lock().unwrap();
            if terminate {
                weak_error!(engine.terminate(), "terminate debuggee:");
            } else {
                weak_error!(engine.detach(), "detach engine:");
            }
        }

        if !self.channel().is_closed() && self.adapter().mark_terminated() {
            muted_error!(adapter::send_terminated(self.channel()));
        }
        self.channel().close();
        self.inner.ctx.router.clear_target();

        let hook = self.inner.release.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(self, outcome);
        }
        *self.inner.state.lock().unwrap() = SessionState::Closed;
        self.inner.closed.notify_all();
        debug!(target: "session", "{}: closed", self.name());
    }
}

/// Engine event receiver bound to a session without keeping it alive.
struct SessionSink(Weak<SessionInner>);

impl EventSink for SessionSink {
    fn on_engine_event(&self, event: EngineEvent) {
        if let Some(session) = Session::from_weak(&self.0) {
            adapter::on_engine_event(&session, event);
        }
    }
}
