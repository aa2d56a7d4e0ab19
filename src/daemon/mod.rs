//! Process-wide daemon: owns the editor connection, serves debug sessions, decides the exit code.

pub mod exit;

use crate::config::Config;
use crate::dap::channel::ChannelObserver;
use crate::dap::transport::{DapTransport, FramedTransport};
use crate::engine::{EngineHandle, EventRouter, EventSender};
use crate::error::{Error, Result};
use crate::session::breakpoints::BreakpointStore;
use crate::session::{EndReason, Session, SessionContext, SessionOutcome, SessionState};
use crate::socket::{self, Address};
use crate::weak_error;
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;
use strum_macros::{Display, IntoStaticStr};

/// How long closing waits for an acceptor to leave `accept` on the closed listener.
const ACCEPTOR_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum DaemonState {
    NotStarted,
    Started,
    SessionBound,
    SessionActive,
    SessionEnding,
    Closed,
}

/// Connection role of a started daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Sessions are provided by the caller as ready transports.
    Embedded,
    /// Daemon listens and accepts editor connections.
    Server,
    /// Daemon connects to a listening editor.
    Client,
}

type WaitOnExitFn = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Slot {
    role: Option<Role>,
    server_addr: Option<SocketAddr>,
    /// Listening socket of a server daemon, closed together with the daemon.
    listener: Option<Arc<TcpListener>>,
    closed: bool,
    session: Option<Session>,
    sessions_served: usize,
    exit_code: Option<i32>,
    /// `(normal, abnormal)` wait-on-exit options of the last session.
    wait_options: Option<(bool, bool)>,
    waited: bool,
}

/// Debug daemon handle. Cloning produces another handle to the same daemon.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

struct DaemonInner {
    config: Arc<Config>,
    engine: EngineHandle,
    router: EventSender,
    breakpoints: Arc<Mutex<BreakpointStore>>,
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
    /// Guards the accept-bind-release sequence.
    slot: Mutex<Slot>,
    /// Signalled when a session is released and when the daemon closes.
    released: Condvar,
    closing: AtomicBool,
    wait_on_exit: Mutex<WaitOnExitFn>,
}

/// Block until the user presses Enter.
pub fn wait_for_enter() {
    let mut stdout = io::stdout();
    _ = write!(stdout, "Press Enter to continue . . . ");
    _ = stdout.flush();
    let mut buf = [0u8; 1];
    _ = io::stdin().read(&mut buf);
}

impl Daemon {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                config: Arc::new(config),
                engine,
                router: EventRouter::new(),
                breakpoints: Arc::default(),
                observer: Mutex::new(None),
                slot: Mutex::new(Slot::default()),
                released: Condvar::new(),
                closing: AtomicBool::new(false),
                wait_on_exit: Mutex::new(Box::new(wait_for_enter)),
            }),
        }
    }

    /// Replace the function called when the process should wait for user acknowledgment
    /// before exit.
    pub fn with_wait_on_exit(self, f: impl Fn() + Send + 'static) -> Self {
        *self.inner.wait_on_exit.lock().unwrap() = Box::new(f);
        self
    }

    /// Observe the traffic of every session.
    pub fn with_observer(self, observer: Arc<dyn ChannelObserver>) -> Self {
        *self.inner.observer.lock().unwrap() = Some(observer);
        self
    }

    pub(crate) fn downgrade(&self) -> WeakDaemon {
        WeakDaemon(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.inner.engine
    }

    pub fn breakpoints(&self) -> BreakpointStore {
        self.inner.breakpoints.lock().unwrap().clone()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DaemonState {
        let slot = self.slot();
        if slot.closed {
            return DaemonState::Closed;
        }
        if slot.role.is_none() {
            return DaemonState::NotStarted;
        }
        match slot.session.as_ref().map(Session::state) {
            None => DaemonState::Started,
            Some(SessionState::Bound) => DaemonState::SessionBound,
            Some(SessionState::Active) => DaemonState::SessionActive,
            Some(SessionState::Ending | SessionState::Closed) => DaemonState::SessionEnding,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.slot().role
    }

    /// Address the server daemon listens on.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.slot().server_addr
    }

    /// Currently bound session.
    pub fn session(&self) -> Option<Session> {
        self.slot().session.clone()
    }

    pub fn sessions_served(&self) -> usize {
        self.slot().sessions_served
    }

    /// Start the daemon in the embedded role: sessions are bound with
    /// [`Daemon::start_session`] on caller provided transports.
    pub fn start(&self) -> Result<()> {
        self.start_as(Role::Embedded)
    }

    fn start_as(&self, role: Role) -> Result<()> {
        self.start_with(role, exit::install)
    }

    fn start_with(
        &self,
        role: Role,
        install_exit_handlers: impl FnOnce(&Daemon) -> Result<()>,
    ) -> Result<()> {
        {
            let mut slot = self.slot();
            if slot.closed {
                return Err(Error::DaemonClosed);
            }
            if let Some(current) = slot.role {
                return if current == role {
                    Err(Error::AlreadyStarted)
                } else {
                    Err(Error::RoleConflict(current.into()))
                };
            }
            slot.role = Some(role);
        }

        let started = self
            .inner
            .engine
            .lock()
            .unwrap()
            .start(self.inner.router.clone());
        if let Err(e) = started {
            self.slot().role = None;
            return Err(Error::Engine(e));
        }
        if self.config().add_exit_handlers {
            if let Err(e) = install_exit_handlers(self) {
                self.slot().role = None;
                return Err(e);
            }
        }
        info!(target: "daemon", "started as {role}");
        Ok(())
    }

    /// Start listening for editor connections.
    pub fn start_server(&self, addr: &Address) -> Result<SessionListener> {
        let listener = socket::create_server(addr)?;
        let local_addr = listener.local_addr()?;
        self.start_as(Role::Server)?;
        {
            let mut slot = self.slot();
            slot.server_addr = Some(local_addr);
            slot.listener = Some(Arc::new(listener));
        }
        info!(target: "daemon", "waiting for the editor on {local_addr}");
        Ok(SessionListener {
            daemon: self.clone(),
            local_addr,
        })
    }

    /// Connect to a listening editor and start the session over that connection.
    pub fn start_client(&self, addr: &Address) -> Result<Session> {
        self.start_as(Role::Client)?;
        let stream = match socket::create_client(addr, self.config().connect_timeout()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "daemon", "connect to {addr}: {e}");
                self.close_quietly();
                return Err(e);
            }
        };
        info!(target: "daemon", "connected to the editor at {addr}");
        match self.start_socket_session(stream, "pybridge.client") {
            Ok(session) => Ok(session),
            Err(e) => {
                self.close_quietly();
                Err(e)
            }
        }
    }

    fn start_socket_session(&self, stream: TcpStream, name: &str) -> Result<Session> {
        let transport = match FramedTransport::from_socket(stream.try_clone()?) {
            Ok(transport) => transport,
            Err(e) => {
                weak_error!(socket::close_socket(&stream));
                return Err(e);
            }
        };
        self.start_session(Arc::new(transport), name)
    }

    /// Bind a session over the transport, replay persisted breakpoints and start the session.
    pub fn start_session(&self, transport: Arc<dyn DapTransport>, name: &str) -> Result<Session> {
        let session = self.bind_session(transport, name)?;
        if let Err(e) = session.rebuild_breakpoints() {
            warn!(target: "daemon", "{name}: {e:#}");
            session.end(EndReason::ChannelClosed);
            return Err(Error::Engine(e));
        }
        session.start()?;
        Ok(session)
    }

    /// Bind a new session into the daemon.
    ///
    /// In single-session mode binding while another session is bound is an error. In
    /// multi-session mode the call blocks until the current session is released.
    pub fn bind_session(&self, transport: Arc<dyn DapTransport>, name: &str) -> Result<Session> {
        let mut slot = self.slot();
        loop {
            if slot.closed {
                transport.close();
                return Err(Error::DaemonClosed);
            }
            if slot.role.is_none() {
                return Err(Error::NotStarted);
            }
            if slot.session.is_none() {
                break;
            }
            if !self.config().is_multi_session() {
                return Err(Error::SessionAlreadyBound);
            }
            slot = self.inner.released.wait(slot).unwrap();
        }

        let ctx = SessionContext {
            config: self.inner.config.clone(),
            engine: self.inner.engine.clone(),
            router: self.inner.router.clone(),
            breakpoints: self.inner.breakpoints.clone(),
            observer: self.inner.observer.lock().unwrap().clone(),
        };
        let session = Session::new(name, transport, ctx);
        let daemon = self.downgrade();
        session.on_release(move |session, outcome| {
            if let Some(daemon) = daemon.upgrade() {
                daemon.release_session(session, outcome);
            }
        });

        slot.session = Some(session.clone());
        slot.sessions_served += 1;
        debug!(target: "daemon", "session {name} bound, {} served", slot.sessions_served);
        Ok(session)
    }

    fn release_session(&self, session: &Session, outcome: SessionOutcome) {
        let close = {
            let mut slot = self.slot();
            if slot
                .session
                .as_ref()
                .is_some_and(|current| current.ptr_eq(session))
            {
                slot.session = None;
            }
            slot.wait_options = Some((outcome.wait_on_normal_exit, outcome.wait_on_abnormal_exit));
            !self.config().is_multi_session() && slot.role != Some(Role::Embedded)
        };
        self.inner.released.notify_all();
        debug!(target: "daemon", "session {} released ({:?})", session.name(), outcome.reason);

        if close {
            self.close_quietly();
        }
    }

    /// Block until the current session (if any) is released.
    pub fn wait_for_release(&self, timeout: Duration) -> bool {
        let slot = self.slot();
        let (slot, _) = self
            .inner
            .released
            .wait_timeout_while(slot, timeout, |s| s.session.is_some() && !s.closed)
            .unwrap();
        slot.session.is_none() || slot.closed
    }

    /// Block until the daemon is closed.
    pub fn wait_closed(&self, timeout: Option<Duration>) -> bool {
        let slot = self.slot();
        match timeout {
            Some(timeout) => {
                let (slot, _) = self
                    .inner
                    .released
                    .wait_timeout_while(slot, timeout, |s| !s.closed)
                    .unwrap();
                slot.closed
            }
            None => self.inner.released.wait_while(slot, |s| !s.closed).unwrap().closed,
        }
    }

    /// Override the process exit code.
    pub fn set_exit_code(&self, code: i32) {
        self.slot().exit_code = Some(code);
    }

    /// Process exit code: the explicitly set one, or the one reported by the debuggee, or 0.
    pub fn exit_code(&self) -> i32 {
        self.slot()
            .exit_code
            .or_else(|| self.inner.router.exit_code())
            .unwrap_or(0)
    }

    /// Close the daemon. Closing an already closed daemon is an error.
    pub fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        self.shutdown();
        self.wait_on_exit_if_needed();
        Ok(())
    }

    /// Close the daemon if not closed yet. Used by exit handlers and automatic shutdown paths.
    pub fn close_quietly(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown();
    }

    /// Close quietly, then wait for user acknowledgment if configured. Runs at process exit.
    pub fn finish(&self) {
        self.close_quietly();
        self.wait_on_exit_if_needed();
    }

    fn shutdown(&self) {
        info!(target: "daemon", "closing");
        let session = {
            let mut slot = self.slot();
            slot.closed = true;
            slot.session.take()
        };
        // wake up acceptors and multi-session binders
        self.inner.released.notify_all();

        if let Some(session) = session {
            session.end(EndReason::DaemonClosing);
        }
        self.close_listener();
        self.inner.router.clear_target();
        debug!(target: "daemon", "closed, exit code {}", self.exit_code());
    }

    /// Close the listening socket and wait until no acceptor holds it, so the port is free
    /// once the daemon is closed.
    fn close_listener(&self) {
        let Some(listener) = self.slot().listener.take() else {
            return;
        };
        weak_error!(socket::close_listener(&listener), "close listener:");
        let slot = self.slot();
        let (_slot, timeout) = self
            .inner
            .released
            .wait_timeout_while(slot, ACCEPTOR_EXIT_TIMEOUT, |_| {
                Arc::strong_count(&listener) > 1
            })
            .unwrap();
        if timeout.timed_out() {
            warn!(target: "daemon", "listener is still in use after close");
        }
        debug!(target: "daemon", "listener closed");
    }

    fn wait_on_exit_if_needed(&self) {
        let exit_code = self.exit_code();
        let wait = {
            let mut slot = self.slot();
            let (normal, abnormal) = slot.wait_options.unwrap_or((
                self.config().wait_on_normal_exit,
                self.config().wait_on_abnormal_exit,
            ));
            let wait = !slot.waited && should_wait_on_exit(normal, abnormal, exit_code);
            slot.waited = true;
            wait
        };
        if wait {
            let wait_fn = self.inner.wait_on_exit.lock().unwrap();
            (*wait_fn)();
        }
    }
}

/// `true` if the user should acknowledge the exit with the given code.
pub fn should_wait_on_exit(normal: bool, abnormal: bool, exit_code: i32) -> bool {
    (normal && exit_code == 0) || (abnormal && exit_code != 0)
}

/// Non-owning daemon handle, used by process-wide handlers.
#[derive(Clone)]
pub(crate) struct WeakDaemon(Weak<DaemonInner>);

impl WeakDaemon {
    pub fn upgrade(&self) -> Option<Daemon> {
        self.0.upgrade().map(|inner| Daemon { inner })
    }

    pub fn is(&self, daemon: &Daemon) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&daemon.inner))
    }
}

fn accept_on(
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> Result<(TcpStream, SocketAddr)> {
    if let Some(timeout) = timeout {
        if !socket::wait_connection(listener, timeout)? {
            return Err(Error::Timeout(timeout, "waiting for the editor"));
        }
    }
    Ok(listener.accept()?)
}

/// Listening socket of a server daemon. The socket itself is owned by the daemon.
pub struct SessionListener {
    daemon: Daemon,
    local_addr: SocketAddr,
}

impl SessionListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    fn accept(&self, timeout: Option<Duration>) -> Result<TcpStream> {
        let listener = {
            let slot = self.daemon.slot();
            match slot.listener.as_ref() {
                Some(listener) if !slot.closed => listener.clone(),
                _ => return Err(Error::DaemonClosed),
            }
        };
        let accepted = accept_on(&listener, timeout);

        // closing daemon waits until the listener is released by acceptors
        {
            let _slot = self.daemon.slot();
            drop(listener);
        }
        self.daemon.inner.released.notify_all();

        match accepted {
            Ok((stream, peer)) => {
                info!(target: "daemon", "editor connected from {peer}");
                Ok(stream)
            }
            Err(_) if self.daemon.is_closed() => Err(Error::DaemonClosed),
            Err(e) => Err(e),
        }
    }

    /// Accept the next editor connection and start a session on it.
    pub fn next_session(&self, timeout: Option<Duration>) -> Result<Session> {
        let stream = self.accept(timeout)?;
        let name = format!("pybridge.server.{}", self.daemon.sessions_served() + 1);
        self.daemon.start_socket_session(stream, &name)
    }

    /// Serve sessions one after another until the daemon closes.
    ///
    /// Failure to establish a session is hidden when `hide-session-failures` is set, otherwise
    /// it closes the daemon and is returned.
    pub fn serve(self) -> Result<()> {
        let accept_timeout = self.daemon.config().accept_timeout();
        loop {
            match self.next_session(accept_timeout) {
                Ok(session) => {
                    while !session.wait_closed(Duration::from_secs(1)) {}
                    if self.daemon.is_closed() {
                        return Ok(());
                    }
                }
                Err(Error::DaemonClosed) => return Ok(()),
                Err(e) if self.daemon.config().hide_session_failures => {
                    warn!(target: "daemon", "failed to establish session: {e:#}");
                }
                Err(e) => {
                    warn!(target: "daemon", "failed to establish session: {e:#}");
                    self.daemon.close_quietly();
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{into_handle, nodebug::NoDebugEngine};
    use std::path::Path;

    fn daemon(add_exit_handlers: bool) -> Daemon {
        let engine =
            NoDebugEngine::new(Some(Path::new("/bin/true")), Path::new("x.py"), &[]).unwrap();
        let config = Config {
            add_exit_handlers,
            ..Config::default()
        };
        Daemon::new(into_handle(engine), config)
    }

    #[test]
    fn test_failed_exit_handlers_leave_daemon_not_started() {
        let daemon = daemon(true);
        let res = daemon.start_with(Role::Embedded, |_| {
            Err(Error::IO(io::Error::new(io::ErrorKind::Other, "no handlers")))
        });
        assert!(matches!(res, Err(Error::IO(_))));
        assert_eq!(daemon.state(), DaemonState::NotStarted);
        assert_eq!(daemon.role(), None);

        daemon.start_with(Role::Server, |_| Ok(())).unwrap();
        assert_eq!(daemon.role(), Some(Role::Server));
    }

    #[test]
    fn test_close_listener_without_acceptor() {
        let daemon = daemon(false);
        let listener = daemon
            .start_server(&Address::as_server("127.0.0.1", 0))
            .unwrap();
        let addr = listener.local_addr();
        daemon.close().unwrap();

        assert!(TcpStream::connect(addr).is_err());
        drop(TcpListener::bind(addr).unwrap());
        assert!(matches!(listener.next_session(None), Err(Error::DaemonClosed)));
    }
}
