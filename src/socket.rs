use crate::error::{Error, Result};
use log::debug;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags};
use std::fmt::{Display, Formatter};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::time::Instant;
use std::str::FromStr;
use std::time::Duration;

/// Network address together with the role the daemon plays on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
    is_server: bool,
}

impl Address {
    /// Address to listen on. Port 0 picks a free port.
    pub fn as_server(host: &str, port: u16) -> Self {
        Self {
            host: Self::host_or_default(host),
            port,
            is_server: true,
        }
    }

    /// Address to connect to.
    pub fn as_client(host: &str, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(Error::InvalidAddress(
                format!("{host}:{port}"),
                "port must be in 1..=65535",
            ));
        }
        Ok(Self {
            host: Self::host_or_default(host),
            port,
            is_server: false,
        })
    }

    /// Parse `host:port`. An empty host means a server address on localhost.
    pub fn parse(raw: &str) -> Result<Self> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(raw.to_string(), "expected host:port"))?;
        let port = u16::from_str(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::InvalidAddress(raw.to_string(), "port must be in 1..=65535"))?;
        if host.is_empty() {
            Ok(Self::as_server(host, port))
        } else {
            Self::as_client(host, port)
        }
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    fn host_or_default(host: &str) -> String {
        if host.is_empty() {
            "localhost".to_string()
        } else {
            host.to_string()
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<_> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::InvalidAddress(self.to_string(), "host not resolved"));
        }
        Ok(addrs)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Create a listening socket. Address reuse is enabled by the standard listener on unix.
pub fn create_server(addr: &Address) -> Result<TcpListener> {
    let mut last_err = None;
    for sock_addr in addr.resolve()? {
        match TcpListener::bind(sock_addr) {
            Ok(listener) => {
                debug!(target: "daemon", "listening on {}", listener.local_addr()?);
                return Ok(listener);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::IO(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, addr.to_string())
    })))
}

/// Connect to the address, trying every resolved socket address.
pub fn create_client(addr: &Address, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for sock_addr in addr.resolve()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(Error::Timeout(timeout, "connecting to the editor"))
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::IO(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, addr.to_string())
    })))
}

/// Shut down both directions of the socket. A socket that is not connected is not an error.
pub fn close_socket(stream: &TcpStream) -> Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Block until a connection is pending on the listener or timeout expires. Return false on
/// timeout. A listener closed with [`close_listener`] reports a pending connection, the
/// following `accept` fails.
pub fn wait_connection(listener: &TcpListener, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let millis = i32::try_from(left.as_millis()).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(listener, PollFlags::POLLIN)];
        match nix::poll::poll(&mut fds, millis) {
            Ok(0) if left.is_zero() => return Ok(false),
            Ok(0) => continue,
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e).into()),
        }
    }
}

/// Stop accepting connections. Threads blocked in `accept` on this listener wake up
/// with an error.
pub fn close_listener(listener: &TcpListener) -> Result<()> {
    match nix::sys::socket::shutdown(listener.as_raw_fd(), nix::sys::socket::Shutdown::Both) {
        Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
        Err(e) => Err(io::Error::from(e).into()),
    }
}
