//! DAP transport abstraction layer.
//!
//! A transport turns a duplex byte channel into a sequence of JSON values. On the wire every value
//! is a header block (`Name: value\r\n` lines, terminated by an empty line) followed by exactly
//! `Content-Length` bytes of UTF-8 JSON.

use crate::error::{Error, Result};
use crate::muted_error;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Read, Stdin, Stdout, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;

/// Largest accepted body.
pub const MAX_BODY_SIZE: usize = 0xFF_FFFF;

const CONTENT_LENGTH: &str = "Content-Length";

/// Trait for DAP message transport (socket, stdio or in-memory).
///
/// Reading happens on a single receive thread, writing may happen from any thread; every
/// `write_value` call puts one complete frame on the wire.
pub trait DapTransport: Send + Sync {
    /// Block until one complete value is read. Returns [`Error::EndOfStream`] if the source is
    /// exhausted before a complete value is available.
    fn read_value(&self) -> Result<Value>;

    /// Write a single value.
    fn write_value(&self, value: &Value) -> Result<()>;

    /// Close both directions. A reader blocked in `read_value` observes end-of-stream.
    fn close(&self);
}

/// `Content-Length` framed transport over a pair of byte streams.
pub struct FramedTransport<R: Read, W: Write> {
    reader: Mutex<BufReader<R>>,
    writer: Mutex<W>,
    closing: AtomicBool,
    socket: Option<TcpStream>,
}

impl FramedTransport<TcpStream, TcpStream> {
    /// Create a transport over a connected socket. The socket must be in blocking mode.
    pub fn from_socket(stream: TcpStream) -> Result<Self> {
        if stream.read_timeout()?.is_some() {
            return Err(Error::IO(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket must be in blocking mode",
            )));
        }
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let socket = stream.try_clone()?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(stream),
            closing: AtomicBool::new(false),
            socket: Some(socket),
        })
    }
}

impl FramedTransport<Stdin, Stdout> {
    pub fn from_stdio() -> Self {
        Self::new(io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> FramedTransport<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            closing: AtomicBool::new(false),
            socket: None,
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl<R: Read + Send, W: Write + Send> DapTransport for FramedTransport<R, W> {
    fn read_value(&self) -> Result<Value> {
        let mut reader = self.reader.lock().unwrap();
        match read_frame(&mut *reader) {
            Err(Error::IO(_)) if self.is_closing() => Err(Error::EndOfStream),
            res => res,
        }
    }

    fn write_value(&self, value: &Value) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ChannelClosed);
        }
        let mut writer = self.writer.lock().unwrap();
        write_frame(&mut *writer, value)
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = &self.socket {
            muted_error!(socket.shutdown(Shutdown::Both), "socket shutdown:");
        }
    }
}

/// Read a header line without its `\r\n` terminator. A bare `\n` does not end the line.
fn read_line(reader: &mut impl BufRead) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let read_n = reader.read_until(b'\n', &mut line)?;
        if read_n == 0 {
            return Err(Error::EndOfStream);
        }
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return Ok(line);
        }
    }
}

/// Read one framed JSON value.
pub fn read_frame(reader: &mut impl BufRead) -> Result<Value> {
    let mut content_length: Option<Result<usize>> = None;
    loop {
        let line = read_line(reader)?;
        if line.is_empty() {
            break;
        }
        let line = String::from_utf8(line)
            .map_err(|e| Error::MalformedHeader(String::from_utf8_lossy(e.as_bytes()).into()))?;
        let (name, value) = line.split_once(':').unwrap_or((line.as_str(), ""));
        if name == CONTENT_LENGTH {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|len| *len <= MAX_BODY_SIZE)
                    .ok_or(Error::InvalidContentLength),
            );
        }
    }

    let len = content_length.ok_or(Error::InvalidContentLength)??;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::EndOfStream,
        _ => Error::IO(e),
    })?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write one framed JSON value. Object keys are written in sorted order.
pub fn write_frame(writer: &mut impl Write, value: &Value) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "{CONTENT_LENGTH}: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// In-memory transport, values are passed through without serialization.
pub struct MemoryTransport {
    sender: Mutex<Option<mpsc::Sender<Option<Value>>>>,
    receiver: Mutex<mpsc::Receiver<Option<Value>>>,
    wake: mpsc::Sender<Option<Value>>,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let a = MemoryTransport {
            sender: Mutex::new(Some(a_tx.clone())),
            receiver: Mutex::new(a_rx),
            wake: b_tx.clone(),
        };
        let b = MemoryTransport {
            sender: Mutex::new(Some(b_tx)),
            receiver: Mutex::new(b_rx),
            wake: a_tx,
        };
        (a, b)
    }
}

impl DapTransport for MemoryTransport {
    fn read_value(&self) -> Result<Value> {
        let receiver = self.receiver.lock().unwrap();
        match receiver.recv() {
            Ok(Some(value)) => Ok(value),
            Ok(None) | Err(_) => Err(Error::EndOfStream),
        }
    }

    fn write_value(&self, value: &Value) -> Result<()> {
        let sender = self.sender.lock().unwrap();
        let sender = sender.as_ref().ok_or(Error::ChannelClosed)?;
        sender
            .send(Some(value.clone()))
            .map_err(|_| Error::ChannelClosed)
    }

    fn close(&self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            _ = sender.send(None);
        }
        _ = self.wake.send(None);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn framed(raw: &[u8]) -> FramedTransport<Cursor<Vec<u8>>, Vec<u8>> {
        FramedTransport::new(Cursor::new(raw.to_vec()), Vec::new())
    }

    #[test]
    fn test_write_then_read() {
        let values = [
            json!({"seq": 1, "type": "request", "command": "next", "arguments": {"threadId": 3}}),
            json!([1, "два", null, {"nested": [true, false]}]),
            json!("plain string"),
            json!(42),
        ];
        let mut wire = Vec::new();
        for v in &values {
            write_frame(&mut wire, v).unwrap();
        }

        let transport = framed(&wire);
        for v in &values {
            assert_eq!(&transport.read_value().unwrap(), v);
        }
        assert!(matches!(transport.read_value(), Err(Error::EndOfStream)));
    }

    #[test]
    fn test_sorted_keys_on_write() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &json!({"type": "event", "seq": 2, "body": {"z": 1, "a": 2}})).unwrap();
        let expected = br#"{"body":{"a":2,"z":1},"seq":2,"type":"event"}"#;
        let header = format!("Content-Length: {}\r\n\r\n", expected.len());
        assert_eq!(wire, [header.as_bytes(), expected.as_slice()].concat());
    }

    #[test]
    fn test_extra_headers_ignored() {
        let raw = b"X-Custom: yes\r\nContent-Length: 2\r\nContent-Type: json\r\n\r\n{}";
        assert_eq!(framed(raw).read_value().unwrap(), json!({}));
    }

    #[test]
    fn test_invalid_content_length() {
        struct TestCase {
            raw: &'static [u8],
        }
        let cases = [
            TestCase { raw: b"\r\n{}" },
            TestCase { raw: b"Content-Length: abc\r\n\r\n{}" },
            TestCase { raw: b"Content-Length: -1\r\n\r\n{}" },
            TestCase { raw: b"Content-Length: 16777216\r\n\r\n{}" },
        ];
        for case in cases {
            assert!(matches!(
                framed(case.raw).read_value(),
                Err(Error::InvalidContentLength)
            ));
        }
    }

    #[test]
    fn test_max_content_length_is_accepted_by_header_parser() {
        // header is valid, the body is truncated so this ends as end-of-stream
        let raw = b"Content-Length: 16777215\r\n\r\n{}";
        assert!(matches!(framed(raw).read_value(), Err(Error::EndOfStream)));
    }

    #[test]
    fn test_end_of_stream() {
        // closed before any bytes, mid header and mid body
        for raw in [
            b"".as_slice(),
            b"Content-Len".as_slice(),
            b"Content-Length: 10\r\n".as_slice(),
            b"Content-Length: 10\r\n\r\n{\"a\"".as_slice(),
        ] {
            assert!(matches!(framed(raw).read_value(), Err(Error::EndOfStream)));
        }
    }

    #[test]
    fn test_bare_newline_does_not_end_header() {
        let raw = b"X-Odd: a\nb\r\nContent-Length: 4\r\n\r\nnull";
        assert_eq!(framed(raw).read_value().unwrap(), Value::Null);
    }

    #[test]
    fn test_invalid_json_body() {
        let raw = b"Content-Length: 3\r\n\r\n{x}";
        assert!(matches!(framed(raw).read_value(), Err(Error::Json(_))));
    }

    #[test]
    fn test_memory_transport() {
        let (a, b) = MemoryTransport::pair();
        a.write_value(&json!({"x": 1})).unwrap();
        b.write_value(&json!({"y": 2})).unwrap();
        assert_eq!(b.read_value().unwrap(), json!({"x": 1}));
        assert_eq!(a.read_value().unwrap(), json!({"y": 2}));

        a.close();
        assert!(matches!(a.read_value(), Err(Error::EndOfStream)));
        assert!(matches!(b.read_value(), Err(Error::EndOfStream)));
        assert!(matches!(a.write_value(&json!(1)), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_socket_close_wakes_reader() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let transport = std::sync::Arc::new(FramedTransport::from_socket(client).unwrap());
        let reader = std::thread::spawn({
            let transport = transport.clone();
            move || transport.read_value()
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        transport.close();
        assert!(matches!(reader.join().unwrap(), Err(Error::EndOfStream)));
    }
}
