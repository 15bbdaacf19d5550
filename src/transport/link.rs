//! Newline-delimited JSON over TCP.
//!
//! Every send/receive returns a typed `TransportError` so callers can drive
//! their state from the failure kind.

use std::fmt;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::protocol::{AckCode, ProtocolError};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub enum TransportError {
    Connect(io::Error),
    Send(io::Error),
    Receive(io::Error),
    /// Peer closed the connection.
    Closed,
    /// No reply within the allotted time.
    Timeout,
    Protocol(ProtocolError),
    /// Peer answered with a well-formed but wrong acknowledgement.
    UnexpectedReply { expected: AckCode, got: AckCode },
}

impl TransportError {
    /// True for failures of the byte stream itself (as opposed to content).
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_)
                | TransportError::Send(_)
                | TransportError::Receive(_)
                | TransportError::Closed
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "connect failed: {}", e),
            TransportError::Send(e) => write!(f, "send failed: {}", e),
            TransportError::Receive(e) => write!(f, "receive failed: {}", e),
            TransportError::Closed => f.write_str("connection closed by peer"),
            TransportError::Timeout => f.write_str("timed out waiting for reply"),
            TransportError::Protocol(e) => write!(f, "protocol violation: {}", e),
            TransportError::UnexpectedReply { expected, got } => {
                write!(f, "expected {} but received {}", expected, got)
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Connect(e) | TransportError::Send(e) | TransportError::Receive(e) => {
                Some(e)
            }
            TransportError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError::Protocol(err)
    }
}

/// A bidirectional message stream.
pub trait Link: Send {
    /// Write one already-encoded line (including the trailing newline).
    fn send_line(&mut self, line: &[u8]) -> Result<(), TransportError>;

    /// Read one line without its terminator.
    ///
    /// With `Some(timeout)`, returns `Ok(None)` if nothing complete arrived in
    /// time; a partial line is kept for the next call. With `None`, blocks.
    fn recv_line(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError>;

    fn close(&mut self);
}

/// Opens links to a fixed endpoint.
pub trait Connector: Send {
    type Link: Link;

    fn connect(&mut self) -> Result<Self::Link, TransportError>;

    fn endpoint(&self) -> &str;
}

pub struct TcpLink {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    pending: Vec<u8>,
    max_message_bytes: usize,
}

impl TcpLink {
    pub fn new(stream: TcpStream, max_message_bytes: usize) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            pending: Vec::new(),
            max_message_bytes,
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.writer.peer_addr()
    }

    /// Independent handle to the same socket, for shutting it down from elsewhere.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.writer.try_clone()
    }

    fn take_line(&mut self) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line
    }
}

impl Link for TcpLink {
    fn send_line(&mut self, line: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(line).map_err(TransportError::Send)?;
        self.writer.flush().map_err(TransportError::Send)
    }

    fn recv_line(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        // a zero read timeout is rejected by the OS
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.reader
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(TransportError::Receive)?;

        loop {
            let (consumed, complete) = {
                let available = match self.reader.fill_buf() {
                    Ok(buf) => buf,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        return Ok(None);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(TransportError::Receive(e)),
                };
                if available.is_empty() {
                    return Err(TransportError::Closed);
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        self.pending.extend_from_slice(&available[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        self.pending.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);

            if self.pending.len() > self.max_message_bytes {
                self.pending.clear();
                return Err(ProtocolError::Oversized(self.max_message_bytes).into());
            }
            if complete {
                let line = self.take_line();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(line));
            }
        }
    }

    fn close(&mut self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

pub struct TcpConnector {
    addr: String,
    connect_timeout: Option<Duration>,
    max_message_bytes: usize,
}

impl TcpConnector {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }
}

impl Connector for TcpConnector {
    type Link = TcpLink;

    fn connect(&mut self) -> Result<TcpLink, TransportError> {
        let stream = match self.connect_timeout {
            Some(timeout) => {
                let addr = self
                    .addr
                    .to_socket_addrs()
                    .map_err(TransportError::Connect)?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connect(io::Error::new(
                            ErrorKind::NotFound,
                            format!("{} did not resolve", self.addr),
                        ))
                    })?;
                TcpStream::connect_timeout(&addr, timeout)
            }
            None => TcpStream::connect(self.addr.as_str()),
        }
        .map_err(TransportError::Connect)?;
        TcpLink::new(stream, self.max_message_bytes).map_err(TransportError::Connect)
    }

    fn endpoint(&self) -> &str {
        &self.addr
    }
}
